// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::consent::{ConsentCoordinator, ConsentDecision};
use super::report_store::{ClaimedReport, ReportStore, ReportStoreError};
use crate::crash_info::CrashMetaRecord;
use crate::shared::configuration::CrashReportingConfiguration;
use crate::shared::constants::DD_CRASHREPORT_ABANDONED_CAPTURE_AGE;
use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Takes a finished crash report off our hands, e.g. by uploading it.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// `report_path` stays valid until the returned future completes.
    async fn send(&self, record: &CrashMetaRecord, report_path: &Path) -> anyhow::Result<()>;
}

/// Called once a report was accepted by the sink.
pub type OnReportSent = Arc<dyn Fn(&CrashMetaRecord) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Consent was refused; the report is gone.
    Rejected,
    /// Consent timed out; the report waits for a later launch.
    Retained,
    /// The sink failed; a later launch tries again.
    RetryLater,
    /// Unreadable, or out of delivery attempts.
    Dropped,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub sent: usize,
    pub rejected: usize,
    pub retained: usize,
    pub retry_later: usize,
    pub dropped: usize,
    pub rate_limited: usize,
}

impl DeliverySummary {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Sent => self.sent += 1,
            DeliveryOutcome::Rejected => self.rejected += 1,
            DeliveryOutcome::Retained => self.retained += 1,
            DeliveryOutcome::RetryLater => self.retry_later += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
        }
    }

    fn merge(&mut self, other: DeliverySummary) {
        self.sent += other.sent;
        self.rejected += other.rejected;
        self.retained += other.retained;
        self.retry_later += other.retry_later;
        self.dropped += other.dropped;
        self.rate_limited += other.rate_limited;
    }
}

/// Result of [`DeliveryCoordinator::process_pending`].  Reports on the asynchronous path may
/// still be in flight.
#[derive(Debug)]
pub struct DeliveryPass {
    summary: DeliverySummary,
    worker: Option<JoinHandle<DeliverySummary>>,
}

impl DeliveryPass {
    /// Outcomes known by the time `process_pending` returned.
    pub fn summary(&self) -> &DeliverySummary {
        &self.summary
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().map_or(true, |w| w.is_finished())
    }

    /// Waits for the background worker and returns the outcomes of the whole pass.
    pub fn wait(mut self) -> DeliverySummary {
        if let Some(worker) = self.worker.take() {
            match worker.join() {
                Ok(summary) => self.summary.merge(summary),
                Err(_) => tracing::error!("Crash report delivery worker panicked"),
            }
        }
        self.summary
    }
}

struct Job {
    claimed: ClaimedReport,
    record: CrashMetaRecord,
    /// Already answered on the synchronous path.
    decision: Option<ConsentDecision>,
    done: Option<mpsc::SyncSender<DeliveryOutcome>>,
}

#[derive(Clone)]
pub struct DeliveryCoordinator {
    store: ReportStore,
    consent: Arc<ConsentCoordinator>,
    sink: Arc<dyn ReportSink>,
    on_report_sent: Option<OnReportSent>,
    sync_send_launch_crashes: bool,
    sync_send_timeout: Duration,
    max_delivery_attempts: u32,
    full_report_budget: u32,
    stale_claim_age: Duration,
}

impl DeliveryCoordinator {
    pub fn new(
        store: ReportStore,
        consent: Arc<ConsentCoordinator>,
        sink: Arc<dyn ReportSink>,
        config: &CrashReportingConfiguration,
    ) -> Self {
        Self {
            store,
            consent,
            sink,
            on_report_sent: None,
            sync_send_launch_crashes: config.sync_send_launch_crashes(),
            sync_send_timeout: config.sync_send_timeout(),
            max_delivery_attempts: config.max_delivery_attempts(),
            full_report_budget: config.full_report_budget(),
            stale_claim_age: config.stale_claim_age(),
        }
    }

    pub fn with_on_report_sent(mut self, on_report_sent: Option<OnReportSent>) -> Self {
        self.on_report_sent = on_report_sent;
        self
    }

    /// Runs one delivery pass over the store.
    ///
    /// Launch crashes go through the synchronous path when it is enabled: consent and sending
    /// together block the calling thread for at most the configured sync timeout.  Launch
    /// crashes left over once it expires, and everything else, are handed to a background
    /// thread.
    ///
    /// `own_occurrence_id` protects the capture file of the running process.
    pub fn process_pending(&self, own_occurrence_id: Option<&str>) -> anyhow::Result<DeliveryPass> {
        if let Err(e) = self.store.reclaim_stale(self.stale_claim_age) {
            tracing::warn!("Failed to reclaim stale crash reports: {e}");
        }
        if let Err(e) = self
            .store
            .discard_stale_partials(DD_CRASHREPORT_ABANDONED_CAPTURE_AGE, own_occurrence_id)
        {
            tracing::warn!("Failed to discard incomplete crash reports: {e}");
        }

        let mut summary = DeliverySummary::default();
        let mut sync_jobs = vec![];
        let mut async_jobs = vec![];
        let mut full_reports = 0u32;
        let pending = self
            .store
            .pending()
            .with_context(|| format!("Listing crash reports in {}", self.store.dir().display()))?;

        for report in pending {
            let claimed = match self.store.claim(&report) {
                Ok(claimed) => claimed,
                Err(ReportStoreError::AlreadyClaimed(occurrence_id)) => {
                    tracing::debug!(occurrence_id, "Crash report claimed elsewhere, skipping");
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Failed to claim crash report: {e}");
                    continue;
                }
            };
            let record = match CrashMetaRecord::from_file(&claimed.path) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        occurrence_id = claimed.occurrence_id,
                        "Discarding unreadable crash report: {e}"
                    );
                    self.settle_store(self.store.discard(claimed));
                    summary.record(DeliveryOutcome::Dropped);
                    continue;
                }
            };
            let record = if full_reports < self.full_report_budget {
                full_reports += 1;
                record
            } else {
                summary.rate_limited += 1;
                record.into_rate_limited()
            };
            let job = Job {
                claimed,
                record,
                decision: None,
                done: None,
            };
            if self.sync_send_launch_crashes && job.record.is_launch_crash {
                sync_jobs.push(job);
            } else {
                async_jobs.push(job);
            }
        }

        // One deadline bounds every synchronous consent request and send of this pass.
        let deadline = Instant::now() + self.sync_send_timeout;
        let mut waiting = vec![];
        let mut jobs = vec![];
        for mut job in sync_jobs {
            if Instant::now() >= deadline {
                tracing::debug!(
                    occurrence_id = job.claimed.occurrence_id,
                    "Synchronous delivery window used up, sending in the background"
                );
                async_jobs.push(job);
                continue;
            }
            let decision = self.consent.request_consent_until(job.record.crash_type, deadline);
            if !decision.allows_sending() {
                summary.record(self.settle_without_sending(job.claimed, decision));
                continue;
            }
            let (tx, rx) = mpsc::sync_channel(1);
            job.decision = Some(decision);
            job.done = Some(tx);
            waiting.push((job.record.occurrence_id.clone(), rx));
            jobs.push(job);
        }
        jobs.extend(async_jobs);

        if jobs.is_empty() {
            return Ok(DeliveryPass {
                summary,
                worker: None,
            });
        }
        let worker = self.spawn_worker(jobs)?;

        for (occurrence_id, rx) in waiting {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    tracing::debug!(
                        occurrence_id,
                        ?outcome,
                        "Launch crash delivered synchronously"
                    )
                }
                Err(_) => tracing::warn!(
                    occurrence_id,
                    "Synchronous send timed out, continuing in the background"
                ),
            }
        }

        Ok(DeliveryPass {
            summary,
            worker: Some(worker),
        })
    }

    fn spawn_worker(&self, jobs: Vec<Job>) -> anyhow::Result<JoinHandle<DeliverySummary>> {
        let coordinator = self.clone();
        std::thread::Builder::new()
            .name("dd-crashreport-delivery".to_string())
            .spawn(move || coordinator.run_worker(jobs))
            .context("Spawning the crash report delivery thread")
    }

    fn run_worker(&self, jobs: Vec<Job>) -> DeliverySummary {
        let mut summary = DeliverySummary::default();
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::error!("Failed to start the delivery runtime: {e}");
                for job in jobs {
                    let outcome =
                        self.settle_without_sending(job.claimed, ConsentDecision::TimedOut);
                    summary.record(outcome);
                }
                return summary;
            }
        };
        rt.block_on(async {
            for job in jobs {
                let done = job.done.clone();
                let outcome = self.deliver(job).await;
                if let Some(done) = done {
                    // The caller may have stopped waiting.
                    let _ = done.try_send(outcome);
                }
                summary.record(outcome);
            }
        });
        summary
    }

    async fn deliver(&self, job: Job) -> DeliveryOutcome {
        let decision = match job.decision {
            Some(decision) => decision,
            None => self.consent.request_consent(job.record.crash_type).await,
        };
        if !decision.allows_sending() {
            return self.settle_without_sending(job.claimed, decision);
        }

        match self.sink.send(&job.record, &job.claimed.path).await {
            Ok(()) => {
                tracing::debug!(
                    occurrence_id = job.record.occurrence_id,
                    rate_limited = job.record.rate_limited,
                    "Crash report sent"
                );
                self.settle_store(self.store.complete(job.claimed));
                if let Some(on_report_sent) = &self.on_report_sent {
                    (**on_report_sent)(&job.record);
                }
                DeliveryOutcome::Sent
            }
            Err(e) => {
                let attempts = job.claimed.attempt.saturating_add(1);
                if attempts >= self.max_delivery_attempts {
                    tracing::warn!(
                        occurrence_id = job.record.occurrence_id,
                        attempts,
                        "Giving up on crash report: {e:#}"
                    );
                    self.settle_store(self.store.discard(job.claimed));
                    DeliveryOutcome::Dropped
                } else {
                    tracing::warn!(
                        occurrence_id = job.record.occurrence_id,
                        attempts,
                        "Failed to send crash report, will retry: {e:#}"
                    );
                    self.settle_store(self.store.release_for_retry(job.claimed).map(|_| ()));
                    DeliveryOutcome::RetryLater
                }
            }
        }
    }

    fn settle_without_sending(
        &self,
        claimed: ClaimedReport,
        decision: ConsentDecision,
    ) -> DeliveryOutcome {
        if decision == ConsentDecision::Reject {
            tracing::debug!(
                occurrence_id = claimed.occurrence_id,
                "Crash report rejected, discarding"
            );
            self.settle_store(self.store.discard(claimed));
            DeliveryOutcome::Rejected
        } else {
            self.settle_store(self.store.retain(claimed).map(|_| ()));
            DeliveryOutcome::Retained
        }
    }

    /// Store failures after a delivery decision leave a claimed file behind, which a later pass
    /// reclaims once stale.
    fn settle_store(&self, result: Result<(), ReportStoreError>) {
        if let Err(e) = result {
            tracing::warn!("Failed to update the crash report store: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{CrashReportConsent, CrashType};
    use crate::receiver::consent::ConsentReply;
    use crate::shared::launch_gate::unix_time_ms;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<CrashMetaRecord>>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl ReportSink for RecordingSink {
        async fn send(&self, record: &CrashMetaRecord, report_path: &Path) -> anyhow::Result<()> {
            assert!(report_path.exists());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                anyhow::bail!("intake unavailable");
            }
            self.sent.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn write_report(store: &ReportStore, launch_crash: bool) -> String {
        let occurrence_id = uuid::Uuid::new_v4().to_string();
        let now = unix_time_ms();
        let report = serde_json::json!({
            "occurrence_id": occurrence_id,
            "crash_type": "crash",
            "error_code": "11",
            "error_type": "SIGSEGV",
            "error_description": "Invalid memory reference",
            "pid": 1,
            "timestamp_ms": now,
            "launch": {
                "window_start_ms": now - 1000,
                "window_duration_ms": 5000,
                "completed": !launch_crash,
            },
            "user_attributes": {"plan": "pro"},
            "additional_data": {"queue_depth": 4},
        });
        let paths = store.capture_paths(&occurrence_id);
        std::fs::write(&paths.pending, serde_json::to_vec(&report).unwrap()).unwrap();
        occurrence_id
    }

    fn setup(
        config: &CrashReportingConfiguration,
        sink: Arc<RecordingSink>,
    ) -> (tempfile::TempDir, ReportStore, DeliveryCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).unwrap();
        let consent = Arc::new(ConsentCoordinator::new(config));
        let coordinator = DeliveryCoordinator::new(store.clone(), consent, sink, config);
        (dir, store, coordinator)
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_async_delivery() {
        let config = CrashReportingConfiguration::default();
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        let sent_callbacks = Arc::new(AtomicUsize::new(0));
        let counter = sent_callbacks.clone();
        let coordinator = coordinator.with_on_report_sent(Some(Arc::new(
            move |_: &CrashMetaRecord| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )));
        let id = write_report(&store, false);
        std::fs::write(store.capture_paths(&uuid::Uuid::new_v4().to_string()).pending, b"{")
            .unwrap();

        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.dropped, 1);
        assert_eq!(sent_callbacks.load(Ordering::SeqCst), 1);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].occurrence_id, id);
        assert_eq!(sent[0].user_attributes["plan"], "pro");
        assert!(!sent[0].rate_limited);
        assert!(!store.contains(&id));
        assert!(!store.has_pending());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_retry_then_drop() {
        let mut config = CrashReportingConfiguration::default();
        config.set_max_delivery_attempts(2);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let (_dir, store, coordinator) = setup(&config, sink);
        let id = write_report(&store, false);

        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.retry_later, 1);
        assert_eq!(store.pending().unwrap()[0].attempt, 1);

        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.dropped, 1);
        assert!(!store.contains(&id));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_rate_limiting() {
        let mut config = CrashReportingConfiguration::default();
        config.set_full_report_budget(1);
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        for _ in 0..3 {
            write_report(&store, false);
        }

        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.rate_limited, 2);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent.iter().filter(|r| r.rate_limited).count(), 2);
        for record in sent.iter().filter(|r| r.rate_limited) {
            assert!(record.additional_crash_data.is_empty());
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_consent_reject_and_timeout() {
        let config = CrashReportingConfiguration::default();
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        let id = write_report(&store, false);

        // An unanswered request keeps the report for next time.
        coordinator
            .consent
            .set_handler(Some(Arc::new(|_: CrashType, reply: ConsentReply| drop(reply))));
        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.retained, 1);
        assert_eq!(store.pending().unwrap()[0].occurrence_id, id);
        assert_eq!(store.pending().unwrap()[0].attempt, 0);

        coordinator
            .consent
            .set_handler(Some(Arc::new(|_: CrashType, reply: ConsentReply| {
                reply.resolve(CrashReportConsent::Reject);
            })));
        let summary = coordinator.process_pending(None).unwrap().wait();
        assert_eq!(summary.rejected, 1);
        assert!(!store.contains(&id));
        assert!(sink.sent.lock().unwrap().is_empty());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_sync_launch_crash() {
        let mut config = CrashReportingConfiguration::default();
        config.set_sync_send_launch_crashes(true);
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        let launch_id = write_report(&store, true);

        let consent_calls = Arc::new(AtomicUsize::new(0));
        let calls = consent_calls.clone();
        coordinator
            .consent
            .set_handler(Some(Arc::new(move |_: CrashType, reply: ConsentReply| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::thread::spawn(move || reply.resolve(CrashReportConsent::Accept));
            })));

        let pass = coordinator.process_pending(None).unwrap();
        // The launch crash is out before process_pending returns.
        assert_eq!(sink.sent.lock().unwrap()[0].occurrence_id, launch_id);
        assert!(sink.sent.lock().unwrap()[0].is_launch_crash);
        let summary = pass.wait();
        assert_eq!(summary.sent, 1);
        assert_eq!(consent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore)]
    async fn test_sync_launch_crash_from_async_context() {
        let mut config = CrashReportingConfiguration::default();
        config.set_sync_send_launch_crashes(true);
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        let launch_id = write_report(&store, true);

        // No consent handler: nothing to ask, straight to the sink.
        let pass = coordinator.process_pending(None).unwrap();
        assert_eq!(pass.summary().retained, 0);
        assert_eq!(sink.sent.lock().unwrap()[0].occurrence_id, launch_id);
        let summary = pass.wait();
        assert_eq!(summary.sent, 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_sync_window_shared_by_consent_and_sends() {
        let mut config = CrashReportingConfiguration::default();
        config.set_sync_send_launch_crashes(true);
        config.set_sync_send_timeout_ms(1000);
        let sink = Arc::new(RecordingSink::default());
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        write_report(&store, true);
        write_report(&store, true);

        coordinator
            .consent
            .set_handler(Some(Arc::new(|_: CrashType, reply: ConsentReply| {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(1500));
                    reply.resolve(CrashReportConsent::Accept);
                });
            })));

        let start = Instant::now();
        let pass = coordinator.process_pending(None).unwrap();
        assert!(start.elapsed() < Duration::from_millis(1500));
        // The first request used up the window; the second went to the background.
        assert_eq!(pass.summary().retained, 1);
        assert!(sink.sent.lock().unwrap().is_empty());

        let summary = pass.wait();
        assert_eq!(summary.retained, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(store.pending().unwrap().len(), 1);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_slow_sync_send_continues_in_background() {
        let mut config = CrashReportingConfiguration::default();
        config.set_sync_send_launch_crashes(true);
        config.set_sync_send_timeout_ms(1000);
        let sink = Arc::new(RecordingSink {
            delay: Duration::from_millis(1500),
            ..Default::default()
        });
        let (_dir, store, coordinator) = setup(&config, sink.clone());
        let launch_id = write_report(&store, true);

        let start = Instant::now();
        let pass = coordinator.process_pending(None).unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000));
        assert!(elapsed < Duration::from_millis(1500));
        assert!(sink.sent.lock().unwrap().is_empty());

        let summary = pass.wait();
        assert_eq!(summary.sent, 1);
        assert!(!store.contains(&launch_id));
    }
}
