// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{CrashReportConsent, CrashType};
use crate::shared::configuration::CrashReportingConfiguration;
use crate::shared::constants::{
    DD_CRASHREPORT_ASYNC_CONSENT_TIMEOUT, DD_CRASHREPORT_MAX_SYNC_SEND_TIMEOUT_MS,
    DD_CRASHREPORT_MIN_SYNC_SEND_TIMEOUT_MS,
};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Asked by the delivery path whether a crash report may be sent.  The handler answers through
/// the [`ConsentReply`], right away or later from any thread.
pub type ConsentHandler = Arc<dyn Fn(CrashType, ConsentReply) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsentDecision {
    Accept,
    Reject,
    /// Nobody answered before the deadline.  Treated as a rejection, but the report is kept.
    TimedOut,
    /// Consent is not needed for this crash type, or no handler is registered.
    NotRequired,
}

impl ConsentDecision {
    pub fn allows_sending(self) -> bool {
        matches!(self, ConsentDecision::Accept | ConsentDecision::NotRequired)
    }
}

impl From<CrashReportConsent> for ConsentDecision {
    fn from(consent: CrashReportConsent) -> Self {
        match consent {
            CrashReportConsent::Accept => ConsentDecision::Accept,
            CrashReportConsent::Reject => ConsentDecision::Reject,
        }
    }
}

#[derive(Debug)]
enum ReplySender {
    Async(oneshot::Sender<CrashReportConsent>),
    Blocking(mpsc::SyncSender<CrashReportConsent>),
}

/// One-shot answer to a consent request.  Dropping it unanswered counts as a timeout.
#[derive(Debug)]
pub struct ConsentReply {
    crash_type: CrashType,
    sender: ReplySender,
}

impl ConsentReply {
    pub fn crash_type(&self) -> CrashType {
        self.crash_type
    }

    /// Delivers the answer.  Returns false if the request already timed out.
    pub fn resolve(self, consent: CrashReportConsent) -> bool {
        match self.sender {
            ReplySender::Async(sender) => sender.send(consent).is_ok(),
            ReplySender::Blocking(sender) => sender.try_send(consent).is_ok(),
        }
    }
}

/// Clamps a synchronous consent timeout into the accepted range.
pub fn clamp_sync_timeout(timeout: Duration) -> Duration {
    timeout.clamp(
        Duration::from_millis(DD_CRASHREPORT_MIN_SYNC_SEND_TIMEOUT_MS),
        Duration::from_millis(DD_CRASHREPORT_MAX_SYNC_SEND_TIMEOUT_MS),
    )
}

pub struct ConsentCoordinator {
    handler: RwLock<Option<ConsentHandler>>,
    required: RwLock<Vec<CrashType>>,
}

impl ConsentCoordinator {
    pub fn new(config: &CrashReportingConfiguration) -> Self {
        let required = CrashType::ALL
            .iter()
            .copied()
            .filter(|t| config.consent_required(*t))
            .collect();
        Self {
            handler: RwLock::new(None),
            required: RwLock::new(required),
        }
    }

    pub fn set_handler(&self, handler: Option<ConsentHandler>) {
        if let Ok(mut guard) = self.handler.write() {
            *guard = handler;
        }
    }

    pub fn set_required(&self, crash_type: CrashType, required: bool) {
        if let Ok(mut guard) = self.required.write() {
            guard.retain(|t| *t != crash_type);
            if required {
                guard.push(crash_type);
            }
        }
    }

    /// Returns the handler to ask, or None if no question needs asking.
    fn handler_for(&self, crash_type: CrashType) -> Option<ConsentHandler> {
        let required = self
            .required
            .read()
            .map(|r| r.contains(&crash_type))
            .unwrap_or(true);
        if !required {
            return None;
        }
        self.handler.read().ok().and_then(|h| h.clone())
    }

    /// Asks the host, waiting up to two minutes for the answer.
    pub async fn request_consent(&self, crash_type: CrashType) -> ConsentDecision {
        self.request_consent_within(crash_type, DD_CRASHREPORT_ASYNC_CONSENT_TIMEOUT)
            .await
    }

    /// Asks the host, blocking the calling thread until it answers or `timeout` (clamped to
    /// 1000..=5000 ms) elapses.  Returns right away when no consent is needed.
    pub fn request_consent_blocking(
        &self,
        crash_type: CrashType,
        timeout: Duration,
    ) -> ConsentDecision {
        self.request_consent_until(crash_type, Instant::now() + clamp_sync_timeout(timeout))
    }

    /// Blocking request bounded by `deadline`, which the caller may share with other work.
    pub(crate) fn request_consent_until(
        &self,
        crash_type: CrashType,
        deadline: Instant,
    ) -> ConsentDecision {
        let Some(handler) = self.handler_for(crash_type) else {
            return ConsentDecision::NotRequired;
        };
        let (sender, receiver) = mpsc::sync_channel(1);
        (*handler)(
            crash_type,
            ConsentReply {
                crash_type,
                sender: ReplySender::Blocking(sender),
            },
        );

        let timeout = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(timeout) {
            Ok(consent) => {
                tracing::debug!(%crash_type, ?consent, "Crash report consent resolved");
                consent.into()
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!(%crash_type, "Consent handler dropped the reply without answering");
                ConsentDecision::TimedOut
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    %crash_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for crash report consent"
                );
                ConsentDecision::TimedOut
            }
        }
    }

    pub(crate) async fn request_consent_within(
        &self,
        crash_type: CrashType,
        timeout: Duration,
    ) -> ConsentDecision {
        let Some(handler) = self.handler_for(crash_type) else {
            return ConsentDecision::NotRequired;
        };
        let (sender, receiver) = oneshot::channel();
        (*handler)(
            crash_type,
            ConsentReply {
                crash_type,
                sender: ReplySender::Async(sender),
            },
        );

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(consent)) => {
                tracing::debug!(%crash_type, ?consent, "Crash report consent resolved");
                consent.into()
            }
            Ok(Err(_)) => {
                tracing::warn!(%crash_type, "Consent handler dropped the reply without answering");
                ConsentDecision::TimedOut
            }
            Err(_) => {
                tracing::warn!(
                    %crash_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for crash report consent"
                );
                ConsentDecision::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn coordinator() -> ConsentCoordinator {
        ConsentCoordinator::new(&CrashReportingConfiguration::default())
    }

    fn resolve_after(delay: Duration, consent: CrashReportConsent) -> ConsentHandler {
        Arc::new(move |_: CrashType, reply: ConsentReply| {
            std::thread::spawn(move || {
                std::thread::sleep(delay);
                reply.resolve(consent);
            });
        })
    }

    /// Keeps every reply alive without ever answering.
    fn never_resolve() -> (ConsentHandler, Arc<Mutex<Vec<ConsentReply>>>) {
        let held = Arc::new(Mutex::new(vec![]));
        let sink = held.clone();
        let handler: ConsentHandler = Arc::new(move |_: CrashType, reply: ConsentReply| {
            sink.lock().unwrap().push(reply)
        });
        (handler, held)
    }

    #[test]
    fn test_clamp_sync_timeout() {
        assert_eq!(
            clamp_sync_timeout(Duration::from_millis(10)),
            Duration::from_millis(1000)
        );
        assert_eq!(
            clamp_sync_timeout(Duration::from_millis(2500)),
            Duration::from_millis(2500)
        );
        assert_eq!(
            clamp_sync_timeout(Duration::from_secs(60)),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn test_not_required() {
        let coordinator = coordinator();
        // No handler registered.
        assert_eq!(
            coordinator
                .request_consent_blocking(CrashType::Crash, Duration::from_millis(1000)),
            ConsentDecision::NotRequired
        );
        coordinator.set_handler(Some(resolve_after(
            Duration::ZERO,
            CrashReportConsent::Reject,
        )));
        coordinator.set_required(CrashType::Oom, false);
        assert_eq!(
            coordinator
                .request_consent_blocking(CrashType::Oom, Duration::from_millis(1000)),
            ConsentDecision::NotRequired
        );
        assert_eq!(
            coordinator
                .request_consent_blocking(CrashType::Crash, Duration::from_millis(1000)),
            ConsentDecision::Reject
        );
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_blocking_resolved_before_min_deadline() {
        let coordinator = coordinator();
        coordinator.set_handler(Some(resolve_after(
            Duration::from_millis(200),
            CrashReportConsent::Accept,
        )));
        let decision = coordinator
            .request_consent_blocking(CrashType::Crash, Duration::from_millis(1000));
        assert_eq!(decision, ConsentDecision::Accept);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_blocking_times_out_at_min_deadline() {
        let coordinator = coordinator();
        let (handler, held) = never_resolve();
        coordinator.set_handler(Some(handler));
        let start = Instant::now();
        // Below the accepted range: clamped up to 1000 ms.
        let decision = coordinator
            .request_consent_blocking(CrashType::Crash, Duration::from_millis(100));
        assert_eq!(decision, ConsentDecision::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(1000));
        // A late answer goes nowhere.
        let reply = held.lock().unwrap().pop().unwrap();
        assert!(!reply.resolve(CrashReportConsent::Accept));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_blocking_at_max_deadline() {
        let coordinator = coordinator();
        coordinator.set_handler(Some(resolve_after(
            Duration::from_millis(4000),
            CrashReportConsent::Reject,
        )));
        let decision = coordinator
            .request_consent_blocking(CrashType::Crash, Duration::from_millis(5000));
        assert_eq!(decision, ConsentDecision::Reject);

        let (handler, _held) = never_resolve();
        coordinator.set_handler(Some(handler));
        let start = Instant::now();
        let decision = coordinator
            .request_consent_blocking(CrashType::Crash, Duration::from_secs(30));
        assert_eq!(decision, ConsentDecision::TimedOut);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn test_dropped_reply_is_a_timeout() {
        let coordinator = coordinator();
        coordinator.set_handler(Some(Arc::new(|_: CrashType, reply: ConsentReply| drop(reply))));
        let decision = coordinator
            .request_consent_blocking(CrashType::ForceRestart, Duration::from_millis(5000));
        assert_eq!(decision, ConsentDecision::TimedOut);
        assert!(!decision.allows_sending());
    }

    #[tokio::test]
    async fn test_async_request() {
        let coordinator = coordinator();
        coordinator.set_handler(Some(Arc::new(|crash_type: CrashType, reply: ConsentReply| {
            assert_eq!(reply.crash_type(), crash_type);
            reply.resolve(CrashReportConsent::Accept);
        })));
        assert_eq!(
            coordinator.request_consent(CrashType::Oom).await,
            ConsentDecision::Accept
        );

        let (handler, _held) = never_resolve();
        coordinator.set_handler(Some(handler));
        assert_eq!(
            coordinator
                .request_consent_within(CrashType::Crash, Duration::from_millis(50))
                .await,
            ConsentDecision::TimedOut
        );
    }

    #[tokio::test]
    async fn test_blocking_request_inside_runtime() {
        let coordinator = coordinator();
        // Nothing to ask, so nothing to wait for.
        assert_eq!(
            coordinator.request_consent_blocking(CrashType::Crash, Duration::from_millis(1000)),
            ConsentDecision::NotRequired
        );
        coordinator.set_handler(Some(resolve_after(
            Duration::from_millis(50),
            CrashReportConsent::Accept,
        )));
        assert_eq!(
            coordinator.request_consent_blocking(CrashType::Crash, Duration::from_millis(1000)),
            ConsentDecision::Accept
        );
    }

    #[test]
    fn test_request_until_past_deadline() {
        let coordinator = coordinator();
        let (handler, held) = never_resolve();
        coordinator.set_handler(Some(handler));
        let start = Instant::now();
        let decision = coordinator.request_consent_until(CrashType::Crash, Instant::now());
        assert_eq!(decision, ConsentDecision::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(held.lock().unwrap().len(), 1);
    }
}
