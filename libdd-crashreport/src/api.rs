// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::collector::{
    self, emit_report_file, CaptureContext, CrashReporterState, HandlerRegistry, OnCrashCallback,
    ReportFields,
};
use crate::crash_info::CrashType;
use crate::receiver::{
    ConsentCoordinator, ConsentHandler, DeliveryCoordinator, DeliveryPass, OnReportSent,
    ReportSink, ReportStore, SessionMarker,
};
use crate::shared::configuration::CrashReportingConfiguration;
use crate::shared::launch_gate::LaunchCrashGate;
use anyhow::Context;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Supplies the user attributes attached to every crash report.
pub trait MetadataProvider: Send + Sync {
    fn user_attributes(&self) -> Vec<(String, String)>;
}

const UNCLEAN_SHUTDOWN_ERROR_TYPE: &str = "OOM";
const UNCLEAN_SHUTDOWN_DESCRIPTION: &str =
    "The process ended without a crash report or an orderly shutdown, most likely killed for \
     using too much memory";

const FORCE_RESTART_ERROR_TYPE: &str = "FORCE_RESTART";
const FORCE_RESTART_ERROR_CODE: &str = "15";
const FORCE_RESTART_DESCRIPTION: &str =
    "The process was asked to terminate and did not shut down before it was killed";

// Slack so the touch lands after the window, not on its last millisecond.
const LAUNCH_WINDOW_TOUCH_SLACK: Duration = Duration::from_millis(10);

// The signal handler and the capture context are process-wide.
static ACTIVE: AtomicBool = AtomicBool::new(false);

// Store of the session being captured, ended by the exit hook.
static EXIT_SESSION: Mutex<Option<ReportStore>> = Mutex::new(None);
static EXIT_HOOK: Once = Once::new();

/// Runs on `exit(3)`, including a normal return from `main`.  A session that exits on its own
/// did not crash, unless the crash handler already wrote its report.
extern "C" fn end_session_at_exit() {
    if collector::capture_attempted() {
        return;
    }
    if let Some(store) = lock(&EXIT_SESSION).take() {
        if let Err(e) = store.end_session() {
            tracing::warn!("Failed to record the end of the session at exit: {e}");
        }
    }
}

/// Refreshes the session marker's timestamp once the launch window is over, so that a later
/// unclean shutdown is not dated inside it.
fn touch_after_launch_window(
    store: ReportStore,
    window: Duration,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("dd-crashreport-launch-window".to_string())
        .spawn(move || {
            std::thread::sleep(window + LAUNCH_WINDOW_TOUCH_SLACK);
            if let Err(e) = store.touch_session() {
                tracing::warn!("Failed to refresh the session marker: {e}");
            }
        })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Entry point of crash reporting for one process.
///
/// Owns the launch gate, the handler registry and the report store.  Only one instance per
/// process may have its handlers installed at a time.
pub struct CrashReporting {
    config: Mutex<CrashReportingConfiguration>,
    store: ReportStore,
    occurrence_id: String,
    launch_gate: Arc<LaunchCrashGate>,
    registry: Mutex<HandlerRegistry>,
    consent: Arc<ConsentCoordinator>,
    sink: Arc<dyn ReportSink>,
    on_crash: Mutex<Option<OnCrashCallback>>,
    on_report_sent: Mutex<Option<OnReportSent>>,
    metadata_provider: Mutex<Option<Arc<dyn MetadataProvider>>>,
    user_attributes: Mutex<BTreeMap<String, String>>,
    started: AtomicBool,
    capturing: AtomicBool,
    last_session_crashed: AtomicBool,
}

impl CrashReporting {
    pub fn new(
        config: CrashReportingConfiguration,
        store_dir: impl Into<PathBuf>,
        sink: Arc<dyn ReportSink>,
    ) -> anyhow::Result<Self> {
        let store = ReportStore::new(store_dir).context("Opening the crash report store")?;
        let launch_gate = LaunchCrashGate::new();
        launch_gate.set_window_duration(config.launch_duration_ms());
        Ok(Self {
            registry: Mutex::new(HandlerRegistry::new(&config)),
            consent: Arc::new(ConsentCoordinator::new(&config)),
            config: Mutex::new(config),
            store,
            occurrence_id: uuid::Uuid::new_v4().to_string(),
            launch_gate: Arc::new(launch_gate),
            sink,
            on_crash: Mutex::new(None),
            on_report_sent: Mutex::new(None),
            metadata_provider: Mutex::new(None),
            user_attributes: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            capturing: AtomicBool::new(false),
            last_session_crashed: AtomicBool::new(false),
        })
    }

    /// Id of the report this process would write if it crashed.
    pub fn occurrence_id(&self) -> &str {
        &self.occurrence_id
    }

    pub fn launch_gate(&self) -> &LaunchCrashGate {
        &self.launch_gate
    }

    /// Starts the launch window, installs the crash handlers and delivers the reports left by
    /// previous launches.
    ///
    /// Launch crashes may be sent before this returns, see
    /// [`DeliveryCoordinator::process_pending`].  The rest is delivered in the background.
    ///
    /// PRECONDITIONS:
    ///     No other `CrashReporting` instance is capturing in this process.
    /// SAFETY:
    ///     Crash-tracking functions are not reentrant.
    ///     No other crash-handler functions should be called concurrently.
    /// ATOMICITY:
    ///     This function is not atomic. A crash during its execution may lead to
    ///     unexpected crash-handling behaviour.
    pub fn start(&self) -> anyhow::Result<DeliveryPass> {
        anyhow::ensure!(!self.started.swap(true, SeqCst), "Crash reporting already started");
        let window_ms = lock(&self.config).launch_duration_ms();
        self.launch_gate.start_with_window(window_ms);

        if let Err(e) = self.detect_unclean_shutdown() {
            tracing::warn!("Failed to check how the previous session ended: {e:#}");
        }
        if lock(&self.config).enabled() {
            self.begin_capture()?;
        }
        if let Err(e) =
            touch_after_launch_window(self.store.clone(), Duration::from_millis(window_ms))
        {
            tracing::warn!("Failed to start the launch window timer: {e}");
        }

        let coordinator = DeliveryCoordinator::new(
            self.store.clone(),
            self.consent.clone(),
            self.sink.clone(),
            &lock(&self.config),
        )
        .with_on_report_sent(lock(&self.on_report_sent).clone());
        coordinator.process_pending(Some(&self.occurrence_id))
    }

    /// Master switch.  Disabling restores the previous handlers and stops unclean-shutdown
    /// detection for this session.
    pub fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        lock(&self.config).set_enabled(enabled);
        if !self.started.load(SeqCst) {
            return Ok(());
        }
        match (enabled, self.capturing.load(SeqCst)) {
            (true, false) => self.begin_capture(),
            (false, true) => self.end_capture(),
            _ => Ok(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.config).enabled()
    }

    /// Ends the launch window.  Crashes from now on are not launch crashes.
    pub fn mark_launch_crash_free(&self) -> bool {
        if !self.launch_gate.mark_complete() {
            return false;
        }
        if let Err(e) = self.write_session_marker() {
            tracing::warn!("Failed to record the end of the launch window: {e:#}");
        }
        true
    }

    pub fn crash_reporter_state(&self) -> CrashReporterState {
        lock(&self.registry).current_state()
    }

    /// Whether the previous session ended in a fatal crash, as found by [`Self::start`].
    /// Out-of-memory and force-restart terminations do not count.
    pub fn did_last_session_crash(&self) -> bool {
        self.last_session_crashed.load(SeqCst)
    }

    /// Sets the callback that appends data to the report from inside the crash handler.
    pub fn set_on_crash_callback(&self, on_crash: Option<OnCrashCallback>) -> anyhow::Result<()> {
        *lock(&self.on_crash) = on_crash;
        self.republish_capture_context()
    }

    pub fn set_consent_handler(&self, handler: Option<ConsentHandler>) {
        self.consent.set_handler(handler);
    }

    pub fn set_consent_required(&self, crash_type: CrashType, required: bool) {
        lock(&self.config).set_consent_required(crash_type, required);
        self.consent.set_required(crash_type, required);
    }

    /// Takes effect for the delivery pass of the next [`Self::start`].
    pub fn set_on_report_sent(&self, on_report_sent: Option<OnReportSent>) {
        *lock(&self.on_report_sent) = on_report_sent;
    }

    /// While disabled, crash reports carry no user attributes.
    pub fn set_user_identification_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        lock(&self.config).set_user_identification_enabled(enabled);
        self.republish_capture_context()?;
        self.write_session_marker()
    }

    /// Whether a termination request that kills the process is reported.  The termination
    /// handler itself is installed with the crash handlers.
    pub fn set_force_restart_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        lock(&self.config).set_force_restart_enabled(enabled);
        if self.capturing.load(SeqCst) {
            self.publish_termination_flag()?;
        }
        Ok(())
    }

    pub fn set_metadata_provider(&self, provider: Option<Arc<dyn MetadataProvider>>) {
        *lock(&self.metadata_provider) = provider;
    }

    /// Pulls the user attributes from the metadata provider into future crash reports.
    pub fn refresh_user_attributes(&self) -> anyhow::Result<()> {
        let provider = lock(&self.metadata_provider).clone();
        let attributes: BTreeMap<String, String> = provider
            .map(|p| p.user_attributes().into_iter().collect())
            .unwrap_or_default();
        *lock(&self.user_attributes) = attributes;
        self.republish_capture_context()?;
        self.write_session_marker()
    }

    /// Orderly shutdown: restores the previous handlers and records that this session did not
    /// crash.  Exiting the process without calling this records the same.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        if self.capturing.load(SeqCst) {
            self.end_capture()?;
        }
        Ok(())
    }

    fn begin_capture(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !ACTIVE.swap(true, SeqCst),
            "Another crash reporter is already capturing in this process"
        );
        let result = self.install();
        if result.is_err() {
            ACTIVE.store(false, SeqCst);
        }
        result
    }

    fn install(&self) -> anyhow::Result<()> {
        let unhandled_enabled = lock(&self.config).unhandled_enabled();
        self.capturing.store(true, SeqCst);
        self.republish_capture_context()?;
        self.publish_termination_flag()?;
        self.write_session_marker()?;
        *lock(&EXIT_SESSION) = Some(self.store.clone());
        EXIT_HOOK.call_once(|| {
            // SAFETY: the hook only takes a lock and removes files.
            if unsafe { libc::atexit(end_session_at_exit) } != 0 {
                tracing::warn!("Failed to register the exit hook, exits will look unclean");
            }
        });
        collector::enable();
        let mut registry = lock(&self.registry);
        if !registry.is_installed() {
            // Picks up switches changed since the last install.
            *registry = HandlerRegistry::new(&lock(&self.config));
        }
        registry
            .install_fatal_handlers(unhandled_enabled)
            .context("Installing crash handlers")?;
        tracing::debug!(occurrence_id = self.occurrence_id, "Crash reporting started");
        Ok(())
    }

    fn end_capture(&self) -> anyhow::Result<()> {
        collector::disable();
        collector::update_termination_flag_path(None);
        lock(&EXIT_SESSION).take();
        self.capturing.store(false, SeqCst);
        ACTIVE.store(false, SeqCst);
        if let Err(e) = self.store.end_session() {
            tracing::warn!("Failed to record the end of the session: {e}");
        }
        let mut registry = lock(&self.registry);
        if registry.is_installed() {
            registry
                .restore_previous()
                .context("Restoring previous crash handlers")?;
        }
        tracing::debug!(occurrence_id = self.occurrence_id, "Crash reporting stopped");
        Ok(())
    }

    fn republish_capture_context(&self) -> anyhow::Result<()> {
        if !self.capturing.load(SeqCst) {
            return Ok(());
        }
        let paths = self.store.capture_paths(&self.occurrence_id);
        let byte_limit = lock(&self.config).byte_limit();
        let mut context = CaptureContext::new(
            self.occurrence_id.clone(),
            &paths.partial,
            &paths.pending,
            byte_limit,
            self.launch_gate.clone(),
        )?;
        context.set_user_attributes(self.reported_user_attributes());
        context.set_on_crash(*lock(&self.on_crash));
        collector::update_capture_context(context);
        Ok(())
    }

    fn publish_termination_flag(&self) -> anyhow::Result<()> {
        let path = if lock(&self.config).force_restart_enabled() {
            let path = self.store.termination_flag_path();
            Some(CString::new(path.as_os_str().as_bytes())?)
        } else {
            None
        };
        collector::update_termination_flag_path(path);
        Ok(())
    }

    fn reported_user_attributes(&self) -> BTreeMap<String, String> {
        if lock(&self.config).user_identification_enabled() {
            lock(&self.user_attributes).clone()
        } else {
            BTreeMap::new()
        }
    }

    /// Written whenever capturing, so the next launch can tell how this session ended.
    fn write_session_marker(&self) -> anyhow::Result<()> {
        if !self.capturing.load(SeqCst) {
            return Ok(());
        }
        let marker = SessionMarker {
            occurrence_id: self.occurrence_id.clone(),
            pid: std::process::id(),
            launch: self.launch_gate.snapshot(),
            user_attributes: self.reported_user_attributes(),
            last_updated_ms: 0,
            termination_requested: false,
        };
        self.store
            .begin_session(&marker)
            .context("Writing the session marker")
    }

    /// Looks at how the previous session ended.  A session that neither exited nor left a crash
    /// report behind is reported as a force restart if it was asked to terminate, and as an
    /// out-of-memory termination otherwise.
    pub(crate) fn detect_unclean_shutdown(&self) -> anyhow::Result<()> {
        let Some(previous) = self.store.take_previous_session()? else {
            return Ok(());
        };
        // Only that session's own crash handler writes reports under its id.
        if self.store.contains(&previous.occurrence_id) {
            self.last_session_crashed.store(true, SeqCst);
            return Ok(());
        }
        let (crash_type, error_type, error_code, description) = {
            let config = lock(&self.config);
            if previous.termination_requested {
                if !config.force_restart_enabled() {
                    return Ok(());
                }
                (
                    CrashType::ForceRestart,
                    FORCE_RESTART_ERROR_TYPE,
                    FORCE_RESTART_ERROR_CODE,
                    FORCE_RESTART_DESCRIPTION,
                )
            } else {
                if !config.oom_enabled() {
                    return Ok(());
                }
                (
                    CrashType::Oom,
                    UNCLEAN_SHUTDOWN_ERROR_TYPE,
                    "0",
                    UNCLEAN_SHUTDOWN_DESCRIPTION,
                )
            }
        };

        let paths = self.store.capture_paths(&previous.occurrence_id);
        let partial = CString::new(paths.partial.as_os_str().as_bytes())?;
        let pending = CString::new(paths.pending.as_os_str().as_bytes())?;
        let identify_user = lock(&self.config).user_identification_enabled();
        let user_attributes: Vec<(String, String)> = if identify_user {
            previous.user_attributes.into_iter().collect()
        } else {
            vec![]
        };
        let fields = ReportFields {
            occurrence_id: &previous.occurrence_id,
            crash_type,
            error_code,
            error_type,
            error_description: description,
            signal: None,
            pid: previous.pid,
            timestamp_ms: previous.last_updated_ms,
            launch: previous.launch,
            user_attributes: &user_attributes,
            on_crash: None,
        };
        let byte_limit = lock(&self.config).byte_limit();
        anyhow::ensure!(
            emit_report_file(&partial, &pending, byte_limit, &fields),
            "Failed to write the {crash_type} report"
        );
        tracing::debug!(
            occurrence_id = previous.occurrence_id,
            %crash_type,
            "Previous session ended uncleanly, reporting it"
        );
        Ok(())
    }
}
