// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::emitters::{
    emit_report_file, format_signum, OnCrashCallback, ReportFields, SignalDetails,
};
use super::handler_registry::chain_signal_handler;
use crate::crash_info::CrashType;
use crate::shared::launch_gate::{unix_time_ms, LaunchCrashGate};
use crate::shared::signals::{signal_description, signal_name};
use anyhow::Context;
use libc::{c_void, siginfo_t};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::panic::PanicHookInfo;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64};
use std::sync::Arc;

// Note that this file makes use the following async-signal safe functions in a signal handler.
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - clock_gettime
// - close
// - getpid
// - open
// - raise
// - rename
// - sigaction
// - write

// Using mutexes inside a signal handler is not allowed, so use `AtomicPtr` instead to get
// atomicity.  These are always either null_mut, or `Box::into_raw()`.
static CAPTURE_CONTEXT: AtomicPtr<CaptureContext> = AtomicPtr::new(ptr::null_mut());
static PANIC_MESSAGE: AtomicPtr<String> = AtomicPtr::new(ptr::null_mut());
static TERMINATION_FLAG_PATH: AtomicPtr<CString> = AtomicPtr::new(ptr::null_mut());
static ENABLED: AtomicBool = AtomicBool::new(true);

// One-time guard to guarantee at most one crash report per process, whether it comes from a
// signal or from an unhandled panic.  This also protects against a crash inside the handler.
static NUM_TIMES_CALLED: AtomicU64 = AtomicU64::new(0);
static CAPTURE_ATTEMPTED: AtomicBool = AtomicBool::new(false);
// Id of the `PanicMessageHook` that is alive, 0 once it was dropped.
static LIVE_PANIC_HOOK: AtomicU64 = AtomicU64::new(0);

const PANIC_ERROR_TYPE: &str = "PANIC";
// Exit status of a process whose main thread panicked.
const PANIC_ERROR_CODE: &str = "101";

/// Everything the signal handler needs, prepared ahead of time so that writing the report does
/// not have to allocate.
#[derive(Clone)]
pub struct CaptureContext {
    occurrence_id: String,
    partial_path: CString,
    pending_path: CString,
    byte_limit: u64,
    launch_gate: Arc<LaunchCrashGate>,
    user_attributes: Vec<(String, String)>,
    on_crash: Option<OnCrashCallback>,
}

impl CaptureContext {
    pub fn new(
        occurrence_id: String,
        partial_path: &Path,
        pending_path: &Path,
        byte_limit: u64,
        launch_gate: Arc<LaunchCrashGate>,
    ) -> anyhow::Result<Self> {
        let partial_path = CString::new(partial_path.as_os_str().as_bytes())
            .with_context(|| format!("Invalid capture path {}", partial_path.display()))?;
        let pending_path = CString::new(pending_path.as_os_str().as_bytes())
            .with_context(|| format!("Invalid report path {}", pending_path.display()))?;
        Ok(Self {
            occurrence_id,
            partial_path,
            pending_path,
            byte_limit,
            launch_gate,
            user_attributes: vec![],
            on_crash: None,
        })
    }

    pub fn occurrence_id(&self) -> &str {
        &self.occurrence_id
    }

    /// Attributes are written in order; later duplicates of a key replace earlier ones.
    pub fn set_user_attributes(&mut self, attributes: impl IntoIterator<Item = (String, String)>) {
        let unique: std::collections::BTreeMap<String, String> = attributes.into_iter().collect();
        self.user_attributes = unique.into_iter().collect();
    }

    pub fn set_on_crash(&mut self, on_crash: Option<OnCrashCallback>) {
        self.on_crash = on_crash;
    }
}

/// Publishes the context the signal handler will use.
///
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn update_capture_context(context: CaptureContext) {
    let box_ptr = Box::into_raw(Box::new(context));
    let old = CAPTURE_CONTEXT.swap(box_ptr, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe {
            std::mem::drop(Box::from_raw(old));
        }
    }
}

/// Turns capture into a no-op.  Installed handlers keep chaining to their predecessors.
///
/// # Atomicity
///   This function is atomic and idempotent.
pub fn disable() {
    ENABLED.store(false, SeqCst);
}

/// Re-enables capture after [`disable`].
pub fn enable() {
    ENABLED.store(true, SeqCst);
}

pub fn is_enabled() -> bool {
    ENABLED.load(SeqCst)
}

/// Publishes where the termination handler records that the process was asked to terminate.
/// `None` turns that recording off.
///
/// ATOMICITY:
///     This function uses a swap on an atomic pointer.
pub fn update_termination_flag_path(path: Option<CString>) {
    let box_ptr = path.map_or(ptr::null_mut(), |p| Box::into_raw(Box::new(p)));
    let old = TERMINATION_FLAG_PATH.swap(box_ptr, SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe {
            std::mem::drop(Box::from_raw(old));
        }
    }
}

/// Whether this process already started writing a crash report.
pub fn capture_attempted() -> bool {
    CAPTURE_ATTEMPTED.load(SeqCst)
}

/// Panic hook installed by the handler registry.
///
/// A panic on the main thread ends the process once it unwinds out of `main`, so it is reported
/// as a crash right away.  On other threads only the message is remembered: if the panic turns
/// into an abort, the signal handler uses it as the error description.  Then hands over to the
/// hook that was installed before.
pub(crate) struct PanicMessageHook {
    previous: Arc<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>,
    // Also keeps the type from being zero-sized: the registry identifies the installed hook by
    // its heap address.
    id: u64,
}

impl PanicMessageHook {
    pub(crate) fn new(previous: Arc<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, SeqCst);
        LIVE_PANIC_HOOK.store(id, SeqCst);
        Self { previous, id }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn call(&self, info: &PanicHookInfo<'_>) {
        if ENABLED.load(SeqCst) {
            if std::thread::current().name() == Some("main") {
                report_unhandled_panic(info);
            } else {
                store_panic_message(info);
            }
        }
        (*self.previous)(info);
    }
}

impl Drop for PanicMessageHook {
    fn drop(&mut self) {
        let _ = LIVE_PANIC_HOOK.compare_exchange(self.id, 0, SeqCst, SeqCst);
    }
}

/// Id of the registry's panic hook, as long as something still holds on to it.
pub(crate) fn live_panic_hook() -> u64 {
    LIVE_PANIC_HOOK.load(SeqCst)
}

fn panic_message(info: &PanicHookInfo<'_>) -> Option<String> {
    let payload = info.payload();
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        return None;
    };
    Some(match info.location() {
        Some(location) => format!("{message} ({location})"),
        None => message,
    })
}

fn store_panic_message(info: &PanicHookInfo<'_>) {
    let Some(message) = panic_message(info) else {
        return;
    };
    let old = PANIC_MESSAGE.swap(Box::into_raw(Box::new(message)), SeqCst);
    if !old.is_null() {
        // Safety: This can only come from a box above.
        unsafe { std::mem::drop(Box::from_raw(old)) };
    }
}

/// Not in a signal handler: allocating is fine here.
fn report_unhandled_panic(info: &PanicHookInfo<'_>) -> bool {
    let description = match panic_message(info) {
        Some(message) => {
            format!("Process was terminated due to an unhandled panic. Message: \"{message}\"")
        }
        None => "Process was terminated due to an unhandled panic".to_string(),
    };
    let timestamp_ms = unix_time_ms();
    capture_once(|context| {
        let fields = ReportFields {
            occurrence_id: &context.occurrence_id,
            crash_type: CrashType::Crash,
            error_code: PANIC_ERROR_CODE,
            error_type: PANIC_ERROR_TYPE,
            error_description: &description,
            signal: None,
            pid: std::process::id(),
            timestamp_ms,
            launch: context.launch_gate.snapshot(),
            user_attributes: &context.user_attributes,
            on_crash: context.on_crash,
        };
        emit_report_file(
            &context.partial_path,
            &context.pending_path,
            context.byte_limit,
            &fields,
        )
    })
}

/// Runs `write` with the published context, at most once per process.
///
/// The context is leaked: nothing may be dropped during a crash.
fn capture_once(write: impl FnOnce(&CaptureContext) -> bool) -> bool {
    if !ENABLED.load(SeqCst) {
        return false;
    }
    if NUM_TIMES_CALLED.fetch_add(1, SeqCst) > 0 {
        return false;
    }
    let context_ptr = CAPTURE_CONTEXT.swap(ptr::null_mut(), SeqCst);
    if context_ptr.is_null() {
        return false;
    }
    CAPTURE_ATTEMPTED.store(true, SeqCst);
    // SAFETY: the pointer came from `Box::into_raw` and is never freed from now on.
    let context = unsafe { &*context_ptr };
    write(context)
}

pub(crate) extern "C" fn handle_posix_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    // Handle the signal.  Note this has a guard to ensure that we only generate one crash report
    // per process.
    handle_posix_signal_impl(signum, sig_info);
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

fn handle_posix_signal_impl(signum: i32, sig_info: *const siginfo_t) -> bool {
    let timestamp_ms = unix_time_ms();
    capture_once(|context| {
        let message_ptr = PANIC_MESSAGE.swap(ptr::null_mut(), SeqCst);
        // SAFETY: from `Box::into_raw`, leaked like the context.
        let message = unsafe { message_ptr.as_ref() }.map(String::as_str);

        let signal = signal_details(signum, sig_info);
        let mut code_buf = [0u8; 20];
        let fields = ReportFields {
            occurrence_id: &context.occurrence_id,
            crash_type: CrashType::Crash,
            error_code: format_signum(signum, &mut code_buf),
            error_type: signal_name(signum),
            error_description: message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(signal_description(signum)),
            signal: Some(signal),
            // SAFETY: getpid has no preconditions and cannot fail.
            pid: unsafe { libc::getpid() } as u32,
            timestamp_ms,
            launch: context.launch_gate.snapshot(),
            user_attributes: &context.user_attributes,
            on_crash: context.on_crash,
        };
        emit_report_file(
            &context.partial_path,
            &context.pending_path,
            context.byte_limit,
            &fields,
        )
    })
}

/// Handler for termination requests (`SIGTERM`).  Leaves a flag file behind, so that the next
/// launch can tell a forced termination from other unclean ends, then chains.
pub(crate) extern "C" fn handle_termination_sigaction(
    signum: i32,
    sig_info: *mut siginfo_t,
    ucontext: *mut c_void,
) {
    mark_termination_requested();
    // SAFETY: No preconditions.
    unsafe { chain_signal_handler(signum, sig_info, ucontext) };
}

fn mark_termination_requested() -> bool {
    if !ENABLED.load(SeqCst) {
        return false;
    }
    let path_ptr = TERMINATION_FLAG_PATH.swap(ptr::null_mut(), SeqCst);
    // SAFETY: from `Box::into_raw`, and leaked from now on.
    let Some(path) = (unsafe { path_ptr.as_ref() }) else {
        return false;
    };
    // SAFETY: open and close are async-signal-safe; the path is nul-terminated.
    unsafe {
        let fd = libc::open(
            path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        );
        if fd < 0 {
            return false;
        }
        libc::close(fd);
    }
    true
}

fn signal_details(signum: i32, sig_info: *const siginfo_t) -> SignalDetails {
    if sig_info.is_null() {
        return SignalDetails {
            signum,
            si_code: 0,
            si_addr: None,
        };
    }
    // SAFETY: the kernel hands us a valid siginfo_t for the duration of the handler.
    let si_code = unsafe { (*sig_info).si_code };
    // SIGILL, SIGFPE, SIGSEGV, SIGBUS, and SIGTRAP fill in si_addr with the address of the fault.
    let si_addr = match signum {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            Some(unsafe { (*sig_info).si_addr() as usize })
        }
        _ => None,
    };
    SignalDetails {
        signum,
        si_code,
        si_addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_attributes_unique_keys() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = CaptureContext::new(
            "id".to_string(),
            &dir.path().join("a.partial"),
            &dir.path().join("a.0.crash"),
            1024,
            Arc::new(LaunchCrashGate::new()),
        )
        .unwrap();
        context.set_user_attributes(vec![
            ("b".to_string(), "1".to_string()),
            ("a".to_string(), "2".to_string()),
            ("b".to_string(), "3".to_string()),
        ]);
        assert_eq!(
            context.user_attributes,
            vec![
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "3".to_string())
            ]
        );
    }

    #[test]
    fn test_invalid_path_rejected() {
        let result = CaptureContext::new(
            "id".to_string(),
            Path::new("bad\0path"),
            Path::new("ok"),
            1024,
            Arc::new(LaunchCrashGate::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_termination_flag_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("session.terminated");
        assert!(!mark_termination_requested());

        update_termination_flag_path(Some(CString::new(flag.as_os_str().as_bytes()).unwrap()));
        assert!(mark_termination_requested());
        assert!(flag.exists());
        // The path is consumed by the first request.
        std::fs::remove_file(&flag).unwrap();
        assert!(!mark_termination_requested());
        assert!(!flag.exists());
    }

    #[test]
    fn test_signal_details_without_siginfo() {
        let details = signal_details(libc::SIGABRT, ptr::null());
        assert_eq!(details.signum, libc::SIGABRT);
        assert_eq!(details.si_addr, None);
    }
}
