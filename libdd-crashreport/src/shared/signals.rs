// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use nix::sys::signal::Signal;

/// Fatal signals intercepted unless the configuration names others.
pub fn default_signals() -> Vec<i32> {
    vec![
        libc::SIGABRT,
        libc::SIGBUS,
        libc::SIGFPE,
        libc::SIGILL,
        libc::SIGSEGV,
        libc::SIGTRAP,
        libc::SIGSYS,
    ]
}

/// Converts a raw signal number into a [`Signal`], rejecting signals a crash handler must never
/// take over.
pub fn signal_from_signum(value: libc::c_int) -> anyhow::Result<Signal> {
    let signal = Signal::try_from(value)?;
    anyhow::ensure!(
        !matches!(signal, Signal::SIGKILL | Signal::SIGSTOP),
        "{signal} cannot be caught"
    );
    Ok(signal)
}

/// Signal names as written into the `error_type` of a report.
///
/// Returns `"UNKNOWN"` for anything that is not a crash signal.
pub fn signal_name(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTERM => "SIGTERM",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        _ => "UNKNOWN",
    }
}

/// Default `error_description` when nothing more specific (such as a panic message) is known.
pub fn signal_description(signum: libc::c_int) -> &'static str {
    match signum {
        libc::SIGABRT => "Process aborted",
        libc::SIGBUS => "Bus error: access to undefined portion of a memory object",
        libc::SIGFPE => "Erroneous arithmetic operation",
        libc::SIGILL => "Illegal instruction",
        libc::SIGSEGV => "Invalid memory reference",
        libc::SIGTRAP => "Trace or breakpoint trap",
        libc::SIGSYS => "Bad system call",
        libc::SIGTERM => "Termination request",
        _ => "Fatal signal",
    }
}
