// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash reporting for long-running processes: capture a fatal crash from inside the signal
//! handler, then deliver the report on the next launch.
//!
//! Architecturally, it consists of two halves that never run at the same time for a given
//! report:
//! 1. The collector runs in the crashing process.  A signal handler, or the panic hook for a
//!    panic on the main thread, writes a JSON report to a file in the report store.
//!    The handler runs under a constrained environment where many standard operations are
//!    illegal: <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
//!    Everything it needs is prepared beforehand and published through atomics; writing goes
//!    through a fixed-size buffer straight to `write(2)`, and nothing allocates.  Once the
//!    report is renamed into place, the handler chains to whatever handler was installed
//!    before it.
//! 2. The receiver runs on a later launch.  It claims each pending report, parses it back,
//!    decides whether it was a launch crash (a crash within the launch window, before the
//!    application declared its launch successful), asks the host application for consent
//!    when required, and hands the report to a [`receiver::ReportSink`].  Launch crashes can be
//!    sent synchronously with a bounded wait, since the process may well be about to crash
//!    again; everything else goes to a background thread.
//!
//! [`CrashReporting`] ties both halves together.  It also keeps a session marker in the store,
//! so that a process that died without a report and without exiting is reported on the next
//! launch as an out-of-memory termination or a force restart.
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

#[cfg(all(unix, feature = "collector"))]
pub mod collector;
pub mod crash_info;
#[cfg(feature = "receiver")]
pub mod receiver;
pub mod shared;

#[cfg(all(unix, feature = "collector", feature = "receiver"))]
mod api;

#[cfg(all(unix, feature = "collector", feature = "receiver"))]
pub use api::{CrashReporting, MetadataProvider};
pub use crash_info::{CrashMetaRecord, CrashReportConsent, CrashType};
pub use shared::configuration::CrashReportingConfiguration;
pub use shared::launch_gate::{LaunchCrashGate, LaunchSnapshot, LaunchState};
