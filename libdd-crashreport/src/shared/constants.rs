// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults, valid ranges and on-disk names shared between the collector (which writes crash
//! reports from a signal handler) and the receiver (which delivers them on a later launch).

use std::time::Duration;

/// Default length of the launch window, measured from `CrashReporting::start`.
pub const DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS: u64 = 5_000;
/// Longest accepted launch window.  Larger values are ignored.
pub const DD_CRASHREPORT_MAX_LAUNCH_DURATION_MS: u64 = 20_000;

/// Default time the synchronous launch-crash path may block the calling thread.
pub const DD_CRASHREPORT_DEFAULT_SYNC_SEND_TIMEOUT_MS: u64 = 2_000;
/// Shortest accepted synchronous send timeout.
pub const DD_CRASHREPORT_MIN_SYNC_SEND_TIMEOUT_MS: u64 = 1_000;
/// Longest accepted synchronous send timeout.
pub const DD_CRASHREPORT_MAX_SYNC_SEND_TIMEOUT_MS: u64 = 5_000;

/// How long the host application has to answer an asynchronous consent request.
pub const DD_CRASHREPORT_ASYNC_CONSENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on the size of a single crash report file.
pub const DD_CRASHREPORT_DEFAULT_BYTE_LIMIT: u64 = 64 * 1024;

/// Reports whose delivery failed this many times are discarded.
pub const DD_CRASHREPORT_DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Number of reports per delivery pass that are sent with their attachments.  Any further
/// report in the same pass is flagged as rate limited.
pub const DD_CRASHREPORT_DEFAULT_FULL_REPORT_BUDGET: u32 = 5;

/// A claimed report older than this is considered abandoned by a delivery attempt that died.
pub const DD_CRASHREPORT_DEFAULT_STALE_CLAIM_AGE: Duration = Duration::from_secs(600);

/// Writing a report takes milliseconds.  A capture file older than this belongs to a process
/// that died while writing it.
pub const DD_CRASHREPORT_ABANDONED_CAPTURE_AGE: Duration = Duration::from_secs(30);

/// Environment override for the launch window.
pub const DD_CRASHREPORT_LAUNCH_DURATION_ENV: &str = "DD_CRASHREPORT_LAUNCH_DURATION_MS";
/// Environment override for the synchronous send timeout.
pub const DD_CRASHREPORT_SYNC_SEND_TIMEOUT_ENV: &str = "DD_CRASHREPORT_SYNC_SEND_TIMEOUT_MS";

// File name suffixes used by the report store.

/// A capture is in progress (or the process died while writing it).
pub const DD_CRASHREPORT_PARTIAL_EXTENSION: &str = "partial";
/// A finished report waiting for delivery.
pub const DD_CRASHREPORT_PENDING_EXTENSION: &str = "crash";
/// A report currently owned by a delivery attempt.
pub const DD_CRASHREPORT_CLAIMED_EXTENSION: &str = "claimed";

// Keys of the crash record written by the collector.

pub const KEY_OCCURRENCE_ID: &str = "occurrence_id";
pub const KEY_CRASH_TYPE: &str = "crash_type";
pub const KEY_ERROR_CODE: &str = "error_code";
pub const KEY_ERROR_TYPE: &str = "error_type";
pub const KEY_ERROR_DESCRIPTION: &str = "error_description";
pub const KEY_SIGNAL: &str = "signal";
pub const KEY_SI_CODE: &str = "si_code";
pub const KEY_SI_ADDR: &str = "si_addr";
pub const KEY_PID: &str = "pid";
pub const KEY_TIMESTAMP_MS: &str = "timestamp_ms";
pub const KEY_LAUNCH: &str = "launch";
pub const KEY_LAUNCH_WINDOW_START_MS: &str = "window_start_ms";
pub const KEY_LAUNCH_WINDOW_DURATION_MS: &str = "window_duration_ms";
pub const KEY_LAUNCH_COMPLETED: &str = "completed";
pub const KEY_USER_ATTRIBUTES: &str = "user_attributes";
pub const KEY_ADDITIONAL_DATA: &str = "additional_data";
pub const KEY_PROCESSING_DURATION_MS: &str = "processing_duration_ms";
