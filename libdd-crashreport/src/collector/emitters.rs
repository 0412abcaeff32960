// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::async_file::AsyncFile;
use super::report_writer::{format_i64, CrashReportWriter, ReportWriter};
use crate::crash_info::CrashType;
use crate::shared::constants::*;
use crate::shared::launch_gate::{unix_time_ms, LaunchSnapshot};
use std::ffi::CStr;

/// Invoked while the crash report is being written, inside the `additional_data` object.
///
/// Runs in the crashing context: implementations must only do async-signal-safe work.  The
/// callback cannot close containers it did not open itself.
pub type OnCrashCallback = fn(&mut dyn CrashReportWriter);

/// What the kernel told us about the fatal signal.
#[derive(Clone, Copy, Debug)]
pub struct SignalDetails {
    pub signum: i32,
    pub si_code: i32,
    /// Faulting address, for the signals that carry one.
    pub si_addr: Option<usize>,
}

/// Everything needed to lay out one crash report.  Borrows only, so that building it in a signal
/// handler costs nothing.
pub struct ReportFields<'a> {
    pub occurrence_id: &'a str,
    pub crash_type: CrashType,
    pub error_code: &'a str,
    pub error_type: &'a str,
    pub error_description: &'a str,
    pub signal: Option<SignalDetails>,
    pub pid: u32,
    pub timestamp_ms: u64,
    pub launch: LaunchSnapshot,
    pub user_attributes: &'a [(String, String)],
    pub on_crash: Option<OnCrashCallback>,
}

/// Writes a complete report to `path`, then renames it to `final_path`.
///
/// SIGNAL SAFETY:
///     Only `open`, `write`, `close`, `rename` and `clock_gettime` are called.  Nothing
///     allocates, provided `on_crash` does not.
/// ATOMICITY:
///     The report only becomes visible under `final_path` once fully written.  A crash in the
///     middle leaves the file under `path`, where the store treats it as an abandoned capture.
pub(crate) fn emit_report_file(
    path: &CStr,
    final_path: &CStr,
    byte_limit: u64,
    fields: &ReportFields<'_>,
) -> bool {
    let started_ms = unix_time_ms();
    let Ok(file) = AsyncFile::open(path, byte_limit) else {
        return false;
    };
    let mut writer = ReportWriter::new(file);
    emit_crashreport(&mut writer, fields);
    writer.add_unsigned_integer(
        KEY_PROCESSING_DURATION_MS,
        unix_time_ms().saturating_sub(started_ms),
    );
    writer.finish();

    // SAFETY: both paths are valid nul-terminated strings.  rename(2) is async-signal-safe.
    unsafe { libc::rename(path.as_ptr(), final_path.as_ptr()) == 0 }
}

pub(crate) fn emit_crashreport(writer: &mut ReportWriter, fields: &ReportFields<'_>) {
    writer.add_string(KEY_OCCURRENCE_ID, fields.occurrence_id);
    writer.add_string(KEY_CRASH_TYPE, fields.crash_type.as_str());
    writer.add_string(KEY_ERROR_CODE, fields.error_code);
    writer.add_string(KEY_ERROR_TYPE, fields.error_type);
    writer.add_string(KEY_ERROR_DESCRIPTION, fields.error_description);
    if let Some(signal) = fields.signal {
        emit_siginfo(writer, &signal);
    }
    writer.add_unsigned_integer(KEY_PID, fields.pid as u64);
    writer.add_unsigned_integer(KEY_TIMESTAMP_MS, fields.timestamp_ms);
    emit_launch(writer, &fields.launch);
    emit_user_attributes(writer, fields.user_attributes);
    emit_additional_data(writer, fields.on_crash);
}

fn emit_siginfo(writer: &mut ReportWriter, signal: &SignalDetails) {
    writer.add_integer(KEY_SIGNAL, signal.signum as i64);
    writer.add_integer(KEY_SI_CODE, signal.si_code as i64);
    if let Some(addr) = signal.si_addr {
        let mut buf = [0u8; HEX_ADDR_LEN];
        writer.add_string(KEY_SI_ADDR, format_hex_addr(addr, &mut buf));
    }
}

fn emit_launch(writer: &mut ReportWriter, launch: &LaunchSnapshot) {
    writer.begin_container(KEY_LAUNCH);
    writer.add_unsigned_integer(KEY_LAUNCH_WINDOW_START_MS, launch.window_start_ms);
    writer.add_unsigned_integer(KEY_LAUNCH_WINDOW_DURATION_MS, launch.window_duration_ms);
    writer.add_bool(KEY_LAUNCH_COMPLETED, launch.completed);
    writer.end_container();
}

fn emit_user_attributes(writer: &mut ReportWriter, attributes: &[(String, String)]) {
    writer.begin_container(KEY_USER_ATTRIBUTES);
    for (key, value) in attributes {
        writer.add_string(key, value);
    }
    writer.end_container();
}

fn emit_additional_data(writer: &mut ReportWriter, on_crash: Option<OnCrashCallback>) {
    writer.begin_container(KEY_ADDITIONAL_DATA);
    if let Some(callback) = on_crash {
        let floor = writer.lock_current_depth();
        callback(writer);
        writer.unlock_to(floor);
    }
    writer.end_container();
}

const HEX_ADDR_LEN: usize = 18;

/// `{:#018x}` without the formatting machinery.
fn format_hex_addr(addr: usize, buf: &mut [u8; HEX_ADDR_LEN]) -> &str {
    const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";
    let addr = addr as u64;
    buf[0] = b'0';
    buf[1] = b'x';
    for i in 0..16 {
        let nibble = (addr >> ((15 - i) * 4)) & 0xF;
        buf[2 + i] = HEX_DIGITS[nibble as usize];
    }
    // Only ASCII digits were written.
    std::str::from_utf8(buf).unwrap_or("0x0")
}

/// Decimal rendering of a signal number, for the `error_code` field.
pub(crate) fn format_signum(signum: i32, buf: &mut [u8; 20]) -> &str {
    std::str::from_utf8(format_i64(signum as i64, buf)).unwrap_or("0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::CrashMetaRecord;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    fn on_crash(writer: &mut dyn CrashReportWriter) {
        writer.add_unsigned_integer("requests_in_flight", 3);
        writer.begin_container("build");
        writer.add_string("commit", "abc123");
        writer.end_container();
        // Must not escape the additional data object.
        writer.end_container();
        writer.end_container();
        writer.add_integer("last", -1);
    }

    #[test]
    fn test_format_hex_addr() {
        let mut buf = [0u8; HEX_ADDR_LEN];
        assert_eq!(format_hex_addr(0, &mut buf), "0x0000000000000000");
        assert_eq!(format_hex_addr(0xdead_beef, &mut buf), "0x00000000deadbeef");
        let mut buf = [0u8; 20];
        assert_eq!(format_signum(11, &mut buf), "11");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("report.partial");
        let pending = dir.path().join("report.0.crash");
        let partial_c = CString::new(partial.as_os_str().as_bytes()).unwrap();
        let pending_c = CString::new(pending.as_os_str().as_bytes()).unwrap();

        let occurrence_id = uuid::Uuid::new_v4().to_string();
        let attributes = vec![
            ("plan".to_string(), "pro".to_string()),
            ("name".to_string(), "Zoë \"quoted\"".to_string()),
        ];
        let launch = LaunchSnapshot {
            window_start_ms: 1_000,
            window_duration_ms: 5_000,
            completed: false,
        };
        let fields = ReportFields {
            occurrence_id: &occurrence_id,
            crash_type: CrashType::Crash,
            error_code: "11",
            error_type: "SIGSEGV",
            error_description: "boom\nwith a newline",
            signal: Some(SignalDetails {
                signum: libc::SIGSEGV,
                si_code: 1,
                si_addr: Some(0x10),
            }),
            pid: 77,
            timestamp_ms: 4_000,
            launch,
            user_attributes: &attributes,
            on_crash: Some(on_crash),
        };
        assert!(emit_report_file(&partial_c, &pending_c, 64 * 1024, &fields));
        assert!(!partial.exists());

        let record = CrashMetaRecord::from_file(&pending).unwrap();
        assert_eq!(record.occurrence_id, occurrence_id);
        assert_eq!(record.error_code, "11");
        assert_eq!(record.error_type, "SIGSEGV");
        assert_eq!(record.error_description, "boom\nwith a newline");
        assert_eq!(record.user_attributes["name"], "Zoë \"quoted\"");
        assert_eq!(record.user_attributes["plan"], "pro");
        assert_eq!(record.additional_crash_data["requests_in_flight"], 3);
        assert_eq!(record.additional_crash_data["build"]["commit"], "abc123");
        assert_eq!(record.additional_crash_data["last"], -1);
        assert_eq!(
            record.sig_info.unwrap().si_addr.as_deref(),
            Some("0x0000000000000010")
        );
        assert!(record.is_launch_crash);
        assert!(record.processing_duration_ms.is_some());
    }

    #[test]
    fn test_unwritable_path_fails_quietly() {
        let partial = CString::new("/nonexistent-dir-for-crashreport/a.partial").unwrap();
        let pending = CString::new("/nonexistent-dir-for-crashreport/a.0.crash").unwrap();
        let fields = ReportFields {
            occurrence_id: "id",
            crash_type: CrashType::Crash,
            error_code: "6",
            error_type: "SIGABRT",
            error_description: "",
            signal: None,
            pid: 1,
            timestamp_ms: 0,
            launch: LaunchSnapshot {
                window_start_ms: 0,
                window_duration_ms: 0,
                completed: true,
            },
            user_attributes: &[],
            on_crash: None,
        };
        assert!(!emit_report_file(&partial, &pending, 1024, &fields));
    }
}
