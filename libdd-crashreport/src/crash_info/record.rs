// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::CrashType;
use crate::shared::launch_gate::{LaunchCrashGate, LaunchSnapshot};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ReportParseError {
    #[error("Failed to read crash report: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crash report is not a valid document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Crash report has an invalid occurrence id: {0}")]
    InvalidOccurrenceId(String),
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct SigInfo {
    pub si_signo: i32,
    pub si_signo_human_readable: String,
    pub si_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub si_addr: Option<String>,
}

/// One crash, as read back from disk on the launch after it happened.
///
/// Records are only built by [`CrashMetaRecord::from_report_bytes`] (or the test helpers) and
/// handed out by reference afterwards.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CrashMetaRecord {
    pub occurrence_id: String,
    pub crash_type: CrashType,
    pub error_code: String,
    pub error_type: String,
    pub error_description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub additional_crash_data: serde_json::Map<String, serde_json::Value>,
    /// Set when the report was sent without its attachments because of rate limiting.
    pub rate_limited: bool,
    /// Time the crash handler spent writing the report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig_info: Option<SigInfo>,
    pub pid: u32,
    /// RFC 3339 rendering of `timestamp_ms`.
    pub timestamp: String,
    pub timestamp_ms: u64,
    pub launch: LaunchSnapshot,
    pub is_launch_crash: bool,
}

/// The record exactly as the collector lays it out on disk.
#[derive(Deserialize)]
struct RawCrashRecord {
    occurrence_id: String,
    crash_type: CrashType,
    error_code: String,
    error_type: String,
    #[serde(default)]
    error_description: String,
    #[serde(default)]
    signal: Option<i32>,
    #[serde(default)]
    si_code: Option<i32>,
    #[serde(default)]
    si_addr: Option<String>,
    #[serde(default)]
    pid: u32,
    timestamp_ms: u64,
    launch: LaunchSnapshot,
    #[serde(default)]
    user_attributes: BTreeMap<String, String>,
    #[serde(default)]
    additional_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    processing_duration_ms: Option<u64>,
}

impl CrashMetaRecord {
    pub fn from_report_bytes(bytes: &[u8]) -> Result<Self, ReportParseError> {
        let raw: RawCrashRecord = serde_json::from_slice(bytes)?;
        uuid::Uuid::parse_str(&raw.occurrence_id)
            .map_err(|_| ReportParseError::InvalidOccurrenceId(raw.occurrence_id.clone()))?;

        let gate = LaunchCrashGate::from_snapshot(raw.launch);
        let is_launch_crash = gate.classify(raw.timestamp_ms);
        let timestamp = DateTime::<Utc>::from_timestamp_millis(raw.timestamp_ms as i64)
            .unwrap_or_default()
            .to_rfc3339();
        let sig_info = raw.signal.map(|si_signo| SigInfo {
            si_signo,
            si_signo_human_readable: raw.error_type.clone(),
            si_code: raw.si_code.unwrap_or_default(),
            si_addr: raw.si_addr.clone(),
        });

        Ok(Self {
            occurrence_id: raw.occurrence_id,
            crash_type: raw.crash_type,
            error_code: raw.error_code,
            error_type: raw.error_type,
            error_description: raw.error_description,
            user_attributes: raw.user_attributes,
            additional_crash_data: raw.additional_data,
            rate_limited: false,
            processing_duration_ms: raw.processing_duration_ms,
            sig_info,
            pid: raw.pid,
            timestamp,
            timestamp_ms: raw.timestamp_ms,
            launch: raw.launch,
            is_launch_crash,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ReportParseError> {
        let bytes = std::fs::read(path)?;
        Self::from_report_bytes(&bytes)
    }

    /// Drops the attachments of a report sent past the rate limit.
    pub fn into_rate_limited(mut self) -> Self {
        self.rate_limited = true;
        self.additional_crash_data.clear();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::test_utils::TestInstance;

    impl TestInstance for CrashMetaRecord {
        fn test_instance(seed: u64) -> Self {
            let launch = LaunchSnapshot {
                window_start_ms: 1_700_000_000_000,
                window_duration_ms: 5000,
                completed: false,
            };
            let timestamp_ms = launch.window_start_ms + seed;
            let mut user_attributes = BTreeMap::new();
            user_attributes.insert("user".to_string(), format!("user-{seed}"));
            Self {
                occurrence_id: uuid::Uuid::from_u128(seed as u128).to_string(),
                crash_type: CrashType::Crash,
                error_code: libc::SIGSEGV.to_string(),
                error_type: "SIGSEGV".to_string(),
                error_description: "Invalid memory reference".to_string(),
                user_attributes,
                additional_crash_data: serde_json::Map::new(),
                rate_limited: false,
                processing_duration_ms: Some(1),
                sig_info: None,
                pid: 42,
                timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
                    .unwrap()
                    .to_rfc3339(),
                timestamp_ms,
                launch,
                is_launch_crash: seed <= 5000,
            }
        }
    }

    fn raw_report(timestamp_ms: u64, completed: bool) -> String {
        format!(
            r#"{{"occurrence_id":"67e55044-10b1-426f-9247-bb680e5fe0c8","crash_type":"crash",
            "error_code":"11","error_type":"SIGSEGV","error_description":"Invalid memory reference",
            "signal":11,"si_code":1,"si_addr":"0x0","pid":1234,"timestamp_ms":{timestamp_ms},
            "launch":{{"window_start_ms":1000000,"window_duration_ms":5000,"completed":{completed}}},
            "user_attributes":{{"plan":"pro","plan":"free"}},
            "additional_data":{{"counter":3}},"processing_duration_ms":2}}"#
        )
    }

    #[test]
    fn test_parse_report() {
        let record = CrashMetaRecord::from_report_bytes(raw_report(1_004_000, false).as_bytes())
            .unwrap();
        assert_eq!(record.occurrence_id, "67e55044-10b1-426f-9247-bb680e5fe0c8");
        assert_eq!(record.crash_type, CrashType::Crash);
        assert_eq!(record.error_code, "11");
        assert_eq!(record.error_type, "SIGSEGV");
        assert_eq!(record.pid, 1234);
        // Duplicate keys collapse, the last one wins.
        assert_eq!(record.user_attributes.len(), 1);
        assert_eq!(record.user_attributes["plan"], "free");
        assert_eq!(record.additional_crash_data["counter"], 3);
        assert_eq!(record.sig_info.as_ref().unwrap().si_addr.as_deref(), Some("0x0"));
        assert!(record.is_launch_crash);
        assert!(!record.rate_limited);
        assert!(record.timestamp.starts_with("1970-01-01T00:16:44"));
    }

    #[test]
    fn test_launch_classification() {
        let late = CrashMetaRecord::from_report_bytes(raw_report(1_006_000, false).as_bytes())
            .unwrap();
        assert!(!late.is_launch_crash);
        let completed =
            CrashMetaRecord::from_report_bytes(raw_report(1_001_000, true).as_bytes()).unwrap();
        assert!(!completed.is_launch_crash);
    }

    #[test]
    fn test_malformed_reports() {
        let truncated = raw_report(1_004_000, false);
        let truncated = &truncated.as_bytes()[..truncated.len() / 2];
        assert!(matches!(
            CrashMetaRecord::from_report_bytes(truncated),
            Err(ReportParseError::Malformed(_))
        ));
        assert!(matches!(
            CrashMetaRecord::from_report_bytes(b""),
            Err(ReportParseError::Malformed(_))
        ));
        let bad_id = raw_report(1_004_000, false)
            .replace("67e55044-10b1-426f-9247-bb680e5fe0c8", "not-a-uuid");
        assert!(matches!(
            CrashMetaRecord::from_report_bytes(bad_id.as_bytes()),
            Err(ReportParseError::InvalidOccurrenceId(_))
        ));
    }

    #[test]
    fn test_rate_limited_drops_attachments() {
        let record = CrashMetaRecord::from_report_bytes(raw_report(1_004_000, false).as_bytes())
            .unwrap()
            .into_rate_limited();
        assert!(record.rate_limited);
        assert!(record.additional_crash_data.is_empty());
        assert_eq!(record.user_attributes["plan"], "free");
    }

    #[test]
    fn test_serde_round_trip() {
        let record = CrashMetaRecord::test_instance(100);
        let json = serde_json::to_string(&record).unwrap();
        let back: CrashMetaRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
