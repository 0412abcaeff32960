// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of abnormal termination a report describes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashType {
    /// Fatal signal or unrecoverable panic.
    Crash,
    /// The process was killed from the outside, e.g. by a watchdog.
    ForceRestart,
    /// The process ran out of memory.
    Oom,
}

impl CrashType {
    pub const ALL: [CrashType; 3] = [CrashType::Crash, CrashType::ForceRestart, CrashType::Oom];

    /// Stable name, also used in the on-disk record.
    pub const fn as_str(self) -> &'static str {
        match self {
            CrashType::Crash => "crash",
            CrashType::ForceRestart => "force_restart",
            CrashType::Oom => "oom",
        }
    }
}

impl fmt::Display for CrashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrashType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CrashType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown crash type: {s}"))
    }
}

/// The host application's answer to a consent request.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum CrashReportConsent {
    Accept,
    Reject,
}
