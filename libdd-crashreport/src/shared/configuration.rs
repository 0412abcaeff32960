// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
use super::constants::*;
use super::launch_gate::is_valid_launch_duration;
use crate::crash_info::CrashType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashReportingConfiguration {
    // Maximum size of a single crash report file, in bytes
    byte_limit: u64,
    // Crash types for which the host is asked before a report is sent
    consent_required: Vec<CrashType>,
    create_alt_stack: bool,
    enabled: bool,
    // Unclean ends preceded by a termination request are reported as force restarts
    force_restart_enabled: bool,
    full_report_budget: u32,
    launch_duration_ms: u64,
    max_delivery_attempts: u32,
    oom_enabled: bool,
    signals: Vec<i32>,
    stale_claim_age: Duration,
    sync_send_launch_crashes: bool,
    sync_send_timeout_ms: u64,
    unhandled_enabled: bool,
    use_alt_stack: bool,
    // Whether user attributes go into crash reports
    user_identification_enabled: bool,
}

impl Default for CrashReportingConfiguration {
    fn default() -> Self {
        Self {
            byte_limit: DD_CRASHREPORT_DEFAULT_BYTE_LIMIT,
            consent_required: CrashType::ALL.to_vec(),
            create_alt_stack: true,
            enabled: true,
            force_restart_enabled: true,
            full_report_budget: DD_CRASHREPORT_DEFAULT_FULL_REPORT_BUDGET,
            launch_duration_ms: DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS,
            max_delivery_attempts: DD_CRASHREPORT_DEFAULT_MAX_DELIVERY_ATTEMPTS,
            oom_enabled: true,
            signals: default_signals(),
            stale_claim_age: DD_CRASHREPORT_DEFAULT_STALE_CLAIM_AGE,
            sync_send_launch_crashes: false,
            sync_send_timeout_ms: DD_CRASHREPORT_DEFAULT_SYNC_SEND_TIMEOUT_MS,
            unhandled_enabled: true,
            use_alt_stack: true,
            user_identification_enabled: true,
        }
    }
}

#[cfg(unix)]
fn default_signals() -> Vec<i32> {
    super::signals::default_signals()
}

#[cfg(not(unix))]
fn default_signals() -> Vec<i32> {
    vec![]
}

#[cfg(unix)]
fn validate_signals(signals: &[i32]) -> anyhow::Result<()> {
    signals
        .iter()
        .try_for_each(|x| super::signals::signal_from_signum(*x).map(|_| ()))
}

#[cfg(not(unix))]
fn validate_signals(_signals: &[i32]) -> anyhow::Result<()> {
    Ok(())
}

impl CrashReportingConfiguration {
    pub fn new(
        create_alt_stack: bool,
        use_alt_stack: bool,
        mut signals: Vec<i32>,
        byte_limit: Option<u64>,
    ) -> anyhow::Result<Self> {
        // Requesting to create, but not use, the altstack is considered paradoxical.
        anyhow::ensure!(
            !create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        if signals.is_empty() {
            signals = default_signals();
        } else {
            let before_len = signals.len();
            signals.sort();
            signals.dedup();
            anyhow::ensure!(
                before_len == signals.len(),
                "Signals contained duplicate elements"
            );
            validate_signals(&signals)?;
        }
        let byte_limit = byte_limit.unwrap_or(DD_CRASHREPORT_DEFAULT_BYTE_LIMIT);
        anyhow::ensure!(byte_limit > 0, "Crash report byte limit must be positive");

        Ok(Self {
            byte_limit,
            create_alt_stack,
            signals,
            use_alt_stack,
            ..Default::default()
        })
    }

    /// Applies `DD_CRASHREPORT_*` environment overrides.  Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_u64(DD_CRASHREPORT_LAUNCH_DURATION_ENV) {
            self.set_launch_duration_ms(ms);
        }
        if let Some(ms) = env_u64(DD_CRASHREPORT_SYNC_SEND_TIMEOUT_ENV) {
            self.set_sync_send_timeout_ms(ms);
        }
        self
    }

    pub fn byte_limit(&self) -> u64 {
        self.byte_limit
    }

    pub fn create_alt_stack(&self) -> bool {
        self.create_alt_stack
    }

    pub fn use_alt_stack(&self) -> bool {
        self.use_alt_stack
    }

    pub fn signals(&self) -> &Vec<i32> {
        &self.signals
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Out-of-memory reporting is only on while crash reporting as a whole is.
    pub fn oom_enabled(&self) -> bool {
        self.enabled && self.oom_enabled
    }

    /// Unhandled panic reporting is only on while crash reporting as a whole is.
    pub fn unhandled_enabled(&self) -> bool {
        self.enabled && self.unhandled_enabled
    }

    /// Force restart reporting is only on while crash reporting as a whole is.
    pub fn force_restart_enabled(&self) -> bool {
        self.enabled && self.force_restart_enabled
    }

    pub fn user_identification_enabled(&self) -> bool {
        self.user_identification_enabled
    }

    pub fn launch_duration_ms(&self) -> u64 {
        self.launch_duration_ms
    }

    pub fn sync_send_launch_crashes(&self) -> bool {
        self.sync_send_launch_crashes
    }

    pub fn sync_send_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_send_timeout_ms)
    }

    pub fn consent_required(&self, crash_type: CrashType) -> bool {
        self.consent_required.contains(&crash_type)
    }

    pub fn max_delivery_attempts(&self) -> u32 {
        self.max_delivery_attempts
    }

    pub fn full_report_budget(&self) -> u32 {
        self.full_report_budget
    }

    pub fn stale_claim_age(&self) -> Duration {
        self.stale_claim_age
    }

    pub fn set_create_alt_stack(&mut self, create_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !create_alt_stack || self.use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.create_alt_stack = create_alt_stack;
        Ok(())
    }

    pub fn set_use_alt_stack(&mut self, use_alt_stack: bool) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.create_alt_stack || use_alt_stack,
            "Cannot create an altstack without using it"
        );
        self.use_alt_stack = use_alt_stack;
        Ok(())
    }

    /// Master switch.  Turning it off also turns off the reporting features that depend on it.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_oom_enabled(&mut self, enabled: bool) {
        self.oom_enabled = enabled;
    }

    pub fn set_unhandled_enabled(&mut self, enabled: bool) {
        self.unhandled_enabled = enabled;
    }

    pub fn set_force_restart_enabled(&mut self, enabled: bool) {
        self.force_restart_enabled = enabled;
    }

    pub fn set_user_identification_enabled(&mut self, enabled: bool) {
        self.user_identification_enabled = enabled;
    }

    /// Values outside `0..=20000` ms leave the current duration unchanged.
    pub fn set_launch_duration_ms(&mut self, duration_ms: u64) {
        if is_valid_launch_duration(duration_ms) {
            self.launch_duration_ms = duration_ms;
        } else {
            tracing::warn!(
                duration_ms,
                current = self.launch_duration_ms,
                "Launch duration out of range, ignoring"
            );
        }
    }

    pub fn set_sync_send_launch_crashes(&mut self, enabled: bool) {
        self.sync_send_launch_crashes = enabled;
    }

    /// Values outside `1000..=5000` ms fall back to the 2000 ms default.
    pub fn set_sync_send_timeout_ms(&mut self, timeout_ms: u64) {
        self.sync_send_timeout_ms = normalize_sync_send_timeout_ms(timeout_ms);
    }

    pub fn set_consent_required(&mut self, crash_type: CrashType, required: bool) {
        self.consent_required.retain(|t| *t != crash_type);
        if required {
            self.consent_required.push(crash_type);
        }
    }

    /// Zero is ignored: every report gets at least one attempt.
    pub fn set_max_delivery_attempts(&mut self, attempts: u32) {
        if attempts > 0 {
            self.max_delivery_attempts = attempts;
        }
    }

    pub fn set_full_report_budget(&mut self, budget: u32) {
        self.full_report_budget = budget;
    }

    pub fn set_stale_claim_age(&mut self, age: Duration) {
        self.stale_claim_age = age;
    }
}

pub fn is_valid_sync_send_timeout_ms(timeout_ms: u64) -> bool {
    (DD_CRASHREPORT_MIN_SYNC_SEND_TIMEOUT_MS..=DD_CRASHREPORT_MAX_SYNC_SEND_TIMEOUT_MS)
        .contains(&timeout_ms)
}

pub fn normalize_sync_send_timeout_ms(timeout_ms: u64) -> u64 {
    if is_valid_sync_send_timeout_ms(timeout_ms) {
        timeout_ms
    } else {
        tracing::warn!(
            timeout_ms,
            "Synchronous send timeout out of range, using {DD_CRASHREPORT_DEFAULT_SYNC_SEND_TIMEOUT_MS} ms"
        );
        DD_CRASHREPORT_DEFAULT_SYNC_SEND_TIMEOUT_MS
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(name, raw = %raw, "Ignoring invalid environment override: {e}");
            None
        }
    }
}
