// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a crash happened while the application was still launching.
//!
//! The gate is shared between the running application, which starts the window and marks it
//! complete, and the signal handler, which snapshots it into the crash report.  All state is
//! therefore kept in atomics.  The snapshot travels with the report, so the delivery code on the
//! next launch can classify the crash against the window of the process that died.

use super::constants::{
    DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS, DD_CRASHREPORT_MAX_LAUNCH_DURATION_MS,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub enum LaunchState {
    InLaunchWindow,
    LaunchComplete,
}

/// The launch window as it was when a crash was captured.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct LaunchSnapshot {
    pub window_start_ms: u64,
    pub window_duration_ms: u64,
    pub completed: bool,
}

/// Milliseconds since the unix epoch.
///
/// Wall clock rather than monotonic: the value is compared across process lifetimes.
/// `SystemTime::now` boils down to `clock_gettime`, which is async-signal-safe.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn is_valid_launch_duration(duration_ms: u64) -> bool {
    duration_ms <= DD_CRASHREPORT_MAX_LAUNCH_DURATION_MS
}

#[derive(Debug)]
pub struct LaunchCrashGate {
    started: AtomicBool,
    completed: AtomicBool,
    window_start_ms: AtomicU64,
    window_duration_ms: AtomicU64,
}

impl Default for LaunchCrashGate {
    fn default() -> Self {
        Self::new()
    }
}

impl LaunchCrashGate {
    pub const fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            window_start_ms: AtomicU64::new(0),
            window_duration_ms: AtomicU64::new(DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS),
        }
    }

    /// Rebuilds the gate of a previous process from the snapshot persisted in its crash report.
    pub fn from_snapshot(snapshot: LaunchSnapshot) -> Self {
        Self {
            started: AtomicBool::new(true),
            completed: AtomicBool::new(snapshot.completed),
            window_start_ms: AtomicU64::new(snapshot.window_start_ms),
            window_duration_ms: AtomicU64::new(snapshot.window_duration_ms),
        }
    }

    /// Changes the window length.  Values outside `0..=20000` ms are ignored, as are changes
    /// once the window has started.  Returns whether the value was applied.
    pub fn set_window_duration(&self, duration_ms: u64) -> bool {
        if !is_valid_launch_duration(duration_ms) {
            tracing::debug!(duration_ms, "Ignoring out of range launch window duration");
            return false;
        }
        if self.started.load(SeqCst) {
            tracing::debug!(duration_ms, "Launch window already started, keeping duration");
            return false;
        }
        self.window_duration_ms.store(duration_ms, SeqCst);
        true
    }

    pub fn window_duration_ms(&self) -> u64 {
        self.window_duration_ms.load(SeqCst)
    }

    /// Sets the window length, then opens the window now.  An out-of-range `window_ms` keeps
    /// the current duration.
    pub fn start_with_window(&self, window_ms: u64) -> bool {
        self.set_window_duration(window_ms);
        self.start()
    }

    /// Opens the launch window now.  See [`Self::start_at`].
    pub fn start(&self) -> bool {
        self.start_at(unix_time_ms())
    }

    /// Opens the launch window at `now_ms`.  Only the first call has an effect.
    pub fn start_at(&self, now_ms: u64) -> bool {
        if self
            .started
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_err()
        {
            return false;
        }
        self.window_start_ms.store(now_ms, SeqCst);
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.load(SeqCst)
    }

    /// Ends the launch window now.  See [`Self::mark_complete_at`].
    pub fn mark_complete(&self) -> bool {
        self.mark_complete_at(unix_time_ms())
    }

    /// Ends the launch window, provided it started and its deadline has not passed yet.
    ///
    /// A call after the deadline, before `start`, or after a previous completion is a no-op.
    /// Returns whether this call performed the transition.
    pub fn mark_complete_at(&self, now_ms: u64) -> bool {
        if !self.started.load(SeqCst) || now_ms > self.deadline_ms() {
            return false;
        }
        self.completed
            .compare_exchange(false, true, SeqCst, SeqCst)
            .is_ok()
    }

    fn deadline_ms(&self) -> u64 {
        self.window_start_ms
            .load(SeqCst)
            .saturating_add(self.window_duration_ms.load(SeqCst))
    }

    pub fn state(&self) -> LaunchState {
        self.state_at(unix_time_ms())
    }

    /// The window is left either explicitly, through `mark_complete`, or by elapsing.
    pub fn state_at(&self, now_ms: u64) -> LaunchState {
        if self.completed.load(SeqCst) || (self.started.load(SeqCst) && now_ms > self.deadline_ms())
        {
            LaunchState::LaunchComplete
        } else {
            LaunchState::InLaunchWindow
        }
    }

    /// Whether a crash at `crash_timestamp_ms` counts as a launch crash.
    ///
    /// Nothing is a launch crash before the window was started.
    pub fn classify(&self, crash_timestamp_ms: u64) -> bool {
        self.started.load(SeqCst)
            && !self.completed.load(SeqCst)
            && crash_timestamp_ms <= self.deadline_ms()
    }

    /// Reads the gate with plain atomic loads.  Safe to call from a signal handler.
    pub fn snapshot(&self) -> LaunchSnapshot {
        LaunchSnapshot {
            window_start_ms: self.window_start_ms.load(SeqCst),
            window_duration_ms: self.window_duration_ms.load(SeqCst),
            completed: self.completed.load(SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const START: u64 = 1_700_000_000_000;

    fn started_gate(duration_ms: u64) -> LaunchCrashGate {
        let gate = LaunchCrashGate::new();
        assert!(gate.set_window_duration(duration_ms));
        assert!(gate.start_at(START));
        gate
    }

    #[test]
    fn test_classify_inside_and_outside_window() {
        let gate = started_gate(5000);
        assert!(gate.classify(START + 4000));
        assert!(!gate.classify(START + 6000));
        // Both ends of the window are inclusive.
        assert!(gate.classify(START));
        assert!(gate.classify(START + 5000));
        assert!(!gate.classify(START + 5001));
    }

    #[test]
    fn test_mark_complete_ends_window() {
        let gate = started_gate(5000);
        assert_eq!(gate.state_at(START + 100), LaunchState::InLaunchWindow);
        assert!(gate.mark_complete_at(START + 1000));
        assert_eq!(gate.state_at(START + 1001), LaunchState::LaunchComplete);
        assert!(!gate.classify(START + 1500));
        assert!(!gate.classify(START));
        // Already completed.
        assert!(!gate.mark_complete_at(START + 1200));
    }

    #[test]
    fn test_mark_complete_after_deadline_is_noop() {
        let gate = started_gate(5000);
        assert!(!gate.mark_complete_at(START + 5001));
        assert!(!gate.snapshot().completed);
        assert_eq!(gate.state_at(START + 5001), LaunchState::LaunchComplete);
        assert!(!gate.classify(START + 7000));
    }

    #[test]
    fn test_mark_complete_before_start_is_noop() {
        let gate = LaunchCrashGate::new();
        assert!(!gate.mark_complete_at(START));
        assert!(!gate.classify(START));
        assert!(gate.start_at(START));
        assert!(gate.classify(START + 10));
    }

    #[test]
    fn test_start_only_once() {
        let gate = started_gate(5000);
        assert!(!gate.start_at(START + 10_000));
        assert_eq!(gate.snapshot().window_start_ms, START);
    }

    #[test]
    fn test_out_of_range_duration_ignored() {
        let gate = LaunchCrashGate::new();
        assert_eq!(
            gate.window_duration_ms(),
            DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS
        );
        assert!(!gate.set_window_duration(20_001));
        assert_eq!(
            gate.window_duration_ms(),
            DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS
        );
        assert!(gate.set_window_duration(3000));
        assert!(!gate.set_window_duration(u64::MAX));
        assert_eq!(gate.window_duration_ms(), 3000);
        assert!(gate.set_window_duration(0));
        assert!(gate.set_window_duration(20_000));
    }

    #[test]
    fn test_start_with_window() {
        let gate = LaunchCrashGate::new();
        assert!(gate.start_with_window(1500));
        assert_eq!(gate.window_duration_ms(), 1500);

        let gate = LaunchCrashGate::new();
        assert!(gate.start_with_window(30_000));
        assert_eq!(
            gate.window_duration_ms(),
            DD_CRASHREPORT_DEFAULT_LAUNCH_DURATION_MS
        );
        assert!(gate.is_started());
    }

    #[test]
    fn test_zero_length_window() {
        let gate = started_gate(0);
        assert!(gate.classify(START));
        assert!(!gate.classify(START + 1));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let gate = started_gate(2500);
        let restored = LaunchCrashGate::from_snapshot(gate.snapshot());
        assert_eq!(restored.snapshot(), gate.snapshot());
        assert!(restored.classify(START + 2000));

        gate.mark_complete_at(START + 100);
        let restored = LaunchCrashGate::from_snapshot(gate.snapshot());
        assert!(!restored.classify(START + 2000));
    }
}
