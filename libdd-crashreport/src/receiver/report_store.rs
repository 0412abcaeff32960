// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Directory-backed persistence of crash reports between the crash and its delivery.
//!
//! The state of a report is encoded in its file name, and every transition is a `rename(2)`
//! within the directory, which is atomic:
//!
//! - `<id>.partial`: being written by the crash handler, or abandoned mid-write.
//! - `<id>.<attempt>.crash`: complete, waiting for delivery attempt number `<attempt>`.
//! - `<id>.<attempt>.claimed`: owned by a running delivery attempt.
//!
//! Whoever wins the rename from `.crash` to `.claimed` is the only one delivering that report.

use crate::shared::constants::{
    DD_CRASHREPORT_CLAIMED_EXTENSION, DD_CRASHREPORT_PARTIAL_EXTENSION,
    DD_CRASHREPORT_PENDING_EXTENSION,
};
use crate::shared::launch_gate::LaunchSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SESSION_MARKER_FILE: &str = "session.json";
const TERMINATION_FLAG_FILE: &str = "session.terminated";

#[derive(Debug, thiserror::Error)]
pub enum ReportStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Report {0} is not available, another delivery attempt owns it")]
    AlreadyClaimed(String),
    #[error("Invalid session marker: {0}")]
    InvalidSessionMarker(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ReportStoreError + '_ {
    move |source| ReportStoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where the crash handler of this process writes, and where the finished report goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturePaths {
    pub occurrence_id: String,
    pub partial: PathBuf,
    pub pending: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingReport {
    pub occurrence_id: String,
    /// Number of delivery attempts that already failed.
    pub attempt: u32,
    pub path: PathBuf,
}

/// A report owned by the current delivery attempt.  Must be handed back to the store through
/// one of `complete`, `discard`, `retain` or `release_for_retry`.
#[derive(Debug, PartialEq, Eq)]
pub struct ClaimedReport {
    pub occurrence_id: String,
    pub attempt: u32,
    pub path: PathBuf,
}

/// Written when crash reporting starts, removed when the process exits normally.  Finding one
/// from a previous process means that process ended without a clean shutdown.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SessionMarker {
    pub occurrence_id: String,
    pub pid: u32,
    pub launch: LaunchSnapshot,
    #[serde(default)]
    pub user_attributes: BTreeMap<String, String>,
    /// When the marker was last written.  Filled in from the file itself.
    #[serde(skip)]
    pub last_updated_ms: u64,
    /// The process was asked to terminate (`SIGTERM`) before it ended.  Filled in from the
    /// termination flag file.
    #[serde(skip)]
    pub termination_requested: bool,
}

#[derive(Clone, Debug)]
pub struct ReportStore {
    dir: PathBuf,
}

enum ReportFile {
    Partial {
        occurrence_id: String,
    },
    Pending {
        occurrence_id: String,
        attempt: u32,
    },
    Claimed {
        occurrence_id: String,
        attempt: u32,
    },
}

fn parse_file_name(name: &str) -> Option<ReportFile> {
    let mut parts = name.split('.');
    let occurrence_id = parts.next()?.to_string();
    let second = parts.next()?;
    let third = parts.next();
    if parts.next().is_some() || uuid::Uuid::parse_str(&occurrence_id).is_err() {
        return None;
    }
    match third {
        None if second == DD_CRASHREPORT_PARTIAL_EXTENSION => {
            Some(ReportFile::Partial { occurrence_id })
        }
        Some(ext) => {
            let attempt = second.parse().ok()?;
            if ext == DD_CRASHREPORT_PENDING_EXTENSION {
                Some(ReportFile::Pending {
                    occurrence_id,
                    attempt,
                })
            } else if ext == DD_CRASHREPORT_CLAIMED_EXTENSION {
                Some(ReportFile::Claimed {
                    occurrence_id,
                    attempt,
                })
            } else {
                None
            }
        }
        None => None,
    }
}

fn file_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(now.duration_since(modified).unwrap_or_default())
}

fn remove_if_exists(path: &Path) -> Result<(), ReportStoreError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path)(e)),
        _ => Ok(()),
    }
}

impl ReportStore {
    /// Opens the store, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ReportStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, occurrence_id: &str, attempt: u32, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{occurrence_id}.{attempt}.{extension}"))
    }

    pub fn capture_paths(&self, occurrence_id: &str) -> CapturePaths {
        CapturePaths {
            occurrence_id: occurrence_id.to_string(),
            partial: self
                .dir
                .join(format!("{occurrence_id}.{DD_CRASHREPORT_PARTIAL_EXTENSION}")),
            pending: self.path_for(occurrence_id, 0, DD_CRASHREPORT_PENDING_EXTENSION),
        }
    }

    fn entries(&self) -> Result<Vec<(PathBuf, ReportFile)>, ReportStoreError> {
        let mut entries = vec![];
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(file) = parse_file_name(&name) {
                entries.push((entry.path(), file));
            }
        }
        Ok(entries)
    }

    /// Reports waiting for delivery, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingReport>, ReportStoreError> {
        let mut pending: Vec<(SystemTime, PendingReport)> = self
            .entries()?
            .into_iter()
            .filter_map(|(path, file)| match file {
                ReportFile::Pending {
                    occurrence_id,
                    attempt,
                } => {
                    let modified = fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    Some((
                        modified,
                        PendingReport {
                            occurrence_id,
                            attempt,
                            path,
                        },
                    ))
                }
                _ => None,
            })
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.path.cmp(&b.1.path)));
        Ok(pending.into_iter().map(|(_, report)| report).collect())
    }

    pub fn has_pending(&self) -> bool {
        self.pending().map(|p| !p.is_empty()).unwrap_or(false)
    }

    /// Takes ownership of a pending report.  Fails with `AlreadyClaimed` if another delivery
    /// attempt got there first.
    pub fn claim(&self, report: &PendingReport) -> Result<ClaimedReport, ReportStoreError> {
        let claimed = self.path_for(
            &report.occurrence_id,
            report.attempt,
            DD_CRASHREPORT_CLAIMED_EXTENSION,
        );
        match fs::rename(&report.path, &claimed) {
            Ok(()) => Ok(ClaimedReport {
                occurrence_id: report.occurrence_id.clone(),
                attempt: report.attempt,
                path: claimed,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ReportStoreError::AlreadyClaimed(report.occurrence_id.clone()))
            }
            Err(e) => Err(io_error(&report.path)(e)),
        }
    }

    /// The report was delivered.
    pub fn complete(&self, claimed: ClaimedReport) -> Result<(), ReportStoreError> {
        fs::remove_file(&claimed.path).map_err(io_error(&claimed.path))
    }

    /// The report must never be delivered.
    pub fn discard(&self, claimed: ClaimedReport) -> Result<(), ReportStoreError> {
        fs::remove_file(&claimed.path).map_err(io_error(&claimed.path))
    }

    /// Gives the report back untouched, for a later launch to try again.
    pub fn retain(&self, claimed: ClaimedReport) -> Result<PendingReport, ReportStoreError> {
        self.unclaim(claimed, 0)
    }

    /// Delivery failed: give the report back and count the attempt.
    pub fn release_for_retry(
        &self,
        claimed: ClaimedReport,
    ) -> Result<PendingReport, ReportStoreError> {
        self.unclaim(claimed, 1)
    }

    fn unclaim(
        &self,
        claimed: ClaimedReport,
        attempt_increment: u32,
    ) -> Result<PendingReport, ReportStoreError> {
        let attempt = claimed.attempt.saturating_add(attempt_increment);
        let path = self.path_for(
            &claimed.occurrence_id,
            attempt,
            DD_CRASHREPORT_PENDING_EXTENSION,
        );
        fs::rename(&claimed.path, &path).map_err(io_error(&claimed.path))?;
        Ok(PendingReport {
            occurrence_id: claimed.occurrence_id,
            attempt,
            path,
        })
    }

    /// Claims older than `age` belong to a delivery attempt that died.  They are released as a
    /// failed attempt.  Returns how many were released.
    pub fn reclaim_stale(&self, age: Duration) -> Result<usize, ReportStoreError> {
        let now = SystemTime::now();
        let mut reclaimed = 0;
        for (path, file) in self.entries()? {
            let ReportFile::Claimed {
                occurrence_id,
                attempt,
            } = file
            else {
                continue;
            };
            if file_age(&path, now).is_some_and(|a| a >= age) {
                tracing::debug!(occurrence_id, "Reclaiming stale crash report claim");
                self.release_for_retry(ClaimedReport {
                    occurrence_id,
                    attempt,
                    path,
                })?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    /// Removes captures older than `age` that never completed.  `keep` names the occurrence id
    /// of the running process, whose capture file must not be touched.
    pub fn discard_stale_partials(
        &self,
        age: Duration,
        keep: Option<&str>,
    ) -> Result<usize, ReportStoreError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, file) in self.entries()? {
            let ReportFile::Partial { occurrence_id } = file else {
                continue;
            };
            if keep == Some(occurrence_id.as_str()) {
                continue;
            }
            if file_age(&path, now).is_some_and(|a| a >= age) {
                tracing::warn!(occurrence_id, "Discarding incomplete crash report");
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn session_marker_path(&self) -> PathBuf {
        self.dir.join(SESSION_MARKER_FILE)
    }

    /// Records that a process is running with crash reporting on.
    pub fn begin_session(&self, marker: &SessionMarker) -> Result<(), ReportStoreError> {
        let path = self.session_marker_path();
        let tmp = self.dir.join(format!("{SESSION_MARKER_FILE}.tmp"));
        let bytes = serde_json::to_vec(marker)?;
        fs::write(&tmp, bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))
    }

    /// Where the termination handler of the running process leaves its flag.
    pub fn termination_flag_path(&self) -> PathBuf {
        self.dir.join(TERMINATION_FLAG_FILE)
    }

    /// Records an orderly shutdown.
    pub fn end_session(&self) -> Result<(), ReportStoreError> {
        remove_if_exists(&self.session_marker_path())?;
        remove_if_exists(&self.termination_flag_path())
    }

    /// Marks the session as still alive now, without rewriting it.  Does nothing once the
    /// session ended.
    pub fn touch_session(&self) -> Result<(), ReportStoreError> {
        let path = self.session_marker_path();
        let file = match fs::OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(&path)(e)),
        };
        file.set_modified(SystemTime::now()).map_err(io_error(&path))
    }

    /// Returns the marker left by a previous process, if it did not shut down cleanly.  The
    /// marker is consumed.
    pub fn take_previous_session(&self) -> Result<Option<SessionMarker>, ReportStoreError> {
        let path = self.session_marker_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        let last_updated_ms = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as u64);
        fs::remove_file(&path).map_err(io_error(&path))?;
        let flag = self.termination_flag_path();
        let termination_requested = flag.exists();
        remove_if_exists(&flag)?;
        let mut marker: SessionMarker = serde_json::from_slice(&bytes)?;
        marker.last_updated_ms = last_updated_ms;
        marker.termination_requested = termination_requested;
        Ok(Some(marker))
    }

    /// Whether any file for `occurrence_id` exists, whatever its state.
    pub fn contains(&self, occurrence_id: &str) -> bool {
        self.entries()
            .map(|entries| {
                entries.iter().any(|(_, file)| match file {
                    ReportFile::Partial { occurrence_id: id }
                    | ReportFile::Pending {
                        occurrence_id: id, ..
                    }
                    | ReportFile::Claimed {
                        occurrence_id: id, ..
                    } => id == occurrence_id,
                })
            })
            .unwrap_or(false)
    }
}
