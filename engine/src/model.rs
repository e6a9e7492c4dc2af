//! Core data model for backup works and jobs.
//!
//! This module defines the main data structures:
//! - BackupWork: a named source/destination folder pair
//! - BackupType: full or differential selection of files
//! - FileItem: a single file scheduled for transfer
//! - JobState: the per-job execution state machine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// A user-defined backup: copy everything under `source` into `destination`.
///
/// Works are immutable once added to a list; runners only read them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupWork {
    /// Display name, unique within a work list
    pub name: String,

    /// Root source directory
    pub source: PathBuf,

    /// Root destination directory
    pub destination: PathBuf,

    /// Which files are selected for transfer
    #[serde(default)]
    pub backup_type: BackupType,
}

impl BackupWork {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        backup_type: BackupType,
    ) -> Self {
        BackupWork {
            name: name.into(),
            source: source.into(),
            destination: destination.into(),
            backup_type,
        }
    }
}

/// How files are selected for a backup work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackupType {
    /// Copy every file of the source tree
    #[default]
    Full,
    /// Copy only files absent from the destination or newer than their copy
    Differential,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupType::Full => write!(f, "Full"),
            BackupType::Differential => write!(f, "Differential"),
        }
    }
}

impl std::str::FromStr for BackupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(BackupType::Full),
            "diff" | "differential" => Ok(BackupType::Differential),
            other => Err(format!(
                "Invalid backup type '{}'. Must be 'full' or 'differential'",
                other
            )),
        }
    }
}

/// A single regular file within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    /// Full source path
    pub source_path: PathBuf,

    /// Full destination path
    pub destination_path: PathBuf,

    /// File size in bytes
    pub file_size: u64,

    /// Source modification time, if the platform reports one
    pub last_modified: Option<SystemTime>,
}

impl FileItem {
    /// Lowercased extension with a leading dot (".docx"), or empty.
    pub fn extension(&self) -> String {
        normalized_extension(&self.source_path)
    }
}

/// Lowercased extension of `path` with a leading dot, or an empty string.
pub fn normalized_extension(path: &std::path::Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default()
}

/// The state of one job runner.
///
/// Edges:
/// - `Idle -> Running` when the runner starts
/// - `Running -> Pausing` on a manual pause request
/// - `Pausing -> Paused` once the runner reaches a checkpoint
/// - `Running <-> Paused` on resume or business software activity
/// - `Running | Pausing | Paused -> Stopped` on stop
/// - `Running | Pausing -> Done | Error` when execution ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Created, not yet started
    Idle,
    /// Transferring files
    Running,
    /// Pause requested, waiting for the next checkpoint
    Pausing,
    /// Blocked on the pause latch
    Paused,
    /// Stopped by the user
    Stopped,
    /// All files transferred
    Done,
    /// Aborted by a fault
    Error,
}

impl JobState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Stopped | JobState::Error)
    }

    /// Whether the runner is on its worker thread and not yet finished.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Running | JobState::Pausing | JobState::Paused)
    }

    /// Whether `self -> next` is an edge of the state machine.
    ///
    /// `Pausing` is still executing, so it may end in `Done` or `Error` when a
    /// pause request lands after the last checkpoint.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (*self, next),
            (Idle, Running)
                | (Running, Pausing)
                | (Pausing, Paused)
                | (Paused, Running)
                | (Running, Paused)
                | (Running | Pausing | Paused, Stopped)
                | (Running | Pausing, Done)
                | (Running | Pausing, Error)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Idle => "Idle",
            JobState::Running => "Running",
            JobState::Pausing => "Pausing",
            JobState::Paused => "Paused",
            JobState::Stopped => "Stopped",
            JobState::Done => "Done",
            JobState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}
