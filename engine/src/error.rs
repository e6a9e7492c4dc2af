//! Error types for the backup engine.
//!
//! The primary error type is `EngineError`. Configuration faults (missing
//! folders, unknown work indices) are raised before a batch starts; transfer
//! faults and cancellation are raised from inside a running job and decide
//! the terminal state of that job only.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the engine.
///
/// `Cancelled` is not a failure: it is how a stopped job unwinds out of any
/// suspension point (pause latch, priority gate, large-file permit, business
/// software poll) and is never reported as an error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The job was stopped by the user
    #[error("Job was cancelled")]
    Cancelled,

    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Destination directory does not exist
    #[error("Destination directory not found: {}", path.display())]
    DestinationNotFound { path: PathBuf },

    /// No backup work at this index in the work list
    #[error("No backup work at index {index}")]
    WorkNotFound { index: usize },

    /// A work with the same name is already in the list
    #[error("A backup work named '{name}' already exists")]
    DuplicateWork { name: String },

    /// Failed to enumerate source directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed { path: PathBuf, source: io::Error },

    /// Failed to read from source file
    #[error("Failed to read file: {}", path.display())]
    ReadError { path: PathBuf, source: io::Error },

    /// Failed to write to destination file
    #[error("Failed to write file: {}", path.display())]
    WriteError { path: PathBuf, source: io::Error },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed { path: PathBuf, source: io::Error },

    /// A file transfer aborted mid-copy
    #[error("Transfer of {} to {} failed ({size} bytes)", source_path.display(), destination_path.display())]
    Transfer {
        source_path: PathBuf,
        destination_path: PathBuf,
        size: u64,
        #[source]
        source: io::Error,
    },

    /// `run_jobs` was called while a previous batch is still running
    #[error("A batch of backup jobs is already running")]
    BatchActive,

    /// Settings or work list file could not be read or parsed
    #[error("Invalid configuration in {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    /// Catch-all for unexpected errors
    #[error("Engine error: {message}")]
    Unknown { message: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<u32> {
        match self {
            Self::EnumerationFailed { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::Transfer { source, .. } => source.raw_os_error().map(|e| e as u32),
            _ => None,
        }
    }

    /// True when this error is the cooperative cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Unknown {
            message: err.to_string(),
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
