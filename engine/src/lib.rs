//! # BackUP Engine - Parallel Backup Library
//!
//! A headless engine that runs several backup works at once.
//! Designed as the foundation for multiple UIs (CLI, automation).
//!
//! ## Overview
//!
//! Each backup work (a named source folder, destination folder and backup
//! type) runs on its own thread. Jobs share three coordination rules:
//! - Files with a priority extension are copied before any other file of
//!   any job
//! - Only one file above the large-file threshold is copied at a time
//! - Every job waits while the configured business software is running
//!
//! Jobs can be paused, resumed and stopped individually or all at once, and
//! report their progress through channel events.
//!
//! ## Basic Usage
//!
//! ```no_run
//! use engine::{BackupType, BackupWork, EngineSettings, JobEngine, WorkList};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut works = WorkList::new();
//! works.add(BackupWork::new("documents", "/home/me/docs", "/mnt/backup/docs", BackupType::Full))?;
//! works.add(BackupWork::new("photos", "/home/me/photos", "/mnt/backup/photos", BackupType::Differential))?;
//!
//! let settings = EngineSettings {
//!     priority_extensions: vec![".docx".to_string()],
//!     large_file_threshold_kb: 100 * 1024,
//!     ..EngineSettings::default()
//! };
//! let engine = JobEngine::new(works, settings);
//!
//! let events = engine.subscribe();
//! engine.run_jobs(&[0, 1])?;
//!
//! for event in events.try_iter() {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (BackupWork, FileItem, JobState)
//! - **error**: Error types and handling
//! - **config**: Engine settings and the persisted work list
//! - **fs_ops**: Enumeration and filesystem helpers
//! - **control**: Pause latch and cancellation token
//! - **copy**: Chunked file copy
//! - **priority**: Priority file gate
//! - **large_file**: Large file transfer lock
//! - **business**: Business software detection
//! - **encryption**: Post-transfer encryption hook
//! - **checksums**: Checksum computation and verification
//! - **events**: Engine events and their dispatcher
//! - **runner**: One job's state machine
//! - **engine**: Batch orchestration
//! - **observer**: Observer trait for UIs

pub mod model;
pub mod error;
pub mod config;
pub mod fs_ops;
pub mod control;
pub mod copy;
pub mod priority;
pub mod large_file;
pub mod business;
pub mod encryption;
pub mod checksums;
pub mod events;
pub mod runner;
pub mod engine;
pub mod observer;

pub use business::{BusinessSoftwareGuard, NoBusinessSoftware, ProcessGuard};
pub use checksums::ChecksumAlgorithm;
pub use config::{EncryptionSettings, EngineSettings, WorkList};
pub use encryption::{EncryptionResult, Encryptor, ExternalEncryptor};
pub use engine::{EngineBuilder, JobEngine};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, JobSnapshot};
pub use model::{BackupType, BackupWork, FileItem, JobState};
pub use observer::{run_observed, JobObserver};
pub use runner::JobRunner;
