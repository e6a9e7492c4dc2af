//! Engine settings and the backup work list.
//!
//! Both are plain JSON documents. Every settings field has a default so a
//! partial (or empty) file is valid.

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, Result};
use crate::model::{normalized_extension, BackupWork};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default chunk size for the copy engine (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Default business software poll interval.
pub const DEFAULT_BUSINESS_POLL_MS: u64 = 500;

/// External encryption program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// Program run as `<program> <file> <key>`
    pub program: PathBuf,
    /// Key passed to the program
    pub key: String,
}

/// Settings shared by every job of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Extensions transferred before any other file, batch-wide
    pub priority_extensions: Vec<String>,

    /// Extensions handed to the encryption hook after transfer
    pub encrypted_extensions: Vec<String>,

    /// Files strictly above this size (KiB) transfer one at a time; 0 disables
    pub large_file_threshold_kb: u64,

    /// Process name whose presence pauses every job
    pub business_software: Option<String>,

    /// How often the business software check is repeated while blocked
    pub business_poll_interval_ms: u64,

    /// Copy engine chunk size in bytes
    pub chunk_size: usize,

    /// External encryption program, if any
    pub encryption: Option<EncryptionSettings>,

    /// Compare source and destination checksums after each copy
    pub verify_after_copy: Option<ChecksumAlgorithm>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            priority_extensions: Vec::new(),
            encrypted_extensions: Vec::new(),
            large_file_threshold_kb: 0,
            business_software: None,
            business_poll_interval_ms: DEFAULT_BUSINESS_POLL_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            encryption: None,
            verify_after_copy: None,
        }
    }
}

impl EngineSettings {
    /// Load settings from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| EngineError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let settings: EngineSettings =
            serde_json::from_str(&text).map_err(|e| EngineError::Config {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Ok(settings.normalized())
    }

    /// Write settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Lowercase extensions with a leading dot, clamp zero values.
    pub fn normalized(mut self) -> Self {
        self.priority_extensions = normalize_extensions(&self.priority_extensions);
        self.encrypted_extensions = normalize_extensions(&self.encrypted_extensions);
        self.business_software = self
            .business_software
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.business_poll_interval_ms == 0 {
            self.business_poll_interval_ms = DEFAULT_BUSINESS_POLL_MS;
        }
        self
    }

    /// Large file threshold in bytes (0 = disabled).
    pub fn large_file_threshold_bytes(&self) -> u64 {
        self.large_file_threshold_kb.saturating_mul(1024)
    }

    pub fn business_poll_interval(&self) -> Duration {
        Duration::from_millis(self.business_poll_interval_ms)
    }

    /// Whether the destination of `path` must be passed to the encryption hook.
    pub fn should_encrypt(&self, path: &Path) -> bool {
        let ext = normalized_extension(path);
        !ext.is_empty() && self.encrypted_extensions.iter().any(|e| *e == ext)
    }
}

/// Normalize a list of extensions to lowercase ".ext" form, dropping blanks
/// and duplicates while keeping order.
pub fn normalize_extensions(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for ext in raw {
        let trimmed = ext.trim().trim_start_matches('.').to_lowercase();
        if trimmed.is_empty() {
            continue;
        }
        let ext = format!(".{}", trimmed);
        if !out.contains(&ext) {
            out.push(ext);
        }
    }
    out
}

/// Ordered list of backup works with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkList {
    works: Vec<BackupWork>,
}

impl WorkList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a list, rejecting duplicate names.
    pub fn from_works(works: Vec<BackupWork>) -> Result<Self> {
        let mut list = WorkList::new();
        for work in works {
            list.add(work)?;
        }
        Ok(list)
    }

    /// Load a work list from JSON. A missing file yields an empty list.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path).map_err(|e| EngineError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let works: Vec<BackupWork> = serde_json::from_str(&text).map_err(|e| EngineError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_works(works)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, &self.works)
    }

    pub fn add(&mut self, work: BackupWork) -> Result<()> {
        if self.works.iter().any(|w| w.name == work.name) {
            return Err(EngineError::DuplicateWork { name: work.name });
        }
        self.works.push(work);
        Ok(())
    }

    /// Remove the work at `index`, returning it.
    pub fn remove(&mut self, index: usize) -> Result<BackupWork> {
        if index >= self.works.len() {
            return Err(EngineError::WorkNotFound { index });
        }
        Ok(self.works.remove(index))
    }

    pub fn get(&self, index: usize) -> Option<&BackupWork> {
        self.works.get(index)
    }

    pub fn works(&self) -> &[BackupWork] {
        &self.works
    }

    pub fn len(&self) -> usize {
        self.works.len()
    }

    pub fn is_empty(&self) -> bool {
        self.works.is_empty()
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| EngineError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    crate::fs_ops::ensure_parent_dir_exists(path)?;
    fs::write(path, text).map_err(|e| EngineError::WriteError {
        path: path.to_path_buf(),
        source: e,
    })
}
