//! Encryption hook invoked on a destination file after it is transferred.
//!
//! The cipher itself lives in an external program; the engine only runs it
//! and records the outcome.

use crate::config::EncryptionSettings;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// Outcome of encrypting one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionResult {
    Encrypted(Duration),
    Skipped,
    /// Negative error code reported by the encryptor
    Failed(i64),
}

impl EncryptionResult {
    /// Log-friendly code: elapsed milliseconds (at least 1) on success, 0 when
    /// skipped, a negative error code on failure.
    pub fn code(&self) -> i64 {
        match self {
            EncryptionResult::Encrypted(elapsed) => (elapsed.as_millis() as i64).max(1),
            EncryptionResult::Skipped => 0,
            EncryptionResult::Failed(code) => *code,
        }
    }

    /// Inverse of `code`.
    pub fn from_code(code: i64) -> Self {
        match code {
            c if c > 0 => EncryptionResult::Encrypted(Duration::from_millis(c as u64)),
            0 => EncryptionResult::Skipped,
            c => EncryptionResult::Failed(c),
        }
    }
}

pub trait Encryptor: Send + Sync {
    fn encrypt(&self, destination: &Path) -> EncryptionResult;
}

/// Used when no encryption program is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl Encryptor for NoEncryption {
    fn encrypt(&self, _destination: &Path) -> EncryptionResult {
        EncryptionResult::Skipped
    }
}

/// Runs `<program> <file> <key>` and waits for it.
///
/// A zero exit status counts as success. Any other status is reported as its
/// negation; a program that cannot be spawned or is killed by a signal
/// reports -1.
#[derive(Debug, Clone)]
pub struct ExternalEncryptor {
    program: PathBuf,
    key: String,
}

impl ExternalEncryptor {
    pub fn new(settings: &EncryptionSettings) -> Self {
        ExternalEncryptor {
            program: settings.program.clone(),
            key: settings.key.clone(),
        }
    }
}

impl Encryptor for ExternalEncryptor {
    fn encrypt(&self, destination: &Path) -> EncryptionResult {
        let started = Instant::now();
        let status = Command::new(&self.program)
            .arg(destination)
            .arg(&self.key)
            .status();
        match status {
            Ok(status) if status.success() => EncryptionResult::Encrypted(started.elapsed()),
            Ok(status) => {
                let code = status.code().map(|c| -(c.abs() as i64)).unwrap_or(-1);
                log::error!(
                    "Encryption of {} exited with {}",
                    destination.display(),
                    status
                );
                EncryptionResult::Failed(code)
            }
            Err(e) => {
                log::error!(
                    "Failed to start encryption program {}: {}",
                    self.program.display(),
                    e
                );
                EncryptionResult::Failed(-1)
            }
        }
    }
}

/// Build the encryptor described by the settings.
pub fn encryptor_for(settings: Option<&EncryptionSettings>) -> Box<dyn Encryptor> {
    match settings {
        Some(settings) => Box::new(ExternalEncryptor::new(settings)),
        None => Box::new(NoEncryption),
    }
}
