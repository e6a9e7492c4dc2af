//! System-wide single-permit lock for large file transfers.

use crate::control::{CancellationToken, CANCEL_POLL};
use crate::error::EngineError;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Files above `threshold` bytes transfer one at a time across all jobs.
#[derive(Debug)]
pub struct LargeFileTransferLock {
    threshold: u64,
    held: Mutex<bool>,
    released: Condvar,
}

impl LargeFileTransferLock {
    /// `threshold` in bytes; 0 disables the lock.
    pub fn new(threshold: u64) -> Self {
        LargeFileTransferLock {
            threshold,
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn is_large_file(&self, size: u64) -> bool {
        self.threshold > 0 && size > self.threshold
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_held(&self) -> bool {
        *self.lock()
    }

    /// Take the permit for a file of `size` bytes.
    ///
    /// Returns `Ok(None)` without waiting for files that are not large. For
    /// large files blocks until the permit is free; the permit is released
    /// when the returned guard is dropped.
    pub fn acquire(&self, size: u64, cancel: &CancellationToken) -> Result<Option<LargeFilePermit<'_>>, EngineError> {
        if !self.is_large_file(size) {
            return Ok(None);
        }
        let mut held = self.lock();
        while *held {
            cancel.check()?;
            let (guard, _) = self
                .released
                .wait_timeout(held, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            held = guard;
        }
        cancel.check()?;
        *held = true;
        Ok(Some(LargeFilePermit { lock: self }))
    }

    fn release(&self) {
        let mut held = self.lock();
        *held = false;
        self.released.notify_one();
    }
}

impl Default for LargeFileTransferLock {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Proof of holding the large file permit.
#[derive(Debug)]
#[must_use = "the permit is released as soon as it is dropped"]
pub struct LargeFilePermit<'a> {
    lock: &'a LargeFileTransferLock,
}

impl Drop for LargeFilePermit<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
