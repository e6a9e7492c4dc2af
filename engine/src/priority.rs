//! Batch-wide priority file gate.
//!
//! Files with a priority extension must all finish, across every running
//! job, before any non-priority file may start. Priority files themselves are
//! never serialized by the gate.

use crate::config::normalize_extensions;
use crate::control::{CancellationToken, CANCEL_POLL};
use crate::error::EngineError;
use crate::model::normalized_extension;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Counter of pending priority files plus a condition variable used as the
/// open/closed latch (open iff the counter is zero).
#[derive(Debug)]
pub struct PriorityFileGate {
    extensions: Vec<String>,
    pending: Mutex<usize>,
    opened: Condvar,
}

impl PriorityFileGate {
    /// Build a gate for the given extensions. An empty list disables it.
    pub fn new(extensions: &[String]) -> Self {
        PriorityFileGate {
            extensions: normalize_extensions(extensions),
            pending: Mutex::new(0),
            opened: Condvar::new(),
        }
    }

    /// A gate that never blocks.
    pub fn disabled() -> Self {
        Self::new(&[])
    }

    pub fn is_enabled(&self) -> bool {
        !self.extensions.is_empty()
    }

    pub fn is_priority(&self, path: &Path) -> bool {
        let ext = normalized_extension(path);
        !ext.is_empty() && self.extensions.iter().any(|e| *e == ext)
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of priority files registered and not yet completed.
    pub fn pending_count(&self) -> usize {
        *self.lock()
    }

    pub fn is_open(&self) -> bool {
        self.pending_count() == 0
    }

    /// Add the priority files among `files` to the pending counter.
    ///
    /// Returns how many were counted.
    pub fn register_pending_files<P: AsRef<Path>>(&self, files: &[P]) -> usize {
        if !self.is_enabled() {
            return 0;
        }
        let count = files.iter().filter(|f| self.is_priority(f.as_ref())).count();
        if count > 0 {
            let mut pending = self.lock();
            *pending += count;
            log::debug!("Registered {} priority file(s), {} pending", count, *pending);
        }
        count
    }

    /// One priority file finished (or was abandoned).
    pub fn mark_priority_file_completed(&self) {
        self.decrement(1);
    }

    /// Drop the priority files among `files` from the counter without
    /// requiring them to complete. Used when a job stops early.
    pub fn unregister_all<P: AsRef<Path>>(&self, files: &[P]) {
        if !self.is_enabled() {
            return;
        }
        let count = files.iter().filter(|f| self.is_priority(f.as_ref())).count();
        self.decrement(count);
    }

    fn decrement(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut pending = self.lock();
        if count > *pending {
            log::warn!(
                "Priority gate asked to release {} file(s) with only {} pending",
                count,
                *pending
            );
        }
        *pending = pending.saturating_sub(count);
        if *pending == 0 {
            log::debug!("Priority gate open");
            self.opened.notify_all();
        }
    }

    /// Block non-priority files until no priority file is pending.
    ///
    /// Priority files return immediately. Returns `Err(Cancelled)` if `cancel`
    /// fires while waiting.
    pub fn wait_if_non_priority(&self, file: &Path, cancel: &CancellationToken) -> Result<(), EngineError> {
        if !self.is_enabled() || self.is_priority(file) {
            return Ok(());
        }
        let mut pending = self.lock();
        while *pending > 0 {
            cancel.check()?;
            let (guard, _) = self
                .opened
                .wait_timeout(pending, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner());
            pending = guard;
        }
        Ok(())
    }

    /// Register `files` and return a guard that releases whatever was not
    /// completed when it is dropped.
    pub fn register<'a>(&'a self, files: &[PathBuf]) -> PriorityRegistration<'a> {
        let remaining: Vec<PathBuf> = if self.is_enabled() {
            files.iter().filter(|f| self.is_priority(f)).cloned().collect()
        } else {
            Vec::new()
        };
        self.register_pending_files(&remaining);
        PriorityRegistration { gate: self, remaining }
    }
}

impl Default for PriorityFileGate {
    fn default() -> Self {
        Self::disabled()
    }
}

/// A job's outstanding priority registrations.
#[derive(Debug)]
pub struct PriorityRegistration<'a> {
    gate: &'a PriorityFileGate,
    remaining: Vec<PathBuf>,
}

impl PriorityRegistration<'_> {
    /// Mark `file` completed if it was registered here.
    pub fn complete(&mut self, file: &Path) {
        if let Some(pos) = self.remaining.iter().position(|f| f == file) {
            self.remaining.remove(pos);
            self.gate.mark_priority_file_completed();
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

impl Drop for PriorityRegistration<'_> {
    fn drop(&mut self) {
        if !self.remaining.is_empty() {
            log::debug!("Releasing {} uncopied priority file(s)", self.remaining.len());
            self.gate.unregister_all(&self.remaining);
        }
    }
}
