//! Observer trait for engine events.
//!
//! This module decouples the engine from any specific UI technology. A UI
//! implements `JobObserver` and hands it to `run_observed`, which runs a
//! batch and delivers every event on the calling thread.

use crate::engine::JobEngine;
use crate::error::Result;
use crate::events::{EngineEvent, JobSnapshot};
use crate::encryption::EncryptionResult;
use crate::model::JobState;
use crossbeam_channel::{bounded, select};
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Trait for receiving engine events.
///
/// Every method has an empty default, so implementors only override what
/// they display. Methods are called in publication order.
pub trait JobObserver {
    /// Called when a job changes state.
    fn on_state_changed(&mut self, _job: &JobSnapshot, _previous: JobState) {}

    /// Called when a job's overall progress advances.
    fn on_job_progress(&mut self, _job: &JobSnapshot, _percent: f64) {}

    /// Called when a job starts waiting for the business software to exit.
    fn on_business_blocked(&mut self, _job: &JobSnapshot) {}

    /// Called when a blocked job may continue.
    fn on_business_released(&mut self, _job: &JobSnapshot) {}

    /// Called after every chunk of a file.
    fn on_file_progress(&mut self, _source: &Path, _percent: f64) {}

    /// Called when a file is fully copied.
    fn on_file_transferred(&mut self, _work_name: &str, _source: &Path, _size: u64, _elapsed: Duration) {}

    /// Called when a file could not be copied.
    fn on_file_error(&mut self, _work_name: &str, _source: &Path, _fault: &str) {}

    fn on_file_encrypted(&mut self, _destination: &Path, _result: EncryptionResult) {}

    fn on_file_verified(&mut self, _destination: &Path, _matches: bool) {}

    /// Called once after every job of the batch has ended.
    fn on_all_completed(&mut self) {}

    /// Dispatch one event to the matching method.
    fn on_event(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::JobStateChanged { job, previous, .. } => self.on_state_changed(job, *previous),
            EngineEvent::JobProgressChanged { job, percent } => self.on_job_progress(job, *percent),
            EngineEvent::BusinessSoftwareBlocked { job, .. } => self.on_business_blocked(job),
            EngineEvent::BusinessSoftwareReleased { job, .. } => self.on_business_released(job),
            EngineEvent::FileProgress { source, percent, .. } => self.on_file_progress(source, *percent),
            EngineEvent::FileTransferred {
                work_name,
                source,
                size,
                elapsed,
                ..
            } => self.on_file_transferred(work_name, source, *size, *elapsed),
            EngineEvent::FileTransferError {
                work_name, source, fault, ..
            } => self.on_file_error(work_name, source, fault),
            EngineEvent::FileEncrypted { destination, result, .. } => self.on_file_encrypted(destination, *result),
            EngineEvent::FileVerified { destination, matches, .. } => self.on_file_verified(destination, *matches),
            EngineEvent::AllJobsCompleted { .. } => self.on_all_completed(),
        }
    }
}

/// Run the works at `indices` and feed every event to `observer` until the
/// batch ends. Returns what `JobEngine::run_jobs` returns.
pub fn run_observed(engine: &JobEngine, indices: &[usize], observer: &mut dyn JobObserver) -> Result<()> {
    let events = engine.subscribe();
    let (done_tx, done_rx) = bounded(1);

    thread::scope(|s| {
        s.spawn(move || {
            let _ = done_tx.send(engine.run_jobs(indices));
        });

        let result = loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => observer.on_event(&event),
                    Err(_) => break done_rx.recv().unwrap_or(Ok(())),
                },
                recv(done_rx) -> result => break result.unwrap_or(Ok(())),
            }
        };
        for event in events.try_iter() {
            observer.on_event(&event);
        }
        result
    })
}
