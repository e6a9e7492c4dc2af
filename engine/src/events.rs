//! Engine events and the channel dispatcher that fans them out.
//!
//! Runners publish into an `EventHub` owned by the engine. Observers hold a
//! crossbeam `Receiver`; a dropped receiver is pruned on the next send, so
//! subscriptions never outlive their consumer.

use crate::encryption::EncryptionResult;
use crate::model::JobState;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Point-in-time view of a runner, carried by job events.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub id: Uuid,
    /// Index of the work in the work list
    pub index: usize,
    pub work_name: String,
    pub state: JobState,
    pub progress: f64,
    pub blocked_by_business_software: bool,
    pub current_file: Option<PathBuf>,
}

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    JobStateChanged {
        job: JobSnapshot,
        previous: JobState,
        at: DateTime<Utc>,
    },
    JobProgressChanged {
        job: JobSnapshot,
        percent: f64,
    },
    /// The job is waiting for the business software to exit
    BusinessSoftwareBlocked {
        job: JobSnapshot,
        at: DateTime<Utc>,
    },
    BusinessSoftwareReleased {
        job: JobSnapshot,
        at: DateTime<Utc>,
    },
    FileProgress {
        job_id: Uuid,
        source: PathBuf,
        destination: PathBuf,
        percent: f64,
    },
    FileTransferred {
        job_id: Uuid,
        work_name: String,
        source: PathBuf,
        destination: PathBuf,
        size: u64,
        elapsed: Duration,
        at: DateTime<Utc>,
    },
    FileTransferError {
        job_id: Uuid,
        work_name: String,
        source: PathBuf,
        destination: PathBuf,
        size: u64,
        fault: String,
        at: DateTime<Utc>,
    },
    FileEncrypted {
        job_id: Uuid,
        destination: PathBuf,
        result: EncryptionResult,
    },
    FileVerified {
        job_id: Uuid,
        destination: PathBuf,
        matches: bool,
    },
    AllJobsCompleted {
        at: DateTime<Utc>,
    },
}

/// Fan-out dispatcher for engine events.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New unbounded subscription receiving every event published from now on.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: EngineEvent) {
        let mut subscribers = self.lock();
        match subscribers.len() {
            0 => {}
            1 => {
                if subscribers[0].send(event).is_err() {
                    subscribers.clear();
                }
            }
            _ => subscribers.retain(|tx| tx.send(event.clone()).is_ok()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<EngineEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
