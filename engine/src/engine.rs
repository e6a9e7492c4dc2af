//! Job engine: runs a batch of backup works in parallel.
//!
//! The engine owns the shared coordination primitives (priority gate,
//! large-file lock, business software guard) and hands the same instances to
//! every runner of every batch it launches.

use crate::business::{self, BusinessSoftwareGuard};
use crate::config::{EngineSettings, WorkList};
use crate::encryption::{self, Encryptor};
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventHub};
use crate::fs_ops::{self, FileEnumerator, FsEnumerator};
use crate::large_file::LargeFileTransferLock;
use crate::model::{BackupWork, JobState};
use crate::priority::PriorityFileGate;
use crate::runner::{JobRunner, JobServices};
use chrono::Utc;
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, RwLock};
use std::thread;

/// Launches and supervises batches of job runners.
pub struct JobEngine {
    works: RwLock<WorkList>,
    services: Arc<JobServices>,
    business: Arc<dyn BusinessSoftwareGuard>,
    large_file_lock: Arc<LargeFileTransferLock>,
    priority_gate: Arc<PriorityFileGate>,
    events: EventHub,
    runners: RwLock<Vec<Arc<JobRunner>>>,
    batch_active: AtomicBool,
}

/// Builds a `JobEngine`, letting callers replace any collaborator.
pub struct EngineBuilder {
    works: WorkList,
    settings: EngineSettings,
    enumerator: Option<Arc<dyn FileEnumerator>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    business: Option<Arc<dyn BusinessSoftwareGuard>>,
    large_file_lock: Option<Arc<LargeFileTransferLock>>,
    priority_gate: Option<Arc<PriorityFileGate>>,
}

impl EngineBuilder {
    pub fn new(works: WorkList, settings: EngineSettings) -> Self {
        EngineBuilder {
            works,
            settings: settings.normalized(),
            enumerator: None,
            encryptor: None,
            business: None,
            large_file_lock: None,
            priority_gate: None,
        }
    }

    pub fn enumerator(mut self, enumerator: Arc<dyn FileEnumerator>) -> Self {
        self.enumerator = Some(enumerator);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn business_guard(mut self, guard: Arc<dyn BusinessSoftwareGuard>) -> Self {
        self.business = Some(guard);
        self
    }

    pub fn large_file_lock(mut self, lock: Arc<LargeFileTransferLock>) -> Self {
        self.large_file_lock = Some(lock);
        self
    }

    pub fn priority_gate(mut self, gate: Arc<PriorityFileGate>) -> Self {
        self.priority_gate = Some(gate);
        self
    }

    /// Fill every collaborator not supplied from the settings.
    pub fn build(self) -> JobEngine {
        let settings = self.settings;
        let business = self.business.unwrap_or_else(|| {
            Arc::from(business::guard_for(
                settings.business_software.as_deref(),
                settings.business_poll_interval(),
            ))
        });
        let encryptor = self
            .encryptor
            .unwrap_or_else(|| Arc::from(encryption::encryptor_for(settings.encryption.as_ref())));
        let large_file_lock = self
            .large_file_lock
            .unwrap_or_else(|| Arc::new(LargeFileTransferLock::new(settings.large_file_threshold_bytes())));
        let priority_gate = self
            .priority_gate
            .unwrap_or_else(|| Arc::new(PriorityFileGate::new(&settings.priority_extensions)));
        let enumerator = self.enumerator.unwrap_or_else(|| Arc::new(FsEnumerator));

        JobEngine {
            works: RwLock::new(self.works),
            services: Arc::new(JobServices {
                settings,
                enumerator,
                encryptor,
            }),
            business,
            large_file_lock,
            priority_gate,
            events: EventHub::new(),
            runners: RwLock::new(Vec::new()),
            batch_active: AtomicBool::new(false),
        }
    }
}

/// Clears the active-batch flag however `run_jobs` exits.
struct BatchGuard<'a>(&'a AtomicBool);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobEngine {
    /// Engine with collaborators derived from `settings`.
    pub fn new(works: WorkList, settings: EngineSettings) -> Self {
        EngineBuilder::new(works, settings).build()
    }

    pub fn builder(works: WorkList, settings: EngineSettings) -> EngineBuilder {
        EngineBuilder::new(works, settings)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.services.settings
    }

    pub fn priority_gate(&self) -> &PriorityFileGate {
        &self.priority_gate
    }

    pub fn large_file_lock(&self) -> &LargeFileTransferLock {
        &self.large_file_lock
    }

    /// Copy of the current work list.
    pub fn works(&self) -> WorkList {
        self.works.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the work list. Running batches keep their own copies.
    pub fn set_works(&self, works: WorkList) {
        *self.works.write().unwrap_or_else(|e| e.into_inner()) = works;
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Run the works at `indices` concurrently and wait for all of them.
    ///
    /// Every index is resolved and its folders validated before any job
    /// starts; a bad index or missing folder rejects the whole batch.
    /// Duplicate indices run once. A failing or stopped job never affects
    /// its siblings. Calling this while a batch is running returns
    /// `EngineError::BatchActive`.
    pub fn run_jobs(&self, indices: &[usize]) -> Result<()> {
        if self
            .batch_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Rejected relaunch while a batch is running");
            return Err(EngineError::BatchActive);
        }
        let _batch = BatchGuard(&self.batch_active);

        let selected = self.resolve(indices)?;
        let runners: Vec<Arc<JobRunner>> = selected
            .into_iter()
            .map(|(index, work)| {
                Arc::new(JobRunner::new(index, work, Arc::clone(&self.services), self.events.clone()))
            })
            .collect();
        *self.runners.write().unwrap_or_else(|e| e.into_inner()) = runners.clone();

        log::info!("Starting batch of {} job(s)", runners.len());
        let business: &dyn BusinessSoftwareGuard = self.business.as_ref();
        let large_file_lock = self.large_file_lock.as_ref();
        let priority_gate = self.priority_gate.as_ref();

        let start = Barrier::new(runners.len());
        let start = &start;

        let finished: Vec<JobState> = thread::scope(|s| {
            let handles: Vec<_> = runners
                .iter()
                .map(|runner| {
                    s.spawn(move || runner.run_in_batch(business, large_file_lock, priority_gate, start))
                })
                .collect();
            handles
                .into_iter()
                .zip(&runners)
                .map(|(handle, runner)| {
                    handle.join().unwrap_or_else(|_| {
                        log::error!("Job '{}' worker panicked", runner.work().name);
                        runner.state()
                    })
                })
                .collect()
        });

        let done = finished.iter().filter(|s| **s == JobState::Done).count();
        log::info!(
            "Batch finished: {} done, {} stopped, {} failed",
            done,
            finished.iter().filter(|s| **s == JobState::Stopped).count(),
            finished.iter().filter(|s| **s == JobState::Error).count()
        );
        self.events.publish(EngineEvent::AllJobsCompleted { at: Utc::now() });
        Ok(())
    }

    fn resolve(&self, indices: &[usize]) -> Result<Vec<(usize, BackupWork)>> {
        let works = self.works.read().unwrap_or_else(|e| e.into_inner());
        let mut selected: Vec<(usize, BackupWork)> = Vec::with_capacity(indices.len());
        for &index in indices {
            if selected.iter().any(|(i, _)| *i == index) {
                continue;
            }
            let work = works.get(index).ok_or(EngineError::WorkNotFound { index })?;
            fs_ops::validate_work(work)?;
            selected.push((index, work.clone()));
        }
        Ok(selected)
    }

    /// Runners of the current (or last) batch.
    pub fn runners(&self) -> Vec<Arc<JobRunner>> {
        self.runners.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Runner of the current batch executing the work at `index`.
    pub fn runner(&self, index: usize) -> Option<Arc<JobRunner>> {
        self.runners().into_iter().find(|r| r.index() == index)
    }

    pub fn pause_all(&self) {
        self.runners().iter().for_each(|r| r.pause());
    }

    pub fn resume_all(&self) {
        self.runners().iter().for_each(|r| r.resume());
    }

    pub fn stop_all(&self) {
        self.runners().iter().for_each(|r| r.stop());
    }

    /// Mean progress of the runners currently `Running`, 0 if there are none.
    pub fn global_progress(&self) -> f64 {
        let running: Vec<f64> = self
            .runners()
            .iter()
            .filter(|r| r.state() == JobState::Running)
            .map(|r| r.progress())
            .collect();
        if running.is_empty() {
            return 0.0;
        }
        running.iter().sum::<f64>() / running.len() as f64
    }

    /// True if any runner is running, pausing or paused.
    pub fn is_any_active(&self) -> bool {
        self.runners().iter().any(|r| r.state().is_active())
    }

    pub fn is_batch_active(&self) -> bool {
        self.batch_active.load(Ordering::SeqCst)
    }
}
