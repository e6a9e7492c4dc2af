//! Job runner: executes one backup work on the calling thread.
//!
//! The runner owns the job's state machine, its pause latch and its
//! cancellation token. `pause`, `resume` and `stop` may be called from any
//! thread while `run` is executing on a worker.

use crate::business::BusinessSoftwareGuard;
use crate::checksums;
use crate::config::EngineSettings;
use crate::control::{CancellationToken, PauseLatch, PauseReason, CANCEL_POLL};
use crate::copy::{percent_of, FileCopier, TransferControl, TransferOrigin};
use crate::encryption::{EncryptionResult, Encryptor};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHub, JobSnapshot};
use crate::fs_ops::{self, FileEnumerator};
use crate::large_file::LargeFileTransferLock;
use crate::model::{BackupWork, FileItem, JobState};
use crate::priority::{PriorityFileGate, PriorityRegistration};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Collaborators shared by every runner of an engine.
pub struct JobServices {
    pub settings: EngineSettings,
    pub enumerator: Arc<dyn FileEnumerator>,
    pub encryptor: Arc<dyn Encryptor>,
}

#[derive(Debug)]
struct RunnerState {
    state: JobState,
    progress: f64,
    last_reported: f64,
    blocked: bool,
    current_file: Option<PathBuf>,
}

/// Live execution wrapper around one backup work for one launch.
pub struct JobRunner {
    id: Uuid,
    index: usize,
    work: BackupWork,
    services: Arc<JobServices>,
    events: EventHub,
    inner: Mutex<RunnerState>,
    latch: PauseLatch,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(index: usize, work: BackupWork, services: Arc<JobServices>, events: EventHub) -> Self {
        JobRunner {
            id: Uuid::new_v4(),
            index,
            work,
            services,
            events,
            inner: Mutex::new(RunnerState {
                state: JobState::Idle,
                progress: 0.0,
                last_reported: 0.0,
                blocked: false,
                current_file: None,
            }),
            latch: PauseLatch::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn work(&self) -> &BackupWork {
        &self.work
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn is_blocked_by_business_software(&self) -> bool {
        self.lock().blocked
    }

    pub fn current_file(&self) -> Option<PathBuf> {
        self.lock().current_file.clone()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        self.snapshot_of(&inner)
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_of(&self, inner: &RunnerState) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            index: self.index,
            work_name: self.work.name.clone(),
            state: inner.state,
            progress: inner.progress,
            blocked_by_business_software: inner.blocked,
            current_file: inner.current_file.clone(),
        }
    }

    /// Move to `next` and publish the change. Caller holds the lock, so
    /// events from concurrent callers are published in transition order.
    fn set_state(&self, inner: &mut RunnerState, next: JobState) {
        let previous = inner.state;
        debug_assert!(previous.can_transition_to(next), "{} -> {}", previous, next);
        inner.state = next;
        log::info!("Job '{}': {} -> {}", self.work.name, previous, next);
        self.events.publish(EngineEvent::JobStateChanged {
            job: self.snapshot_of(inner),
            previous,
            at: Utc::now(),
        });
    }

    fn set_progress(&self, inner: &mut RunnerState, progress: f64) {
        inner.progress = progress;
        inner.last_reported = progress;
        self.events.publish(EngineEvent::JobProgressChanged {
            job: self.snapshot_of(inner),
            percent: progress,
        });
    }

    /// Request a pause. Takes effect at the next checkpoint.
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.state == JobState::Running {
            self.latch.close(PauseReason::Manual);
            self.set_state(&mut inner, JobState::Pausing);
        }
    }

    /// Resume a manually paused job.
    ///
    /// If the business software is also holding the job, it stays `Paused`
    /// until the software exits.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if inner.state == JobState::Paused && self.latch.is_closed_by(PauseReason::Manual) {
            self.latch.open(PauseReason::Manual);
            if !inner.blocked {
                self.set_state(&mut inner, JobState::Running);
            }
        }
    }

    /// Cancel the job. The worker observes it at its next suspension point.
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.state.is_active() {
            self.cancel.cancel();
            self.latch.force_open();
            self.set_progress(&mut inner, 0.0);
            self.set_state(&mut inner, JobState::Stopped);
        }
    }

    /// Execute the work. Blocks until the job is done, stopped or failed and
    /// returns the terminal state. Calling it on a runner that already ran
    /// returns the current state without doing anything.
    pub fn run(
        &self,
        business: &dyn BusinessSoftwareGuard,
        large_file_lock: &LargeFileTransferLock,
        priority_gate: &PriorityFileGate,
    ) -> JobState {
        self.run_inner(business, large_file_lock, priority_gate, None)
    }

    /// Like `run`, but waits on `start` once the job's priority files are
    /// registered, so no job of the batch transfers anything before every
    /// sibling has registered its own.
    pub fn run_in_batch(
        &self,
        business: &dyn BusinessSoftwareGuard,
        large_file_lock: &LargeFileTransferLock,
        priority_gate: &PriorityFileGate,
        start: &Barrier,
    ) -> JobState {
        self.run_inner(business, large_file_lock, priority_gate, Some(start))
    }

    fn run_inner(
        &self,
        business: &dyn BusinessSoftwareGuard,
        large_file_lock: &LargeFileTransferLock,
        priority_gate: &PriorityFileGate,
        start: Option<&Barrier>,
    ) -> JobState {
        {
            let mut inner = self.lock();
            if inner.state != JobState::Idle {
                log::warn!("Job '{}' already started ({})", self.work.name, inner.state);
                drop(inner);
                if let Some(start) = start {
                    start.wait();
                }
                return self.state();
            }
            self.set_state(&mut inner, JobState::Running);
        }

        let started = Instant::now();
        let outcome = self.execute(business, large_file_lock, priority_gate, start);

        let mut inner = self.lock();
        inner.current_file = None;
        match outcome {
            Ok(()) => {
                if matches!(inner.state, JobState::Running | JobState::Pausing) {
                    self.set_progress(&mut inner, 100.0);
                    self.set_state(&mut inner, JobState::Done);
                    log::info!("Job '{}' finished in {:?}", self.work.name, started.elapsed());
                }
            }
            Err(e) if e.is_cancellation() => {
                // stop() already moved the state; only a bare token cancel gets here active
                if inner.state.is_active() {
                    self.set_progress(&mut inner, 0.0);
                    self.set_state(&mut inner, JobState::Stopped);
                }
            }
            Err(e) => {
                log::error!("Job '{}' failed: {}", self.work.name, e);
                if matches!(inner.state, JobState::Running | JobState::Pausing) {
                    self.set_progress(&mut inner, 0.0);
                    self.set_state(&mut inner, JobState::Error);
                }
            }
        }
        inner.state
    }

    fn execute(
        &self,
        business: &dyn BusinessSoftwareGuard,
        large_file_lock: &LargeFileTransferLock,
        priority_gate: &PriorityFileGate,
        start: Option<&Barrier>,
    ) -> Result<(), EngineError> {
        let settings = &self.services.settings;
        let planned = self.plan(priority_gate);
        // Every party must arrive, including jobs whose enumeration failed
        if let Some(start) = start {
            start.wait();
        }
        let (files, mut registration) = planned?;
        let total_bytes: u64 = files.iter().map(|f| f.file_size).sum();

        let control = Checkpoint { runner: self, business };
        self.wait_for_business_software(business)?;

        let copier = FileCopier::new(settings.chunk_size);
        let origin = TransferOrigin {
            job_id: self.id,
            work_name: &self.work.name,
        };
        let mut copied_bytes: u64 = 0;

        for file in &files {
            control.checkpoint()?;
            self.lock().current_file = Some(file.source_path.clone());

            priority_gate.wait_if_non_priority(&file.source_path, &self.cancel)?;
            let permit = large_file_lock.acquire(file.file_size, &self.cancel)?;
            if permit.is_some() {
                log::debug!("Large file permit taken for {}", file.source_path.display());
            }

            copier.copy(origin, file, &control, &self.events, &mut |n: u64| {
                copied_bytes += n;
                self.report_progress(percent_of(copied_bytes, total_bytes));
            })?;
            drop(permit);

            registration.complete(&file.source_path);
            self.after_transfer(file);
        }

        control.checkpoint()
    }

    /// Enumerate, select and order the job's files, then register its
    /// priority files with the gate.
    fn plan<'g>(&self, priority_gate: &'g PriorityFileGate) -> Result<(Vec<FileItem>, PriorityRegistration<'g>), EngineError> {
        let files = self
            .services
            .enumerator
            .enumerate(&self.work.source, &self.work.destination)?;
        let files = order_for_transfer(fs_ops::select_files(files, self.work.backup_type), priority_gate);
        let total_bytes: u64 = files.iter().map(|f| f.file_size).sum();
        log::info!(
            "Job '{}' ({}): {} file(s), {} bytes",
            self.work.name,
            self.work.backup_type,
            files.len(),
            total_bytes
        );

        let paths: Vec<PathBuf> = files.iter().map(|f| f.source_path.clone()).collect();
        let registration = priority_gate.register(&paths);
        Ok((files, registration))
    }

    /// Verification and encryption of a freshly copied file. Neither is fatal
    /// to the job.
    fn after_transfer(&self, file: &FileItem) {
        let settings = &self.services.settings;

        if let Some(algorithm) = settings.verify_after_copy {
            match checksums::verify_copy(&file.source_path, &file.destination_path, algorithm) {
                Ok(matches) => self.events.publish(EngineEvent::FileVerified {
                    job_id: self.id,
                    destination: file.destination_path.clone(),
                    matches,
                }),
                Err(e) => log::warn!("Could not verify {}: {}", file.destination_path.display(), e),
            }
        }

        if settings.should_encrypt(&file.destination_path) {
            let result = self.services.encryptor.encrypt(&file.destination_path);
            if let EncryptionResult::Failed(code) = result {
                log::error!(
                    "Encryption of {} failed with code {}",
                    file.destination_path.display(),
                    code
                );
            }
            self.events.publish(EngineEvent::FileEncrypted {
                job_id: self.id,
                destination: file.destination_path.clone(),
                result,
            });
        }
    }

    /// Raise progress while the job is active; never lowers it.
    fn report_progress(&self, percent: f64) {
        let mut inner = self.lock();
        if !inner.state.is_active() || percent <= inner.progress {
            return;
        }
        inner.progress = percent;
        if percent.floor() > inner.last_reported.floor() || percent >= 100.0 {
            self.set_progress(&mut inner, percent);
        }
    }

    /// Hold the job while the business software is running.
    ///
    /// Publishes one block/release pair and, for a running job, one
    /// `Running -> Paused -> Running` round trip.
    fn wait_for_business_software(&self, business: &dyn BusinessSoftwareGuard) -> Result<(), EngineError> {
        if !business.is_running() {
            return Ok(());
        }

        {
            let mut inner = self.lock();
            if !inner.state.is_active() {
                return Err(EngineError::Cancelled);
            }
            self.latch.close(PauseReason::Business);
            inner.blocked = true;
            log::warn!("Job '{}' blocked by business software", self.work.name);
            self.events.publish(EngineEvent::BusinessSoftwareBlocked {
                job: self.snapshot_of(&inner),
                at: Utc::now(),
            });
            if inner.state == JobState::Running {
                self.set_state(&mut inner, JobState::Paused);
            }
        }

        let poll_interval = self.services.settings.business_poll_interval();
        let waited = loop {
            if let Err(e) = sleep_cancellable(poll_interval, &self.cancel) {
                break Err(e);
            }
            if !business.is_running() {
                break Ok(());
            }
        };

        self.latch.open(PauseReason::Business);
        let mut inner = self.lock();
        inner.blocked = false;
        if waited.is_ok() {
            log::info!("Job '{}' released by business software", self.work.name);
            self.events.publish(EngineEvent::BusinessSoftwareReleased {
                job: self.snapshot_of(&inner),
                at: Utc::now(),
            });
            if inner.state == JobState::Paused && !self.latch.is_closed_by(PauseReason::Manual) {
                self.set_state(&mut inner, JobState::Running);
            }
        }
        waited
    }

    /// Block while the latch is closed, promoting a pending manual pause to
    /// `Paused` on every wake-up. A `resume` followed by another `pause`
    /// before this thread wakes leaves the job `Pausing` with the latch still
    /// closed; the next pass raises `Paused` again.
    fn wait_while_paused(&self) {
        loop {
            {
                let mut inner = self.lock();
                if inner.state == JobState::Pausing && self.latch.is_closed_by(PauseReason::Manual) {
                    self.set_state(&mut inner, JobState::Paused);
                }
            }
            if self.latch.wait_timeout(CANCEL_POLL) {
                return;
            }
        }
    }
}

/// The runner's `TransferControl`: pause latch, business software and
/// cancellation, checked between files and between chunks.
struct Checkpoint<'a> {
    runner: &'a JobRunner,
    business: &'a dyn BusinessSoftwareGuard,
}

impl TransferControl for Checkpoint<'_> {
    fn checkpoint(&self) -> Result<(), EngineError> {
        self.runner.cancel.check()?;
        self.runner.wait_for_business_software(self.business)?;
        self.runner.wait_while_paused();
        self.runner.cancel.check()
    }
}

/// Priority files first, otherwise enumeration order.
fn order_for_transfer(files: Vec<FileItem>, priority_gate: &PriorityFileGate) -> Vec<FileItem> {
    if !priority_gate.is_enabled() {
        return files;
    }
    let (mut ordered, rest): (Vec<_>, Vec<_>) = files
        .into_iter()
        .partition(|f| priority_gate.is_priority(&f.source_path));
    ordered.extend(rest);
    ordered
}

fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), EngineError> {
    let deadline = Instant::now() + duration;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::NoBusinessSoftware;
    use crate::encryption::NoEncryption;
    use crate::fs_ops::FsEnumerator;
    use crate::model::BackupType;
    use crossbeam_channel::Receiver;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Fixture {
        _temp: tempfile::TempDir,
        src: PathBuf,
        dst: PathBuf,
    }

    fn fixture(files: &[(&str, usize)]) -> Fixture {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(&src).expect("Failed to create src dir");
        fs::create_dir_all(&dst).expect("Failed to create dst dir");
        for (name, size) in files {
            fs::write(src.join(name), vec![b'x'; *size]).expect("Failed to write file");
        }
        Fixture { _temp: temp, src, dst }
    }

    fn services(settings: EngineSettings) -> Arc<JobServices> {
        Arc::new(JobServices {
            settings,
            enumerator: Arc::new(FsEnumerator),
            encryptor: Arc::new(NoEncryption),
        })
    }

    fn runner(fx: &Fixture, settings: EngineSettings, hub: &EventHub) -> JobRunner {
        let work = BackupWork::new("job", &fx.src, &fx.dst, BackupType::Full);
        JobRunner::new(0, work, services(settings), hub.clone())
    }

    fn state_changes(rx: &Receiver<EngineEvent>) -> Vec<(JobState, JobState)> {
        rx.try_iter()
            .filter_map(|e| match e {
                EngineEvent::JobStateChanged { job, previous, .. } => Some((previous, job.state)),
                _ => None,
            })
            .collect()
    }

    /// Reports "running" until released.
    struct SwitchGuard {
        running: AtomicBool,
        checks: AtomicUsize,
    }

    impl SwitchGuard {
        fn new(running: bool) -> Self {
            SwitchGuard {
                running: AtomicBool::new(running),
                checks: AtomicUsize::new(0),
            }
        }
    }

    impl BusinessSoftwareGuard for SwitchGuard {
        fn is_running(&self) -> bool {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.running.load(Ordering::SeqCst)
        }
    }

    fn wait_for_state(runner: &JobRunner, state: JobState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while runner.state() != state {
            assert!(Instant::now() < deadline, "timed out waiting for {}", state);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_run_copies_files_and_finishes_done() {
        let fx = fixture(&[("a.txt", 10), ("b.txt", 20)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let runner = runner(&fx, EngineSettings::default(), &hub);

        let end = runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());

        assert_eq!(end, JobState::Done);
        assert_eq!(runner.progress(), 100.0);
        assert_eq!(runner.current_file(), None);
        assert_eq!(fs::read(fx.dst.join("b.txt")).expect("read").len(), 20);
        assert_eq!(
            state_changes(&rx),
            vec![(JobState::Idle, JobState::Running), (JobState::Running, JobState::Done)]
        );
    }

    #[test]
    fn test_run_twice_is_noop() {
        let fx = fixture(&[("a.txt", 1)]);
        let hub = EventHub::new();
        let runner = runner(&fx, EngineSettings::default(), &hub);
        runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());

        let rx = hub.subscribe();
        let end = runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());
        assert_eq!(end, JobState::Done);
        assert!(state_changes(&rx).is_empty());
    }

    #[test]
    fn test_controls_are_noops_outside_their_state() {
        let fx = fixture(&[]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let runner = runner(&fx, EngineSettings::default(), &hub);

        runner.pause();
        runner.resume();
        runner.stop();
        assert_eq!(runner.state(), JobState::Idle);
        assert!(state_changes(&rx).is_empty());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let fx = fixture(&[("a.bin", 4096), ("b.bin", 4096), ("c.bin", 100)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let settings = EngineSettings {
            chunk_size: 512,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);
        runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());

        let percents: Vec<f64> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::JobProgressChanged { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(percents.len() > 2);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert!(percents.iter().all(|p| (0.0..=100.0).contains(p)));
        assert_eq!(percents.last().copied(), Some(100.0));
    }

    #[test]
    fn test_pause_resume_stop_transitions() {
        let fx = fixture(&[("a.bin", 4 * 1024 * 1024)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let settings = EngineSettings {
            chunk_size: 64,
            ..EngineSettings::default()
        };
        let runner = Arc::new(runner(&fx, settings, &hub));
        let priority = PriorityFileGate::new(&[".bin".to_string()]);

        thread::scope(|s| {
            let worker = s.spawn(|| runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &priority));

            wait_for_state(&runner, JobState::Running);
            runner.pause();
            runner.pause();
            wait_for_state(&runner, JobState::Paused);
            let frozen = runner.progress();
            thread::sleep(Duration::from_millis(30));
            assert_eq!(runner.progress(), frozen, "paused job kept copying");

            runner.resume();
            runner.resume();
            runner.pause();
            wait_for_state(&runner, JobState::Paused);
            runner.stop();
            runner.stop();

            assert_eq!(worker.join().expect("worker panicked"), JobState::Stopped);
        });

        assert_eq!(runner.progress(), 0.0);
        assert_eq!(priority.pending_count(), 0, "stopped job must release its priority files");
        assert_eq!(
            state_changes(&rx),
            vec![
                (JobState::Idle, JobState::Running),
                (JobState::Running, JobState::Pausing),
                (JobState::Pausing, JobState::Paused),
                (JobState::Paused, JobState::Running),
                (JobState::Running, JobState::Pausing),
                (JobState::Pausing, JobState::Paused),
                (JobState::Paused, JobState::Stopped),
            ]
        );
        assert!(!fx.dst.join("a.bin").exists());
    }

    #[test]
    fn test_pause_right_after_resume_is_observed() {
        let fx = fixture(&[("a.bin", 16 * 1024 * 1024)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let settings = EngineSettings {
            chunk_size: 16,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled())
            });
            wait_for_state(&runner, JobState::Running);
            runner.pause();
            wait_for_state(&runner, JobState::Paused);

            for _ in 0..10 {
                runner.resume();
                runner.pause();
                wait_for_state(&runner, JobState::Paused);
            }
            runner.stop();
            assert_eq!(worker.join().expect("worker panicked"), JobState::Stopped);
        });

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        let last_progress = events.iter().rev().find_map(|e| match e {
            EngineEvent::JobProgressChanged { percent, .. } => Some(*percent),
            _ => None,
        });
        assert_eq!(last_progress, Some(0.0), "stop must publish the progress reset");
        assert!(matches!(
            events.last(),
            Some(EngineEvent::JobStateChanged { job, .. }) if job.state == JobState::Stopped
        ));
        let paused = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::JobStateChanged { job, .. } if job.state == JobState::Paused))
            .count();
        assert_eq!(paused, 11);
    }

    #[test]
    fn test_business_software_pauses_running_job() {
        let fx = fixture(&[("a.bin", 4 * 1024 * 1024)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let settings = EngineSettings {
            chunk_size: 64,
            business_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);
        let guard = SwitchGuard::new(false);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                runner.run(&guard, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled())
            });
            let deadline = Instant::now() + Duration::from_secs(5);
            while runner.progress() == 0.0 {
                assert!(Instant::now() < deadline, "timed out waiting for progress");
                thread::sleep(Duration::from_millis(1));
            }

            guard.running.store(true, Ordering::SeqCst);
            wait_for_state(&runner, JobState::Paused);
            assert!(runner.is_blocked_by_business_software());
            let frozen = runner.progress();
            assert!(frozen > 0.0 && frozen < 100.0);
            thread::sleep(Duration::from_millis(40));
            assert_eq!(runner.progress(), frozen, "blocked job kept copying");

            guard.running.store(false, Ordering::SeqCst);
            assert_eq!(worker.join().expect("worker panicked"), JobState::Done);
        });

        assert!(!runner.is_blocked_by_business_software());
        let events: Vec<EngineEvent> = rx.try_iter().collect();
        let states: Vec<JobState> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::JobStateChanged { job, .. } => Some(job.state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![JobState::Running, JobState::Paused, JobState::Running, JobState::Done]
        );
        let blocked = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::BusinessSoftwareBlocked { .. }))
            .count();
        let released = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::BusinessSoftwareReleased { .. }))
            .count();
        assert_eq!((blocked, released), (1, 1));
    }

    #[test]
    fn test_business_software_delays_start() {
        let fx = fixture(&[("a.txt", 10)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let settings = EngineSettings {
            business_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);
        let guard = SwitchGuard::new(true);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                runner.run(&guard, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled())
            });
            wait_for_state(&runner, JobState::Paused);
            assert!(runner.is_blocked_by_business_software());
            thread::sleep(Duration::from_millis(40));
            assert!(!fx.dst.join("a.txt").exists(), "copied while business software ran");

            guard.running.store(false, Ordering::SeqCst);
            assert_eq!(worker.join().expect("worker panicked"), JobState::Done);
        });

        let events: Vec<_> = rx.try_iter().collect();
        let blocked = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::BusinessSoftwareBlocked { .. }))
            .count();
        let released = events
            .iter()
            .filter(|e| matches!(e, EngineEvent::BusinessSoftwareReleased { .. }))
            .count();
        assert_eq!((blocked, released), (1, 1));

        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::JobStateChanged { job, .. } => Some(job.state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![JobState::Running, JobState::Paused, JobState::Running, JobState::Done]
        );
        assert!(!runner.is_blocked_by_business_software());
    }

    #[test]
    fn test_stop_while_blocked_by_business_software() {
        let fx = fixture(&[("a.txt", 10)]);
        let hub = EventHub::new();
        let settings = EngineSettings {
            business_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);
        let guard = SwitchGuard::new(true);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                runner.run(&guard, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled())
            });
            wait_for_state(&runner, JobState::Paused);
            runner.stop();
            assert_eq!(worker.join().expect("worker panicked"), JobState::Stopped);
        });
        assert!(!runner.is_blocked_by_business_software());
        assert!(!fx.dst.join("a.txt").exists());
    }

    #[test]
    fn test_stop_releases_uncopied_priority_files() {
        let fx = fixture(&[("a.docx", 5), ("b.docx", 5), ("c.docx", 5), ("d.txt", 5)]);
        let hub = EventHub::new();
        let settings = EngineSettings {
            business_poll_interval_ms: 10,
            ..EngineSettings::default()
        };
        let runner = runner(&fx, settings, &hub);
        let guard = SwitchGuard::new(true);
        let priority = PriorityFileGate::new(&[".docx".to_string()]);

        thread::scope(|s| {
            let worker = s.spawn(|| runner.run(&guard, &LargeFileTransferLock::disabled(), &priority));
            // Registration happens before the business software wait
            wait_for_state(&runner, JobState::Paused);
            assert_eq!(priority.pending_count(), 3);
            assert!(!priority.is_open());

            runner.stop();
            assert_eq!(worker.join().expect("worker panicked"), JobState::Stopped);
        });
        assert_eq!(priority.pending_count(), 0);
        assert!(priority.is_open());
    }

    #[test]
    fn test_batch_start_waits_for_every_party() {
        let fx = fixture(&[("a.txt", 5)]);
        let hub = EventHub::new();
        let runner = runner(&fx, EngineSettings::default(), &hub);
        let start = Barrier::new(2);

        thread::scope(|s| {
            let worker = s.spawn(|| {
                runner.run_in_batch(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled(), &start)
            });
            thread::sleep(Duration::from_millis(30));
            assert!(!fx.dst.join("a.txt").exists(), "copied before the batch started");
            start.wait();
            assert_eq!(worker.join().expect("worker panicked"), JobState::Done);
        });
        assert!(fx.dst.join("a.txt").exists());
    }

    #[test]
    fn test_priority_files_are_copied_first() {
        let fx = fixture(&[("a.txt", 5), ("b.docx", 5), ("c.txt", 5), ("d.docx", 5)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let runner = runner(&fx, EngineSettings::default(), &hub);
        let priority = PriorityFileGate::new(&[".docx".to_string()]);

        let end = runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &priority);
        assert_eq!(end, JobState::Done);

        let order: Vec<String> = rx
            .try_iter()
            .filter_map(|e| match e {
                EngineEvent::FileTransferred { source, .. } => {
                    Some(source.file_name().unwrap().to_string_lossy().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["b.docx", "d.docx", "a.txt", "c.txt"]);
        assert_eq!(priority.pending_count(), 0);
    }

    #[test]
    fn test_enumeration_failure_is_error() {
        let fx = fixture(&[]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let work = BackupWork::new("broken", fx.src.join("missing"), &fx.dst, BackupType::Full);
        let runner = JobRunner::new(3, work, services(EngineSettings::default()), hub);

        let end = runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());
        assert_eq!(end, JobState::Error);
        assert_eq!(runner.progress(), 0.0);
        assert_eq!(runner.index(), 3);
        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(matches!(
            &events[events.len() - 2..],
            [
                EngineEvent::JobProgressChanged { percent, .. },
                EngineEvent::JobStateChanged { job, .. },
            ] if *percent == 0.0 && job.state == JobState::Error
        ));
    }

    struct RecordingEncryptor {
        seen: Mutex<Vec<PathBuf>>,
    }

    impl Encryptor for RecordingEncryptor {
        fn encrypt(&self, destination: &Path) -> EncryptionResult {
            self.seen.lock().unwrap().push(destination.to_path_buf());
            EncryptionResult::Encrypted(Duration::from_millis(3))
        }
    }

    #[test]
    fn test_only_configured_extensions_are_encrypted_and_verified_first() {
        let fx = fixture(&[("secret.key", 8), ("plain.txt", 8)]);
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let encryptor = Arc::new(RecordingEncryptor {
            seen: Mutex::new(Vec::new()),
        });
        let settings = EngineSettings {
            encrypted_extensions: vec![".key".to_string()],
            verify_after_copy: Some(checksums::ChecksumAlgorithm::Sha256),
            ..EngineSettings::default()
        };
        let services = Arc::new(JobServices {
            settings,
            enumerator: Arc::new(FsEnumerator),
            encryptor: encryptor.clone(),
        });
        let work = BackupWork::new("enc", &fx.src, &fx.dst, BackupType::Full);
        let runner = JobRunner::new(0, work, services, hub);

        runner.run(&NoBusinessSoftware, &LargeFileTransferLock::disabled(), &PriorityFileGate::disabled());

        assert_eq!(*encryptor.seen.lock().unwrap(), vec![fx.dst.join("secret.key")]);
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, EngineEvent::FileVerified { matches: true, .. }))
                .count(),
            2
        );
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::FileEncrypted { result: EncryptionResult::Encrypted(_), .. }
        )));
    }
}
