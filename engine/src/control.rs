//! Per-job control primitives: the pause latch and the cancellation token.

use crate::error::EngineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Why the latch is closed. Both reasons are tracked independently so that a
/// business software release does not resume a manually paused job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    Manual,
    Business,
}

#[derive(Debug, Default)]
struct LatchState {
    manual: bool,
    business: bool,
}

impl LatchState {
    fn is_open(&self) -> bool {
        !self.manual && !self.business
    }
}

/// Resettable gate a worker blocks on while the job is paused.
#[derive(Debug, Default)]
pub struct PauseLatch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl PauseLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        // The latch holds two bools; a poisoned guard is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn close(&self, reason: PauseReason) {
        let mut state = self.lock();
        match reason {
            PauseReason::Manual => state.manual = true,
            PauseReason::Business => state.business = true,
        }
    }

    pub fn open(&self, reason: PauseReason) {
        let mut state = self.lock();
        match reason {
            PauseReason::Manual => state.manual = false,
            PauseReason::Business => state.business = false,
        }
        if state.is_open() {
            self.changed.notify_all();
        }
    }

    /// Clear every reason and wake all waiters.
    pub fn force_open(&self) {
        let mut state = self.lock();
        state.manual = false;
        state.business = false;
        self.changed.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    pub fn is_closed_by(&self, reason: PauseReason) -> bool {
        let state = self.lock();
        match reason {
            PauseReason::Manual => state.manual,
            PauseReason::Business => state.business,
        }
    }

    /// Block until the latch is open or `timeout` elapses. Returns whether
    /// the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.lock();
        if state.is_open() {
            return true;
        }
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !s.is_open())
            .unwrap_or_else(|e| e.into_inner());
        state.is_open()
    }
}

/// Cooperative cancellation flag shared between a runner and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// How often blocking waits re-check a cancellation token.
pub(crate) const CANCEL_POLL: Duration = Duration::from_millis(20);
