//! Business software detection.
//!
//! While the configured process is running, backups must not touch the
//! disk: jobs wait before their first file and pause between chunks.

use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Predicate telling whether the business software is currently running.
pub trait BusinessSoftwareGuard: Send + Sync {
    fn is_running(&self) -> bool;
}

/// Guard used when no business software is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBusinessSoftware;

impl BusinessSoftwareGuard for NoBusinessSoftware {
    fn is_running(&self) -> bool {
        false
    }
}

/// Looks the configured process up in the system process table.
///
/// Refreshing the process table is expensive, so the answer is cached for
/// `refresh_interval`.
pub struct ProcessGuard {
    process_name: String,
    refresh_interval: Duration,
    inner: Mutex<ProcessCache>,
}

struct ProcessCache {
    system: System,
    last_check: Option<Instant>,
    running: bool,
}

impl ProcessGuard {
    pub fn new(process_name: impl Into<String>, refresh_interval: Duration) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
        );
        ProcessGuard {
            process_name: normalize_process_name(OsStr::new(&process_name.into())),
            refresh_interval,
            inner: Mutex::new(ProcessCache {
                system,
                last_check: None,
                running: false,
            }),
        }
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }
}

impl BusinessSoftwareGuard for ProcessGuard {
    fn is_running(&self) -> bool {
        let mut cache = match self.inner.lock() {
            Ok(cache) => cache,
            Err(poisoned) => {
                log::warn!("Process cache lock poisoned, refreshing anyway");
                poisoned.into_inner()
            }
        };

        let fresh = cache
            .last_check
            .is_some_and(|at| at.elapsed() < self.refresh_interval);
        if fresh {
            return cache.running;
        }

        cache.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        let running = cache
            .system
            .processes()
            .values()
            .any(|p| normalize_process_name(p.name()) == self.process_name);
        if running != cache.running {
            log::info!(
                "Business software '{}' {}",
                self.process_name,
                if running { "detected" } else { "no longer running" }
            );
        }
        cache.running = running;
        cache.last_check = Some(Instant::now());
        running
    }
}

/// Lowercase, without a trailing ".exe", so "Calc.exe" matches "calc".
fn normalize_process_name(name: &OsStr) -> String {
    let name = name.to_string_lossy().trim().to_lowercase();
    match name.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => name,
    }
}

/// Build the guard described by the settings.
pub fn guard_for(process_name: Option<&str>, refresh_interval: Duration) -> Box<dyn BusinessSoftwareGuard> {
    match process_name {
        Some(name) => Box::new(ProcessGuard::new(name, refresh_interval)),
        None => Box::new(NoBusinessSoftware),
    }
}
