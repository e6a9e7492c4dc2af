//! Chunked file copy.
//!
//! Copies one file in fixed-size chunks. Between chunks the copier reports
//! progress and hands control to a `TransferControl` checkpoint, which is
//! where pausing and cancellation take effect.

use crate::error::EngineError;
use crate::events::{EngineEvent, EventHub};
use crate::fs_ops;
use crate::model::FileItem;
use chrono::Utc;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Hook consulted between chunks.
pub trait TransferControl {
    /// Block while the job is paused; `Err(Cancelled)` once it is stopped.
    fn checkpoint(&self) -> Result<(), EngineError>;
}

/// Identifies the job a transfer belongs to, for events.
#[derive(Debug, Clone, Copy)]
pub struct TransferOrigin<'a> {
    pub job_id: Uuid,
    pub work_name: &'a str,
}

/// Copies files chunk by chunk.
#[derive(Debug, Clone, Copy)]
pub struct FileCopier {
    chunk_size: usize,
}

impl FileCopier {
    pub fn new(chunk_size: usize) -> Self {
        FileCopier {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `file` to its destination.
    ///
    /// A destination file with the same name is deleted first. `on_chunk`
    /// receives the size of every chunk written. On success the destination
    /// gets the source modification time and a `FileTransferred` event is
    /// published. I/O faults publish `FileTransferError` and return
    /// `EngineError::Transfer`; the partially written destination is removed
    /// on both fault and cancellation.
    pub fn copy(
        &self,
        origin: TransferOrigin<'_>,
        file: &FileItem,
        control: &dyn TransferControl,
        events: &EventHub,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<Duration, EngineError> {
        let started = Instant::now();
        let src = &file.source_path;
        let dst = &file.destination_path;

        let result = self.copy_chunks(origin, file, control, events, on_chunk);
        match result {
            Ok(()) => {
                if let Some(mtime) = file.last_modified {
                    if let Err(e) = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime)) {
                        log::warn!("Could not preserve mtime on {}: {}", dst.display(), e);
                    }
                }
                let elapsed = started.elapsed();
                log::debug!(
                    "Copied {} -> {} ({} bytes in {:?})",
                    src.display(),
                    dst.display(),
                    file.file_size,
                    elapsed
                );
                events.publish(EngineEvent::FileTransferred {
                    job_id: origin.job_id,
                    work_name: origin.work_name.to_string(),
                    source: src.clone(),
                    destination: dst.clone(),
                    size: file.file_size,
                    elapsed,
                    at: Utc::now(),
                });
                Ok(elapsed)
            }
            Err(CopyFailure::Cancelled) => {
                remove_partial(dst);
                Err(EngineError::Cancelled)
            }
            Err(CopyFailure::Io(e)) => {
                remove_partial(dst);
                log::error!("Transfer of {} failed: {}", src.display(), e);
                events.publish(EngineEvent::FileTransferError {
                    job_id: origin.job_id,
                    work_name: origin.work_name.to_string(),
                    source: src.clone(),
                    destination: dst.clone(),
                    size: file.file_size,
                    fault: e.to_string(),
                    at: Utc::now(),
                });
                Err(EngineError::Transfer {
                    source_path: src.clone(),
                    destination_path: dst.clone(),
                    size: file.file_size,
                    source: e,
                })
            }
        }
    }

    fn copy_chunks(
        &self,
        origin: TransferOrigin<'_>,
        file: &FileItem,
        control: &dyn TransferControl,
        events: &EventHub,
        on_chunk: &mut dyn FnMut(u64),
    ) -> Result<(), CopyFailure> {
        let src = &file.source_path;
        let dst = &file.destination_path;

        fs_ops::ensure_parent_dir_exists(dst).map_err(|e| match e {
            EngineError::DirectoryCreationFailed { source, .. } => CopyFailure::Io(source),
            other => CopyFailure::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        })?;
        match fs::remove_file(dst) {
            Ok(()) => log::debug!("Replaced existing {}", dst.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CopyFailure::Io(e)),
        }

        let mut reader = fs::File::open(src)?;
        let mut writer = fs::File::create(dst)?;
        let mut buffer = vec![0u8; self.chunk_size];
        let mut copied: u64 = 0;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n])?;
            copied += n as u64;

            on_chunk(n as u64);
            events.publish(EngineEvent::FileProgress {
                job_id: origin.job_id,
                source: src.clone(),
                destination: dst.clone(),
                percent: percent_of(copied, file.file_size),
            });
            control.checkpoint().map_err(|_| CopyFailure::Cancelled)?;
        }
        writer.flush()?;
        Ok(())
    }
}

enum CopyFailure {
    Cancelled,
    Io(io::Error),
}

impl From<io::Error> for CopyFailure {
    fn from(e: io::Error) -> Self {
        CopyFailure::Io(e)
    }
}

fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Could not remove partial file {}: {}", path.display(), e);
        }
    }
}

/// `done / total` as a percentage in [0, 100]; an empty total counts as done.
pub fn percent_of(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (done as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CancellationToken;
    use std::cell::Cell;

    struct Free;

    impl TransferControl for Free {
        fn checkpoint(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    /// Cancels after a fixed number of checkpoints.
    struct CancelAfter {
        remaining: Cell<usize>,
        token: CancellationToken,
    }

    impl TransferControl for CancelAfter {
        fn checkpoint(&self) -> Result<(), EngineError> {
            let left = self.remaining.get();
            if left == 0 {
                self.token.cancel();
            } else {
                self.remaining.set(left - 1);
            }
            self.token.check()
        }
    }

    fn origin() -> TransferOrigin<'static> {
        TransferOrigin {
            job_id: Uuid::nil(),
            work_name: "test",
        }
    }

    fn item(src: &Path, dst: &Path) -> FileItem {
        let metadata = fs::metadata(src).expect("Failed to stat source");
        FileItem {
            source_path: src.to_path_buf(),
            destination_path: dst.to_path_buf(),
            file_size: metadata.len(),
            last_modified: metadata.modified().ok(),
        }
    }

    #[test]
    fn test_copy_in_chunks_reports_progress() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("source.bin");
        let dst = temp_dir.path().join("out").join("dest.bin");
        fs::write(&src, vec![7u8; 10_000]).expect("Failed to write source");

        let hub = EventHub::new();
        let rx = hub.subscribe();
        let mut chunks = Vec::new();
        FileCopier::new(4096)
            .copy(origin(), &item(&src, &dst), &Free, &hub, &mut |n: u64| chunks.push(n))
            .expect("Failed to copy");

        assert_eq!(chunks, vec![4096, 4096, 1808]);
        assert_eq!(fs::read(&dst).expect("Failed to read dest"), vec![7u8; 10_000]);

        let events: Vec<_> = rx.try_iter().collect();
        let percents: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::FileProgress { percent, .. } => Some(*percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents.len(), 3);
        assert_eq!(percents.last().copied(), Some(100.0));
        assert!(matches!(
            events.last(),
            Some(EngineEvent::FileTransferred { size: 10_000, .. })
        ));
    }

    #[test]
    fn test_existing_destination_is_replaced() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        let dst = temp_dir.path().join("b.txt");
        fs::write(&src, "new").expect("Failed to write source");
        fs::write(&dst, "much longer old content").expect("Failed to write dest");

        FileCopier::new(1024)
            .copy(origin(), &item(&src, &dst), &Free, &EventHub::new(), &mut |_| {})
            .expect("Failed to copy");
        assert_eq!(fs::read_to_string(&dst).expect("Failed to read dest"), "new");
    }

    #[test]
    fn test_preserves_modification_time() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("a.txt");
        let dst = temp_dir.path().join("b.txt");
        fs::write(&src, "data").expect("Failed to write source");
        let mtime = filetime::FileTime::from_unix_time(1_500_000_000, 0);
        filetime::set_file_mtime(&src, mtime).expect("Failed to set mtime");

        FileCopier::new(1024)
            .copy(origin(), &item(&src, &dst), &Free, &EventHub::new(), &mut |_| {})
            .expect("Failed to copy");

        let copied = filetime::FileTime::from_last_modification_time(&fs::metadata(&dst).expect("stat"));
        assert_eq!(copied.unix_seconds(), 1_500_000_000);
    }

    #[test]
    fn test_cancellation_removes_partial_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("big.bin");
        let dst = temp_dir.path().join("copy.bin");
        fs::write(&src, vec![1u8; 8192]).expect("Failed to write source");

        let control = CancelAfter {
            remaining: Cell::new(1),
            token: CancellationToken::new(),
        };
        let mut chunks = 0;
        let result = FileCopier::new(1024).copy(
            origin(),
            &item(&src, &dst),
            &control,
            &EventHub::new(),
            &mut |_| chunks += 1,
        );

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(chunks, 2);
        assert!(!dst.exists());
    }

    #[test]
    fn test_missing_source_is_transfer_error() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = FileItem {
            source_path: temp_dir.path().join("gone.txt"),
            destination_path: temp_dir.path().join("dst.txt"),
            file_size: 12,
            last_modified: None,
        };

        let hub = EventHub::new();
        let rx = hub.subscribe();
        let result = FileCopier::new(1024).copy(origin(), &file, &Free, &hub, &mut |_| {});

        assert!(matches!(result, Err(EngineError::Transfer { size: 12, .. })));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::FileTransferError { size: 12, .. })
        ));
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(0, 0), 100.0);
        assert_eq!(percent_of(50, 200), 25.0);
        assert_eq!(percent_of(300, 200), 100.0);
    }
}
