//! Filesystem operations module.
//!
//! This module provides:
//! - Recursive enumeration of a work's source tree (`FileEnumerator`)
//! - Full/differential file selection
//! - Directory validation and creation helpers

use crate::error::EngineError;
use crate::model::{BackupType, BackupWork, FileItem};
use std::fs;
use std::io;
use std::path::Path;

/// Provides the recursive list of regular files under a source folder.
///
/// Runners call this once per launch. Destination paths are derived by
/// mirroring the path relative to `source` under `destination_root`.
pub trait FileEnumerator: Send + Sync {
    fn enumerate(&self, source: &Path, destination_root: &Path) -> Result<Vec<FileItem>, EngineError>;
}

/// Enumerates the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsEnumerator;

impl FileEnumerator for FsEnumerator {
    fn enumerate(&self, source: &Path, destination_root: &Path) -> Result<Vec<FileItem>, EngineError> {
        enumerate_tree(source, destination_root)
    }
}

/// Enumerate the source directory tree and return all regular files.
///
/// Entries are visited in file-name order within each directory so that the
/// transfer order is stable between runs.
///
/// # Errors
/// Returns EngineError if the root or any subdirectory cannot be read.
pub fn enumerate_tree(source: &Path, destination_root: &Path) -> Result<Vec<FileItem>, EngineError> {
    fn recurse(path: &Path, rel_path: &Path, destination_root: &Path, items: &mut Vec<FileItem>) -> Result<(), EngineError> {
        let enumeration_failed = |e: io::Error| EngineError::EnumerationFailed {
            path: path.to_path_buf(),
            source: e,
        };

        let mut entries = fs::read_dir(path)
            .map_err(enumeration_failed)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(enumeration_failed)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let metadata = entry.metadata().map_err(enumeration_failed)?;
            let rel_full_path = rel_path.join(entry.file_name());
            let entry_path = entry.path();

            if metadata.is_dir() {
                recurse(&entry_path, &rel_full_path, destination_root, items)?;
            } else if metadata.is_file() {
                items.push(FileItem {
                    destination_path: destination_root.join(&rel_full_path),
                    source_path: entry_path,
                    file_size: metadata.len(),
                    last_modified: metadata.modified().ok(),
                });
            }
        }
        Ok(())
    }

    let mut items = Vec::new();
    recurse(source, Path::new(""), destination_root, &mut items)?;
    Ok(items)
}

/// Apply the work's backup type to an enumerated file set.
///
/// Differential keeps files whose destination is missing, or whose source
/// is strictly newer than the destination copy.
pub fn select_files(files: Vec<FileItem>, backup_type: BackupType) -> Vec<FileItem> {
    match backup_type {
        BackupType::Full => files,
        BackupType::Differential => files.into_iter().filter(needs_differential_copy).collect(),
    }
}

fn needs_differential_copy(file: &FileItem) -> bool {
    let dst_modified = match fs::metadata(&file.destination_path).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        // Missing destination (or unreadable mtime): copy
        Err(_) => return true,
    };
    match file.last_modified {
        Some(src_modified) => src_modified > dst_modified,
        None => true,
    }
}

/// Reject a work whose folders do not exist.
pub fn validate_work(work: &BackupWork) -> Result<(), EngineError> {
    if !work.source.is_dir() {
        return Err(EngineError::SourceNotFound {
            path: work.source.clone(),
        });
    }
    if !work.destination.is_dir() {
        return Err(EngineError::DestinationNotFound {
            path: work.destination.clone(),
        });
    }
    Ok(())
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return Ok(()),
    };

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "Parent path exists but is not a directory"),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreationFailed {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
