//! Atomic file I/O primitives for registry and policy state files.
//!
//! Writes go to a temp file in the same directory, are flushed, and are
//! renamed over the final path. A crash at any point leaves either the old
//! complete file or the new complete file, never a partial write, so readers
//! of the persisted registry never observe a torn document.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Errors from atomic filesystem operations.
#[derive(Debug, thiserror::Error)]
pub enum FsIoError {
    /// The target path has no parent directory.
    #[error("path has no parent directory: {}", path.display())]
    NoParentDirectory {
        /// Path that was missing a parent.
        path: PathBuf,
    },

    /// Serialization to JSON failed.
    #[error("failed to serialize value: {0}")]
    SerializeFailed(#[from] serde_json::Error),

    /// Underlying I/O failure with context.
    #[error("{context}: {source}")]
    Io {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        source: std::io::Error,
    },
}

impl FsIoError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Write `data` to `path` atomically (temp file + rename).
///
/// The parent directory is created if it does not exist.
///
/// # Errors
///
/// Returns [`FsIoError`] if any filesystem operation fails.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), FsIoError> {
    let parent = path
        .parent()
        .ok_or_else(|| FsIoError::NoParentDirectory {
            path: path.to_path_buf(),
        })?;

    if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
            .map_err(|e| FsIoError::io("create parent directory", e))?;
    }

    // Temp file in the same directory: same filesystem, so the rename is
    // atomic.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| FsIoError::io("create temp file", e))?;

    tmp.write_all(data)
        .map_err(|e| FsIoError::io("write to temp file", e))?;

    tmp.flush()
        .map_err(|e| FsIoError::io("flush temp file", e))?;

    tmp.persist(path)
        .map_err(|e| FsIoError::io("rename temp file to final path", e.error))?;

    Ok(())
}

/// Serialize `value` as pretty-printed JSON and write it atomically.
///
/// Serialization happens in memory before any file I/O, so a serialization
/// failure never leaves a partial file on disk.
///
/// # Errors
///
/// Returns [`FsIoError::SerializeFailed`] if serialization fails, or any
/// I/O error from [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), FsIoError> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_write_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[test]
    fn test_atomic_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        atomic_write(&path, b"old").unwrap();
        atomic_write(&path, b"new").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_atomic_write_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("state.json");

        atomic_write(&path, b"x").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_atomic_write_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.json");

        atomic_write_json(&path, &vec!["a", "b"]).unwrap();
        let loaded: Vec<String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(loaded, vec!["a", "b"]);
    }
}
