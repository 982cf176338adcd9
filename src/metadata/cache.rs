//! Filesystem-backed metadata cache.
//!
//! One JSON file per series UID under `<output>/metadata/`. Reads are
//! lock-free; writes serialize through a process-wide mutex and publish by
//! temp-file-then-rename, so a cache file either does not exist or parses
//! to a complete record. Concurrent writers of the same UID are safe: the
//! rename is atomic and the payload is identical for the same upstream
//! response.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

use super::record::SeriesRecord;

/// Errors from cache writes. (Reads never error; they miss.)
#[derive(Debug, Error)]
pub enum CacheError {
    /// The record carries no series UID to key the file by.
    #[error("refusing to cache a record with an empty series UID")]
    EmptyUid,

    /// Serialization failed.
    #[error("failed to serialize metadata record: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem write or rename failed.
    #[error("failed to write cache entry {path}: {source}")]
    Io {
        /// The cache path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Per-series metadata store rooted at `<output>/metadata/`.
#[derive(Debug)]
pub struct MetadataCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl MetadataCache {
    /// Opens (and creates, if needed) the cache directory under `output`.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the directory cannot be created.
    pub fn create(output: &Path) -> std::io::Result<Self> {
        let dir = output.join("metadata");
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the cache entry for a series UID.
    #[must_use]
    pub fn path(&self, series_uid: &str) -> PathBuf {
        self.dir.join(format!("{series_uid}.json"))
    }

    /// Loads a cached record. Any read or parse error is a miss.
    #[must_use]
    pub fn load(&self, series_uid: &str) -> Option<SeriesRecord> {
        let bytes = std::fs::read(self.path(series_uid)).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(series_uid, error = %e, "cache entry unreadable, treating as miss");
                None
            }
        }
    }

    /// Stores a record atomically. Idempotent; last writer wins.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the record has no UID or the write fails.
    pub fn store(&self, record: &SeriesRecord) -> Result<(), CacheError> {
        if record.series_uid.is_empty() {
            return Err(CacheError::EmptyUid);
        }

        let target = self.path(&record.series_uid);
        let content = serde_json::to_vec_pretty(record)?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let temp_path = target.with_extension("json.tmp");
        std::fs::write(&temp_path, content).map_err(|e| CacheError::Io {
            path: temp_path.clone(),
            source: e,
        })?;
        if let Err(e) = std::fs::rename(&temp_path, &target) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CacheError::Io {
                path: target,
                source: e,
            });
        }
        Ok(())
    }
}
