//! On-disk layout of extracted series.
//!
//! ```text
//! <output>/
//!   metadata/<series_uid>.json               cache entries
//!   <subject_id>/<study_uid>/<series_uid>/   extracted DICOM files
//!   <subject_id>/<study_uid>/<series_uid>.zip  keep-zip mode
//!   <username>.json                          persisted token
//! ```
//!
//! Subject/study directories are created concurrently by workers; creation
//! goes through create-or-ignore wrapped in an in-process mutex with a
//! double-check, so racing workers never trip over each other.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::metadata::SeriesRecord;

/// Resolves and creates output paths for the run.
#[derive(Debug)]
pub struct OutputLayout {
    root: PathBuf,
    dir_lock: Mutex<()>,
}

impl OutputLayout {
    /// Creates a layout rooted at `output`.
    #[must_use]
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            root: output.into(),
            dir_lock: Mutex::new(()),
        }
    }

    /// The output root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the extracted series:
    /// `<output>/<subject_id>/<study_uid>/<series_uid>`.
    #[must_use]
    pub fn series_dir(&self, record: &SeriesRecord) -> PathBuf {
        self.study_dir(record).join(&record.series_uid)
    }

    /// Keep-zip target: `<output>/<subject_id>/<study_uid>/<series_uid>.zip`.
    #[must_use]
    pub fn series_zip(&self, record: &SeriesRecord) -> PathBuf {
        self.study_dir(record)
            .join(format!("{}.zip", record.series_uid))
    }

    /// Ensures `<output>/<subject_id>/<study_uid>` exists and returns it.
    ///
    /// # Errors
    ///
    /// Returns the IO error if the directory cannot be created.
    pub fn ensure_study_dir(&self, record: &SeriesRecord) -> std::io::Result<PathBuf> {
        let dir = self.study_dir(record);
        if dir.is_dir() {
            return Ok(dir);
        }

        let _guard = self
            .dir_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Double-check after acquiring the lock.
        if !dir.is_dir() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    fn study_dir(&self, record: &SeriesRecord) -> PathBuf {
        self.root.join(&record.subject_id).join(&record.study_uid)
    }
}

/// Appends a suffix to the final path component (`series` + `.zip.tmp`
/// becomes `series.zip.tmp`).
#[must_use]
pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(suffix);
    PathBuf::from(os_string)
}
