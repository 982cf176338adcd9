//! Input manifest decoding.
//!
//! A manifest is a plain-text file enumerating series UIDs, one per line,
//! mixed with `key=value` header lines that configure the vendor's own
//! download tool (`downloadServerUrl`, `databasketId`, `manifestVersion`,
//! `ListOfSeriesToDownload`, ...). Header lines are ignored; every other
//! non-empty line is taken as a series UID.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors that can occur while reading a manifest file.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest {path}: {source}")]
    Io {
        /// The manifest path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Reads a manifest file and returns the series UIDs it enumerates.
///
/// Lines containing `=` are header entries and are skipped; blank lines are
/// skipped; everything else is a series UID. Order is preserved.
///
/// # Errors
///
/// Returns [`ManifestError::Io`] if the file cannot be read.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, ManifestError> {
    let content = fs::read_to_string(path).map_err(|e| ManifestError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let uids = parse_manifest(&content);
    debug!(path = %path.display(), series = uids.len(), "decoded manifest");
    Ok(uids)
}

/// Parses manifest text into series UIDs.
#[must_use]
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('='))
        .map(std::string::ToString::to_string)
        .collect()
}
