//! Safe archive extraction with integrity verification.
//!
//! Downloaded series arrive as ZIP archives. Extraction refuses entries
//! whose cleaned path would escape the destination root, streams each entry
//! to disk while feeding an MD5 hasher when the entry appears in the
//! archive's hash manifest (`md5hashes.csv`), and checks the extracted
//! total against the expected uncompressed size. The hash manifest itself
//! is never materialized to the output.
//!
//! Hash-map lookup keys are archive entry names, not local paths.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, warn};

/// Name of the per-archive hash manifest entry.
const HASH_MANIFEST_NAME: &str = "md5hashes.csv";

/// Copy buffer for entry extraction and file hashing.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Errors from archive inspection, extraction, or verification.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive could not be opened or walked.
    #[error("failed to read archive {path}: {source}")]
    Archive {
        /// The archive path.
        path: PathBuf,
        /// The underlying zip error.
        #[source]
        source: zip::result::ZipError,
    },

    /// Filesystem error while extracting.
    #[error("IO error extracting to {path}: {source}")]
    Io {
        /// The path being written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An entry's cleaned path escapes the destination root.
    #[error("unsafe entry path in archive: {name}")]
    UnsafeEntry {
        /// The offending entry name.
        name: String,
    },

    /// One or more entries did not match their expected digest.
    #[error("MD5 validation failed for {} files:\n{}", .mismatches.len(), .mismatches.join("\n"))]
    HashMismatch {
        /// One line per mismatching file: name, expected, actual.
        mismatches: Vec<String>,
    },

    /// Extracted total differs from the expected uncompressed size.
    #[error("size mismatch: expected {expected} bytes, extracted {actual} bytes")]
    SizeMismatch {
        /// Expected uncompressed total.
        expected: u64,
        /// Extracted total.
        actual: u64,
    },
}

/// Parses the archive's hash manifest into an entry-name → hex-digest map.
///
/// Returns `Ok(None)` when the archive carries no manifest. The first row
/// is a header and is skipped; rows without two columns are ignored.
///
/// # Errors
///
/// Returns [`ArchiveError`] when the archive or the manifest entry cannot
/// be read.
pub fn parse_hash_manifest(
    zip_path: &Path,
) -> Result<Option<HashMap<String, String>>, ArchiveError> {
    let archive_err = |source| ArchiveError::Archive {
        path: zip_path.to_path_buf(),
        source,
    };

    let file = fs::File::open(zip_path).map_err(|e| ArchiveError::Io {
        path: zip_path.to_path_buf(),
        source: e,
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(archive_err)?;

    let mut entry = match archive.by_name(HASH_MANIFEST_NAME) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(archive_err(e)),
    };

    let mut content = String::new();
    entry
        .read_to_string(&mut content)
        .map_err(|e| ArchiveError::Io {
            path: zip_path.to_path_buf(),
            source: e,
        })?;

    let mut hashes = HashMap::new();
    for line in content.lines().skip(1) {
        let Some((filename, digest)) = line.split_once(',') else {
            continue;
        };
        hashes.insert(
            filename.trim().to_string(),
            digest.trim().to_ascii_lowercase(),
        );
    }

    debug!(path = %zip_path.display(), files = hashes.len(), "parsed hash manifest");
    Ok(Some(hashes))
}

/// Extracts an archive into `dest`, verifying per-entry digests and the
/// extracted total size.
///
/// In hash mode (`hashes` non-empty) the set of imaging files is exactly
/// the manifest's key set, so only those entries count toward the total
/// and the size comparison is strict. Without hashes every entry counts
/// and a size difference is logged rather than failed, since a
/// non-imaging file in the archive can legitimately perturb the sum.
///
/// Returns the counted extracted byte total.
///
/// # Errors
///
/// Returns [`ArchiveError`] on unsafe entry paths, IO failures, digest
/// mismatches, or (hash mode) a strict size mismatch.
pub fn extract_and_verify(
    zip_path: &Path,
    dest: &Path,
    expected_size: Option<u64>,
    hashes: Option<&HashMap<String, String>>,
) -> Result<u64, ArchiveError> {
    let archive_err = |source| ArchiveError::Archive {
        path: zip_path.to_path_buf(),
        source,
    };
    let io_err = |path: &Path, source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = fs::File::open(zip_path).map_err(|e| io_err(zip_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(archive_err)?;

    fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

    let hash_mode = hashes.is_some_and(|map| !map.is_empty());
    let mut total_size: u64 = 0;
    let mut mismatches = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(archive_err)?;

        // The manifest describes the output; it is not part of it.
        if entry.name() == HASH_MANIFEST_NAME {
            continue;
        }

        // Path-traversal guard: reject before any write.
        let Some(relative) = entry.enclosed_name() else {
            return Err(ArchiveError::UnsafeEntry {
                name: entry.name().to_string(),
            });
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let expected_digest = hashes.and_then(|map| map.get(entry.name()));
        let (written, actual_digest) =
            write_entry(&mut entry, &target, expected_digest.is_some())
                .map_err(|e| io_err(&target, e))?;

        if let (Some(expected), Some(actual)) = (expected_digest, actual_digest) {
            if *expected == actual {
                debug!(entry = entry.name(), "MD5 verified");
            } else {
                mismatches.push(format!(
                    "{}: expected {expected}, got {actual}",
                    entry.name()
                ));
            }
        }

        // In hash mode only manifest-listed (imaging) files count.
        if !hash_mode || expected_digest.is_some() {
            total_size += written;
        }
    }

    if !mismatches.is_empty() {
        return Err(ArchiveError::HashMismatch { mismatches });
    }

    if let Some(expected) = expected_size.filter(|&size| size > 0) {
        if total_size != expected {
            if hash_mode {
                return Err(ArchiveError::SizeMismatch {
                    expected,
                    actual: total_size,
                });
            }
            warn!(
                expected,
                actual = total_size,
                "size differs from manifest (non-imaging files in the archive can cause this)"
            );
        }
    }

    Ok(total_size)
}

/// Streams one entry to disk, optionally computing its MD5 digest.
fn write_entry(
    entry: &mut impl Read,
    target: &Path,
    hash: bool,
) -> std::io::Result<(u64, Option<String>)> {
    let mut output = fs::File::create(target)?;
    let mut hasher = hash.then(|| Md5::new());
    let mut buffer = [0_u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        let read = entry.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read])?;
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buffer[..read]);
        }
        written += read as u64;
    }

    Ok((written, hasher.map(|h| hex_encode(&h.finalize()))))
}

/// Computes the MD5 digest of a file on disk as a lowercase hex string.
///
/// # Errors
///
/// Returns the IO error if the file cannot be read.
pub fn calculate_file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0_u8; COPY_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Total size of all regular files under `dir`, recursively.
///
/// # Errors
///
/// Returns the first IO error encountered while walking.
pub fn directory_size(dir: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += directory_size(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}
