//! Error types for the download engine.
//!
//! Variants carry the context (URL, path, status) needed both for
//! diagnostics and for the structured retry classification in
//! [`super::retry`].

use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::auth::AuthError;

/// Errors that can occur while downloading a series.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// No valid bearer token could be obtained for the request.
    #[error("authentication unavailable: {source}")]
    AuthUnavailable {
        /// The underlying token failure.
        #[source]
        source: AuthError,
    },

    /// The archive answered with a non-200 status.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that was requested.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// The request or body stream timed out.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Transport-level failure (refused, reset, broken pipe, premature EOF).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Filesystem failure while writing, renaming, or cleaning up.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Archive extraction or verification failed.
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// The image endpoint URL could not be constructed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// A background task died before producing a result.
    #[error("internal task failure: {detail}")]
    Internal {
        /// What the task reported.
        detail: String,
    },
}

impl DownloadError {
    /// Creates an auth-unavailable error from a token failure.
    #[must_use]
    pub fn auth_unavailable(source: AuthError) -> Self {
        Self::AuthUnavailable { source }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a network error, promoting timeouts to [`Self::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}
