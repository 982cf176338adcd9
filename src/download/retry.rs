//! Structured retry classification and exponential backoff.
//!
//! Every failed attempt is classified into a [`FailureKind`]; the
//! [`RetryPolicy`] then decides whether to retry and with what delay.
//! Classification works on error kinds, not message text:
//!
//! - [`FailureKind::Transport`] and [`FailureKind::Server`] faults are the
//!   flaky-archive cases retries exist for.
//! - [`FailureKind::Integrity`] failures (size or digest mismatch, corrupt
//!   archive) usually mean a truncated transfer and are retried too.
//! - [`FailureKind::Auth`], [`FailureKind::Filesystem`], and
//!   [`FailureKind::Protocol`] failures would fail identically on retry.
//!
//! The retry counter resets per series, never globally.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::archive::ArchiveError;
use super::DownloadError;

/// Default maximum retries (attempts = retries + 1).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff delay.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Backoff is capped so a long retry ladder cannot stall a worker forever.
const MAX_BACKOFF_DELAY: Duration = Duration::from_secs(10 * 60);

/// Maximum jitter added to each backoff delay.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of a failed download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Token acquisition failed or the archive rejected the bearer.
    Auth,
    /// Connection-level fault: refused, reset, closed, broken pipe,
    /// premature EOF, timeout.
    Transport,
    /// Server-side fault: HTTP 429 or any 5xx.
    Server,
    /// The transferred archive failed verification.
    Integrity,
    /// Local filesystem fault: permission denied, rename failure.
    Filesystem,
    /// Unexpected status or malformed payload.
    Protocol,
}

impl FailureKind {
    /// Whether a retry could plausibly succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transport | Self::Server | Self::Integrity)
    }
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to sleep first.
        delay: Duration,
        /// The attempt number about to run (1-indexed).
        attempt: u32,
    },
    /// Give up on this series.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff configuration.
///
/// Delay for the n-th retry is `initial_delay * 2^(n-1)` (capped), plus a
/// small random jitter so simultaneous failures do not retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` retries after the first
    /// attempt, starting from `initial_delay`.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Total attempts this policy allows.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Decides whether the attempt that just failed should be retried.
    ///
    /// `attempt` is the 1-indexed attempt number that failed.
    #[must_use]
    pub fn should_retry(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{kind:?} failures are not retryable"),
            };
        }

        if attempt >= self.max_attempts() {
            debug!(attempt, max = self.max_attempts(), "attempts exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("all {} attempts exhausted", self.max_attempts()),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt),
            attempt: attempt + 1,
        }
    }

    /// Backoff delay after the given failed attempt (1-indexed).
    fn delay_for(&self, attempt: u32) -> Duration {
        let doubled = self
            .initial_delay
            .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)));
        doubled.min(MAX_BACKOFF_DELAY) + jitter()
    }
}

/// Random jitter in `0..=MAX_JITTER`.
fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a download error for retry purposes.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureKind {
    match error {
        DownloadError::AuthUnavailable { source } => match source.status() {
            // A flaky token endpoint is a server fault, not a credential one.
            Some(status) if status == 429 || (500..600).contains(&status) => FailureKind::Server,
            _ => FailureKind::Auth,
        },

        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } | DownloadError::Network { .. } => FailureKind::Transport,

        DownloadError::Io { .. } => FailureKind::Filesystem,

        DownloadError::Archive(archive_error) => classify_archive_error(archive_error),

        DownloadError::InvalidUrl { .. } | DownloadError::Internal { .. } => FailureKind::Protocol,
    }
}

fn classify_http_status(status: u16) -> FailureKind {
    match status {
        401 | 403 => FailureKind::Auth,
        429 => FailureKind::Server,
        status if (500..600).contains(&status) => FailureKind::Server,
        _ => FailureKind::Protocol,
    }
}

fn classify_archive_error(error: &ArchiveError) -> FailureKind {
    match error {
        // Truncated or corrupt transfers produce unreadable archives and
        // digest/size mismatches; a clean re-download often resolves them.
        ArchiveError::Archive { .. }
        | ArchiveError::HashMismatch { .. }
        | ArchiveError::SizeMismatch { .. } => FailureKind::Integrity,
        ArchiveError::Io { .. } => FailureKind::Filesystem,
        ArchiveError::UnsafeEntry { .. } => FailureKind::Protocol,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn transient_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }

    #[test]
    fn test_default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(policy.initial_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::Transport.is_retryable());
        assert!(FailureKind::Server.is_retryable());
        assert!(FailureKind::Integrity.is_retryable());
        assert!(!FailureKind::Auth.is_retryable());
        assert!(!FailureKind::Filesystem.is_retryable());
        assert!(!FailureKind::Protocol.is_retryable());
    }

    #[test]
    fn test_should_retry_transient_until_exhausted() {
        let policy = transient_policy();

        assert!(matches!(
            policy.should_retry(FailureKind::Transport, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureKind::Transport, 3),
            RetryDecision::Retry { attempt: 4, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureKind::Transport, 4),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_should_not_retry_permanent_kinds_on_first_failure() {
        let policy = transient_policy();
        for kind in [FailureKind::Auth, FailureKind::Filesystem, FailureKind::Protocol] {
            let decision = policy.should_retry(kind, 1);
            assert!(
                matches!(decision, RetryDecision::DoNotRetry { .. }),
                "{kind:?} must not retry"
            );
        }
    }

    #[test]
    fn test_delay_doubles_each_attempt() {
        let policy = transient_policy();
        let first = policy.delay_for(1);
        let second = policy.delay_for(2);
        let third = policy.delay_for(3);

        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(600)); // base + jitter
        assert!(second >= Duration::from_millis(200));
        assert!(second <= Duration::from_millis(700));
        assert!(third >= Duration::from_millis(400));
        assert!(third <= Duration::from_millis(900));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(64, Duration::from_secs(30));
        let delay = policy.delay_for(32);
        assert!(delay <= MAX_BACKOFF_DELAY + MAX_JITTER);
    }

    #[test]
    fn test_classify_http_statuses() {
        for status in [429, 500, 502, 503, 504, 599] {
            let error = DownloadError::http_status("https://x.example", status);
            assert_eq!(classify_error(&error), FailureKind::Server, "status {status}");
        }
        for status in [401, 403] {
            let error = DownloadError::http_status("https://x.example", status);
            assert_eq!(classify_error(&error), FailureKind::Auth, "status {status}");
        }
        for status in [400, 404, 410, 451] {
            let error = DownloadError::http_status("https://x.example", status);
            assert_eq!(classify_error(&error), FailureKind::Protocol, "status {status}");
        }
    }

    #[test]
    fn test_classify_timeout_as_transport() {
        let error = DownloadError::timeout("https://x.example");
        assert_eq!(classify_error(&error), FailureKind::Transport);
    }

    #[test]
    fn test_classify_io_as_filesystem() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::io("/out", source);
        assert_eq!(classify_error(&error), FailureKind::Filesystem);
    }

    #[test]
    fn test_classify_archive_integrity_failures() {
        let size: DownloadError = ArchiveError::SizeMismatch {
            expected: 10,
            actual: 4,
        }
        .into();
        assert_eq!(classify_error(&size), FailureKind::Integrity);

        let hashes: DownloadError = ArchiveError::HashMismatch {
            mismatches: vec!["img.dcm: expected aa, got bb".to_string()],
        }
        .into();
        assert_eq!(classify_error(&hashes), FailureKind::Integrity);
    }

    #[test]
    fn test_classify_traversal_refusal_as_protocol() {
        let error: DownloadError = ArchiveError::UnsafeEntry {
            name: "../evil".to_string(),
        }
        .into();
        assert_eq!(classify_error(&error), FailureKind::Protocol);
        assert!(!classify_error(&error).is_retryable());
    }

    #[test]
    fn test_classify_invalid_url_as_protocol() {
        let error = DownloadError::invalid_url("not-a-url");
        assert_eq!(classify_error(&error), FailureKind::Protocol);
    }

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(jitter() <= MAX_JITTER);
        }
    }
}
