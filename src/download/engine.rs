//! The download engine: a bounded worker pool running the per-series
//! state machine.
//!
//! Each series moves through `Request → Stream → Extract → Materialize`,
//! with a precondition check in front and retry with exponential backoff
//! around the whole attempt. Terminal states are Skipped, Done, and
//! Failed; every terminal transition updates the shared
//! [`DownloadStats`].
//!
//! # Atomicity
//!
//! A final-location path is only ever created by renaming a temporary
//! sibling (`<target>.zip.tmp` plus `<target>.uncompressed.tmp` in extract
//! mode, `<target>.tmp` in keep-zip mode). Any failure cleans up both
//! temporary artifacts, so an aborted run leaves either the previous state
//! or the completed one, never a partial.
//!
//! # Concurrency
//!
//! - Each series runs in its own Tokio task
//! - A semaphore permit bounds in-flight series (RAII release)
//! - Series ownership is exclusive to the task that holds it
//! - Cancellation is cooperative: the dispatch loop stops on the
//!   interrupted flag, and request deadlines bound in-flight transfers

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::archive;
use crate::auth::TokenManager;
use crate::http::{ApiClient, RequestError, make_url};
use crate::metadata::{MetadataCache, SeriesRecord};
use crate::progress::DownloadStats;

use super::error::DownloadError;
use super::layout::{OutputLayout, path_with_suffix};
use super::retry::{RetryDecision, RetryPolicy, classify_error};

/// Buffer size for streaming the archive body to disk.
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Base deadline for an archive transfer of known size.
const BASE_STREAM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Additional minute of deadline per this many declared bytes.
const TIMEOUT_SIZE_STEP: u64 = 100 * 1024 * 1024;

/// Transfer deadlines never exceed this.
const MAX_STREAM_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Deadline when the uncompressed size is unknown.
const UNKNOWN_SIZE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Engine settings resolved from the run configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent download workers.
    pub concurrency: usize,
    /// Image endpoint URL.
    pub image_url: String,
    /// Bypass the precondition and re-download everything.
    pub force: bool,
    /// Skip a series when the precondition says present-and-correct,
    /// even under `force`.
    pub skip_existing: bool,
    /// Keep archives as downloaded instead of extracting.
    pub no_extract: bool,
    /// Verify per-file digests against the archive's hash manifest.
    pub hash_verify: bool,
    /// Minimum interarrival per worker, slept before every attempt.
    pub request_delay: Duration,
}

/// Shared dependencies handed to every worker.
#[derive(Debug)]
pub struct EngineContext {
    /// Request executor (fallback-aware).
    pub api: ApiClient,
    /// Shared token manager.
    pub tokens: Arc<TokenManager>,
    /// Metadata cache, refreshed after each successful download.
    pub cache: Arc<MetadataCache>,
    /// Output path resolution.
    pub layout: Arc<OutputLayout>,
}

/// Bounded-concurrency download engine.
#[derive(Debug)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    retry_policy: RetryPolicy,
}

impl DownloadEngine {
    /// Creates an engine with the given configuration and retry policy.
    #[must_use]
    pub fn new(config: EngineConfig, retry_policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                retry_policy,
            }),
        }
    }

    /// Processes every series, updating `stats` at each terminal
    /// transition. Individual failures never abort the batch.
    ///
    /// Dispatch stops early when `interrupted` is set; series already
    /// in flight run to their own conclusion or deadline.
    pub async fn process(
        &self,
        records: Vec<SeriesRecord>,
        ctx: Arc<EngineContext>,
        stats: Arc<DownloadStats>,
        interrupted: Arc<AtomicBool>,
    ) {
        let concurrency = self.inner.config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut handles = Vec::with_capacity(records.len());

        info!(series = records.len(), concurrency, "starting downloads");

        for record in records {
            if interrupted.load(Ordering::SeqCst) {
                info!("interrupted, stopping dispatch");
                break;
            }
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let inner = Arc::clone(&self.inner);
            let ctx = Arc::clone(&ctx);
            let stats = Arc::clone(&stats);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_series(&record, &inner, &ctx, &stats).await;
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "download task panicked");
            }
        }
    }
}

/// Runs one series to a terminal state.
async fn process_series(
    record: &SeriesRecord,
    inner: &EngineInner,
    ctx: &EngineContext,
    stats: &DownloadStats,
) {
    let series_uid = record.series_uid.clone();
    let config = &inner.config;

    if config.skip_existing && !needs_download(record, &ctx.layout, false, config.no_extract) {
        debug!(%series_uid, "skip existing");
        stats.record_skipped(&series_uid);
        return;
    }

    if !needs_download(record, &ctx.layout, config.force, config.no_extract) {
        debug!(%series_uid, "already present with correct size, skipping");
        stats.record_skipped(&series_uid);
        return;
    }

    match download_with_retry(record, inner, ctx).await {
        Ok(attempts) => {
            debug!(%series_uid, attempts, "series downloaded");
            // Keep the cache entry in step with what is now on disk.
            if let Err(e) = ctx.cache.store(record) {
                warn!(%series_uid, error = %e, "failed to refresh metadata cache");
            }
            stats.record_downloaded(&series_uid);
        }
        Err((error, attempts)) => {
            warn!(
                %series_uid,
                attempts,
                error = %error,
                "download failed after all attempts"
            );
            stats.record_failed(&series_uid);
        }
    }
}

/// Precondition: does this series need to be transferred?
///
/// - `force` short-circuits to true (unless the caller already applied
///   the skip-existing check).
/// - Keep-zip mode: the target is `<series>.zip`; download when it is
///   missing or is (wrongly) a directory.
/// - Extract mode: the target is the series directory; download when it
///   is missing, not a directory, or its recursive size differs from the
///   declared uncompressed size (when known).
#[must_use]
pub fn needs_download(
    record: &SeriesRecord,
    layout: &OutputLayout,
    force: bool,
    no_extract: bool,
) -> bool {
    let series_uid = &record.series_uid;
    if force {
        debug!(%series_uid, "force flag set, re-downloading");
        return true;
    }

    if no_extract {
        let target = layout.series_zip(record);
        return match std::fs::metadata(&target) {
            Err(_) => {
                debug!(%series_uid, target = %target.display(), "archive absent");
                true
            }
            // A directory where the archive should be means a broken
            // prior run; re-download.
            Ok(metadata) => metadata.is_dir(),
        };
    }

    let target = layout.series_dir(record);
    let Ok(metadata) = std::fs::metadata(&target) else {
        debug!(%series_uid, target = %target.display(), "series directory absent");
        return true;
    };
    if !metadata.is_dir() {
        debug!(%series_uid, "target exists but is not a directory");
        return true;
    }

    if let Some(expected) = record.file_size_bytes() {
        match archive::directory_size(&target) {
            Ok(actual) if actual == expected => {}
            Ok(actual) => {
                debug!(%series_uid, expected, actual, "directory size mismatch");
                return true;
            }
            Err(e) => {
                warn!(%series_uid, error = %e, "could not measure series directory");
                return true;
            }
        }
    }
    false
}

/// Retries the state machine with exponential backoff until success, a
/// non-retryable failure, or exhaustion. Returns the attempt count on
/// success, or the final error and attempt count.
async fn download_with_retry(
    record: &SeriesRecord,
    inner: &EngineInner,
    ctx: &EngineContext,
) -> Result<u32, (DownloadError, u32)> {
    let series_uid = &record.series_uid;
    let mut attempt = 0_u32;

    loop {
        attempt += 1;

        // Rate shaping applies to every attempt, not only the first.
        if !inner.config.request_delay.is_zero() {
            tokio::time::sleep(inner.config.request_delay).await;
        }

        match attempt_download(record, inner, ctx).await {
            Ok(()) => return Ok(attempt),
            Err(error) => {
                let kind = classify_error(&error);
                match inner.retry_policy.should_retry(kind, attempt) {
                    RetryDecision::Retry {
                        delay,
                        attempt: next_attempt,
                    } => {
                        info!(
                            %series_uid,
                            attempt = next_attempt,
                            max_attempts = inner.retry_policy.max_attempts(),
                            delay_ms = delay.as_millis(),
                            error = %error,
                            "retrying download"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(%series_uid, %reason, "not retrying");
                        return Err((error, attempt));
                    }
                }
            }
        }
    }
}

/// Temporary and final paths for one series transfer.
struct SeriesPaths {
    /// Final artifact: the series directory (extract) or archive (keep-zip).
    final_path: PathBuf,
    /// Where the archive body streams to.
    temp_zip: PathBuf,
    /// Extraction staging directory (extract mode only).
    temp_extract: Option<PathBuf>,
}

impl SeriesPaths {
    fn resolve(record: &SeriesRecord, layout: &OutputLayout, no_extract: bool) -> Self {
        if no_extract {
            let final_path = layout.series_zip(record);
            let temp_zip = path_with_suffix(&final_path, ".tmp");
            Self {
                final_path,
                temp_zip,
                temp_extract: None,
            }
        } else {
            let final_path = layout.series_dir(record);
            let temp_zip = path_with_suffix(&final_path, ".zip.tmp");
            let temp_extract = path_with_suffix(&final_path, ".uncompressed.tmp");
            Self {
                final_path,
                temp_zip,
                temp_extract: Some(temp_extract),
            }
        }
    }

    /// Removes leftover temporary artifacts from an earlier attempt or run.
    fn clear_stale_temps(&self) {
        if self.temp_zip.exists() {
            debug!(path = %self.temp_zip.display(), "removing incomplete download");
            let _ = std::fs::remove_file(&self.temp_zip);
        }
        if let Some(temp_extract) = &self.temp_extract {
            if temp_extract.exists() {
                debug!(path = %temp_extract.display(), "removing incomplete extraction");
                let _ = std::fs::remove_dir_all(temp_extract);
            }
        }
    }

    /// Best-effort removal of both temporary artifacts after a failure.
    fn cleanup_temps(&self) {
        if let Err(e) = std::fs::remove_file(&self.temp_zip) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.temp_zip.display(), error = %e, "failed to remove temp archive");
            }
        }
        if let Some(temp_extract) = &self.temp_extract {
            if let Err(e) = std::fs::remove_dir_all(temp_extract) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_extract.display(), error = %e, "failed to remove temp extraction");
                }
            }
        }
    }
}

/// One pass through `Request → Stream → Extract → Materialize`.
async fn attempt_download(
    record: &SeriesRecord,
    inner: &EngineInner,
    ctx: &EngineContext,
) -> Result<(), DownloadError> {
    let config = &inner.config;
    let series_uid = &record.series_uid;

    let bearer = ctx
        .tokens
        .get()
        .await
        .map_err(DownloadError::auth_unavailable)?;

    let url = make_url(
        &config.image_url,
        &[("SeriesInstanceUID", series_uid.as_str())],
    )
    .map_err(|_| DownloadError::invalid_url(&config.image_url))?;

    ctx.layout
        .ensure_study_dir(record)
        .map_err(|e| DownloadError::io(ctx.layout.root(), e))?;

    let paths = SeriesPaths::resolve(record, &ctx.layout, config.no_extract);
    paths.clear_stale_temps();

    let timeout = stream_timeout(record.file_size_bytes());
    debug!(
        %series_uid,
        timeout_secs = timeout.as_secs(),
        "requesting image archive"
    );

    let response = ctx
        .api
        .get(url.clone(), &bearer, timeout)
        .await
        .map_err(|e| match e {
            RequestError::Network { url, source } => DownloadError::network(url, source),
            RequestError::InvalidUrl { url, .. } => DownloadError::invalid_url(url),
        })?;

    let status = response.status();
    debug!(
        %series_uid,
        status = status.as_u16(),
        content_length = response.content_length(),
        "response headers received"
    );
    if status.as_u16() != 200 {
        return Err(DownloadError::http_status(url.as_str(), status.as_u16()));
    }

    let written = match stream_to_file(response, &paths.temp_zip, url.as_str()).await {
        Ok(written) => written,
        Err(error) => {
            paths.cleanup_temps();
            return Err(error);
        }
    };
    // The declared size is uncompressed; the body is the compressed
    // archive, so this is logged rather than validated.
    debug!(%series_uid, bytes = written, "archive body written");

    let outcome = if config.no_extract {
        materialize_zip(&paths)
    } else {
        extract_and_materialize(record, &paths, config.hash_verify).await
    };
    if outcome.is_err() {
        paths.cleanup_temps();
    }
    outcome
}

/// Streams the response body into the temp file through a 64 KiB buffer.
async fn stream_to_file(
    response: reqwest::Response,
    path: &Path,
    url: &str,
) -> Result<u64, DownloadError> {
    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    let mut writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);
    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(path, e))?;
    Ok(written)
}

/// Keep-zip materialization: rename the temp archive over the target.
fn materialize_zip(paths: &SeriesPaths) -> Result<(), DownloadError> {
    remove_existing(&paths.final_path)?;
    std::fs::rename(&paths.temp_zip, &paths.final_path)
        .map_err(|e| DownloadError::io(&paths.final_path, e))?;
    debug!(path = %paths.final_path.display(), "archive materialized");
    Ok(())
}

/// Extract mode: verify into the staging directory, then publish by
/// rename and drop the temp archive.
async fn extract_and_materialize(
    record: &SeriesRecord,
    paths: &SeriesPaths,
    hash_verify: bool,
) -> Result<(), DownloadError> {
    let series_uid = &record.series_uid;
    let Some(temp_extract) = paths.temp_extract.clone() else {
        return Err(DownloadError::Internal {
            detail: "extract mode without a staging directory".to_string(),
        });
    };
    let temp_zip = paths.temp_zip.clone();
    let expected_size = record.file_size_bytes();

    let hashes = if hash_verify {
        let manifest_zip = temp_zip.clone();
        match run_blocking(move || archive::parse_hash_manifest(&manifest_zip)).await? {
            Ok(Some(map)) => Some(map),
            Ok(None) => {
                warn!(
                    %series_uid,
                    "archive carries no hash manifest; extracting without per-file validation"
                );
                None
            }
            Err(e) => {
                warn!(%series_uid, error = %e, "failed to parse hash manifest");
                None
            }
        }
    } else {
        None
    };

    debug!(
        %series_uid,
        dest = %temp_extract.display(),
        hash_files = hashes.as_ref().map_or(0, std::collections::HashMap::len),
        "extracting archive"
    );
    let extract_zip = temp_zip.clone();
    let extract_dest = temp_extract.clone();
    run_blocking(move || {
        archive::extract_and_verify(&extract_zip, &extract_dest, expected_size, hashes.as_ref())
    })
    .await??;

    // Publish: a prior corrupt run may have left a final directory behind.
    remove_existing(&paths.final_path)?;
    std::fs::rename(&temp_extract, &paths.final_path)
        .map_err(|e| DownloadError::io(&paths.final_path, e))?;

    if let Err(e) = std::fs::remove_file(&temp_zip) {
        warn!(path = %temp_zip.display(), error = %e, "failed to remove temp archive");
    }

    debug!(%series_uid, path = %paths.final_path.display(), "series materialized");
    Ok(())
}

/// Removes a pre-existing final artifact (file or directory) before rename.
fn remove_existing(path: &Path) -> Result<(), DownloadError> {
    match std::fs::metadata(path) {
        Err(_) => Ok(()),
        Ok(metadata) => {
            debug!(path = %path.display(), "removing existing artifact");
            let removal = if metadata.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            removal.map_err(|e| DownloadError::io(path, e))
        }
    }
}

/// Runs blocking archive work off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T, DownloadError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DownloadError::Internal {
            detail: e.to_string(),
        })
}

/// Size-adaptive transfer deadline: 5 minutes plus one minute per
/// 100 MiB of declared uncompressed size, capped at an hour; 30 minutes
/// when the size is unknown.
fn stream_timeout(declared_size: Option<u64>) -> Duration {
    match declared_size {
        Some(size) => {
            let extra_minutes = size / TIMEOUT_SIZE_STEP;
            let timeout = BASE_STREAM_TIMEOUT + Duration::from_secs(extra_minutes * 60);
            timeout.min(MAX_STREAM_TIMEOUT)
        }
        None => UNKNOWN_SIZE_TIMEOUT,
    }
}
