//! Bounded parallel metadata resolution.
//!
//! A pool of workers (semaphore-bounded tasks) fetches or loads a cached
//! record for every series UID in the manifest. Cache hits are effectively
//! free; fetches go through the request layer with a bearer header and a
//! 30 second deadline. Failures are per-series: an auth rejection or parse
//! error marks that UID failed and the run continues.
//!
//! Output ordering is not guaranteed; the pool interleaves. Dedup is the
//! cache's responsibility (one file per UID, last writer wins).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::auth::TokenManager;
use crate::http::{ApiClient, make_url};
use crate::metadata::{MetadataCache, MetadataPayload, SeriesRecord};
use crate::progress::MetadataStats;

/// Deadline for a single metadata request.
const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// Default resolver pool size.
pub const DEFAULT_METADATA_WORKERS: usize = 20;

/// Shared dependencies for the resolver pool.
#[derive(Debug)]
pub struct ResolverContext {
    /// Request executor (fallback-aware).
    pub api: ApiClient,
    /// Shared token manager.
    pub tokens: Arc<TokenManager>,
    /// Metadata cache consulted before the network.
    pub cache: Arc<MetadataCache>,
    /// Metadata endpoint.
    pub meta_url: String,
    /// Bypass the cache and refetch everything.
    pub force_refresh: bool,
}

/// Bounded worker pool resolving series UIDs to [`SeriesRecord`]s.
#[derive(Debug)]
pub struct MetadataResolver {
    workers: usize,
}

impl MetadataResolver {
    /// Creates a resolver with the given pool size (minimum 1).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Resolves every UID, returning the records that succeeded.
    ///
    /// Progress transitions (fetched / cached / failed) are recorded on
    /// `stats` as they happen.
    pub async fn resolve(
        &self,
        series_uids: Vec<String>,
        ctx: Arc<ResolverContext>,
        stats: Arc<MetadataStats>,
    ) -> Vec<SeriesRecord> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut handles = Vec::with_capacity(series_uids.len());

        for series_uid in series_uids {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break; // Semaphore closed; nothing more to schedule.
            };
            let ctx = Arc::clone(&ctx);
            let stats = Arc::clone(&stats);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                resolve_one(&series_uid, &ctx, &stats).await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(records) => results.extend(records),
                Err(e) => warn!(error = %e, "metadata task panicked"),
            }
        }
        results
    }
}

/// Resolves a single UID: cache first, then the metadata endpoint.
async fn resolve_one(
    series_uid: &str,
    ctx: &ResolverContext,
    stats: &MetadataStats,
) -> Vec<SeriesRecord> {
    if !ctx.force_refresh {
        if let Some(cached) = ctx.cache.load(series_uid) {
            debug!(series_uid, "loaded metadata from cache");
            stats.record_cached(series_uid);
            return vec![cached];
        }
        debug!(series_uid, "cache miss, fetching metadata");
    }

    let bearer = match ctx.tokens.get().await {
        Ok(bearer) => bearer,
        Err(e) => {
            error!(series_uid, error = %e, "no bearer token for metadata fetch");
            stats.record_failed(series_uid);
            return Vec::new();
        }
    };

    let url = match make_url(&ctx.meta_url, &[("SeriesInstanceUID", series_uid)]) {
        Ok(url) => url,
        Err(e) => {
            error!(series_uid, error = %e, "failed to build metadata URL");
            stats.record_failed(series_uid);
            return Vec::new();
        }
    };

    let response = match ctx.api.get(url, &bearer, METADATA_TIMEOUT).await {
        Ok(response) => response,
        Err(e) => {
            error!(series_uid, error = %e, "metadata request failed");
            stats.record_failed(series_uid);
            return Vec::new();
        }
    };

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        error!(
            series_uid,
            status = status.as_u16(),
            "authentication failed for series; check credentials and access to restricted collections"
        );
        stats.record_failed(series_uid);
        return Vec::new();
    }
    if !status.is_success() {
        error!(series_uid, status = status.as_u16(), "metadata request rejected");
        stats.record_failed(series_uid);
        return Vec::new();
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            error!(series_uid, error = %e, "failed to read metadata response");
            stats.record_failed(series_uid);
            return Vec::new();
        }
    };

    let records = match serde_json::from_str::<MetadataPayload>(&body) {
        Ok(payload) => payload.into_records(),
        Err(e) => {
            error!(series_uid, error = %e, "failed to parse metadata response");
            debug!(series_uid, body = %body, "unparseable metadata body");
            stats.record_failed(series_uid);
            return Vec::new();
        }
    };

    let mut results = Vec::with_capacity(records.len());
    for record in records {
        if record.series_uid.is_empty() {
            continue;
        }
        if let Err(e) = ctx.cache.store(&record) {
            warn!(series_uid = %record.series_uid, error = %e, "failed to cache metadata");
        }
        results.push(record);
    }

    stats.record_fetched(series_uid);
    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_pool_size_minimum_is_one() {
        let resolver = MetadataResolver::new(0);
        assert_eq!(resolver.workers, 1);
    }

    #[test]
    fn test_resolver_keeps_configured_pool_size() {
        let resolver = MetadataResolver::new(DEFAULT_METADATA_WORKERS);
        assert_eq!(resolver.workers, 20);
    }
}
