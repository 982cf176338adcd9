//! Orchestrator: wires the transport, token manager, cache, resolver, and
//! download engine together for one run.
//!
//! There is no global mutable state; every shared dependency is
//! constructed here and handed to workers behind `Arc`.

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::auth::TokenManager;
use crate::config::RunConfig;
use crate::download::{DownloadEngine, EngineConfig, EngineContext, OutputLayout, RetryPolicy};
use crate::http::{ApiClient, TransportConfig, build_transport};
use crate::manifest;
use crate::metadata::{MetadataCache, MetadataResolver, ResolverContext, SeriesRecord};
use crate::progress::{DownloadStats, MetadataStats, spawn_progress};

/// Runs the fetcher end to end.
///
/// Per-series failures are counted, logged, and reported in the summary;
/// only startup failures (transport, token bootstrap, manifest I/O)
/// surface as errors.
///
/// # Errors
///
/// Returns an error for fatal startup problems only.
pub async fn run(config: RunConfig) -> Result<()> {
    std::fs::create_dir_all(&config.output).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.output.display()
        )
    })?;

    let transport = build_transport(&TransportConfig {
        max_conns_per_host: config.max_conns_per_host,
        proxy: config.proxy.clone(),
    })
    .context("failed to build HTTP client")?;
    let api = ApiClient::new(transport);

    let tokens = Arc::new(
        TokenManager::connect(
            api.clone(),
            config.token_url.clone(),
            config.credentials.clone(),
            config.token_path(),
        )
        .await
        .context("failed to obtain an access token")?,
    );

    let cache = Arc::new(
        MetadataCache::create(&config.output).context("failed to create metadata directory")?,
    );

    let series_uids =
        manifest::read_manifest(&config.input).context("failed to decode input manifest")?;
    println!("Found {} series to fetch metadata for", series_uids.len());

    let records = resolve_metadata(&config, &api, &tokens, &cache, series_uids).await;
    println!("Resolved metadata for {} series", records.len());

    if config.meta_only {
        info!("meta-only run, stopping before downloads");
        tokens.close().await;
        return Ok(());
    }

    let stats = Arc::new(DownloadStats::new(records.len()));
    let interrupted = install_interrupt_flag();

    let show_progress = std::io::stderr().is_terminal();
    let (progress_handle, progress_stop) = spawn_progress(show_progress, Arc::clone(&stats));

    let engine = DownloadEngine::new(
        EngineConfig {
            concurrency: config.concurrency,
            image_url: config.image_url.clone(),
            force: config.force,
            skip_existing: config.skip_existing,
            no_extract: config.no_extract,
            hash_verify: config.hash_verify,
            request_delay: config.request_delay,
        },
        RetryPolicy::new(config.max_retries, config.retry_delay),
    );
    let engine_ctx = Arc::new(EngineContext {
        api,
        tokens: Arc::clone(&tokens),
        cache,
        layout: Arc::new(OutputLayout::new(&config.output)),
    });

    engine
        .process(
            records,
            engine_ctx,
            Arc::clone(&stats),
            Arc::clone(&interrupted),
        )
        .await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    tokens.close().await;

    println!("{}", stats.summary());
    if stats.failed() > 0 {
        warn!("some downloads failed; check the logs above for details");
    }
    Ok(())
}

/// Runs the metadata resolution phase with its own progress display.
async fn resolve_metadata(
    config: &RunConfig,
    api: &ApiClient,
    tokens: &Arc<TokenManager>,
    cache: &Arc<MetadataCache>,
    series_uids: Vec<String>,
) -> Vec<SeriesRecord> {
    let meta_stats = Arc::new(MetadataStats::new(series_uids.len()));
    let show_progress = std::io::stderr().is_terminal();
    let (progress_handle, progress_stop) = spawn_progress(show_progress, Arc::clone(&meta_stats));

    let resolver = MetadataResolver::new(config.metadata_workers);
    let resolver_ctx = Arc::new(ResolverContext {
        api: api.clone(),
        tokens: Arc::clone(tokens),
        cache: Arc::clone(cache),
        meta_url: config.meta_url.clone(),
        force_refresh: config.refresh_metadata,
    });
    let records = resolver
        .resolve(series_uids, resolver_ctx, Arc::clone(&meta_stats))
        .await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    info!(
        fetched = meta_stats.fetched(),
        cached = meta_stats.cached(),
        failed = meta_stats.failed(),
        records = records.len(),
        "metadata resolution complete"
    );
    records
}

/// Installs the Ctrl-C handler: the first interrupt stops dispatching new
/// series; in-flight transfers are bounded by their request deadlines and
/// on-disk state stays consistent because only renames publish results.
fn install_interrupt_flag() -> Arc<AtomicBool> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\r- interrupt received, stopping");
            flag.store(true, Ordering::SeqCst);
        }
    });
    interrupted
}
