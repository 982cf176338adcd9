//! Run configuration: CLI validation, the server-friendly preset, and
//! endpoint resolution.
//!
//! Everything a worker needs travels inside [`RunConfig`]; there is no
//! global mutable state.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::auth::Credentials;
use crate::cli::Cli;

/// Default token endpoint.
pub const DEFAULT_TOKEN_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/oauth/token";

/// Default metadata endpoint.
pub const DEFAULT_META_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/services/v2/getSeriesMetaData";

/// Default image endpoint (no hash manifest in the archive).
pub const DEFAULT_IMAGE_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/services/v2/getImage";

/// Image endpoint whose archives carry a per-file hash manifest.
pub const HASH_IMAGE_URL: &str =
    "https://services.cancerimagingarchive.net/nbia-api/services/v2/getImageWithMD5Hash";

/// Fatal configuration errors, reported before any network I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Hash validation needs the expanded archive content, which
    /// `--no-extract` keeps packed.
    #[error(
        "hash validation (default) and --no-extract are incompatible; \
         pass --no-hash together with --no-extract"
    )]
    HashRequiresExtraction,
}

/// Validated, preset-applied configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Manifest path.
    pub input: PathBuf,
    /// Output root.
    pub output: PathBuf,
    /// Download worker count.
    pub concurrency: usize,
    /// Metadata resolver worker count.
    pub metadata_workers: usize,
    /// HTTP pool cap per host.
    pub max_conns_per_host: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub retry_delay: Duration,
    /// Pre-attempt sleep.
    pub request_delay: Duration,
    /// Bypass the download precondition.
    pub force: bool,
    /// Skip series that are present and correct.
    pub skip_existing: bool,
    /// Keep archives packed.
    pub no_extract: bool,
    /// Verify per-file digests (mutually exclusive with `no_extract`).
    pub hash_verify: bool,
    /// Bypass the metadata cache.
    pub refresh_metadata: bool,
    /// Stop after metadata resolution.
    pub meta_only: bool,
    /// Upstream proxy.
    pub proxy: Option<String>,
    /// Archive credentials.
    pub credentials: Credentials,
    /// Token endpoint.
    pub token_url: String,
    /// Metadata endpoint.
    pub meta_url: String,
    /// Image endpoint.
    pub image_url: String,
    /// Debug-level logging requested.
    pub debug: bool,
}

impl RunConfig {
    /// Validates CLI arguments and resolves presets and endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for incompatible option combinations.
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let hash_verify = !cli.no_hash;
        if hash_verify && cli.no_extract {
            return Err(ConfigError::HashRequiresExtraction);
        }

        let mut concurrency = usize::from(cli.concurrency);
        let mut metadata_workers = usize::from(cli.metadata_workers);
        let mut max_conns_per_host = usize::from(cli.max_connections);
        let mut retry_delay = Duration::from_secs(cli.retry_delay);
        let mut request_delay = Duration::from_millis(cli.request_delay);

        if cli.server_friendly {
            info!("server-friendly mode: using extra conservative settings");
            concurrency = 1;
            max_conns_per_host = 2;
            retry_delay = Duration::from_secs(30);
            request_delay = Duration::from_secs(2);
            metadata_workers = 5;
        }

        let image_url = match cli.image_url {
            Some(custom) => {
                info!(url = %custom, "using custom image url");
                custom
            }
            None if hash_verify => HASH_IMAGE_URL.to_string(),
            None => DEFAULT_IMAGE_URL.to_string(),
        };

        Ok(Self {
            input: cli.input,
            output: cli.output,
            concurrency,
            metadata_workers,
            max_conns_per_host,
            max_retries: cli.max_retries,
            retry_delay,
            request_delay,
            force: cli.force,
            skip_existing: cli.skip_existing,
            no_extract: cli.no_extract,
            hash_verify,
            refresh_metadata: cli.refresh_metadata,
            meta_only: cli.meta_only,
            proxy: cli.proxy,
            credentials: Credentials {
                username: cli.username,
                password: cli.password,
            },
            token_url: cli.token_url.unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            meta_url: cli.meta_url.unwrap_or_else(|| DEFAULT_META_URL.to_string()),
            image_url,
            debug: cli.debug,
        })
    }

    /// Path the token persists to: `<output>/<username>.json`.
    #[must_use]
    pub fn token_path(&self) -> PathBuf {
        self.output
            .join(format!("{}.json", self.credentials.username))
    }
}
