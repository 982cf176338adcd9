//! URL templating and request execution with the versioned-endpoint
//! fallback.
//!
//! Some archive deployments still run the older API generation. When a
//! request against a `/services/v2/` endpoint comes back 404 or 5xx, the
//! same request is retried exactly once against `/services/v1/`, with the
//! same bearer header and timeout. This is the sole fallback rule and it
//! applies uniformly to metadata and image requests; every other status is
//! the caller's business.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Path segment of the current API generation.
const NEWER_SEGMENT: &str = "/services/v2/";

/// Path segment of the previous API generation.
const OLDER_SEGMENT: &str = "/services/v1/";

/// Errors from the request layer.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The endpoint URL could not be parsed.
    #[error("invalid endpoint URL {url}: {source}")]
    InvalidUrl {
        /// The offending URL string.
        url: String,
        /// The underlying parse error.
        #[source]
        source: url::ParseError,
    },

    /// The request failed at the transport level.
    #[error("request to {url} failed: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying transport error.
        #[source]
        source: reqwest::Error,
    },
}

/// Constructs an endpoint URL with the given query parameters encoded.
///
/// # Errors
///
/// Returns [`RequestError::InvalidUrl`] if `base` is not a valid URL.
pub fn make_url(base: &str, params: &[(&str, &str)]) -> Result<Url, RequestError> {
    let mut url = Url::parse(base).map_err(|e| RequestError::InvalidUrl {
        url: base.to_string(),
        source: e,
    })?;
    url.query_pairs_mut().extend_pairs(params);
    Ok(url)
}

/// Request executor shared by the metadata resolver and download engine.
///
/// Wraps the pooled [`Client`] and applies the newer-to-older endpoint
/// fallback. The wrapper is cheap to clone; the underlying connection pool
/// is shared.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
}

impl ApiClient {
    /// Creates an executor over the shared transport.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Executes a bearer-authenticated GET with a per-request deadline.
    ///
    /// When the URL targets the newer API generation and the response is
    /// 404 or 5xx, the request is replayed once against the older
    /// generation; the fallback response is returned only when it
    /// succeeds, so a transient failure on the primary endpoint keeps its
    /// own status for retry classification.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Network`] on transport failure. Non-success
    /// statuses are returned inside the [`Response`] for the caller to
    /// classify.
    pub async fn get(
        &self,
        url: Url,
        bearer: &str,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        let response = self.send(url.clone(), bearer, timeout).await?;

        if !should_fall_back(&url, response.status()) {
            return Ok(response);
        }

        let Some(older) = downgrade_url(&url) else {
            return Ok(response);
        };
        warn!(
            status = response.status().as_u16(),
            url = %url,
            fallback = %older,
            "endpoint unavailable, retrying against previous API generation"
        );
        match self.send(older, bearer, timeout).await {
            Ok(fallback) if fallback.status().is_success() => Ok(fallback),
            // The older generation did not improve things; hand the caller
            // the original response so its status drives classification.
            Ok(fallback) => {
                debug!(
                    status = fallback.status().as_u16(),
                    "fallback response no better, keeping original"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(error = %e, "fallback request failed, keeping original response");
                Ok(response)
            }
        }
    }

    /// Executes a form-encoded POST (no fallback; used by the token flow).
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Network`] on transport failure.
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<Response, RequestError> {
        self.client
            .post(url)
            .form(form)
            .send()
            .await
            .map_err(|e| RequestError::Network {
                url: url.to_string(),
                source: e,
            })
    }

    /// Returns a reference to the underlying pooled client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }

    async fn send(
        &self,
        url: Url,
        bearer: &str,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        debug!(url = %url, timeout_secs = timeout.as_secs(), "executing request");
        self.client
            .get(url.clone())
            .bearer_auth(bearer)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RequestError::Network {
                url: url.to_string(),
                source: e,
            })
    }
}

/// Returns true when the status warrants falling back to the older API.
fn should_fall_back(url: &Url, status: StatusCode) -> bool {
    (status == StatusCode::NOT_FOUND || status.is_server_error())
        && url.path().contains(NEWER_SEGMENT)
}

/// Rewrites the newer version segment to the older one.
///
/// Returns `None` when the URL does not contain the newer segment or the
/// rewritten string no longer parses.
fn downgrade_url(url: &Url) -> Option<Url> {
    if !url.as_str().contains(NEWER_SEGMENT) {
        return None;
    }
    let replaced = url.as_str().replacen(NEWER_SEGMENT, OLDER_SEGMENT, 1);
    Url::parse(&replaced).ok()
}
