//! Bearer token lifecycle: acquisition, refresh, and persistence.
//!
//! The archive issues OAuth password-grant tokens. A single [`TokenManager`]
//! is shared by every worker in the run; readers take a shared lock and get
//! the current bearer, and the first reader to observe expiry upgrades to
//! the write lock and refreshes (with a double-check after the upgrade so
//! concurrent observers refresh only once).
//!
//! The token is persisted next to the downloaded data as
//! `<output>/<username>.json` with owner-only permissions, written via a
//! temp sibling and atomic rename. A persist failure is logged and the
//! in-memory token stays usable.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::http::{ApiClient, RequestError};

/// Tokens are treated as expired this long before their actual expiry, so
/// a bearer handed to a slow request does not lapse mid-flight.
const EXPIRY_SKEW_SECS: i64 = 30;

/// OAuth client identifier expected by the archive's token endpoint.
const CLIENT_ID: &str = "NBIA";

/// Errors from token acquisition, refresh, or persistence.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token endpoint rejected the credential request.
    #[error("token endpoint returned HTTP {status}: {body}")]
    Endpoint {
        /// HTTP status of the rejection.
        status: u16,
        /// Response body (truncated) for diagnostics.
        body: String,
    },

    /// The credential request failed at the transport level.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The token response body could not be read.
    #[error("failed to read token response: {0}")]
    Body(#[source] reqwest::Error),

    /// The token payload could not be parsed.
    #[error("failed to parse token payload: {0}")]
    Parse(#[from] serde_json::Error),

    /// Writing the persisted token failed.
    #[error("failed to persist token to {path}: {source}")]
    Persist {
        /// The persistence path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl AuthError {
    /// HTTP status of the failure, when the token endpoint produced one.
    /// Used by the download engine's retry classification.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Endpoint { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Username and password for the password-grant flow.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Account name; the guest account is accepted for public collections.
    pub username: String,
    /// Account password; empty for the guest account.
    pub password: String,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Wire and on-disk representation of an issued token.
///
/// Field names follow the upstream endpoint; `expires_time` is computed
/// locally as an absolute wall-clock deadline and is what the persisted
/// form round-trips through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Bearer value attached to every archive request.
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub session_state: String,
    /// Issued lifetime in seconds.
    #[serde(default)]
    pub expires_in: i64,
    #[serde(rename = "not-before-policy", default)]
    pub not_before_policy: i64,
    #[serde(default)]
    pub refresh_expires_in: i64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_type: String,
    /// Absolute expiry; `expires_in` relative to the moment of issue.
    #[serde(rename = "expires_time", default = "unix_epoch")]
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Returns true while the token is still usable (with skew applied).
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        Utc::now() + TimeDelta::seconds(EXPIRY_SKEW_SECS) < self.expires_at
    }
}

/// Acquires, refreshes, and persists the shared bearer token.
#[derive(Debug)]
pub struct TokenManager {
    api: ApiClient,
    token_url: String,
    credentials: Credentials,
    persist_path: PathBuf,
    state: RwLock<Token>,
}

impl TokenManager {
    /// Connects the manager: restores a persisted token when one exists and
    /// is still fresh, otherwise acquires a new one from the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when no usable token can be obtained.
    pub async fn connect(
        api: ApiClient,
        token_url: impl Into<String>,
        credentials: Credentials,
        persist_path: impl Into<PathBuf>,
    ) -> Result<Self, AuthError> {
        let token_url = token_url.into();
        let persist_path = persist_path.into();

        if let Some(restored) = load_persisted_token(&persist_path) {
            if restored.is_fresh() {
                info!(path = %persist_path.display(), "restored persisted token");
                return Ok(Self {
                    api,
                    token_url,
                    credentials,
                    persist_path,
                    state: RwLock::new(restored),
                });
            }
            warn!("persisted token expired, requesting a new one");
        }

        let token = request_token(&api, &token_url, &credentials).await?;
        if let Err(e) = persist_token(&persist_path, &token) {
            warn!(error = %e, "failed to persist token");
        }

        Ok(Self {
            api,
            token_url,
            credentials,
            persist_path,
            state: RwLock::new(token),
        })
    }

    /// Returns a currently valid bearer value, refreshing when expired.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the refresh fails; the previous (expired)
    /// token is not returned.
    pub async fn get(&self) -> Result<String, AuthError> {
        {
            let token = self.state.read().await;
            if token.is_fresh() {
                return Ok(token.access_token.clone());
            }
        }

        let mut token = self.state.write().await;
        // Double-check: another writer may have refreshed while this task
        // waited for the write lock.
        if token.is_fresh() {
            return Ok(token.access_token.clone());
        }

        info!("token expired, refreshing");
        *token = request_token(&self.api, &self.token_url, &self.credentials).await?;
        if let Err(e) = persist_token(&self.persist_path, &token) {
            warn!(error = %e, "failed to persist refreshed token");
        }

        Ok(token.access_token.clone())
    }

    /// Persists the latest token. Called once at the end of a run.
    pub async fn close(&self) {
        let token = self.state.read().await;
        if let Err(e) = persist_token(&self.persist_path, &token) {
            warn!(error = %e, "failed to persist token at shutdown");
        }
    }

    /// Absolute expiry of the current token (primarily for diagnostics).
    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.state.read().await.expires_at
    }
}

/// Requests a new token via the form-encoded password grant.
async fn request_token(
    api: &ApiClient,
    token_url: &str,
    credentials: &Credentials,
) -> Result<Token, AuthError> {
    debug!(url = token_url, username = %credentials.username, "requesting token");

    let response = api
        .post_form(
            token_url,
            &[
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
                ("client_id", CLIENT_ID),
                ("grant_type", "password"),
            ],
        )
        .await?;

    let status = response.status();
    let body = response.text().await.map_err(AuthError::Body)?;
    if status.as_u16() != 200 {
        return Err(AuthError::Endpoint {
            status: status.as_u16(),
            body: truncate_body(&body),
        });
    }

    let mut token: Token = serde_json::from_str(&body)?;
    token.expires_at = Utc::now() + TimeDelta::seconds(token.expires_in.max(0));
    debug!(expires_at = %token.expires_at, "token issued");
    Ok(token)
}

/// Loads a persisted token; any read or parse error is treated as absent.
fn load_persisted_token(path: &Path) -> Option<Token> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice::<Token>(&bytes) {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable persisted token");
            None
        }
    }
}

/// Writes the token to disk: temp sibling, fsync, owner-only
/// permissions, rename. A crash can leave the previous file or the new
/// one, never a truncated form.
fn persist_token(path: &Path, token: &Token) -> Result<(), AuthError> {
    let io_err = |source| AuthError::Persist {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_vec_pretty(token)?;
    let temp_path = temp_sibling(path);
    if let Err(e) = write_synced(&temp_path, &content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(e));
    }
    if let Err(e) = set_owner_only_permissions(&temp_path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(e));
    }
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(io_err(e));
    }
    debug!(path = %path.display(), "token persisted");
    Ok(())
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut os_string = path.as_os_str().to_os_string();
    os_string.push(".tmp");
    PathBuf::from(os_string)
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Truncates a response body for inclusion in error messages.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}
