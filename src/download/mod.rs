//! Per-series download state machine with bounded concurrency and retry.

mod engine;
mod error;
mod layout;
mod retry;

pub use engine::{DownloadEngine, EngineConfig, EngineContext, needs_download};
pub use error::DownloadError;
pub use layout::OutputLayout;
pub use retry::{FailureKind, RetryDecision, RetryPolicy, classify_error};
