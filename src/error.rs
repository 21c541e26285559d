//! Error types for hubwarden

use std::time::Duration;
use thiserror::Error;

/// Main error type for hubwarden operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Qdrant error: {0}")]
    Qdrant(String),

    /// Network failure or timeout talking to an upstream service
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Upstream asked us to slow down
    #[error("Upstream rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Upstream rejected credentials: {0}")]
    Unauthorized(String),

    /// Non-retryable upstream failure
    #[error("Upstream error: {0}")]
    Fatal(String),

    /// Malformed upstream item or corrupt stored value
    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Index rebuild failed: {0}")]
    IndexRebuild(String),

    #[error("Component unresponsive: {0}")]
    ComponentUnresponsive(String),

    #[error("Restart budget exhausted for component {0}")]
    RestartBudgetExhausted(String),

    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a registry call that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientIo(_) | Error::RateLimited { .. })
    }
}

/// Result type alias for hubwarden
pub type Result<T> = std::result::Result<T, Error>;

/// Convert qdrant errors
impl From<qdrant_client::QdrantError> for Error {
    fn from(err: qdrant_client::QdrantError) -> Self {
        Error::Qdrant(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::TransientIo("timeout".into()).is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
        assert!(!Error::Unauthorized("401".into()).is_retryable());
        assert!(!Error::Fatal("404".into()).is_retryable());
        assert!(!Error::DataIntegrity("bad item".into()).is_retryable());
    }
}
