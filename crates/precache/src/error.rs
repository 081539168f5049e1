use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;

/// Errors raised while fetching a single resource from the network.
///
/// Cloneable so the last failure of a retry loop can be reported
/// while earlier ones are logged.
#[derive(Debug, thiserror::Error, Clone)]
pub enum FetchError {
    #[error("Network error: {source}")]
    Network {
        #[from]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {0}")]
    Status(StatusCode),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable: {0}")]
    Unavailable(String),

    #[error("Cache write failed: {0}")]
    CacheWrite(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Network {
            source: Arc::new(err),
        }
    }
}

// Custom error type for cache lifecycle and strategy operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Staging failed for '{path}': {reason}")]
    Staging { path: String, reason: String },

    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Partition '{name}' error: {reason}")]
    Partition { name: String, reason: String },

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
}

impl CacheError {
    pub(crate) fn staging(path: impl Into<String>, reason: impl ToString) -> Self {
        CacheError::Staging {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
