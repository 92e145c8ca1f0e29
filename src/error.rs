//! error.rs
//! Typed failures for the pipeline's fallible edges.
//!
//! Delivery failures never reach the host: workers log and count them.
//! Only construction (store, config) and the transport/policy seams return these.

use thiserror::Error;

/// Event/policy persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode/decode stored record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("event has already been persisted with local id {0}")]
    AlreadyPersisted(i64),
}

/// Failures below the HTTP status line: nothing usable came back.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to encode request body: {0}")]
    Encode(String),

    #[error("malformed response body: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Request(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors surfaced to the host while assembling the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("the pipeline must be started inside a tokio runtime")]
    NoRuntime,
}

pub type StoreResult<T> = Result<T, StoreError>;
