//! Error types for cache operations
//!
//! Storage failures inside the cache facade are logged and swallowed, so these
//! errors surface mainly from constructors, configuration loading and the blob
//! client.

use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Missing or invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Programmer error: an argument violated the contract
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Remote blob storage error
    #[error("Blob storage error: {0}")]
    BlobError(String),

    /// Optimistic concurrency check rejected a blob write
    #[error("Precondition failed for blob {blob}: expected version {expected}")]
    PreconditionFailed { blob: String, expected: String },

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        CacheError::BlobError(e.to_string())
    }
}
