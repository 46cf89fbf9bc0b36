//! Error types for tracklet-core

use thiserror::Error;

/// Main error type for the tracklet-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings database error
    #[error("settings error: {0}")]
    Settings(#[from] rusqlite::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Tracker API URL could not be parsed
    #[error("invalid api url {0}")]
    InvalidUrl(String),

    /// Visitor id does not match `^[0-9a-f]{16}$`
    #[error("invalid visitor id {0:?}: expected 16 lowercase hex characters")]
    InvalidVisitorId(String),

    /// Transport-level HTTP failure (connect, timeout, body)
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server answered with something other than 200 or 204
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Malformed cache container
    #[error("cache error: {0}")]
    Cache(String),
}

/// Result type alias for tracklet-core
pub type Result<T> = std::result::Result<T, Error>;
