//! Error types for emissor-core

use thiserror::Error;

/// Main error type for the emissor-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Receiver rejected at the registry boundary (bad URL, SSRF policy, bad token)
    #[error("invalid receiver: {0}")]
    InvalidReceiver(String),

    /// Receiver not found
    #[error("receiver not found: {0}")]
    ReceiverNotFound(i64),

    /// Credential vault error
    #[error("vault error: {0}")]
    Vault(String),

    /// HTTP client construction or transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Translation endpoint error
    #[error("translation error: {0}")]
    Translation(String),

    /// Queue row that cannot be decoded into a job
    #[error("undecodable job payload: {0}")]
    Payload(String),
}

/// Result type alias for emissor-core
pub type Result<T> = std::result::Result<T, Error>;
