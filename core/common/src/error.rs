//! Common error types for profilesync.

use thiserror::Error;

/// Top-level error type for profilesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Remote store could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// A bounded remote call did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The device is offline.
    #[error("Device is offline")]
    Offline,

    /// Remote store rejected the request (quota, permission, payload).
    #[error("Remote error: {0}")]
    Remote(String),

    /// A batched commit failed as a whole.
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Local key-value store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the failure is expected to clear up on its own (connectivity, timeouts).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Offline | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
