//! Event log error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for event log operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the event log and the legacy migrator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Session id unusable as a directory name.
    #[error("invalid session id: {0:?}")]
    InvalidSession(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A legacy message log that is not valid JSON.
    #[error("invalid legacy message log {}: {source}", path.display())]
    Legacy {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Blocking reader task failed.
    #[error("background task failed: {0}")]
    Task(String),
}
