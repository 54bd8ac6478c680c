//! Relay error types.

use thiserror::Error;

use crate::events::StoreError;
use crate::runner::RunnerError;

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// Request body is not the event the endpoint expects.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}
