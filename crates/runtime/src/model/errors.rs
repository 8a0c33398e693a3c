use std::time::Duration;
use thiserror::Error;

/// Errors from talking to a model backend.
///
/// Any of these aborts the current turn; the conversation stays usable.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend could not be reached at all.
    #[error("backend unavailable at {endpoint}: {reason}")]
    Unavailable { endpoint: String, reason: String },

    /// No complete response within the configured deadline.
    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    /// The backend answered with a non-success status.
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// A network error other than a refused connection.
    #[error("network: {0}")]
    Network(String),

    /// The response body could not be decoded.
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}
