//! Task tracking error types.

use thiserror::Error;

/// Errors from the video-generation service.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Network or server hiccup; retried on the next tick.
    #[error("transient api error: {0}")]
    Transient(String),

    /// The service refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Errors surfaced by task operations.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task store error: {0}")]
    Store(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("unknown task: {0}")]
    Unknown(String),

    /// The service handed out an id that was removed earlier in the session.
    #[error("task {0} was removed and cannot be tracked again")]
    Removed(String),
}

impl From<mongodb::error::Error> for TaskError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::Store(e.to_string())
    }
}
