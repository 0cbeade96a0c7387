//! Error types for the sync layer.

use parley_backend::{BackendError, ErrorKind};
use thiserror::Error;

/// Errors surfaced by view-model operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backend rejected or failed the operation.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Rejected locally before reaching the backend.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl SyncError {
    /// Classification used for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Backend(e) => e.kind(),
            Self::InvalidInput(_) => ErrorKind::MalformedRequest,
        }
    }

    /// Check if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_retryable())
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Backend(e) => e.user_message(),
            Self::InvalidInput(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_errors_pass_through() {
        let err = SyncError::from(BackendError::Transport("reset by peer".into()));
        assert!(err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "transport error: reset by peer");
    }

    #[test]
    fn test_invalid_input_is_not_retryable() {
        let err = SyncError::InvalidInput("title must not be empty".into());
        assert!(!err.is_retryable());
        assert_eq!(err.user_message(), "title must not be empty");
    }
}
