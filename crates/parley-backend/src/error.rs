//! Error types for the backend client.

use thiserror::Error;

/// Coarse classification of a backend failure.
///
/// Drives retry decisions: only [`ErrorKind::Transport`] is retried, and only
/// on the live-feed path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connectivity lost or the server was unreachable.
    Transport,
    /// The backend rejected the operation for authorization reasons.
    Permission,
    /// The request itself was invalid (a client-side bug).
    MalformedRequest,
    /// Anything else.
    Unknown,
}

/// Errors that can occur when talking to the chat backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Connection lost, socket closed or request never reached the server.
    #[error("transport error: {0}")]
    Transport(String),

    /// Operation rejected by the backend's permission layer.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The backend could not parse or validate the request.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// Error reported by the backend that fits no other bucket.
    #[error("backend error: {0}")]
    Unknown(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// A by-primary-key mutation matched no row.
    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    /// Build an error from a GraphQL error's `extensions.code`.
    pub fn from_graphql_code(code: Option<&str>, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            Some("validation-failed" | "access-denied" | "invalid-jwt" | "permission-error") => {
                Self::Permission(message)
            }
            Some("parse-failed" | "bad-request" | "invalid-params" | "unexpected-payload") => {
                Self::MalformedRequest(message)
            }
            Some("start-failed" | "connection-error") => Self::Transport(message),
            _ => Self::Unknown(message),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::RateLimited { .. } => ErrorKind::Transport,
            Self::Permission(_) => ErrorKind::Permission,
            Self::MalformedRequest(_) => ErrorKind::MalformedRequest,
            Self::Unknown(_) | Self::Json(_) | Self::NotFound(_) => ErrorKind::Unknown,
            Self::Http(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    return ErrorKind::Transport;
                }
                match e.status() {
                    Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => ErrorKind::Permission,
                    Some(s) if s.as_u16() == 400 || s.as_u16() == 422 => {
                        ErrorKind::MalformedRequest
                    }
                    Some(s) if s.is_server_error() => ErrorKind::Transport,
                    _ => ErrorKind::Unknown,
                }
            }
        }
    }

    /// Check if the error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Transport => "Connection lost. Trying to reconnect...".to_string(),
            ErrorKind::Permission => "Permission denied. Please refresh and try again.".to_string(),
            ErrorKind::MalformedRequest => "Invalid request. Please refresh the page.".to_string(),
            ErrorKind::Unknown => match self {
                Self::Unknown(message) if !message.is_empty() => message.clone(),
                Self::Unknown(_) => "Something went wrong with real-time updates.".to_string(),
                _ => "Real-time updates temporarily unavailable.".to_string(),
            },
        }
    }
}
