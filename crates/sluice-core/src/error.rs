//! Client error handling
//!
//! Provides typed errors for sync operations. Errors are `Clone` because a
//! single failure is fanned out to every subscriber of a subscription.

use thiserror::Error;

/// Errors surfaced by the sync client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Server rejected the operation for authorization reasons
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Server rejected the token sent with `auth`
    #[error("Authentication rejected: {message}")]
    AuthRejected { message: String },

    /// Server reported a function or query error
    #[error("Server error{}: {message}", code_suffix(.code))]
    Server { code: Option<i64>, message: String },

    /// Connection dropped and the request timed out waiting for a response
    #[error("Connection lost before a response arrived")]
    ConnectionLost,

    /// The client was closed while the operation was pending
    #[error("Client closed")]
    ClientClosed,

    /// Operation could not be delivered to the connection task
    #[error("Connection task is not running")]
    TaskGone,

    /// WebSocket or endpoint resolution failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be serialized or parsed
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl SyncError {
    /// Build a server error from an error frame's fields
    pub fn server(code: Option<i64>, message: impl Into<String>) -> Self {
        SyncError::Server {
            code,
            message: message.into(),
        }
    }

    /// Whether the error is authorization-related
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized { .. } | SyncError::AuthRejected { .. }
        )
    }

    /// Check if retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionLost | SyncError::Transport(_) | SyncError::Unauthorized { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            SyncError::Unauthorized { .. } => {
                Some("Send a valid token with `auth`; affected subscriptions are re-validated automatically.")
            }
            SyncError::AuthRejected { .. } => Some("Obtain a fresh token and call `auth` again."),
            SyncError::ConnectionLost => {
                Some("The request may or may not have run on the server. Retry if it is idempotent.")
            }
            SyncError::Transport(_) => Some("Check the server URL and that the server is running."),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::InvalidPayload(err.to_string())
    }
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;
