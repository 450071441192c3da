//! Error taxonomy for session, reconnection, and subscription operations
//!
//! Errors are split by where they surface: establishment failures come back
//! once from `connect`, security failures close the session, and registry
//! errors stay local to the selector request that produced them.

use crate::session::{CloseReason, SessionState};
use thiserror::Error;

/// Main error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid topic selector: {0:?}")]
    InvalidSelector(String),

    #[error("A session to {url} is already open; close it before connecting again")]
    AlreadyOpen { url: String },

    #[error("Session establishment failed: {0}")]
    Establishment(String),

    #[error("Security failure: {0}")]
    Security(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: Option<SessionState> },

    #[error("Request for selector '{selector}' rejected: {reason}")]
    Rejected { selector: String, reason: String },

    #[error("Request failed")]
    RequestFailed(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl SessionError {
    /// Create a disconnected error
    pub fn disconnected<S: Into<String>>(reason: S) -> Self {
        Self::Disconnected(reason.into())
    }

    /// Create an establishment error
    pub fn establishment<S: Into<String>>(reason: S) -> Self {
        Self::Establishment(reason.into())
    }

    /// Create a rejection error for a selector request
    pub fn rejected<S: Into<String>, R: Into<String>>(selector: S, reason: R) -> Self {
        Self::Rejected {
            selector: selector.into(),
            reason: reason.into(),
        }
    }

    /// Whether repeating the same operation later may succeed.
    ///
    /// Security failures are never retryable: resending identical
    /// credentials fails identically.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::Disconnected(_)
                | SessionError::Timeout(_)
                | SessionError::RequestFailed(_)
        )
    }

    /// Close reason reported when this error ends a session during establishment
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionError::Security(message) => CloseReason::Security(message.clone()),
            other => CloseReason::Establishment(other.to_string()),
        }
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;
