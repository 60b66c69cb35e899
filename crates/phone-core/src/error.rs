//! Error types for the phone session manager
//!
//! Every failure the session manager can observe is expressed as a
//! [`PhoneError`]. Errors are grouped so the orchestrator can decide what to do
//! with them without inspecting message strings:
//!
//! - **Auth** - no or invalid credential, surfaced to the user, never retried
//! - **Network / Server / Timeout** - transient, retried through the backoff scheduler
//! - **Device** - the telephony device reported a fault, triggers re-registration
//! - **MediaPermission** - microphone denied, terminal until the user retries
//! - **Protocol** - malformed signalling traffic, logged and dropped
//!
//! # Example
//!
//! ```rust
//! use agentdesk_phone_core::error::PhoneError;
//!
//! let err = PhoneError::network("connection reset");
//! assert!(err.is_recoverable());
//! assert_eq!(err.category(), "network");
//!
//! let denied = PhoneError::MediaPermission { reason: "NotAllowedError".into() };
//! assert!(!denied.is_recoverable());
//! ```

use thiserror::Error;

/// Result type alias for session manager operations
pub type PhoneResult<T> = Result<T, PhoneError>;

/// Errors produced by the session manager and its collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhoneError {
    /// No identity/session available, or the backend refused the credential
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    /// Transport-level failure talking to a backend
    #[error("Network error: {reason}")]
    Network { reason: String },

    /// Backend answered with a non-2xx status
    #[error("Server returned status {status}: {reason}")]
    Server { status: u16, reason: String },

    /// Telephony device fault (registration failure, SDK error event)
    #[error("Device error: {reason}")]
    Device { reason: String },

    /// Microphone access was denied
    #[error("Microphone permission denied: {reason}")]
    MediaPermission { reason: String },

    /// Device enumeration or selection failure
    #[error("Media error: {reason}")]
    Media { reason: String },

    /// Malformed or unexpected signalling payload
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// Operation not valid for the current state
    #[error("Invalid state: {operation} not allowed while {state}")]
    InvalidState { operation: String, state: String },

    #[error("No active call")]
    NoActiveCall,

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The session manager task is gone
    #[error("Session manager is not running")]
    ChannelClosed,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PhoneError {
    /// Create an authentication error
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth { reason: reason.into() }
    }

    /// Create a network error
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network { reason: reason.into() }
    }

    /// Create a device error
    pub fn device(reason: impl Into<String>) -> Self {
        Self::Device { reason: reason.into() }
    }

    /// Create a media error
    pub fn media(reason: impl Into<String>) -> Self {
        Self::Media { reason: reason.into() }
    }

    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Check if retrying the failed operation can succeed without user action
    pub fn is_recoverable(&self) -> bool {
        match self {
            PhoneError::Network { .. }
            | PhoneError::Timeout { .. }
            | PhoneError::Device { .. } => true,

            // 5xx is the backend's problem and usually passes; 4xx won't fix itself
            PhoneError::Server { status, .. } => *status >= 500,

            PhoneError::Auth { .. }
            | PhoneError::MediaPermission { .. }
            | PhoneError::InvalidConfiguration { .. }
            | PhoneError::ChannelClosed => false,

            _ => false,
        }
    }

    /// Check if the user has to re-authenticate
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            PhoneError::Auth { .. } | PhoneError::Server { status: 401 | 403, .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            PhoneError::Auth { .. } => "auth",
            PhoneError::Network { .. } | PhoneError::Timeout { .. } => "network",
            PhoneError::Server { .. } => "server",
            PhoneError::Device { .. } => "device",
            PhoneError::MediaPermission { .. } | PhoneError::Media { .. } => "media",
            PhoneError::Protocol { .. } => "protocol",
            PhoneError::InvalidState { .. } | PhoneError::NoActiveCall => "state",
            PhoneError::InvalidConfiguration { .. } => "configuration",
            PhoneError::ChannelClosed | PhoneError::Internal { .. } => "internal",
        }
    }
}

impl From<reqwest::Error> for PhoneError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            PhoneError::Server {
                status: status.as_u16(),
                reason: err.to_string(),
            }
        } else if err.is_decode() {
            PhoneError::protocol(err.to_string())
        } else {
            PhoneError::network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for PhoneError {
    fn from(err: serde_json::Error) -> Self {
        PhoneError::protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PhoneError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Protocol(e) => PhoneError::protocol(e.to_string()),
            WsError::Http(response) => PhoneError::Server {
                status: response.status().as_u16(),
                reason: "websocket upgrade rejected".to_string(),
            },
            other => PhoneError::network(other.to_string()),
        }
    }
}
