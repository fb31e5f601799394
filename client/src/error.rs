//! Error types for the cellaserv client

use cellaserv::{ErrorType, FrameError};
use thiserror::Error;

/// Errors that can occur while talking to a cellaserv broker
#[derive(Error, Debug)]
pub enum CellaservClientError {
    /// Connection-related errors
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame or message from the broker
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No reply arrived in time
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The broker or the remote service answered with an error
    #[error("Error reply: {kind}{}", .what.as_deref().map(|w| format!(" ({w})")).unwrap_or_default())]
    Reply {
        kind: ErrorType,
        what: Option<String>,
    },

    /// JSON payload errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Invalid client settings
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The connection task has stopped
    #[error("Connection closed")]
    Closed,
}

impl CellaservClientError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    pub fn serialization<S: Into<String>>(message: S) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True for a local timeout and for a `Timeout` reply from the broker
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::Reply {
                    kind: ErrorType::Timeout,
                    ..
                }
        )
    }

    /// Check if the connection is unusable after this error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::Closed | Self::Protocol { .. }
        )
    }

    /// The error kind carried by an error reply
    pub fn reply_kind(&self) -> Option<ErrorType> {
        match self {
            Self::Reply { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CellaservClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<::config::ConfigError> for CellaservClientError {
    fn from(e: ::config::ConfigError) -> Self {
        Self::config(e.to_string())
    }
}

impl From<prost::DecodeError> for CellaservClientError {
    fn from(e: prost::DecodeError) -> Self {
        Self::protocol(e.to_string())
    }
}

impl From<FrameError> for CellaservClientError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => Self::Io(e),
            other => Self::protocol(other.to_string()),
        }
    }
}
