//! # Cellaserv Core Library
//!
//! Cellaserv is a small message broker: independent processes connect over a
//! single long-lived TCP connection, register services under a name (and an
//! optional instance identification), call each other's methods by name, and
//! publish or subscribe to named events.
//!
//! ## Architecture Overview
//!
//! - [`broker`] - connection sessions, shared routing state and the TCP server
//! - [`protocol`] - length-prefixed framing and protobuf message definitions
//! - [`config`] - broker settings resolved from file, environment and flags
//! - [`log_sink`] - durable per-channel log files fed by `log.*` events
//! - [`dump`] - optional pcap capture of every frame
//! - [`metrics`] - lock-free broker counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cellaserv::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> cellaserv::Result<()> {
//!     let config = BrokerConfig {
//!         port: 4200,
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::bind(config).await?;
//!     server.run().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod dump;
pub mod log_sink;
pub mod metrics;
pub mod protocol;

pub use broker::{Broker, BrokerServer, ConnId};
pub use config::{BrokerConfig, Verbosity};
pub use log_sink::{FileLogSink, LogSink, LogSinkError};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{CellaservFrameCodec, ErrorType, Frame, FrameError, MessageType};

use thiserror::Error;

/// Broker version reported by the `version` administrative command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cellaserv error types
///
/// Request-level failures (unknown service, bad arguments, timeouts) are not
/// represented here: they are answered to the caller as error replies. This
/// enum covers failures that end a connection or prevent the broker from
/// starting.
#[derive(Debug, Error)]
pub enum CellaservError {
    /// Socket and file I/O failures
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener or peer level failures
    #[error("Network error: {0}")]
    Network(String),

    /// JSON encoding of administrative payloads
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unreadable settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or oversized frame on the stream
    #[error("Frame error: {0}")]
    Frame(#[from] protocol::FrameError),

    /// Outer envelope could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl From<::config::ConfigError> for CellaservError {
    fn from(e: ::config::ConfigError) -> Self {
        CellaservError::Config(e.to_string())
    }
}

/// Result type alias for cellaserv operations
pub type Result<T> = std::result::Result<T, CellaservError>;
