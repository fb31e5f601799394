//! # Cellaserv Broker Module
//!
//! Connection handling and the routing core of the broker.
//!
//! ## Architecture
//!
//! - [`server`] - TCP listener spawning one session task per accepted client
//! - [`session`] - framed read loop, per-connection writer task and dispatch
//! - [`state`] - the [`Broker`]: registry, subscriptions and in-flight
//!   requests behind a single lock, plus every routing operation
//! - [`admin`] - the built-in `cellaserv` service
//! - [`registry`], [`subscriptions`], [`pending`] - the routing tables
//! - [`connection`] - connection identity and outbound queue
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use cellaserv::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig {
//!         port: 4200,
//!         host: "0.0.0.0".to_string(),
//!         log_root: "/var/log/cellaserv".into(),
//!         ..Default::default()
//!     };
//!
//!     let server = BrokerServer::bind(config).await?;
//!
//!     // Runs until the `shutdown` administrative command is received
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod connection;
pub mod pending;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod subscriptions;

pub use admin::{AdminCommand, DescribeConnArgs, LogRotateArgs, SpyArgs};
pub use connection::{ConnId, ConnectionInfo, Outbound};
pub use registry::{LookupError, ServiceInfo, ServiceKey};
pub use server::BrokerServer;
pub use session::serve_connection;
pub use state::{events, Broker, ADMIN_SERVICE, LOG_PREFIX};
