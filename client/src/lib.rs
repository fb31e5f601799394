//! # Cellaserv Client
//!
//! Async client for the cellaserv broker.
//!
//! ## Features
//!
//! - **Requests**: call methods of registered services, raw or JSON
//! - **Services**: register a name and answer the requests routed to it
//! - **Events**: publish and subscribe, with glob patterns
//! - **Administration**: typed access to the built-in `cellaserv` service
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cellaserv_client::CellaservClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = CellaservClient::connect_to("localhost:4200").await?;
//!
//!     client.subscribe("robot.*")?;
//!     let services = client.admin().list_services().await?;
//!     println!("{} services registered", services.len());
//!
//!     while let Some(event) = client.next_event().await {
//!         println!("{}", event.event);
//!     }
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;

pub use admin::AdminClient;
pub use client::CellaservClient;
pub use config::ClientConfig;
pub use connection::{Connection, Incoming};
pub use error::CellaservClientError;

pub use cellaserv::protocol::{ErrorType, Publish, Request};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, CellaservClientError>;

/// Client version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
