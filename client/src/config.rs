//! Client configuration

use crate::{CellaservClientError, Result};
use ::config::{Config, Environment};
use cellaserv::config::settings::ENV_PREFIX;
use cellaserv::protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::Deserialize;
use std::time::Duration;

/// Broker address used when nothing else is configured
pub const DEFAULT_ADDRESS: &str = "localhost:4200";

/// `CS_HOST` and `CS_PORT`
#[derive(Debug, Default, Deserialize)]
struct EnvValues {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address as `host:port`
    pub address: String,
    pub connect_timeout: Duration,
    /// How long to wait for a reply. Keep it above the broker's own timeout
    /// so that the broker's `Timeout` reply is what callers see.
    pub request_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `CS_HOST` and `CS_PORT`, the variables the
    /// broker itself reads.
    pub fn from_env() -> Result<Self> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(environment: Environment) -> Result<Self> {
        let values = Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize::<EnvValues>()?;
        Self::from_parts(values.host.as_deref(), values.port.as_deref())
    }

    fn from_parts(host: Option<&str>, port: Option<&str>) -> Result<Self> {
        let host = host.unwrap_or("localhost");
        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| CellaservClientError::config(format!("invalid port {p:?}: {e}")))?,
            None => 4200,
        };
        Ok(Self::new(format!("{host}:{port}")))
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.address, "localhost:4200");
        assert!(config.request_timeout > Duration::from_secs(5));
    }

    #[test]
    fn test_from_parts() {
        let config = ClientConfig::from_parts(Some("robot.local"), Some("4201")).unwrap();
        assert_eq!(config.address, "robot.local:4201");

        let config = ClientConfig::from_parts(None, None).unwrap();
        assert_eq!(config.address, DEFAULT_ADDRESS);

        assert!(ClientConfig::from_parts(None, Some("http")).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let vars = ::config::Map::from([
            ("CS_HOST".to_string(), "robot.local".to_string()),
            ("CS_PORT".to_string(), "4300".to_string()),
        ]);
        let config =
            ClientConfig::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
                .unwrap();
        assert_eq!(config.address, "robot.local:4300");

        let vars = ::config::Map::from([("CS_PORT".to_string(), "http".to_string())]);
        let err =
            ClientConfig::from_environment(Environment::with_prefix(ENV_PREFIX).source(Some(vars)))
                .unwrap_err();
        assert!(matches!(err, CellaservClientError::Config { .. }));
    }
}
