pub mod settings;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default listening port of the broker
pub const DEFAULT_PORT: u16 = 4200;

/// Default delay before a routed request is answered with a Timeout error
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Log verbosity, following the historical `debug` setting values (0, 1, 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verbosity {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl Verbosity {
    pub fn as_level(&self) -> tracing::Level {
        match self {
            Verbosity::Error => tracing::Level::ERROR,
            Verbosity::Warning => tracing::Level::WARN,
            Verbosity::Info => tracing::Level::INFO,
            Verbosity::Debug => tracing::Level::DEBUG,
            Verbosity::Trace => tracing::Level::TRACE,
        }
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(Verbosity::Error),
            "0" | "warn" | "warning" => Ok(Verbosity::Warning),
            "1" | "info" => Ok(Verbosity::Info),
            "2" | "debug" => Ok(Verbosity::Debug),
            "trace" => Ok(Verbosity::Trace),
            other => Err(format!("Unknown debug value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub verbosity: Verbosity,
    /// Root directory of the per-session log directories
    pub log_root: PathBuf,
    /// Write the broker's own logs there instead of stderr
    pub log_file: Option<PathBuf>,
    /// Capture every frame into this pcap file
    pub dump_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            verbosity: Verbosity::Warning,
            log_root: PathBuf::from("."),
            log_file: None,
            dump_file: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl BrokerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply a `debug` setting value, ignoring empty ones.
    pub fn set_verbosity_from_str(&mut self, value: &str) -> std::result::Result<(), String> {
        if value.is_empty() {
            return Ok(());
        }
        self.verbosity = value.parse()?;
        Ok(())
    }

    /// Apply a `port` setting value, ignoring empty ones.
    pub fn set_port_from_str(&mut self, value: &str) -> std::result::Result<(), String> {
        let value = value.trim().trim_start_matches(':');
        if value.is_empty() {
            return Ok(());
        }
        self.port = value
            .parse()
            .map_err(|e| format!("Invalid port '{}': {}", value, e))?;
        Ok(())
    }

    /// Validate configuration bounds
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }
        if self.max_frame_size == 0 {
            return Err("max_frame_size must be > 0".to_string());
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err("max_frame_size must fit in a 32-bit length prefix".to_string());
        }
        Ok(())
    }
}
