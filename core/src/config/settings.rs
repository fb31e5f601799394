use super::BrokerConfig;
use crate::Result;
use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

/// System-wide settings file
pub const DEFAULT_SETTINGS_FILE: &str = "/etc/conf.d/cellaserv";

/// Prefix of the environment overrides (`CS_DEBUG`, `CS_PORT`)
pub const ENV_PREFIX: &str = "CS";

/// Keys understood in the `[cellaserv]` section and in the environment
#[derive(Debug, Default, Deserialize)]
struct SettingValues {
    #[serde(default)]
    debug: Option<String>,
    #[serde(default)]
    port: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    cellaserv: SettingValues,
}

impl BrokerConfig {
    /// Defaults, overridden by the settings file, overridden by the environment.
    ///
    /// A missing settings file is not an error. Command-line flags are applied
    /// afterwards by the binary.
    pub fn load(settings_file: Option<&Path>) -> Result<Self> {
        let path = settings_file.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
        let mut config = BrokerConfig::default();

        let file_values = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini).required(false))
            .build()
            .and_then(|c| c.try_deserialize::<SettingsFile>());
        match file_values {
            Ok(values) => config.apply(values.cellaserv, "file"),
            Err(e) => debug!("[Config] Could not read or parse '{}': {}", path.display(), e),
        }

        let env_values = Config::builder()
            .add_source(Environment::with_prefix(ENV_PREFIX))
            .build()?
            .try_deserialize::<SettingValues>()?;
        config.apply(env_values, "environment");

        Ok(config)
    }

    fn apply(&mut self, values: SettingValues, origin: &str) {
        if let Some(debug) = values.debug {
            if let Err(e) = self.set_verbosity_from_str(&debug) {
                warn!("[Config] {} ({})", e, origin);
            }
        }
        if let Some(port) = values.port {
            if let Err(e) = self.set_port_from_str(&port) {
                warn!("[Config] {} ({})", e, origin);
            }
        }
    }
}
