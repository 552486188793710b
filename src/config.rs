use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Bootstrap configuration.
///
/// This is the static half of configuration: where the dynamic option store
/// lives, and how logging behaves. Everything the recorder can change at
/// runtime lives in the [`OptionStore`](crate::options::OptionStore) instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Properties file the device-option store persists to.
    pub options_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            options_file: "tunerlink.properties".to_string(),
        }
    }
}

impl Config {
    /// Loads from an optional file plus `TUNERLINK_`-prefixed environment
    /// variables. A missing default file is not an error.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        builder = match path {
            Some(p) => builder.add_source(File::with_name(p)),
            None => builder.add_source(File::with_name("tunerlink").required(false)),
        };
        builder = builder.add_source(Environment::with_prefix("TUNERLINK").separator("__"));
        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.storage.options_file, "tunerlink.properties");
    }
}
