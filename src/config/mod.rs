//! Application configuration.
//!
//! Loaded from YAML files and environment variables. Nested keys map to
//! environment variables with a `__` separator, e.g.
//! `PRODUCT_EVENTS__BROKER__PREFETCH=20`.

mod broker;

pub use broker::{BrokerConfig, HandlerFailurePolicy};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PRODUCT_EVENTS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PRODUCT_EVENTS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PRODUCT_EVENTS_LOG";
/// Environment variable selecting JSON log output.
pub const LOG_FORMAT_ENV_VAR: &str = "PRODUCT_EVENTS_LOG_FORMAT";
/// Legacy environment variable for the broker URL.
pub const BROKER_URL_ENV_VAR: &str = "RABBITMQ_URL";

/// Errors loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker client configuration.
    pub broker: BrokerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. `RABBITMQ_URL` for the broker URL
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("broker.url", std::env::var(BROKER_URL_ENV_VAR).ok())?
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.broker.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}
