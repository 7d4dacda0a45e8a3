//! Application configuration.
//!
//! Aggregates the broker, dispatcher, worker and manifest settings into a
//! single Config struct that can be loaded from YAML files or environment
//! variables.

use std::path::PathBuf;

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::utils::retry::RetryPolicy;
use crate::worker::WorkerConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "modelbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MODELBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MODELBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MODELBUS_LOG";

/// Service identity. Names the queue, the broadcast topic and the lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub name: String,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "model".to_string(),
        }
    }
}

/// Caller-side settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Polling schedule for reply slots; its total delay is the timeout.
    pub reply_backoff: RetryPolicy,
}

/// Where the version manifest lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManifestSection {
    pub path: PathBuf,
}

impl Default for ManifestSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("versions.json"),
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceSection,
    pub broker: BrokerConfig,
    pub dispatch: DispatchSection,
    pub worker: WorkerConfig,
    pub manifest: ManifestSection,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `modelbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
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
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }
}
