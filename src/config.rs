//! Application configuration.
//!
//! Loaded from YAML files and environment variables with the `config` crate.

use serde::Deserialize;

use crate::listener::BindingPolicy;
use crate::topology::{PermLogEvent, QueueName};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "perm-log.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PERM_LOG_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PERM_LOG";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PERM_LOG_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub amqp: AmqpConfig,
    /// Queue and bindings for the listener.
    pub listener: ListenerConfig,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL.
    pub url: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub queue: QueueName,
    /// Event patterns the queue is bound to.
    pub events: Vec<PermLogEvent>,
    pub binding_policy: BindingPolicy,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            queue: QueueName::Log,
            events: vec![PermLogEvent::PermAll],
            binding_policy: BindingPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `perm-log.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("listener.events")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
