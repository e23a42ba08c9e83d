//! Application configuration.
//!
//! Settings are merged from YAML files and environment variables with the
//! `config` crate, then handed to the messaging roles as a [`ConfigSection`].
//! Validation happens eagerly when a [`ConnectionConfig`] or
//! [`SubscriberConfig`] is built, so a bad deployment fails at startup rather
//! than on first use.

mod connection;

pub use connection::{ConnectionConfig, SubscriberConfig, DEFAULT_PORT, DEFAULT_VIRTUAL_HOST};

use std::collections::HashMap;

use ::config::{Config as ConfigLib, Environment, File, FileFormat, Value};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BITLET_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BITLET";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BITLET_LOG";
/// Name of the broker settings section.
pub const RABBITMQ_SECTION: &str = "RabbitMQ";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required config-section '{0}' not found")]
    MissingSection(String),

    #[error("Required config-setting '{0}' not found")]
    Missing(&'static str),

    #[error("Unable to parse config-setting 'Port' value '{0}' as a port number")]
    InvalidPort(String),

    #[error("Failed to load configuration: {0}")]
    Source(#[from] ::config::ConfigError),
}

/// Merged application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    inner: ConfigLib,
}

impl Settings {
    /// Load settings from files and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config.yaml` in the current directory (if it exists)
    /// 2. File given by `path` (required if provided)
    /// 3. File named by `BITLET_CONFIG` (required if set)
    /// 4. Environment variables, e.g. `BITLET__RABBITMQ__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let inner = builder
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
            .build()?;

        Ok(Self { inner })
    }

    /// Settings from an inline YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let inner = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;
        Ok(Self { inner })
    }

    /// Extract a named section. Section and key names match case-insensitively.
    ///
    /// Environment variables arrive with lowercased keys, so a lowercased
    /// section overrides one spelled as in the files.
    pub fn section(&self, name: &str) -> Result<ConfigSection, ConfigError> {
        let root: HashMap<String, Value> = self.inner.clone().try_deserialize()?;

        let mut tables: Vec<_> = root
            .into_iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(name))
            .filter_map(|(key, value)| value.into_table().ok().map(|table| (key, table)))
            .collect();
        if tables.is_empty() {
            return Err(ConfigError::MissingSection(name.to_string()));
        }
        tables.sort_by_key(|(key, _)| *key == key.to_ascii_lowercase());

        Ok(ConfigSection::from_pairs(
            name,
            tables.into_iter().flat_map(|(_, table)| {
                table
                    .into_iter()
                    .filter_map(|(key, value)| value.into_string().ok().map(|v| (key, v)))
            }),
        ))
    }

    /// The `RabbitMQ` section.
    pub fn rabbitmq(&self) -> Result<ConfigSection, ConfigError> {
        self.section(RABBITMQ_SECTION)
    }
}

/// Flat string settings of one section.
#[derive(Clone, Default)]
pub struct ConfigSection {
    name: String,
    values: HashMap<String, String>,
}

impl ConfigSection {
    pub fn from_pairs<K, V>(name: &str, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            name: name.to_string(),
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into()))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw value for `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Value for `key`, treating empty strings as absent.
    pub(crate) fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub(crate) fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.non_empty(key)
            .map(str::to_string)
            .ok_or(ConfigError::Missing(key))
    }
}

impl std::fmt::Debug for ConfigSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("ConfigSection")
            .field("name", &self.name)
            .field("keys", &keys)
            .finish()
    }
}
