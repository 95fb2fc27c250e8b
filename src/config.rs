//! Configuration management for db-relay.
//!
//! Handles loading configuration from TOML files: executor cadence and
//! limits, the result store, and named engine configurations.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure for db-relay.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Polling cadence and limits.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Result store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Named engine configurations.
    #[serde(default)]
    pub engines: HashMap<String, EngineConfiguration>,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Rows pulled from a cursor per fetch.
    #[serde(default = "default_fetch_batch_size")]
    pub fetch_batch_size: usize,

    #[serde(default = "default_connectivity_timeout_secs")]
    pub connectivity_timeout_secs: u64,

    /// A connectivity check slower than this reports `Warn`.
    #[serde(default = "default_slow_connectivity_ms")]
    pub slow_connectivity_ms: u64,

    /// 0 disables the statement timeout.
    #[serde(default)]
    pub statement_timeout_secs: u64,

    /// 0 means unlimited.
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: u64,

    /// Idle time after which a cached connection pool is dropped.
    #[serde(default = "default_pool_idle_secs")]
    pub pool_idle_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_fetch_batch_size() -> usize {
    1000
}

fn default_connectivity_timeout_secs() -> u64 {
    20
}

fn default_slow_connectivity_ms() -> u64 {
    5000
}

fn default_max_result_rows() -> u64 {
    100_000
}

fn default_pool_idle_secs() -> u64 {
    600
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            fetch_batch_size: default_fetch_batch_size(),
            connectivity_timeout_secs: default_connectivity_timeout_secs(),
            slow_connectivity_ms: default_slow_connectivity_ms(),
            statement_timeout_secs: 0,
            max_result_rows: default_max_result_rows(),
            pool_idle_secs: default_pool_idle_secs(),
        }
    }
}

/// Which kind of store receives new results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Inline,
    Object,
}

/// Result store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreKind,

    /// Per-result byte cap. 0 means unlimited (object backends only).
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// SQLite file for inline results. `None` keeps results in memory.
    pub inline_path: Option<PathBuf>,

    /// Object store location, e.g. `s3://bucket/prefix` or `file:///tmp/results`.
    pub object_url: Option<String>,

    /// Options passed to the object store builder.
    #[serde(default)]
    pub object_options: HashMap<String, String>,

    /// Bytes buffered before a multipart part is sent.
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Enables presigned download URLs.
    pub presign: Option<PresignConfig>,
}

fn default_max_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_key_prefix() -> String {
    "results".to_string()
}

fn default_part_size() -> usize {
    5 * 1024 * 1024
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreKind::default(),
            max_bytes: default_max_bytes(),
            key_prefix: default_key_prefix(),
            inline_path: None,
            object_url: None,
            object_options: HashMap::new(),
            part_size: default_part_size(),
            presign: None,
        }
    }
}

/// S3 presigning settings. Keys are read from the named environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignConfig {
    pub endpoint: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_expires_secs")]
    pub expires_secs: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}

fn default_secret_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

fn default_expires_secs() -> u64 {
    3600
}

/// Immutable descriptor of a target database.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfiguration {
    /// Filled from the table key when loaded from a file.
    #[serde(default)]
    pub name: String,

    /// Engine family, matched exactly against the registry.
    pub family: String,

    /// Host cluster URL (`presto://h1:p1,h2:p2/catalog/schema?SSL=true`) or driver URL.
    pub connection_string: String,

    pub username: Option<String>,

    /// Environment variable holding the password.
    pub password_env: Option<String>,

    /// OS keyring service holding the password for `username`.
    pub keyring_service: Option<String>,

    /// Family-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl EngineConfiguration {
    /// Creates a configuration without credentials or options.
    pub fn new(
        name: impl Into<String>,
        family: impl Into<String>,
        connection_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            connection_string: connection_string.into(),
            ..Self::default()
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Returns a family-specific option.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Resolves the credentials reference.
    ///
    /// An environment variable that is named but unset is a configuration
    /// error. A keyring entry that does not exist resolves to `None`.
    pub fn password(&self) -> Result<Option<String>> {
        if let Some(var) = &self.password_env {
            return std::env::var(var).map(Some).map_err(|_| {
                RelayError::config(format!(
                    "Environment variable {var} for engine '{}' is not set",
                    self.name
                ))
            });
        }

        let Some(service) = &self.keyring_service else {
            return Ok(None);
        };
        let user = self.username.as_deref().ok_or_else(|| {
            RelayError::config(format!(
                "Engine '{}' uses the keyring but has no username",
                self.name
            ))
        })?;

        let entry = keyring::Entry::new(service, user)
            .map_err(|e| RelayError::config(format!("Failed to access keyring: {e}")))?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(RelayError::config(format!(
                "Failed to retrieve password from keyring: {e}"
            ))),
        }
    }
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("db-relay")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(|e| {
            RelayError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })?;

        for (name, engine) in config.engines.iter_mut() {
            if engine.name.is_empty() {
                engine.name = name.clone();
            }
        }
        Ok(config)
    }

    /// Gets a named engine configuration.
    pub fn get_engine(&self, name: &str) -> Result<&EngineConfiguration> {
        self.engines
            .get(name)
            .ok_or_else(|| RelayError::config(format!("Unknown engine '{name}'")))
    }
}
