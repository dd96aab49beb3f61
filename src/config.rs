//! Configuration management for Tallyman.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{Result, TallymanError};
use crate::ratelimit::{RateLimitPolicy, DEFAULT_KEY_PREFIX};

/// Prefix for environment variable overrides, e.g. `TALLYMAN__STORE__URL`.
const ENV_PREFIX: &str = "TALLYMAN";

/// Main configuration for Tallyman.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallymanConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum number of pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a unit of work may wait for a free connection
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,

    /// How long opening a new connection may take
    #[serde(default = "default_create_timeout")]
    pub create_timeout_ms: u64,

    /// How long health-checking a returned connection may take
    #[serde(default = "default_recycle_timeout")]
    pub recycle_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            wait_timeout_ms: default_wait_timeout(),
            create_timeout_ms: default_create_timeout(),
            recycle_timeout_ms: default_recycle_timeout(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_wait_timeout() -> u64 {
    500
}

fn default_create_timeout() -> u64 {
    1000
}

fn default_recycle_timeout() -> u64 {
    500
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix added to every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Named policies, e.g. `login: { allowance: 5, interval: 60 }`
    #[serde(default)]
    pub limits: HashMap<String, RateLimitPolicy>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            limits: HashMap::new(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TallymanConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TallymanConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TallymanError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file, then apply
    /// `TALLYMAN__SECTION__FIELD` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TallymanConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.store.url.is_empty() {
            return Err(TallymanError::Config("store.url must not be empty".to_string()));
        }
        if self.store.pool_size == 0 {
            return Err(TallymanError::Config("store.pool_size must be > 0".to_string()));
        }
        for (name, policy) in &self.rate_limiting.limits {
            policy
                .validate()
                .map_err(|e| TallymanError::Config(format!("limit {:?}: {}", name, e)))?;
        }
        Ok(())
    }

    /// Look up a named policy.
    pub fn limit(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.rate_limiting.limits.get(name)
    }
}
