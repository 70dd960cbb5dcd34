//! Configuration loader and validator for the queue store.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::lease::LeaseConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub database: DatabaseConfig,
    pub lease: LeaseSettings,
}

/// Store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub busy_timeout_ms: u64,
}

/// Lease behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseSettings {
    /// How often an open lease refreshes its claim.
    pub keep_alive_secs: u64,
    /// Age after which an unrefreshed claim may be taken over.
    pub claim_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Config {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            keep_alive_interval: Duration::from_secs(self.lease.keep_alive_secs),
            claim_timeout: Duration::from_secs(self.lease.claim_timeout_secs),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
/// - `DATABASE_URL` overrides `database.url`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        cfg.database.url = url;
    }
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }
    if cfg.database.busy_timeout_ms == 0 {
        return Err(ConfigError::Invalid("database.busy_timeout_ms must be > 0"));
    }
    if cfg.lease.keep_alive_secs == 0 {
        return Err(ConfigError::Invalid("lease.keep_alive_secs must be > 0"));
    }
    if cfg.lease.claim_timeout_secs <= cfg.lease.keep_alive_secs {
        return Err(ConfigError::Invalid(
            "lease.claim_timeout_secs must be greater than lease.keep_alive_secs",
        ));
    }
    Ok(())
}

/// Example configuration file.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./data/txqueue.db"
  busy_timeout_ms: 5000

lease:
  keep_alive_secs: 60
  claim_timeout_secs: 300
"#
}
