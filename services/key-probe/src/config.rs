//! Probe configuration
//!
//! The `[engine]` and `[credentials]` tables are the library's
//! `RotationConfig`, flattened in; this module only adds the `[probe]` table
//! describing the endpoint to exercise.

use key_pool::RotationConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub rotation: RotationConfig,
    pub probe: ProbeConfig,
}

/// Endpoint and load settings
#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    pub url: String,
    #[serde(default = "default_requests")]
    pub requests: usize,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_requests() -> usize {
    10
}

fn default_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    1
}

impl ProbeConfig {
    pub fn validate(&self) -> common::Result<()> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "probe.url must be an http(s) URL, got {}",
                self.url
            )));
        }
        if self.requests == 0 {
            return Err(common::Error::Config(
                "probe.requests must be greater than 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(common::Error::Config(
                "probe.concurrency must be greater than 0".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(common::Error::Config(
                "probe.timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Parse and validate TOML without resolving credentials.
    pub fn from_toml_str(contents: &str) -> common::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.rotation.validate()?;
        config.probe.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file and resolve credentials.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&contents)?;
        config.rotation.resolve_credentials()?;
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("key-probe.toml")
    }
}
