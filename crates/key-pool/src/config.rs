//! Configuration types and loading
//!
//! Engine tunables come from TOML. Credentials never live in the TOML itself:
//! they are read from the env var named by `keys_env`, or failing that from
//! `keys_file` (one key per line, `#` comments allowed).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use classifier::{BackoffClassifier, ErrorClassifier, ResetTimestampClassifier, RetryAfterClassifier};
use common::Secret;
use serde::Deserialize;
use tracing::info;

use crate::engine::{DEFAULT_MAX_RETRIES, EngineOptions};
use crate::pool::CredentialPool;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct RotationConfig {
    pub engine: EngineConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Upstream-service family, selecting the failure classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassifierFamily {
    RetryAfter,
    ResetTimestamp,
    Backoff,
}

/// Engine and classifier settings
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    pub family: ClassifierFamily,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default)]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub proactive_threshold: Option<u64>,
}

/// Where to find the credential list
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_keys_env")]
    pub keys_env: String,
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub keys: Vec<Secret<String>>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            keys_env: default_keys_env(),
            keys_file: None,
            keys: Vec::new(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_backoff_cap_secs() -> u64 {
    64
}

fn default_keys_env() -> String {
    "KEY_POOL_KEYS".to_string()
}

impl EngineConfig {
    pub fn validate(&self) -> common::Result<()> {
        if self.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }
        if self.default_cooldown_secs == 0 {
            return Err(common::Error::Config(
                "default_cooldown_secs must be greater than 0".into(),
            ));
        }
        if self.backoff_cap_secs == 0 {
            return Err(common::Error::Config(
                "backoff_cap_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn default_cooldown(&self) -> Duration {
        Duration::from_secs(self.default_cooldown_secs)
    }

    /// Build the classifier for the configured family.
    pub fn build_classifier(&self) -> Arc<dyn ErrorClassifier> {
        let cooldown = self.default_cooldown();
        match self.family {
            ClassifierFamily::RetryAfter => Arc::new(RetryAfterClassifier::new(cooldown)),
            ClassifierFamily::ResetTimestamp => Arc::new(ResetTimestampClassifier::new(cooldown)),
            ClassifierFamily::Backoff => Arc::new(BackoffClassifier::new(
                Duration::from_secs(self.backoff_cap_secs),
                cooldown,
            )),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            proactive_threshold: self.proactive_threshold,
        }
    }
}

impl CredentialsConfig {
    /// Fill `keys` from the environment or the key file.
    ///
    /// Resolution order:
    /// 1. `keys_env` env var, if set and non-empty
    /// 2. `keys_file`, if configured
    ///
    /// Finding no keys at all is an error.
    pub fn resolve(&mut self) -> common::Result<()> {
        if let Ok(raw) = std::env::var(&self.keys_env) {
            let keys = common::parse_key_list(&raw);
            if !keys.is_empty() {
                info!(source = %self.keys_env, count = keys.len(), "credentials loaded from environment");
                self.keys = keys;
                return Ok(());
            }
        }

        if let Some(ref path) = self.keys_file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read keys_file {}: {e}",
                    path.display()
                ))
            })?;
            let keys = common::parse_key_list(&raw);
            if !keys.is_empty() {
                info!(source = %path.display(), count = keys.len(), "credentials loaded from file");
                self.keys = keys;
                return Ok(());
            }
        }

        Err(common::Error::NoCredentials(format!(
            "set {} or point keys_file at a non-empty key list",
            self.keys_env
        )))
    }
}

impl RotationConfig {
    /// Parse and validate TOML without resolving credentials.
    pub fn from_toml_str(contents: &str) -> common::Result<Self> {
        let config: RotationConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file and resolve credentials.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&contents)?;
        config.resolve_credentials()?;
        Ok(config)
    }

    pub fn validate(&self) -> common::Result<()> {
        self.engine.validate()
    }

    /// See [`CredentialsConfig::resolve`].
    pub fn resolve_credentials(&mut self) -> common::Result<()> {
        self.credentials.resolve()
    }

    /// Build a pool over the resolved credentials.
    pub fn build_pool(&self) -> CredentialPool {
        CredentialPool::from_keys(self.credentials.keys.clone(), self.engine.default_cooldown())
    }
}
