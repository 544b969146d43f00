//! Client configuration
//!
//! Values come from an optional file, overridden by `KEYSMITH_*` environment
//! variables (`KEYSMITH_REDIS_URL`, `KEYSMITH_ROOT`, ...).

use std::time::Duration;

use config::{Config, Environment, File};
use keysmith_common::{DEFAULT_IDENTIFIER_SIZE, Key, KeySmithError, MemoKey, Result};
use serde::Deserialize;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_LOCK_EXPIRATION_MS: u64 = 30_000;
pub const DEFAULT_VALUE_EXPIRATION_MS: u64 = 600_000;

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeySmithConfig {
    pub redis_url: String,
    /// Prefix of every store key and channel
    pub root: String,
    pub identifier_size: usize,
    pub default_lock_expiration_ms: u64,
    pub default_value_expiration_ms: u64,
}

impl Default for KeySmithConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            root: String::new(),
            identifier_size: DEFAULT_IDENTIFIER_SIZE,
            default_lock_expiration_ms: DEFAULT_LOCK_EXPIRATION_MS,
            default_value_expiration_ms: DEFAULT_VALUE_EXPIRATION_MS,
        }
    }
}

impl KeySmithConfig {
    /// Load from `file` (if any) and the environment, then validate.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path));
        }
        builder = builder.add_source(Environment::with_prefix("keysmith").try_parsing(true));

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KeySmithError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.identifier_size == 0 {
            return Err(KeySmithError::Config(
                "identifier_size must be at least 1".to_string(),
            ));
        }
        if self.default_lock_expiration_ms == 0 {
            return Err(KeySmithError::Config(
                "default_lock_expiration_ms must be positive".to_string(),
            ));
        }
        if self.default_value_expiration_ms == 0 {
            return Err(KeySmithError::Config(
                "default_value_expiration_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_lock_expiration(&self) -> Duration {
        Duration::from_millis(self.default_lock_expiration_ms)
    }

    pub fn default_value_expiration(&self) -> Duration {
        Duration::from_millis(self.default_value_expiration_ms)
    }

    /// Lock key under the configured root with the default expiration
    pub fn key(&self, name: impl Into<String>) -> Result<Key> {
        Key::new(self.root.clone(), name, self.default_lock_expiration())
    }

    /// Memo key under the configured root with the default expirations
    pub fn memo_key(&self, name: impl Into<String>) -> Result<MemoKey> {
        MemoKey::new(
            self.root.clone(),
            name,
            self.default_value_expiration(),
            self.default_lock_expiration(),
        )
    }
}
