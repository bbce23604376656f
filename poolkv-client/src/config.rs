//! # Endpoint and Pool Configuration
//!
//! Purpose: Describe the store endpoint and pool bounds, and load them from
//! TOML so the composing application owns configuration.
//!
//! ## Design Principles
//! 1. **Defaults Everywhere**: Every field has a default, so an empty file is valid.
//! 2. **Normalize Before Build**: Pool bounds are fixed up before the pool exists.
//! 3. **No Hidden Globals**: Settings are plain values passed to constructors.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, TemplateError, TemplateResult};

/// Default store host.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default store port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default socket and lease timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;
/// Default database index.
pub const DEFAULT_DATABASE: i64 = 0;
/// Default number of idle sessions kept warm.
pub const DEFAULT_CONNECTION_CACHE_SIZE: usize = 2;
/// Default upper bound on sessions.
pub const DEFAULT_CONNECTION_MAX_SIZE: usize = 5;

/// Endpoint and pool bounds for a [`ConnectionFactory`](crate::ConnectionFactory).
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Store host name or IP address.
    pub host: String,
    /// Store port.
    pub port: u16,
    /// Connect/read/write timeout and lease wait, in milliseconds. 0 disables them.
    pub timeout_ms: u64,
    /// Optional password sent with AUTH on every new session.
    pub password: Option<String>,
    /// Database selected on every new session when non-zero.
    pub database: i64,
    /// Idle sessions opened eagerly on start.
    #[serde(alias = "connection_cache_size")]
    pub min_idle: usize,
    /// Maximum sessions, idle plus leased.
    #[serde(alias = "connection_max_size")]
    pub max_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            password: None,
            database: DEFAULT_DATABASE,
            min_idle: DEFAULT_CONNECTION_CACHE_SIZE,
            max_size: DEFAULT_CONNECTION_MAX_SIZE,
        }
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout_ms", &self.timeout_ms)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("min_idle", &self.min_idle)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl PoolConfig {
    /// Returns `host:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Socket timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Raises `max_size` to `min_idle` when it is smaller. Never lowers it.
    pub fn normalized(mut self) -> Self {
        if self.max_size < self.min_idle {
            self.max_size = self.min_idle;
        }
        self
    }

    /// Rejects configurations a pool cannot be built from.
    ///
    /// Expects a normalized config.
    pub fn validate(&self) -> TemplateResult<()> {
        if self.host.trim().is_empty() {
            return Err(TemplateError::InvalidArgument("host must not be empty".into()));
        }
        if self.max_size == 0 {
            return Err(TemplateError::InvalidArgument(
                "max_size must be at least 1".into(),
            ));
        }
        if self.database < 0 {
            return Err(TemplateError::InvalidArgument(format!(
                "database index must not be negative, got {}",
                self.database
            )));
        }
        Ok(())
    }
}

/// Template-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TemplateSettings {
    /// Database selected before every command when set.
    pub db_index: Option<i64>,
}

/// Top-level settings file layout.
///
/// ```toml
/// [pool]
/// host = "127.0.0.1"
/// port = 6379
/// connection_cache_size = 2
/// connection_max_size = 5
///
/// [template]
/// db_index = 1
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool: PoolConfig,
    pub template: TemplateSettings,
}

impl Settings {
    /// Parses settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
