//! Gateway settings file (`objgate.toml`).
//!
//! Every section is optional; missing keys fall back to the defaults below.

use serde::Deserialize;
use std::{path::Path, time::Duration};
use thiserror::Error;
use tokio::fs;

use super::types::{de_duration, de_opt_duration};

// -----------------------------------------------------------------------------
// ----- Settings --------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub backend: BackendSettings,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub cache: CacheConfig,
}

// -----------------------------------------------------------------------------
// ----- Settings: Static ------------------------------------------------------

impl Settings {
    pub async fn from_file_async(path: &Path) -> Result<Settings, SettingsError> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| SettingsError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Settings, SettingsError> {
        let settings: Settings =
            toml::from_str(raw).map_err(|e| SettingsError::Toml { source: e })?;
        settings.validate()?;
        Ok(settings)
    }
}

// -----------------------------------------------------------------------------
// ----- Settings: Private -----------------------------------------------------

impl Settings {
    fn validate(&self) -> Result<(), SettingsError> {
        if self.backend.host.trim().is_empty() {
            return Err(SettingsError::InvalidField("backend.host".into()));
        }
        if self.pool.max_size == 0 {
            return Err(SettingsError::InvalidField("pool.max_size".into()));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(SettingsError::InvalidField("pool.min_idle".into()));
        }
        if self.pool.health_check_interval.is_zero() {
            return Err(SettingsError::InvalidField(
                "pool.health_check_interval".into(),
            ));
        }
        if self.session.timeout.is_zero() {
            return Err(SettingsError::InvalidField("session.timeout".into()));
        }
        if self.session.cleanup_interval.is_zero() {
            return Err(SettingsError::InvalidField(
                "session.cleanup_interval".into(),
            ));
        }
        if self.cache.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(SettingsError::InvalidField("cache.sweep_interval".into()));
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- BackendSettings -------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSettings {
    pub name: String,
    pub host: String,
    pub port: u16,

    #[serde(deserialize_with = "de_duration")]
    pub connect_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            name: "backend".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8069,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- PoolConfig ------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_size: usize,

    /// Connections opened eagerly at start-up.
    pub min_idle: usize,

    #[serde(deserialize_with = "de_duration")]
    pub acquire_timeout: Duration,

    /// Extra attempts after the first failed connect.
    pub retry_count: u32,

    #[serde(deserialize_with = "de_duration")]
    pub base_retry_delay: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_idle: 0,
            acquire_timeout: Duration::from_secs(30),
            retry_count: 3,
            base_retry_delay: Duration::from_millis(200),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RateLimitConfig -------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// `<= 0` disables limiting.
    pub requests_per_minute: i64,

    /// Bucket capacity. Defaults to `requests_per_minute`.
    pub burst: Option<u32>,

    /// Wait for a token (true) or reject immediately (false).
    pub block: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 0,
            burst: None,
            block: true,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionConfig ---------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    #[serde(deserialize_with = "de_duration")]
    pub timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub cleanup_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- CacheConfig -----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Zero turns the cache into a pass-through.
    #[serde(deserialize_with = "de_duration")]
    pub default_ttl: Duration,

    pub max_entries: usize,

    #[serde(deserialize_with = "de_opt_duration")]
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5 * 60),
            max_entries: 1000,
            sweep_interval: None,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid or missing field '{0}'")]
    InvalidField(String),

    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
