//! Client configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/sluice/config.toml)
//! 3. Environment variables (SLUICE_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix
const ENV_PREFIX: &str = "SLUICE";

/// Client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WebSocket URL of the sync server (optional)
    pub url: Option<String>,

    /// Idle time after which a keepalive ping is sent
    pub ping_interval_secs: u64,

    /// How long the host may stay inactive before the connection is suspended
    pub background_grace_secs: u64,

    /// First reconnect delay
    pub reconnect_floor_ms: u64,

    /// Upper bound for the reconnect delay
    pub reconnect_ceiling_ms: u64,

    /// How long a call may wait for its response without a connection
    pub request_timeout_secs: u64,

    /// Lead time for the token-expiring notice
    pub token_expiry_margin_secs: u64,

    /// Where to persist the checksum cache between runs (optional)
    pub cache_path: Option<PathBuf>,

    pub log_level: String,

    /// Log to this file instead of stderr (optional)
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            ping_interval_secs: 60,
            background_grace_secs: 30,
            reconnect_floor_ms: 100,
            reconnect_ceiling_ms: 1250,
            request_timeout_secs: 15,
            token_expiry_margin_secs: 60,
            cache_path: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (SLUICE_URL, SLUICE_PING_INTERVAL_SECS, ...)
    /// 2. Config file (~/.config/sluice/config.toml or SLUICE_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // SLUICE_URL
        if let Ok(val) = std::env::var(format!("{}_URL", ENV_PREFIX)) {
            self.url = if val.is_empty() { None } else { Some(val) };
        }

        if let Some(secs) = env_u64("PING_INTERVAL_SECS")? {
            self.ping_interval_secs = secs;
        }
        if let Some(secs) = env_u64("BACKGROUND_GRACE_SECS")? {
            self.background_grace_secs = secs;
        }
        if let Some(secs) = env_u64("REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = secs;
        }

        // SLUICE_LOG_LEVEL
        if let Ok(val) = std::env::var(format!("{}_LOG_LEVEL", ENV_PREFIX)) {
            if !val.is_empty() {
                self.log_level = val;
            }
        }

        // SLUICE_CACHE_PATH
        if let Ok(val) = std::env::var(format!("{}_CACHE_PATH", ENV_PREFIX)) {
            self.cache_path = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with SLUICE_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sluice")
            .join("config.toml")
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn background_grace(&self) -> Duration {
        Duration::from_secs(self.background_grace_secs)
    }

    pub fn reconnect_floor(&self) -> Duration {
        Duration::from_millis(self.reconnect_floor_ms)
    }

    pub fn reconnect_ceiling(&self) -> Duration {
        Duration::from_millis(self.reconnect_ceiling_ms.max(self.reconnect_floor_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn token_expiry_margin(&self) -> Duration {
        Duration::from_secs(self.token_expiry_margin_secs)
    }
}

fn env_u64(suffix: &str) -> Result<Option<u64>> {
    let name = format!("{}_{}", ENV_PREFIX, suffix);
    match std::env::var(&name) {
        Ok(val) if !val.is_empty() => val
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a whole number, got {:?}", name, val)),
        _ => Ok(None),
    }
}
