//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tracklet/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tracklet/` (~/.config/tracklet/)
//! - Data: `$XDG_DATA_HOME/tracklet/` (~/.local/share/tracklet/)
//! - Cache: `$XDG_CACHE_HOME/tracklet/` (~/.cache/tracklet/)
//! - State/Logs: `$XDG_STATE_HOME/tracklet/` (~/.local/state/tracklet/)

use crate::dispatch::DispatchMode;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_CACHE_HOME or ~/.cache
fn xdg_cache_home() -> PathBuf {
    std::env::var("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".cache"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Tracker identity and endpoint
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Dispatch loop and offline cache tuning
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tracker endpoint configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Collection endpoint, e.g. `https://analytics.example.com/matomo.php`
    pub api_url: Option<String>,

    /// Site id reported with every event
    #[serde(default = "default_site_id")]
    pub site_id: u32,

    /// Tracker name, used to namespace persisted settings
    #[serde(default = "default_tracker_name")]
    pub name: String,

    /// Base URL that relative `url` parameters are resolved against
    pub application_base_url: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            site_id: default_site_id(),
            name: default_tracker_name(),
            application_base_url: None,
        }
    }
}

fn default_site_id() -> u32 {
    1
}

pub(crate) fn default_tracker_name() -> String {
    "Default Tracker".to_string()
}

/// Dispatch configuration
///
/// Durations are signed milliseconds because negative values carry meaning:
/// a negative interval disables the timer, a negative cache age disables
/// the offline cache.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Pause between dispatch cycles (0 = immediate, <0 = manual only)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,

    /// Connect/read timeout per request
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Gzip POST bodies
    #[serde(default)]
    pub gzip: bool,

    /// When the dispatcher may talk to the network
    #[serde(default)]
    pub mode: DispatchMode,

    /// Offline cache retention (>0 = limit, 0 = unlimited, <0 = disabled)
    #[serde(default = "default_max_cache_age_ms")]
    pub max_cache_age_ms: i64,

    /// Offline cache size bound in bytes (0 = unlimited)
    #[serde(default = "default_max_cache_size_bytes")]
    pub max_cache_size_bytes: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            gzip: false,
            mode: DispatchMode::default(),
            max_cache_age_ms: default_max_cache_age_ms(),
            max_cache_size_bytes: default_max_cache_size_bytes(),
        }
    }
}

impl DispatchConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "dispatch.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_interval_ms() -> i64 {
    120 * 1000
}

fn default_connect_timeout_ms() -> u64 {
    5 * 1000
}

pub(crate) fn default_max_cache_age_ms() -> i64 {
    24 * 60 * 60 * 1000
}

pub(crate) fn default_max_cache_size_bytes() -> u64 {
    4 * 1024 * 1024
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.dispatch.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tracklet/config.toml` (~/.config/tracklet/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tracklet").join("config.toml")
    }

    /// Returns the data directory path (for the settings database)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tracklet")
    }

    /// Returns the cache directory path (for offline event containers)
    pub fn cache_dir() -> PathBuf {
        xdg_cache_home().join("tracklet")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tracklet")
    }

    /// Returns the settings database path
    ///
    /// `$XDG_DATA_HOME/tracklet/settings.db`
    pub fn settings_path() -> PathBuf {
        Self::data_dir().join("settings.db")
    }

    /// Returns the container directory for one collection host
    ///
    /// `$XDG_CACHE_HOME/tracklet/events/<host>/`
    pub fn event_cache_dir(host: &str) -> PathBuf {
        Self::cache_dir().join("events").join(host)
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("tracklet.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }

        if std::env::var("XDG_CACHE_HOME").is_err() {
            std::env::set_var("XDG_CACHE_HOME", home.join(".cache"));
        }
    }
}
