//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/intempt/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/intempt/` (~/.config/intempt/)
//! - Data: `$XDG_DATA_HOME/intempt/` (~/.local/share/intempt/)
//! - State/Logs: `$XDG_STATE_HOME/intempt/` (~/.local/state/intempt/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

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

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Credentials for the shared client (optional)
    #[serde(default)]
    pub client: ClientConfig,

    /// Queueing and delivery tuning
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Beacon region debouncing
    #[serde(default)]
    pub regions: RegionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Credentials used when the shared client is built lazily
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ClientConfig {
    /// Intempt organization id
    pub org_id: Option<String>,
    /// Intempt tracker (source) id
    pub tracker_id: Option<String>,
    /// Tracker security token
    pub token: Option<String>,
}

impl ClientConfig {
    /// Returns all three credentials if every one is present
    pub fn credentials(&self) -> Option<(&str, &str, &str)> {
        match (&self.org_id, &self.tracker_id, &self.token) {
            (Some(org), Some(tracker), Some(token)) => {
                Some((org.as_str(), tracker.as_str(), token.as_str()))
            }
            _ => None,
        }
    }
}

/// Event queue and delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Collection endpoint base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Events per request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum queued events before the oldest is dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Transport timeout per request in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first attempt for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Worker wakeup interval when no enqueue notification arrives
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Save unsent events to storage on teardown and restore them on start
    #[serde(default = "default_persist_queue")]
    pub persist_queue: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            persist_queue: default_persist_queue(),
        }
    }
}

impl DeliveryConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("delivery.endpoint must not be empty".to_string()));
        }
        if self.batch_size == 0 || self.batch_size > 100 {
            return Err(Error::Config(
                "delivery.batch_size must be between 1 and 100".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config(
                "delivery.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("delivery.timeout_ms must be positive".to_string()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(
                "delivery.backoff_base_ms must not exceed delivery.backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

fn default_endpoint() -> String {
    "https://api.intempt.com/v1".to_string()
}

fn default_batch_size() -> usize {
    20
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_persist_queue() -> bool {
    true
}

/// Beacon region monitoring configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RegionConfig {
    /// How long a new proximity reading must hold before it is committed
    #[serde(default = "default_stable_window_ms")]
    pub stable_window_ms: u64,

    /// Consecutive agreeing samples required before a commit
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,

    /// Enqueue an event for every enter/exit
    #[serde(default = "default_emit_events")]
    pub emit_events: bool,

    /// Collection name used for enter/exit events
    #[serde(default = "default_region_collection")]
    pub collection: String,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            stable_window_ms: default_stable_window_ms(),
            min_samples: default_min_samples(),
            emit_events: default_emit_events(),
            collection: default_region_collection(),
        }
    }
}

impl RegionConfig {
    pub fn stable_window(&self) -> Duration {
        Duration::from_millis(self.stable_window_ms)
    }
}

fn default_stable_window_ms() -> u64 {
    3_000
}

fn default_min_samples() -> u32 {
    1
}

fn default_emit_events() -> bool {
    true
}

fn default_region_collection() -> String {
    "beacon".to_string()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Start with log output switched on
    #[serde(default)]
    pub enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            enabled: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
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
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.delivery.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/intempt/config.toml` (~/.config/intempt/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("intempt").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite store)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("intempt")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("intempt")
    }

    /// Returns the durable store path
    ///
    /// `$XDG_DATA_HOME/intempt/store.db` (~/.local/share/intempt/store.db)
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("intempt.log")
    }
}
