//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field has a default, so an empty file (or no file
//! at all, see [`Config::load_or_default`]) yields a working setup that
//! listens on `0.0.0.0:5000` and writes `coordinates.json`.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{IngestError, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub gnss: GnssConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// TCP listener configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Answer `RATE_LIMITED` instead of `OK` when a reading is dropped
    #[serde(default)]
    pub report_rate_limited: bool,
}

/// Entry store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_save_retry_attempts")]
    pub save_retry_attempts: u32,

    #[serde(default = "default_save_retry_initial_ms")]
    pub save_retry_initial_ms: u64,

    #[serde(default = "default_save_retry_max_ms")]
    pub save_retry_max_ms: u64,
}

/// Rate limiting configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Remote (git) replication configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_repo_path")]
    pub repo_path: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_push")]
    pub push: bool,
}

/// GNSS modem configuration
#[derive(Debug, Deserialize, Clone)]
pub struct GnssConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Serial device; empty tries the usual modem devices in turn
    #[serde(default = "default_gnss_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_gnss_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_warmup_secs")]
    pub warmup_secs: u64,

    #[serde(default = "default_max_fix_age_secs")]
    pub max_fix_age_secs: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily-rolling log files; empty disables file logging
    #[serde(default)]
    pub log_dir: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 5000 }
fn default_read_timeout_ms() -> u64 { 5000 }
fn default_max_payload_bytes() -> usize { 1024 }
fn default_max_connections() -> usize { 32 }

fn default_store_path() -> String { "coordinates.json".to_string() }
fn default_write_timeout_ms() -> u64 { 5000 }
fn default_save_retry_attempts() -> u32 { 3 }
fn default_save_retry_initial_ms() -> u64 { 100 }
fn default_save_retry_max_ms() -> u64 { 2000 }

fn default_window_secs() -> u64 { 30 }

fn default_repo_path() -> String { ".".to_string() }
fn default_command_timeout_ms() -> u64 { 30000 }
fn default_push() -> bool { true }

fn default_gnss_port() -> String { "/dev/ttyS0".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_gnss_timeout_ms() -> u64 { 1000 }
fn default_warmup_secs() -> u64 { 10 }
fn default_max_fix_age_secs() -> u64 { 60 }

fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_ms: default_read_timeout_ms(),
            max_payload_bytes: default_max_payload_bytes(),
            max_connections: default_max_connections(),
            report_rate_limited: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            write_timeout_ms: default_write_timeout_ms(),
            save_retry_attempts: default_save_retry_attempts(),
            save_retry_initial_ms: default_save_retry_initial_ms(),
            save_retry_max_ms: default_save_retry_max_ms(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window_secs: default_window_secs() }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            repo_path: default_repo_path(),
            command_timeout_ms: default_command_timeout_ms(),
            push: default_push(),
        }
    }
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_gnss_port(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_gnss_timeout_ms(),
            warmup_secs: default_warmup_secs(),
            max_fix_age_secs: default_max_fix_age_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl StoreConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn invalid(msg: impl std::fmt::Display) -> IngestError {
    IngestError::Config(toml::de::Error::custom(msg))
}

fn check_ms(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(invalid(format!("{} must be between 1 and {}", name, max)));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use aqua_ingest::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is missing
    ///
    /// Any other failure (unreadable file, bad TOML, invalid values) is
    /// still reported.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::metadata(path.as_ref()) {
            Ok(_) => Self::load(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Server
        if self.server.host.is_empty() {
            return Err(invalid("server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(invalid("server port cannot be 0"));
        }

        check_ms("read_timeout_ms", self.server.read_timeout_ms, 60000)?;

        if self.server.max_payload_bytes < 16 || self.server.max_payload_bytes > 65536 {
            return Err(invalid("max_payload_bytes must be between 16 and 65536"));
        }

        if self.server.max_connections == 0 {
            return Err(invalid("max_connections must be greater than 0"));
        }

        // Store
        if self.store.path.is_empty() {
            return Err(invalid("store path cannot be empty"));
        }

        check_ms("write_timeout_ms", self.store.write_timeout_ms, 60000)?;

        if self.store.save_retry_attempts == 0 {
            return Err(invalid("save_retry_attempts must be greater than 0"));
        }

        check_ms("save_retry_initial_ms", self.store.save_retry_initial_ms, 60000)?;
        check_ms("save_retry_max_ms", self.store.save_retry_max_ms, 60000)?;

        if self.store.save_retry_initial_ms > self.store.save_retry_max_ms {
            return Err(invalid("save_retry_initial_ms must not exceed save_retry_max_ms"));
        }

        // Sync
        if self.sync.enabled && self.sync.repo_path.is_empty() {
            return Err(invalid("sync repo_path cannot be empty when enabled"));
        }

        check_ms("command_timeout_ms", self.sync.command_timeout_ms, 600000)?;

        // GNSS
        if ![9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600].contains(&self.gnss.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        check_ms("gnss timeout_ms", self.gnss.timeout_ms, 60000)?;

        if self.gnss.max_fix_age_secs == 0 {
            return Err(invalid("max_fix_age_secs must be greater than 0"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid("logging level must be one of: trace, debug, info, warn, error"));
        }

        Ok(())
    }
}
