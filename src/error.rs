//! # Error Types
//!
//! Custom error types for Aqua Ingest using `thiserror`.

use thiserror::Error;

/// Main error type for Aqua Ingest
#[derive(Debug, Error)]
pub enum IngestError {
    /// Inbound payload could not be decoded as a sensor reading
    #[error("Parse error: {0}")]
    Parse(String),

    /// On-disk document is not valid JSON of the expected shape
    #[error("Store corruption in {path}: {reason}")]
    StoreCorruption { path: String, reason: String },

    /// Remote propagation failed
    #[error("Sync error: {0}")]
    Sync(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No usable serial device
    #[error("Serial port not found: {0}")]
    SerialPortNotFound(String),

    /// GNSS modem rejected or did not answer a command
    #[error("GNSS error: {0}")]
    Gnss(String),

    /// A bounded operation did not finish in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Document serialization errors
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Aqua Ingest
pub type Result<T> = std::result::Result<T, IngestError>;
