//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value for '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("Invalid timezone '{0}': not a known IANA zone")]
    InvalidTimezone(String),

    #[error("Invalid next_quota_reset_datetime '{0}': expected \"YYYY-MM-DD HH:MM\"")]
    InvalidResetDatetime(String),

    #[error("Invalid reset_after '{0}': expected \"HH:MM\"")]
    InvalidResetTime(String),
}
