//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    #[error("Cannot write {path}: {reason}")]
    FileWrite { path: PathBuf, reason: String },

    /// TOML did not match the configuration shape
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(String),

    /// An environment override could not be parsed
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}
