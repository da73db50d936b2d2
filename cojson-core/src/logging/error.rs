//! Logging errors

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoggingError {
    /// A global subscriber was already installed
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("Invalid logging configuration: {0}")]
    InvalidConfiguration(String),
}
