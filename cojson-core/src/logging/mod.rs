//! Logging setup
//!
//! Everything logs through `tracing`. Binaries install one global
//! subscriber here; `RUST_LOG` overrides the configured level.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod error;
mod level;

pub use error::LoggingError;
pub use level::LogLevel;

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub with_timestamp: bool,
    pub with_target: bool,
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            with_timestamp: true,
            with_target: true,
            json_format: false,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self { level, ..Default::default() }
    }

    pub fn with_timestamp(mut self, enabled: bool) -> Self {
        self.with_timestamp = enabled;
        self
    }

    pub fn with_target(mut self, enabled: bool) -> Self {
        self.with_target = enabled;
        self
    }

    pub fn json_format(mut self, enabled: bool) -> Self {
        self.json_format = enabled;
        self
    }
}

impl TryFrom<&LoggingConfig> for LogConfig {
    type Error = LoggingError;

    fn try_from(config: &LoggingConfig) -> Result<Self, Self::Error> {
        Ok(LogConfig::new(config.level.parse()?)
            .with_timestamp(config.with_timestamp)
            .with_target(config.with_target)
            .json_format(config.json_format))
    }
}

pub fn init_logging() -> Result<(), LoggingError> {
    init_logging_with_config(LogConfig::default())
}

/// Install the global subscriber.
///
/// Fails if one is already installed, so call it once per process.
pub fn init_logging_with_config(config: LogConfig) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let init_failed = |e: tracing_subscriber::util::TryInitError| LoggingError::InitializationFailed(e.to_string());

    let registry = tracing_subscriber::registry().with(env_filter);
    match (config.json_format, config.with_timestamp) {
        (true, true) => registry.with(fmt::layer().json().with_target(config.with_target)).try_init(),
        (true, false) => registry
            .with(fmt::layer().json().without_time().with_target(config.with_target))
            .try_init(),
        (false, true) => registry.with(fmt::layer().with_target(config.with_target)).try_init(),
        (false, false) => registry
            .with(fmt::layer().without_time().with_target(config.with_target))
            .try_init(),
    }
    .map_err(init_failed)
}
