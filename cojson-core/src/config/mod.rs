//! Node and server configuration
//!
//! Defaults, a TOML file, or `COJSON_<SECTION>_<KEY>` environment
//! overrides. Durations are written the humantime way (`30s`, `5m`).

use crate::core_covalue::DEFAULT_MAX_BYTES_PER_SIGNATURE;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub gc: GcConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bytes of transactions a session accumulates before a new signature checkpoint
    pub max_bytes_per_signature: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a load waits on peers before reporting unavailable
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,

    /// Known states per storage reconciliation batch
    pub reconcile_batch_size: u64,

    /// Reconcile stored CoValues with every upstream peer that connects
    pub reconcile_on_connect: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// SQLite through a connection pool, called inline
    Sqlite,
    /// SQLite with every call moved to the blocking pool
    SqliteAsync,
    Redb,
    /// Nothing survives the process
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(StorageBackend::Sqlite),
            "sqlite_async" | "sqlite-async" => Ok(StorageBackend::SqliteAsync),
            "redb" => Ok(StorageBackend::Redb),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("unknown storage backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Database file for on-disk backends
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Idle time after which a CoValue is unmounted
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,

    /// Maximum concurrent WebSocket peers
    pub max_connections: usize,

    /// Grace period for peers to drain on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { max_bytes_per_signature: DEFAULT_MAX_BYTES_PER_SIGNATURE }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            reconcile_batch_size: 100,
            reconcile_on_connect: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StorageBackend::Sqlite, path: PathBuf::from("./data/cojson.db") }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            max_age: Duration::from_secs(10 * 60),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 4200)),
            max_connections: 10_000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

/// Parse `var` if it is set
fn env_override<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue { var: var.to_string(), reason: e.to_string() }),
        Err(_) => Ok(None),
    }
}

fn env_duration(var: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(var) {
        Ok(raw) => humantime::parse_duration(&raw)
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue { var: var.to_string(), reason: e.to_string() }),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Defaults overridden by environment variables.
    ///
    /// Variables follow `COJSON_<SECTION>_<KEY>`, for example
    /// `COJSON_SYNC_LOAD_TIMEOUT=10s` or `COJSON_STORAGE_BACKEND=redb`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_override("COJSON_NODE_MAX_BYTES_PER_SIGNATURE")? {
            self.node.max_bytes_per_signature = v;
        }

        if let Some(v) = env_duration("COJSON_SYNC_LOAD_TIMEOUT")? {
            self.sync.load_timeout = v;
        }
        if let Some(v) = env_override("COJSON_SYNC_RECONCILE_BATCH_SIZE")? {
            self.sync.reconcile_batch_size = v;
        }
        if let Some(v) = env_override("COJSON_SYNC_RECONCILE_ON_CONNECT")? {
            self.sync.reconcile_on_connect = v;
        }

        if let Some(v) = env_override("COJSON_STORAGE_BACKEND")? {
            self.storage.backend = v;
        }
        if let Ok(path) = env::var("COJSON_STORAGE_PATH") {
            self.storage.path = PathBuf::from(path);
        }

        if let Some(v) = env_override("COJSON_GC_ENABLED")? {
            self.gc.enabled = v;
        }
        if let Some(v) = env_duration("COJSON_GC_INTERVAL")? {
            self.gc.interval = v;
        }
        if let Some(v) = env_duration("COJSON_GC_MAX_AGE")? {
            self.gc.max_age = v;
        }

        if let Some(v) = env_override("COJSON_SERVER_BIND_ADDRESS")? {
            self.server.bind_address = v;
        }
        if let Some(v) = env_override("COJSON_SERVER_MAX_CONNECTIONS")? {
            self.server.max_connections = v;
        }

        if let Ok(level) = env::var("COJSON_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(v) = env_override("COJSON_LOG_JSON")? {
            self.logging.json_format = v;
        }
        Ok(())
    }

    /// Load a TOML file; missing keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead { path: path.to_path_buf(), reason: e.to_string() })?;

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.max_bytes_per_signature == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_bytes_per_signature must be greater than 0".to_string(),
            ));
        }
        if self.sync.reconcile_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "reconcile_batch_size must be greater than 0".to_string(),
            ));
        }
        if self.sync.load_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed("load_timeout must be positive".to_string()));
        }
        if self.gc.enabled && self.gc.interval.is_zero() {
            return Err(ConfigError::ValidationFailed("gc interval must be positive".to_string()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_connections must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::FileWrite { path: path.to_path_buf(), reason: e.to_string() })?;

        Ok(())
    }
}
