use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cojson_core::config::{Config, StorageBackend};
use cojson_core::core_crypto::{AgentSecret, PureCrypto};
use cojson_core::core_storage::open_storage;
use cojson_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use cojson_core::metrics::init_metrics;
use cojson_core::server::SyncServer;
use cojson_core::{LocalNode, RawCoId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "cojson")]
#[command(author, version, about = "CoValue sync server", long_about = None)]
struct Args {
    /// TOML configuration file; environment overrides apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sync server
    Serve {
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// sqlite, sqlite_async, redb or memory
        #[arg(long)]
        storage: Option<StorageBackend>,

        /// Database file for on-disk backends
        #[arg(long)]
        db: Option<PathBuf>,

        /// Server account credentials, created on first start
        #[arg(long, default_value = "./data/identity.json")]
        identity: PathBuf,
    },
    /// Write the effective configuration to a TOML file
    InitConfig {
        #[arg(default_value = "cojson.toml")]
        path: PathBuf,
    },
}

/// What the server needs to come back as the same account
#[derive(Serialize, Deserialize)]
struct Identity {
    account_id: RawCoId,
    agent_secret: String,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

async fn open_node(config: Config, identity_path: &Path) -> Result<LocalNode> {
    let storage = open_storage(&config.storage, config.node.max_bytes_per_signature).await?;

    if identity_path.exists() {
        let raw = std::fs::read_to_string(identity_path)
            .with_context(|| format!("reading {}", identity_path.display()))?;
        let identity: Identity = serde_json::from_str(&raw).context("parsing identity file")?;
        let secret = AgentSecret::parse(&identity.agent_secret)?;
        let node = LocalNode::with_account(config, Arc::new(PureCrypto::new()), secret, identity.account_id, storage)
            .await?;
        return Ok(node);
    }

    if config.storage.backend != StorageBackend::Memory {
        // An identity without its account would be useless next start
        if storage.stored_co_value_ids(0, 1).await?.first().is_some() {
            anyhow::bail!("storage already holds data but {} is missing", identity_path.display());
        }
    }
    let node = LocalNode::with_new_account(config)?;
    node.set_storage(storage).await;

    if let Some(dir) = identity_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let identity = Identity { account_id: node.account_id().clone(), agent_secret: node.agent_secret().expose() };
    std::fs::write(identity_path, serde_json::to_string_pretty(&identity)?)
        .with_context(|| format!("writing {}", identity_path.display()))?;
    info!(account = %node.account_id(), path = %identity_path.display(), "Created server account");
    Ok(node)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = args.log_level {
        log_config.level = level;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    init_metrics();

    match args.command {
        Command::Serve { bind, storage, db, identity } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind;
            }
            if let Some(backend) = storage {
                config.storage.backend = backend;
            }
            if let Some(db) = db {
                config.storage.path = db;
            }
            config.validate()?;

            let node = open_node(config, &identity).await?;
            SyncServer::new(node).run().await?;
        }
        Command::InitConfig { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
        }
    }
    Ok(())
}
