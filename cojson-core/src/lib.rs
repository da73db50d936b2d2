//! Replicated, end-to-end encrypted CoValues and the protocol that keeps
//! their replicas in sync across clients, servers and storage.
//!
//! Start from [`LocalNode`]: it owns an account, creates and mutates
//! CoValues, persists them through a [`core_storage::StorageApi`] backend
//! and exchanges content with peers over any [`core_sync::PeerConnection`].

pub mod config;
pub mod core_covalue;
pub mod core_crypto;
pub mod core_group;
pub mod core_node;
pub mod core_storage;
pub mod core_sync;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use core_covalue::{CoValueHeader, CoValueType, RawCoId, Ruleset, SessionOwner};
pub use core_group::Role;
pub use core_node::{LoadOutcome, LocalNode, NodeError, NodeResult, Privacy, TransactionContext};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogLevel};
