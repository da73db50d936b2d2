/*
    errors.rs - Error types for the storage subsystem

    Covers every backend: SQLite (rusqlite + r2d2), redb and the in-memory
    store. Contention is handled inside the backends and never shows up here.
*/

use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("redb error: {0}")]
    Redb(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Lock poisoned: a thread panicked while holding the lock")]
    LockPoisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Helper to convert poison errors into StorageError
pub(crate) fn handle_poison<T>(_err: PoisonError<T>) -> StorageError {
    StorageError::LockPoisoned
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

macro_rules! redb_error {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for StorageError {
                fn from(err: $ty) -> Self {
                    StorageError::Redb(err.to_string())
                }
            }
        )*
    };
}

redb_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError
);
