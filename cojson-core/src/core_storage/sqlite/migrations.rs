//! Database migrations for the CoValue mirror
//!
//! Provides versioned migrations for the SQLite storage schema.
//! Each migration is applied atomically and tracked in the schema_version table.

use crate::core_storage::errors::StorageResult;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: Option<&'static str>,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "CoValues, sessions, transactions and signature checkpoints",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS coValues (
                    rowID INTEGER PRIMARY KEY,
                    id TEXT NOT NULL UNIQUE,
                    header TEXT NOT NULL UNIQUE
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    rowID INTEGER PRIMARY KEY,
                    coValue INTEGER NOT NULL,
                    sessionID TEXT NOT NULL,
                    lastIdx INTEGER NOT NULL,
                    lastSignature TEXT NOT NULL,
                    bytesSinceLastSignature INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (sessionID, coValue)
                );

                CREATE INDEX IF NOT EXISTS sessionsByCoValue ON sessions (coValue);

                CREATE TABLE IF NOT EXISTS transactions (
                    ses INTEGER NOT NULL,
                    idx INTEGER NOT NULL,
                    tx TEXT NOT NULL,
                    PRIMARY KEY (ses, idx)
                ) WITHOUT ROWID;

                CREATE TABLE IF NOT EXISTS signatureAfter (
                    ses INTEGER NOT NULL,
                    idx INTEGER NOT NULL,
                    signature TEXT NOT NULL,
                    PRIMARY KEY (ses, idx)
                ) WITHOUT ROWID;
            "#,
            down_sql: Some(
                r#"
                DROP TABLE IF EXISTS signatureAfter;
                DROP TABLE IF EXISTS transactions;
                DROP INDEX IF EXISTS sessionsByCoValue;
                DROP TABLE IF EXISTS sessions;
                DROP TABLE IF EXISTS coValues;
            "#,
            ),
        },
        Migration {
            version: 2,
            description: "Per-peer unsynced tracking",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS unsynced_covalues (
                    rowID INTEGER PRIMARY KEY,
                    co_value_id TEXT NOT NULL,
                    peer_id TEXT NOT NULL,
                    UNIQUE (co_value_id, peer_id)
                );

                CREATE INDEX IF NOT EXISTS idx_unsynced_covalues_co_value ON unsynced_covalues (co_value_id);
            "#,
            down_sql: Some(
                r#"
                DROP INDEX IF EXISTS idx_unsynced_covalues_co_value;
                DROP TABLE IF EXISTS unsynced_covalues;
            "#,
            ),
        },
        Migration {
            version: 3,
            description: "Soft deletion and reconciliation locks",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS deletedCoValues (
                    coValueID TEXT PRIMARY KEY,
                    status INTEGER NOT NULL DEFAULT 0
                ) WITHOUT ROWID;

                CREATE INDEX IF NOT EXISTS deletedCoValuesByStatus ON deletedCoValues (status);

                CREATE TABLE IF NOT EXISTS storageReconciliationLocks (
                    key TEXT PRIMARY KEY,
                    holderSessionId TEXT NOT NULL,
                    acquiredAt INTEGER NOT NULL,
                    lastProcessedOffset INTEGER NOT NULL DEFAULT 0,
                    releasedAt INTEGER
                ) WITHOUT ROWID;
            "#,
            down_sql: Some(
                r#"
                DROP TABLE IF EXISTS storageReconciliationLocks;
                DROP INDEX IF EXISTS deletedCoValuesByStatus;
                DROP TABLE IF EXISTS deletedCoValues;
            "#,
            ),
        },
    ]
}

fn ensure_version_table(conn: &Connection) -> StorageResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Get current schema version from database
pub fn get_current_version(pool: &Pool<SqliteConnectionManager>) -> StorageResult<i32> {
    let conn = pool.get()?;
    ensure_version_table(&conn)?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Run all pending migrations
pub fn migrate(pool: &Pool<SqliteConnectionManager>) -> StorageResult<()> {
    let current_version = get_current_version(pool)?;
    let pending_migrations: Vec<_> = get_migrations()
        .into_iter()
        .filter(|m| m.version > current_version)
        .collect();

    if pending_migrations.is_empty() {
        return Ok(());
    }

    let conn = pool.get()?;

    for migration in pending_migrations {
        let tx = conn.unchecked_transaction()?;

        tx.execute_batch(migration.up_sql)?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now],
        )?;

        tx.commit()?;

        info!(version = migration.version, description = migration.description, "Applied migration");
    }

    Ok(())
}

/// Get the latest migration version available
pub fn get_latest_version() -> i32 {
    get_migrations().iter().map(|m| m.version).max().unwrap_or(0)
}
