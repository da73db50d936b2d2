//! Synchronous SQLite backend
//!
//! Connections come from an r2d2 pool in WAL mode. Writers go through a
//! process-local gate and open IMMEDIATE transactions, so concurrent
//! `transaction` calls queue up instead of failing with SQLITE_BUSY.

use super::migrations;
use crate::core_covalue::{CoValueHeader, RawCoId, SessionId, Transaction};
use crate::core_crypto::Signature;
use crate::core_storage::client::{DbClient, DbReader, DbTransaction};
use crate::core_storage::errors::{handle_poison, StorageError, StorageResult};
use crate::core_storage::types::{CoValueRow, DeletedStatus, LockRecord, RowId, SessionRow, SessionUpdate};
use crate::core_sync::PeerId;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed CoValue mirror
#[derive(Clone)]
pub struct SqliteClient {
    pool: Arc<Pool<SqliteConnectionManager>>,
    writer: Arc<Mutex<()>>,
}

impl SqliteClient {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(BUSY_TIMEOUT)
        });
        let pool = Pool::builder()
            .max_size(16) // Support concurrent access
            .build(manager)?;
        Self::from_pool(pool)
    }

    /// In-memory database (one connection, kept for the client's lifetime)
    pub fn memory() -> StorageResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.busy_timeout(BUSY_TIMEOUT));
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> StorageResult<Self> {
        migrations::migrate(&pool)?;
        Ok(Self { pool: Arc::new(pool), writer: Arc::new(Mutex::new(())) })
    }

    pub fn schema_version(&self) -> StorageResult<i32> {
        migrations::get_current_version(&self.pool)
    }
}

impl DbClient for SqliteClient {
    fn read<R>(&self, f: impl FnOnce(&dyn DbReader) -> StorageResult<R>) -> StorageResult<R> {
        let conn = self.pool.get()?;
        f(&SqliteRows { conn: &conn })
    }

    fn transaction<R>(&self, f: impl FnOnce(&mut dyn DbTransaction) -> StorageResult<R>) -> StorageResult<R> {
        let _gate = self.writer.lock().map_err(handle_poison)?;
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let result = f(&mut SqliteRows { conn: &tx })?;
        tx.commit()?;
        Ok(result)
    }
}

/// Row access over one connection or open transaction
pub(crate) struct SqliteRows<'c> {
    conn: &'c Connection,
}

fn corrupted(what: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::CorruptedData(format!("{what}: {err}"))
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, i64, String, i64, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn into_session(raw: (i64, i64, String, i64, String, i64)) -> StorageResult<SessionRow> {
    let (row_id, co_value, session_id, last_idx, last_signature, bytes) = raw;
    Ok(SessionRow {
        row_id: row_id as RowId,
        co_value: co_value as RowId,
        session_id: SessionId::parse(session_id).map_err(|e| corrupted("session id", e))?,
        last_idx: last_idx as u32,
        last_signature: Signature::parse(last_signature).map_err(|e| corrupted("signature", e))?,
        bytes_since_last_signature: bytes as u64,
    })
}

const SESSION_COLUMNS: &str = "rowID, coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature";

impl DbReader for SqliteRows<'_> {
    fn get_co_value(&self, id: &RawCoId) -> StorageResult<Option<CoValueRow>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row("SELECT rowID, header FROM coValues WHERE id = ?1", params![id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;

        row.map(|(row_id, header)| -> StorageResult<CoValueRow> {
            Ok(CoValueRow {
                row_id: row_id as RowId,
                id: id.clone(),
                header: serde_json::from_str::<CoValueHeader>(&header)?,
            })
        })
        .transpose()
    }

    fn get_co_value_sessions(&self, co_value: RowId) -> StorageResult<Vec<SessionRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 ORDER BY rowID"))?;
        let raw = stmt
            .query_map(params![co_value as i64], session_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(into_session).collect()
    }

    fn get_single_co_value_session(
        &self,
        co_value: RowId,
        session_id: &SessionId,
    ) -> StorageResult<Option<SessionRow>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE coValue = ?1 AND sessionID = ?2"),
                params![co_value as i64, session_id.as_str()],
                session_from_row,
            )
            .optional()?;
        raw.map(into_session).transpose()
    }

    fn get_new_transactions_in_session(&self, session: RowId, from: u32, to: u32) -> StorageResult<Vec<Transaction>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT tx FROM transactions WHERE ses = ?1 AND idx >= ?2 AND idx < ?3 ORDER BY idx")?;
        let rows = stmt
            .query_map(params![session as i64, from, to], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|tx| serde_json::from_str(tx).map_err(StorageError::from))
            .collect()
    }

    fn get_signatures(&self, session: RowId, from: u32) -> StorageResult<Vec<(u32, Signature)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx")?;
        let rows = stmt
            .query_map(params![session as i64, from], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(idx, sig)| Signature::parse(sig).map(|s| (idx, s)).map_err(|e| corrupted("signature", e)))
            .collect()
    }

    fn get_deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>> {
        let status: Option<i64> = self
            .conn
            .query_row("SELECT status FROM deletedCoValues WHERE coValueID = ?1", params![id.as_str()], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(status.map(DeletedStatus::from_i64))
    }

    fn get_all_pending_deletes(&self) -> StorageResult<Vec<RawCoId>> {
        let mut stmt = self.conn.prepare_cached("SELECT coValueID FROM deletedCoValues WHERE status = ?1")?;
        let ids = stmt
            .query_map(params![DeletedStatus::Pending.as_i64()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| RawCoId::parse(id).map_err(|e| corrupted("co value id", e)))
            .collect()
    }

    fn get_unsynced(&self) -> StorageResult<Vec<(RawCoId, PeerId)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT co_value_id, peer_id FROM unsynced_covalues ORDER BY rowID")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, peer)| {
                RawCoId::parse(id)
                    .map(|id| (id, PeerId::from(peer)))
                    .map_err(|e| corrupted("co value id", e))
            })
            .collect()
    }

    fn get_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM coValues ORDER BY rowID LIMIT ?1 OFFSET ?2")?;
        let ids = stmt
            .query_map(params![limit as i64, offset as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|id| RawCoId::parse(id).map_err(|e| corrupted("co value id", e)))
            .collect()
    }

    fn get_lock(&self, key: &str) -> StorageResult<Option<LockRecord>> {
        let lock = self
            .conn
            .query_row(
                "SELECT key, holderSessionId, acquiredAt, lastProcessedOffset, releasedAt
                 FROM storageReconciliationLocks WHERE key = ?1",
                params![key],
                |row| {
                    Ok(LockRecord {
                        key: row.get(0)?,
                        holder_session_id: row.get(1)?,
                        acquired_at: row.get::<_, i64>(2)? as u64,
                        last_processed_offset: row.get::<_, i64>(3)? as u64,
                        released_at: row.get::<_, Option<i64>>(4)?.map(|t| t as u64),
                    })
                },
            )
            .optional()?;
        Ok(lock)
    }
}

impl DbTransaction for SqliteRows<'_> {
    fn upsert_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> StorageResult<RowId> {
        let header = serde_json::to_string(header)?;
        self.conn.execute(
            "INSERT INTO coValues (id, header) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id.as_str(), header],
        )?;
        let row_id: i64 =
            self.conn
                .query_row("SELECT rowID FROM coValues WHERE id = ?1", params![id.as_str()], |row| row.get(0))?;
        Ok(row_id as RowId)
    }

    fn upsert_session(&mut self, update: &SessionUpdate) -> StorageResult<RowId> {
        let row_id: i64 = self.conn.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sessionID, coValue) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature
             RETURNING rowID",
            params![
                update.co_value as i64,
                update.session_id.as_str(),
                update.last_idx,
                update.last_signature.as_str(),
                update.bytes_since_last_signature as i64,
            ],
            |row| row.get(0),
        )?;
        Ok(row_id as RowId)
    }

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> StorageResult<()> {
        let tx = serde_json::to_string(tx)?;
        self.conn
            .prepare_cached("INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)")?
            .execute(params![session as i64, idx, tx])?;
        Ok(())
    }

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> StorageResult<()> {
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)")?
            .execute(params![session as i64, idx, signature.as_str()])?;
        Ok(())
    }

    fn mark_deleted(&mut self, id: &RawCoId, status: DeletedStatus) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO deletedCoValues (coValueID, status) VALUES (?1, ?2)
             ON CONFLICT(coValueID) DO UPDATE SET status = excluded.status",
            params![id.as_str(), status.as_i64()],
        )?;
        Ok(())
    }

    fn erase_co_value_keep_tombstone(&mut self, id: &RawCoId) -> StorageResult<()> {
        let Some(row) = self.get_co_value(id)? else {
            return Ok(());
        };
        for session in self.get_co_value_sessions(row.row_id)? {
            if session.session_id.is_deleted_session() {
                continue;
            }
            let ses = session.row_id as i64;
            self.conn.execute("DELETE FROM transactions WHERE ses = ?1", params![ses])?;
            self.conn.execute("DELETE FROM signatureAfter WHERE ses = ?1", params![ses])?;
            self.conn.execute("DELETE FROM sessions WHERE rowID = ?1", params![ses])?;
        }
        debug!(id = %id, "Erased deleted CoValue content");
        Ok(())
    }

    fn set_sync_state(&mut self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()> {
        if synced {
            self.conn.execute(
                "DELETE FROM unsynced_covalues WHERE co_value_id = ?1 AND peer_id = ?2",
                params![id.as_str(), peer.as_str()],
            )?;
        } else {
            self.conn.execute(
                "INSERT OR IGNORE INTO unsynced_covalues (co_value_id, peer_id) VALUES (?1, ?2)",
                params![id.as_str(), peer.as_str()],
            )?;
        }
        Ok(())
    }

    fn stop_tracking(&mut self, id: &RawCoId) -> StorageResult<()> {
        self.conn
            .execute("DELETE FROM unsynced_covalues WHERE co_value_id = ?1", params![id.as_str()])?;
        Ok(())
    }

    fn put_lock(&mut self, lock: &LockRecord) -> StorageResult<()> {
        self.conn.execute(
            "INSERT INTO storageReconciliationLocks (key, holderSessionId, acquiredAt, lastProcessedOffset, releasedAt)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                holderSessionId = excluded.holderSessionId,
                acquiredAt = excluded.acquiredAt,
                lastProcessedOffset = excluded.lastProcessedOffset,
                releasedAt = excluded.releasedAt",
            params![
                lock.key,
                lock.holder_session_id,
                lock.acquired_at as i64,
                lock.last_processed_offset as i64,
                lock.released_at.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::{CoValueType, Ruleset, SessionOwner};
    use crate::core_crypto::{CryptoProvider, PureCrypto};
    use serde_json::json;
    use std::thread;

    fn fixture(client: &SqliteClient) -> (RawCoId, RowId, Vec<Signature>) {
        let crypto = PureCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret()).unwrap();
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("concurrency"));
        let id = header.id().unwrap();
        let session = SessionId::new(&SessionOwner::Agent(agent), "s");
        let secret = crypto.new_signer_secret();
        let signatures: Vec<_> = (0..16)
            .map(|i| crypto.sign(&secret, format!("message {i}").as_bytes()).unwrap())
            .collect();

        let last = signatures[0].clone();
        let ses = client
            .transaction(|tx| {
                let row = tx.upsert_co_value(&id, &header)?;
                tx.upsert_session(&SessionUpdate {
                    co_value: row,
                    session_id: session.clone(),
                    last_idx: 0,
                    last_signature: last,
                    bytes_since_last_signature: 0,
                })
            })
            .unwrap();
        (id, ses, signatures)
    }

    #[test]
    fn test_concurrent_transactions_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let client = SqliteClient::open(dir.path().join("concurrent.db")).unwrap();
        let (_, ses, signatures) = fixture(&client);

        let handles: Vec<_> = signatures
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, signature)| {
                let client = client.clone();
                thread::spawn(move || client.transaction(|tx| tx.add_signature_after(ses, i as u32, &signature)))
            })
            .collect();

        for handle in handles {
            handle.join().unwrap().expect("no transaction may fail under contention");
        }

        let stored = client.read(|r| r.get_signatures(ses, 0)).unwrap();
        let expected: Vec<_> = signatures.into_iter().enumerate().map(|(i, s)| (i as u32, s)).collect();
        assert_eq!(stored, expected);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let client = SqliteClient::memory().unwrap();
        let (id, _, _) = fixture(&client);

        let result: StorageResult<()> = client.transaction(|tx| {
            tx.mark_deleted(&id, DeletedStatus::Pending)?;
            Err(StorageError::CorruptedData("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(client.read(|r| r.get_deleted_status(&id)).unwrap(), None);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        let id = {
            let client = SqliteClient::open(&path).unwrap();
            fixture(&client).0
        };

        let client = SqliteClient::open(&path).unwrap();
        assert_eq!(client.schema_version().unwrap(), migrations::CURRENT_SCHEMA_VERSION);
        assert!(client.read(|r| r.get_co_value(&id)).unwrap().is_some());
    }
}
