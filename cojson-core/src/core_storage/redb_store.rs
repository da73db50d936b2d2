/*
    redb_store.rs - Embedded B-tree backend

    One redb table per SQL table, with composite ordered keys standing in
    for the SQL primary keys:

    - co_values:      id -> (row, header json)
    - co_value_rows:  row -> id (insertion order for paging)
    - sessions:       (co value row, session id) -> session row json
    - transactions:   (session row, idx) -> tx json
    - signatures:     (session row, idx) -> signature
    - unsynced:       (co value id, peer id) -> ()
    - deleted:        co value id -> status
    - locks:          key -> lock json
    - counters:       name -> next row id

    redb serializes write transactions itself, so concurrent callers queue.
*/

use super::client::{DbClient, DbReader, DbTransaction};
use super::errors::{StorageError, StorageResult};
use super::types::{CoValueRow, DeletedStatus, LockRecord, RowId, SessionRow, SessionUpdate};
use crate::core_covalue::{CoValueHeader, RawCoId, SessionId, Transaction};
use crate::core_crypto::Signature;
use crate::core_sync::PeerId;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadOnlyTable, ReadTransaction, ReadableTable, Table, TableDefinition, WriteTransaction};
use std::path::Path;
use std::sync::Arc;

const CO_VALUES: TableDefinition<&str, (u64, &str)> = TableDefinition::new("co-values-1");
const CO_VALUE_ROWS: TableDefinition<u64, &str> = TableDefinition::new("co-value-rows-1");
const SESSIONS: TableDefinition<(u64, &str), &str> = TableDefinition::new("sessions-1");
const TRANSACTIONS: TableDefinition<(u64, u32), &str> = TableDefinition::new("transactions-1");
const SIGNATURES: TableDefinition<(u64, u32), &str> = TableDefinition::new("signature-after-1");
const UNSYNCED: TableDefinition<(&str, &str), ()> = TableDefinition::new("unsynced-1");
const DELETED: TableDefinition<&str, u8> = TableDefinition::new("deleted-1");
const LOCKS: TableDefinition<&str, &str> = TableDefinition::new("reconciliation-locks-1");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters-1");

const CO_VALUE_COUNTER: &str = "co_values";
const SESSION_COUNTER: &str = "sessions";

type Str = &'static str;

struct ReadOnlyTables {
    co_values: ReadOnlyTable<Str, (u64, Str)>,
    co_value_rows: ReadOnlyTable<u64, Str>,
    sessions: ReadOnlyTable<(u64, Str), Str>,
    transactions: ReadOnlyTable<(u64, u32), Str>,
    signatures: ReadOnlyTable<(u64, u32), Str>,
    unsynced: ReadOnlyTable<(Str, Str), ()>,
    deleted: ReadOnlyTable<Str, u8>,
    locks: ReadOnlyTable<Str, Str>,
}

impl ReadOnlyTables {
    fn new(tx: &ReadTransaction) -> StorageResult<Self> {
        Ok(Self {
            co_values: tx.open_table(CO_VALUES)?,
            co_value_rows: tx.open_table(CO_VALUE_ROWS)?,
            sessions: tx.open_table(SESSIONS)?,
            transactions: tx.open_table(TRANSACTIONS)?,
            signatures: tx.open_table(SIGNATURES)?,
            unsynced: tx.open_table(UNSYNCED)?,
            deleted: tx.open_table(DELETED)?,
            locks: tx.open_table(LOCKS)?,
        })
    }
}

struct Tables<'tx> {
    co_values: Table<'tx, Str, (u64, Str)>,
    co_value_rows: Table<'tx, u64, Str>,
    sessions: Table<'tx, (u64, Str), Str>,
    transactions: Table<'tx, (u64, u32), Str>,
    signatures: Table<'tx, (u64, u32), Str>,
    unsynced: Table<'tx, (Str, Str), ()>,
    deleted: Table<'tx, Str, u8>,
    locks: Table<'tx, Str, Str>,
    counters: Table<'tx, Str, u64>,
}

impl<'tx> Tables<'tx> {
    fn new(tx: &'tx WriteTransaction) -> StorageResult<Self> {
        Ok(Self {
            co_values: tx.open_table(CO_VALUES)?,
            co_value_rows: tx.open_table(CO_VALUE_ROWS)?,
            sessions: tx.open_table(SESSIONS)?,
            transactions: tx.open_table(TRANSACTIONS)?,
            signatures: tx.open_table(SIGNATURES)?,
            unsynced: tx.open_table(UNSYNCED)?,
            deleted: tx.open_table(DELETED)?,
            locks: tx.open_table(LOCKS)?,
            counters: tx.open_table(COUNTERS)?,
        })
    }

    fn next_row(&mut self, counter: &str) -> StorageResult<RowId> {
        let next = self.counters.get(counter)?.map_or(1, |v| v.value());
        self.counters.insert(counter, next + 1)?;
        Ok(next)
    }
}

fn corrupted(what: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::CorruptedData(format!("{what}: {err}"))
}

fn parse_id(value: &str) -> StorageResult<RawCoId> {
    RawCoId::parse(value).map_err(|e| corrupted("co value id", e))
}

fn status_of(value: u8) -> DeletedStatus {
    DeletedStatus::from_i64(value as i64)
}

macro_rules! impl_reader {
    ($ty:ty) => {
        impl DbReader for $ty {
            fn get_co_value(&self, id: &RawCoId) -> StorageResult<Option<CoValueRow>> {
                let Some(entry) = self.co_values.get(id.as_str())? else {
                    return Ok(None);
                };
                let (row_id, header) = entry.value();
                Ok(Some(CoValueRow {
                    row_id,
                    id: id.clone(),
                    header: serde_json::from_str::<CoValueHeader>(header)?,
                }))
            }

            fn get_co_value_sessions(&self, co_value: RowId) -> StorageResult<Vec<SessionRow>> {
                let mut rows = Vec::new();
                for entry in self.sessions.range((co_value, "")..(co_value + 1, ""))? {
                    let (_, value) = entry?;
                    rows.push(serde_json::from_str(value.value())?);
                }
                Ok(rows)
            }

            fn get_single_co_value_session(
                &self,
                co_value: RowId,
                session_id: &SessionId,
            ) -> StorageResult<Option<SessionRow>> {
                match self.sessions.get((co_value, session_id.as_str()))? {
                    Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
                    None => Ok(None),
                }
            }

            fn get_new_transactions_in_session(&self, session: RowId, from: u32, to: u32) -> StorageResult<Vec<Transaction>> {
                let mut transactions = Vec::new();
                if from >= to {
                    return Ok(transactions);
                }
                for entry in self.transactions.range((session, from)..(session, to))? {
                    let (_, value) = entry?;
                    transactions.push(serde_json::from_str(value.value())?);
                }
                Ok(transactions)
            }

            fn get_signatures(&self, session: RowId, from: u32) -> StorageResult<Vec<(u32, Signature)>> {
                let mut signatures = Vec::new();
                for entry in self.signatures.range((session, from)..=(session, u32::MAX))? {
                    let (key, value) = entry?;
                    let signature = Signature::parse(value.value()).map_err(|e| corrupted("signature", e))?;
                    signatures.push((key.value().1, signature));
                }
                Ok(signatures)
            }

            fn get_deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>> {
                Ok(self.deleted.get(id.as_str())?.map(|v| status_of(v.value())))
            }

            fn get_all_pending_deletes(&self) -> StorageResult<Vec<RawCoId>> {
                let mut ids = Vec::new();
                for entry in self.deleted.iter()? {
                    let (key, value) = entry?;
                    if status_of(value.value()) == DeletedStatus::Pending {
                        ids.push(parse_id(key.value())?);
                    }
                }
                Ok(ids)
            }

            fn get_unsynced(&self) -> StorageResult<Vec<(RawCoId, PeerId)>> {
                let mut rows = Vec::new();
                for entry in self.unsynced.iter()? {
                    let (key, _) = entry?;
                    let (id, peer) = key.value();
                    rows.push((parse_id(id)?, PeerId::from(peer)));
                }
                Ok(rows)
            }

            fn get_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>> {
                let mut ids = Vec::new();
                for entry in self.co_value_rows.iter()?.skip(offset as usize).take(limit as usize) {
                    let (_, value) = entry?;
                    ids.push(parse_id(value.value())?);
                }
                Ok(ids)
            }

            fn get_lock(&self, key: &str) -> StorageResult<Option<LockRecord>> {
                match self.locks.get(key)? {
                    Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
                    None => Ok(None),
                }
            }
        }
    };
}

impl_reader!(ReadOnlyTables);
impl_reader!(Tables<'_>);

impl DbTransaction for Tables<'_> {
    fn upsert_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> StorageResult<RowId> {
        if let Some(existing) = self.co_values.get(id.as_str())? {
            return Ok(existing.value().0);
        }
        let row = self.next_row(CO_VALUE_COUNTER)?;
        let header = serde_json::to_string(header)?;
        self.co_values.insert(id.as_str(), (row, header.as_str()))?;
        self.co_value_rows.insert(row, id.as_str())?;
        Ok(row)
    }

    fn upsert_session(&mut self, update: &SessionUpdate) -> StorageResult<RowId> {
        let key = (update.co_value, update.session_id.as_str());
        let existing = self.get_single_co_value_session(update.co_value, &update.session_id)?;
        let row_id = match existing {
            Some(row) => row.row_id,
            None => self.next_row(SESSION_COUNTER)?,
        };
        let row = SessionRow {
            row_id,
            co_value: update.co_value,
            session_id: update.session_id.clone(),
            last_idx: update.last_idx,
            last_signature: update.last_signature.clone(),
            bytes_since_last_signature: update.bytes_since_last_signature,
        };
        self.sessions.insert(key, serde_json::to_string(&row)?.as_str())?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> StorageResult<()> {
        self.transactions
            .insert((session, idx), serde_json::to_string(tx)?.as_str())?;
        Ok(())
    }

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> StorageResult<()> {
        self.signatures.insert((session, idx), signature.as_str())?;
        Ok(())
    }

    fn mark_deleted(&mut self, id: &RawCoId, status: DeletedStatus) -> StorageResult<()> {
        self.deleted.insert(id.as_str(), status.as_i64() as u8)?;
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
            let ses = session.row_id;
            for idx in 0..session.last_idx {
                self.transactions.remove((ses, idx))?;
            }
            let checkpoints: Vec<u32> = self.get_signatures(ses, 0)?.into_iter().map(|(idx, _)| idx).collect();
            for idx in checkpoints {
                self.signatures.remove((ses, idx))?;
            }
            self.sessions.remove((row.row_id, session.session_id.as_str()))?;
        }
        Ok(())
    }

    fn set_sync_state(&mut self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()> {
        if synced {
            self.unsynced.remove((id.as_str(), peer.as_str()))?;
        } else {
            self.unsynced.insert((id.as_str(), peer.as_str()), ())?;
        }
        Ok(())
    }

    fn stop_tracking(&mut self, id: &RawCoId) -> StorageResult<()> {
        let peers: Vec<PeerId> = self
            .get_unsynced()?
            .into_iter()
            .filter(|(unsynced, _)| unsynced == id)
            .map(|(_, peer)| peer)
            .collect();
        for peer in peers {
            self.unsynced.remove((id.as_str(), peer.as_str()))?;
        }
        Ok(())
    }

    fn put_lock(&mut self, lock: &LockRecord) -> StorageResult<()> {
        self.locks
            .insert(lock.key.as_str(), serde_json::to_string(lock)?.as_str())?;
        Ok(())
    }
}

/// redb-backed CoValue mirror
#[derive(Clone)]
pub struct RedbClient {
    db: Arc<Database>,
}

impl RedbClient {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = Database::builder().create(path)?;
        Self::init(db)
    }

    pub fn in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        // Create every table up front so read transactions can open them
        let write = db.begin_write()?;
        Tables::new(&write)?;
        write.commit()?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl DbClient for RedbClient {
    fn read<R>(&self, f: impl FnOnce(&dyn DbReader) -> StorageResult<R>) -> StorageResult<R> {
        let read = self.db.begin_read()?;
        let tables = ReadOnlyTables::new(&read)?;
        f(&tables)
    }

    fn transaction<R>(&self, f: impl FnOnce(&mut dyn DbTransaction) -> StorageResult<R>) -> StorageResult<R> {
        let write = self.db.begin_write()?;
        let result = {
            let mut tables = Tables::new(&write)?;
            f(&mut tables)?
        };
        write.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_ids_are_stable_and_increasing() {
        let client = RedbClient::in_memory().unwrap();
        let header = |u: &str| {
            crate::core_covalue::CoValueHeader::new(
                crate::core_covalue::CoValueType::CoMap,
                crate::core_covalue::Ruleset::UnsafeAllowAll,
                serde_json::json!(u),
            )
        };
        let (a, b) = (header("a"), header("b"));
        let (id_a, id_b) = (a.id().unwrap(), b.id().unwrap());

        let rows = client
            .transaction(|tx| {
                let first = tx.upsert_co_value(&id_a, &a)?;
                let second = tx.upsert_co_value(&id_b, &b)?;
                let again = tx.upsert_co_value(&id_a, &a)?;
                Ok((first, second, again))
            })
            .unwrap();
        assert_eq!(rows, (1, 2, 1));

        let ids = client.read(|r| r.get_co_value_ids(0, 10)).unwrap();
        assert_eq!(ids, vec![id_a, id_b]);
    }

    #[test]
    fn test_file_backend_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        {
            let client = RedbClient::open(&path).unwrap();
            client
                .transaction(|tx| tx.mark_deleted(&RawCoId::parse("co_zGone").unwrap(), DeletedStatus::Pending))
                .unwrap();
        }
        let client = RedbClient::open(&path).unwrap();
        let pending = client.read(|r| r.get_all_pending_deletes()).unwrap();
        assert_eq!(pending, vec![RawCoId::parse("co_zGone").unwrap()]);
    }
}
