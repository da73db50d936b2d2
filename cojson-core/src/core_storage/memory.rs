/*
    memory.rs - In-memory backend with versioned snapshots

    Ordered maps behind a RwLock. A transaction works on a copy of the state
    and swaps it in on success, so a failed callback leaves nothing behind.

    Snapshots (`export` / `import`) carry a store version; older snapshots
    are upgraded step by step, one migration per version, before use.
*/

use super::client::{DbClient, DbReader, DbTransaction};
use super::errors::{handle_poison, StorageError, StorageResult};
use super::types::{CoValueRow, DeletedStatus, LockRecord, RowId, SessionRow, SessionUpdate};
use crate::core_covalue::{CoValueHeader, RawCoId, SessionId, Transaction};
use crate::core_crypto::Signature;
use crate::core_sync::PeerId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::info;

/// Current snapshot layout
pub const STORE_VERSION: u32 = 3;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MemoryState {
    version: u32,
    next_row: RowId,
    co_values: BTreeMap<RawCoId, (RowId, CoValueHeader)>,
    co_value_rows: BTreeMap<RowId, RawCoId>,
    sessions: BTreeMap<RowId, BTreeMap<SessionId, SessionRow>>,
    transactions: BTreeMap<RowId, Vec<Transaction>>,
    signatures: BTreeMap<RowId, BTreeMap<u32, Signature>>,
    unsynced: BTreeSet<(RawCoId, String)>,
    deleted: BTreeMap<RawCoId, DeletedStatus>,
    locks: BTreeMap<String, LockRecord>,
}

impl MemoryState {
    fn new() -> Self {
        Self { version: STORE_VERSION, next_row: 1, ..Default::default() }
    }

    fn allocate_row(&mut self) -> RowId {
        let row = self.next_row;
        self.next_row += 1;
        row
    }
}

type Upgrade = fn(&mut serde_json::Map<String, JsonValue>);

/// v2: per-peer unsynced tracking
fn add_unsynced(state: &mut serde_json::Map<String, JsonValue>) {
    state.insert("unsynced".into(), json!([]));
}

/// v3: soft deletion and reconciliation locks
fn add_deletion_and_locks(state: &mut serde_json::Map<String, JsonValue>) {
    state.insert("deleted".into(), json!({}));
    state.insert("locks".into(), json!({}));
}

/// Entry `i` moves a snapshot from version `i + 1` to `i + 2`
const UPGRADES: [Upgrade; 2] = [add_unsynced, add_deletion_and_locks];

fn upgrade(mut snapshot: JsonValue) -> StorageResult<MemoryState> {
    let state = snapshot
        .as_object_mut()
        .ok_or_else(|| StorageError::Migration("snapshot is not an object".into()))?;
    let mut version = state.get("version").and_then(JsonValue::as_u64).unwrap_or(1).max(1) as u32;
    if version > STORE_VERSION {
        return Err(StorageError::Migration(format!("snapshot version {version} is newer than {STORE_VERSION}")));
    }

    while version < STORE_VERSION {
        UPGRADES[(version - 1) as usize](state);
        version += 1;
        state.insert("version".into(), json!(version));
        info!(version, "Upgraded memory store snapshot");
    }
    Ok(serde_json::from_value(snapshot)?)
}

#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<RwLock<MemoryState>>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self { state: Arc::new(RwLock::new(MemoryState::new())) }
    }

    /// Serialize the whole store
    pub fn export(&self) -> StorageResult<JsonValue> {
        let state = self.state.read().map_err(handle_poison)?;
        Ok(serde_json::to_value(&*state)?)
    }

    /// Restore a snapshot, upgrading it to the current version
    pub fn import(snapshot: JsonValue) -> StorageResult<Self> {
        let state = upgrade(snapshot)?;
        Ok(Self { state: Arc::new(RwLock::new(state)) })
    }

    pub fn version(&self) -> StorageResult<u32> {
        Ok(self.state.read().map_err(handle_poison)?.version)
    }
}

impl DbClient for MemoryClient {
    fn read<R>(&self, f: impl FnOnce(&dyn DbReader) -> StorageResult<R>) -> StorageResult<R> {
        let state = self.state.read().map_err(handle_poison)?;
        f(&*state)
    }

    fn transaction<R>(&self, f: impl FnOnce(&mut dyn DbTransaction) -> StorageResult<R>) -> StorageResult<R> {
        let mut state = self.state.write().map_err(handle_poison)?;
        let mut working = state.clone();
        let result = f(&mut working)?;
        *state = working;
        Ok(result)
    }
}

impl DbReader for MemoryState {
    fn get_co_value(&self, id: &RawCoId) -> StorageResult<Option<CoValueRow>> {
        Ok(self
            .co_values
            .get(id)
            .map(|(row_id, header)| CoValueRow { row_id: *row_id, id: id.clone(), header: header.clone() }))
    }

    fn get_co_value_sessions(&self, co_value: RowId) -> StorageResult<Vec<SessionRow>> {
        let mut rows: Vec<SessionRow> = self
            .sessions
            .get(&co_value)
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|row| row.row_id);
        Ok(rows)
    }

    fn get_single_co_value_session(
        &self,
        co_value: RowId,
        session_id: &SessionId,
    ) -> StorageResult<Option<SessionRow>> {
        Ok(self.sessions.get(&co_value).and_then(|s| s.get(session_id)).cloned())
    }

    fn get_new_transactions_in_session(&self, session: RowId, from: u32, to: u32) -> StorageResult<Vec<Transaction>> {
        let all = self.transactions.get(&session).map(Vec::as_slice).unwrap_or_default();
        let to = (to as usize).min(all.len());
        let from = (from as usize).min(to);
        Ok(all[from..to].to_vec())
    }

    fn get_signatures(&self, session: RowId, from: u32) -> StorageResult<Vec<(u32, Signature)>> {
        Ok(self
            .signatures
            .get(&session)
            .map(|s| s.range(from..).map(|(idx, sig)| (*idx, sig.clone())).collect())
            .unwrap_or_default())
    }

    fn get_deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>> {
        Ok(self.deleted.get(id).copied())
    }

    fn get_all_pending_deletes(&self) -> StorageResult<Vec<RawCoId>> {
        Ok(self
            .deleted
            .iter()
            .filter(|(_, status)| **status == DeletedStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect())
    }

    fn get_unsynced(&self) -> StorageResult<Vec<(RawCoId, PeerId)>> {
        Ok(self
            .unsynced
            .iter()
            .map(|(id, peer)| (id.clone(), PeerId::from(peer.as_str())))
            .collect())
    }

    fn get_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>> {
        Ok(self
            .co_value_rows
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    fn get_lock(&self, key: &str) -> StorageResult<Option<LockRecord>> {
        Ok(self.locks.get(key).cloned())
    }
}

impl DbTransaction for MemoryState {
    fn upsert_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> StorageResult<RowId> {
        if let Some((row, _)) = self.co_values.get(id) {
            return Ok(*row);
        }
        let row = self.allocate_row();
        self.co_values.insert(id.clone(), (row, header.clone()));
        self.co_value_rows.insert(row, id.clone());
        Ok(row)
    }

    fn upsert_session(&mut self, update: &SessionUpdate) -> StorageResult<RowId> {
        let existing = self.get_single_co_value_session(update.co_value, &update.session_id)?;
        let row_id = match existing {
            Some(row) => row.row_id,
            None => self.allocate_row(),
        };
        self.sessions.entry(update.co_value).or_default().insert(
            update.session_id.clone(),
            SessionRow {
                row_id,
                co_value: update.co_value,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature.clone(),
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> StorageResult<()> {
        let transactions = self.transactions.entry(session).or_default();
        match (idx as usize).cmp(&transactions.len()) {
            std::cmp::Ordering::Less => transactions[idx as usize] = tx.clone(),
            std::cmp::Ordering::Equal => transactions.push(tx.clone()),
            std::cmp::Ordering::Greater => {
                return Err(StorageError::CorruptedData(format!(
                    "transaction {idx} of session row {session} leaves a gap"
                )))
            }
        }
        Ok(())
    }

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> StorageResult<()> {
        self.signatures.entry(session).or_default().insert(idx, signature.clone());
        Ok(())
    }

    fn mark_deleted(&mut self, id: &RawCoId, status: DeletedStatus) -> StorageResult<()> {
        self.deleted.insert(id.clone(), status);
        Ok(())
    }

    fn erase_co_value_keep_tombstone(&mut self, id: &RawCoId) -> StorageResult<()> {
        let Some((row, _)) = self.co_values.get(id).cloned() else {
            return Ok(());
        };
        if let Some(sessions) = self.sessions.get_mut(&row) {
            let erased: Vec<SessionId> = sessions.keys().filter(|s| !s.is_deleted_session()).cloned().collect();
            for session_id in erased {
                if let Some(session) = sessions.remove(&session_id) {
                    self.transactions.remove(&session.row_id);
                    self.signatures.remove(&session.row_id);
                }
            }
        }
        Ok(())
    }

    fn set_sync_state(&mut self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()> {
        let key = (id.clone(), peer.to_string());
        if synced {
            self.unsynced.remove(&key);
        } else {
            self.unsynced.insert(key);
        }
        Ok(())
    }

    fn stop_tracking(&mut self, id: &RawCoId) -> StorageResult<()> {
        self.unsynced.retain(|(unsynced, _)| unsynced != id);
        Ok(())
    }

    fn put_lock(&mut self, lock: &LockRecord) -> StorageResult<()> {
        self.locks.insert(lock.key.clone(), lock.clone());
        Ok(())
    }
}
