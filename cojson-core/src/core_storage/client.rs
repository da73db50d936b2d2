/*
    client.rs - Row-level access traits implemented by every backend

    DbReader / DbTransaction describe the persisted tables; DbClient and
    DbClientAsync hand a reader or a transaction to a closure. The closure
    passed to `transaction` runs against one atomic unit of work: either all
    of its writes become visible or none do.
*/

use super::errors::StorageResult;
use super::types::{CoValueRow, DeletedStatus, LockRecord, RowId, SessionRow, SessionUpdate};
use crate::core_covalue::{CoValueHeader, RawCoId, SessionId, Transaction};
use crate::core_crypto::Signature;
use crate::core_sync::PeerId;
use async_trait::async_trait;

pub trait DbReader {
    fn get_co_value(&self, id: &RawCoId) -> StorageResult<Option<CoValueRow>>;

    fn get_co_value_sessions(&self, co_value: RowId) -> StorageResult<Vec<SessionRow>>;

    fn get_single_co_value_session(&self, co_value: RowId, session_id: &SessionId)
        -> StorageResult<Option<SessionRow>>;

    /// Transactions with index in `from..to`, in index order
    fn get_new_transactions_in_session(&self, session: RowId, from: u32, to: u32) -> StorageResult<Vec<Transaction>>;

    /// Checkpoints with index >= `from`, in index order
    fn get_signatures(&self, session: RowId, from: u32) -> StorageResult<Vec<(u32, Signature)>>;

    fn get_deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>>;

    fn get_all_pending_deletes(&self) -> StorageResult<Vec<RawCoId>>;

    /// Every (CoValue, peer) pair still waiting for an upload acknowledgement
    fn get_unsynced(&self) -> StorageResult<Vec<(RawCoId, PeerId)>>;

    /// Stored ids in insertion order
    fn get_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>>;

    fn get_lock(&self, key: &str) -> StorageResult<Option<LockRecord>>;
}

pub trait DbTransaction: DbReader {
    /// Insert the CoValue if missing; returns its row id either way
    fn upsert_co_value(&mut self, id: &RawCoId, header: &CoValueHeader) -> StorageResult<RowId>;

    fn upsert_session(&mut self, update: &SessionUpdate) -> StorageResult<RowId>;

    fn add_transaction(&mut self, session: RowId, idx: u32, tx: &Transaction) -> StorageResult<()>;

    fn add_signature_after(&mut self, session: RowId, idx: u32, signature: &Signature) -> StorageResult<()>;

    fn mark_deleted(&mut self, id: &RawCoId, status: DeletedStatus) -> StorageResult<()>;

    /// Remove every non-tombstone session (and its rows) of a CoValue
    fn erase_co_value_keep_tombstone(&mut self, id: &RawCoId) -> StorageResult<()>;

    fn set_sync_state(&mut self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()>;

    /// Forget every unsynced entry of a CoValue
    fn stop_tracking(&mut self, id: &RawCoId) -> StorageResult<()>;

    fn put_lock(&mut self, lock: &LockRecord) -> StorageResult<()>;
}

/// Backend with synchronous access
pub trait DbClient: Send + Sync + 'static {
    fn read<R>(&self, f: impl FnOnce(&dyn DbReader) -> StorageResult<R>) -> StorageResult<R>;

    fn transaction<R>(&self, f: impl FnOnce(&mut dyn DbTransaction) -> StorageResult<R>) -> StorageResult<R>;
}

/// Backend whose calls must not block the runtime
#[async_trait]
pub trait DbClientAsync: Send + Sync + 'static {
    async fn read<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn DbReader) -> StorageResult<R> + Send + 'static,
        R: Send + 'static;

    async fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn DbTransaction) -> StorageResult<R> + Send + 'static,
        R: Send + 'static;
}
