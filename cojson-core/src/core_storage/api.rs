/*
    api.rs - The node's single storage interface

    StorageSync<C> adapts a synchronous DbClient, StorageAsync<C> an async
    one. Both run the shared algorithms in `mirror`, so every backend has the
    same externally visible KnownState semantics.
*/

use super::client::{DbClient, DbClientAsync, DbReader, DbTransaction};
use super::errors::StorageResult;
use super::mirror;
use super::types::{DeletedStatus, LockRecord, StoreOutcome};
use crate::core_covalue::{KnownState, NewContent, RawCoId, DEFAULT_MAX_BYTES_PER_SIGNATURE};
use crate::core_sync::PeerId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Stored content split at checkpoints, `None` if unknown
    async fn load(&self, id: &RawCoId) -> StorageResult<Option<Vec<NewContent>>>;

    /// Store several pieces in one transaction
    async fn store(&self, content: &[NewContent]) -> StorageResult<Vec<StoreOutcome>>;

    async fn known_state(&self, id: &RawCoId) -> StorageResult<Option<KnownState>>;

    async fn mark_deleted(&self, id: &RawCoId) -> StorageResult<()>;

    async fn deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>>;

    /// Physically erase tombstoned content; returns the erased ids
    async fn erase_all_deleted(&self) -> StorageResult<Vec<RawCoId>>;

    async fn track_sync_state(&self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()>;

    /// Distinct ids with at least one unacknowledged upload
    async fn unsynced_co_value_ids(&self) -> StorageResult<Vec<RawCoId>>;

    async fn stop_tracking_sync_state(&self, id: &RawCoId) -> StorageResult<()>;

    async fn stored_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>>;

    async fn try_acquire_lock(&self, key: &str, holder: &str, now: u64) -> StorageResult<Option<LockRecord>>;

    async fn update_lock_offset(&self, key: &str, holder: &str, offset: u64, now: u64) -> StorageResult<bool>;

    async fn release_lock(&self, key: &str, holder: &str, completed: bool, now: u64) -> StorageResult<bool>;
}

pub type SharedStorage = Arc<dyn StorageApi>;

fn record_op(op: &'static str, started: Instant) {
    metrics::counter!("cojson_storage_operations_total", "op" => op).increment(1);
    metrics::histogram!("cojson_storage_operation_seconds", "op" => op).record(started.elapsed().as_secs_f64());
}

fn distinct_ids(rows: Vec<(RawCoId, PeerId)>) -> Vec<RawCoId> {
    rows.into_iter()
        .map(|(id, _)| id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn store_all<T: DbTransaction + ?Sized>(
    tx: &mut T,
    content: &[NewContent],
    max_bytes: usize,
) -> StorageResult<Vec<StoreOutcome>> {
    content
        .iter()
        .map(|piece| mirror::store_new_content(tx, piece, max_bytes))
        .collect()
}

/// StorageApi over a synchronous backend
pub struct StorageSync<C> {
    client: Arc<C>,
    max_bytes_per_signature: usize,
}

impl<C: DbClient> StorageSync<C> {
    pub fn new(client: C) -> Self {
        Self::with_cadence(client, DEFAULT_MAX_BYTES_PER_SIGNATURE)
    }

    pub fn with_cadence(client: C, max_bytes_per_signature: usize) -> Self {
        Self { client: Arc::new(client), max_bytes_per_signature }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Run `f` as one atomic unit of work
    pub fn transaction<R>(&self, f: impl FnOnce(&mut dyn DbTransaction) -> StorageResult<R>) -> StorageResult<R> {
        self.client.transaction(f)
    }
}

#[async_trait]
impl<C: DbClient> StorageApi for StorageSync<C> {
    async fn load(&self, id: &RawCoId) -> StorageResult<Option<Vec<NewContent>>> {
        let started = Instant::now();
        let result = self.client.read(|r| mirror::load_co_value(r, id));
        record_op("load", started);
        result
    }

    async fn store(&self, content: &[NewContent]) -> StorageResult<Vec<StoreOutcome>> {
        let started = Instant::now();
        let max_bytes = self.max_bytes_per_signature;
        let result = self.client.transaction(|tx| store_all(tx, content, max_bytes));
        record_op("store", started);
        debug!(pieces = content.len(), "Stored content");
        result
    }

    async fn known_state(&self, id: &RawCoId) -> StorageResult<Option<KnownState>> {
        self.client.read(|r| mirror::known_state_of(r, id))
    }

    async fn mark_deleted(&self, id: &RawCoId) -> StorageResult<()> {
        self.client.transaction(|tx| match tx.get_deleted_status(id)? {
            Some(_) => Ok(()),
            None => tx.mark_deleted(id, DeletedStatus::Pending),
        })
    }

    async fn deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>> {
        self.client.read(|r| r.get_deleted_status(id))
    }

    async fn erase_all_deleted(&self) -> StorageResult<Vec<RawCoId>> {
        self.client.transaction(|tx| mirror::erase_all_deleted(tx))
    }

    async fn track_sync_state(&self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()> {
        self.client.transaction(|tx| tx.set_sync_state(id, peer, synced))
    }

    async fn unsynced_co_value_ids(&self) -> StorageResult<Vec<RawCoId>> {
        self.client.read(|r| r.get_unsynced()).map(distinct_ids)
    }

    async fn stop_tracking_sync_state(&self, id: &RawCoId) -> StorageResult<()> {
        self.client.transaction(|tx| tx.stop_tracking(id))
    }

    async fn stored_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>> {
        self.client.read(|r| r.get_co_value_ids(offset, limit))
    }

    async fn try_acquire_lock(&self, key: &str, holder: &str, now: u64) -> StorageResult<Option<LockRecord>> {
        self.client.transaction(|tx| mirror::try_acquire_lock(tx, key, holder, now))
    }

    async fn update_lock_offset(&self, key: &str, holder: &str, offset: u64, now: u64) -> StorageResult<bool> {
        self.client.transaction(|tx| mirror::update_lock_offset(tx, key, holder, offset, now))
    }

    async fn release_lock(&self, key: &str, holder: &str, completed: bool, now: u64) -> StorageResult<bool> {
        self.client.transaction(|tx| mirror::release_lock(tx, key, holder, completed, now))
    }
}

/// StorageApi over an async backend
pub struct StorageAsync<C> {
    client: Arc<C>,
    max_bytes_per_signature: usize,
}

impl<C: DbClientAsync> StorageAsync<C> {
    pub fn new(client: C) -> Self {
        Self::with_cadence(client, DEFAULT_MAX_BYTES_PER_SIGNATURE)
    }

    pub fn with_cadence(client: C, max_bytes_per_signature: usize) -> Self {
        Self { client: Arc::new(client), max_bytes_per_signature }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn transaction<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&mut dyn DbTransaction) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.client.transaction(f).await
    }

    async fn read_with<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn DbReader) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        self.client.read(f).await
    }
}

#[async_trait]
impl<C: DbClientAsync> StorageApi for StorageAsync<C> {
    async fn load(&self, id: &RawCoId) -> StorageResult<Option<Vec<NewContent>>> {
        let started = Instant::now();
        let id = id.clone();
        let result = self.read_with(move |r| mirror::load_co_value(r, &id)).await;
        record_op("load", started);
        result
    }

    async fn store(&self, content: &[NewContent]) -> StorageResult<Vec<StoreOutcome>> {
        let started = Instant::now();
        let max_bytes = self.max_bytes_per_signature;
        let content = content.to_vec();
        let result = self.transaction(move |tx| store_all(tx, &content, max_bytes)).await;
        record_op("store", started);
        result
    }

    async fn known_state(&self, id: &RawCoId) -> StorageResult<Option<KnownState>> {
        let id = id.clone();
        self.read_with(move |r| mirror::known_state_of(r, &id)).await
    }

    async fn mark_deleted(&self, id: &RawCoId) -> StorageResult<()> {
        let id = id.clone();
        self.transaction(move |tx| match tx.get_deleted_status(&id)? {
            Some(_) => Ok(()),
            None => tx.mark_deleted(&id, DeletedStatus::Pending),
        })
        .await
    }

    async fn deleted_status(&self, id: &RawCoId) -> StorageResult<Option<DeletedStatus>> {
        let id = id.clone();
        self.read_with(move |r| r.get_deleted_status(&id)).await
    }

    async fn erase_all_deleted(&self) -> StorageResult<Vec<RawCoId>> {
        self.transaction(|tx| mirror::erase_all_deleted(tx)).await
    }

    async fn track_sync_state(&self, id: &RawCoId, peer: &PeerId, synced: bool) -> StorageResult<()> {
        let (id, peer) = (id.clone(), peer.clone());
        self.transaction(move |tx| tx.set_sync_state(&id, &peer, synced)).await
    }

    async fn unsynced_co_value_ids(&self) -> StorageResult<Vec<RawCoId>> {
        self.read_with(|r| r.get_unsynced()).await.map(distinct_ids)
    }

    async fn stop_tracking_sync_state(&self, id: &RawCoId) -> StorageResult<()> {
        let id = id.clone();
        self.transaction(move |tx| tx.stop_tracking(&id)).await
    }

    async fn stored_co_value_ids(&self, offset: u64, limit: u64) -> StorageResult<Vec<RawCoId>> {
        self.read_with(move |r| r.get_co_value_ids(offset, limit)).await
    }

    async fn try_acquire_lock(&self, key: &str, holder: &str, now: u64) -> StorageResult<Option<LockRecord>> {
        let (key, holder) = (key.to_string(), holder.to_string());
        self.transaction(move |tx| mirror::try_acquire_lock(tx, &key, &holder, now)).await
    }

    async fn update_lock_offset(&self, key: &str, holder: &str, offset: u64, now: u64) -> StorageResult<bool> {
        let (key, holder) = (key.to_string(), holder.to_string());
        self.transaction(move |tx| mirror::update_lock_offset(tx, &key, &holder, offset, now)).await
    }

    async fn release_lock(&self, key: &str, holder: &str, completed: bool, now: u64) -> StorageResult<bool> {
        let (key, holder) = (key.to_string(), holder.to_string());
        self.transaction(move |tx| mirror::release_lock(tx, &key, &holder, completed, now)).await
    }
}
