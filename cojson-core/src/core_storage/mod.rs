/*
    core_storage - Durable mirror of CoValue content

    Persistence is split in two layers:

    - Row traits (`DbReader`, `DbTransaction`) implemented per backend:
      SQLite (sync and async), redb and an in-memory store
    - `StorageApi`, the node's single storage interface, implemented once
      on top of the row traits by `StorageSync` and `StorageAsync`

    Storage is authoritative only at cold start; the in-memory replica is
    authoritative while a CoValue is loaded.
*/

pub mod api;
pub mod client;
pub mod errors;
pub mod memory;
pub mod mirror;
pub mod redb_store;
pub mod sqlite;
pub mod types;

pub use api::{SharedStorage, StorageApi, StorageAsync, StorageSync};
pub use client::{DbClient, DbClientAsync, DbReader, DbTransaction};
pub use errors::{StorageError, StorageResult};
pub use memory::{MemoryClient, STORE_VERSION};
pub use mirror::LOCK_STALE_AFTER_MS;
pub use redb_store::RedbClient;
pub use sqlite::{SqliteAsyncClient, SqliteClient};
pub use types::{DeletedStatus, LockRecord, StoreOutcome};

use crate::config::{StorageBackend, StorageConfig};
use std::sync::Arc;
use tracing::info;

/// Open the configured backend, creating its directory if needed
pub async fn open_storage(config: &StorageConfig, max_bytes_per_signature: usize) -> StorageResult<SharedStorage> {
    if config.backend != StorageBackend::Memory {
        if let Some(dir) = config.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
    }
    let path = &config.path;
    let storage: SharedStorage = match config.backend {
        StorageBackend::Sqlite => Arc::new(StorageSync::with_cadence(SqliteClient::open(path)?, max_bytes_per_signature)),
        StorageBackend::SqliteAsync => Arc::new(StorageAsync::with_cadence(
            SqliteAsyncClient::open(path).await?,
            max_bytes_per_signature,
        )),
        StorageBackend::Redb => Arc::new(StorageSync::with_cadence(RedbClient::open(path)?, max_bytes_per_signature)),
        StorageBackend::Memory => Arc::new(StorageSync::with_cadence(MemoryClient::new(), max_bytes_per_signature)),
    };
    info!(backend = ?config.backend, path = %path.display(), "Storage opened");
    Ok(storage)
}

/// One suite, run against every backend
#[cfg(test)]
mod conformance {
    use super::*;
    use crate::core_covalue::{
        CoValueHeader, CoValueType, KnownState, NewContent, RawCoId, Ruleset, SessionId, SessionOwner, Transaction,
        VerifiedState, DEFAULT_MAX_BYTES_PER_SIGNATURE,
    };
    use crate::core_crypto::{AgentSecret, CryptoProvider, PureCrypto};
    use crate::core_sync::PeerId;
    use serde_json::json;
    use std::future::Future;
    use std::sync::Arc;

    const CADENCES: [usize; 3] = [64, 1024, DEFAULT_MAX_BYTES_PER_SIGNATURE];

    async fn sqlite_sync(cadence: usize) -> SharedStorage {
        Arc::new(StorageSync::with_cadence(SqliteClient::memory().unwrap(), cadence))
    }

    async fn sqlite_async(cadence: usize) -> SharedStorage {
        Arc::new(StorageAsync::with_cadence(SqliteAsyncClient::memory().await.unwrap(), cadence))
    }

    async fn redb(cadence: usize) -> SharedStorage {
        Arc::new(StorageSync::with_cadence(RedbClient::in_memory().unwrap(), cadence))
    }

    async fn memory(cadence: usize) -> SharedStorage {
        Arc::new(StorageSync::with_cadence(MemoryClient::new(), cadence))
    }

    struct Writer {
        crypto: PureCrypto,
        agent: AgentSecret,
        owner: SessionOwner,
    }

    impl Writer {
        fn new() -> Self {
            let crypto = PureCrypto::new();
            let agent = crypto.new_agent_secret();
            let owner = SessionOwner::Agent(crypto.agent_id(&agent).unwrap());
            Self { crypto, agent, owner }
        }

        fn co_value(&self, uniqueness: &str) -> VerifiedState {
            let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!(uniqueness));
            VerifiedState::new(header.id().unwrap(), header, 200).unwrap()
        }

        fn session(&self, name: &str) -> SessionId {
            SessionId::new(&self.owner, name)
        }

        fn write(&self, state: &mut VerifiedState, session: &SessionId, count: u64) {
            for i in 0..count {
                let tx = Transaction::trusting(
                    1_000 + i,
                    &[json!({"op": "set", "key": format!("k{i}"), "value": "x".repeat(40)})],
                    None,
                )
                .unwrap();
                state.make_transaction(&self.crypto, session, self.agent.signer_secret(), tx).unwrap();
            }
        }

        /// Rebuild a replica from stored pieces, verifying every signature
        fn replay(&self, pieces: Vec<NewContent>) -> VerifiedState {
            let header = pieces[0].header.clone().unwrap();
            let mut state = VerifiedState::new(pieces[0].id.clone(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();
            let signer = self.crypto.agent_id(&self.agent).unwrap().signer_id();
            for piece in pieces {
                for (session, chunk) in piece.new {
                    state
                        .try_add_transactions(
                            &self.crypto,
                            &session,
                            Some(&signer),
                            chunk.after,
                            chunk.new_transactions,
                            chunk.last_signature,
                            false,
                        )
                        .unwrap();
                }
            }
            state
        }
    }

    fn stored(outcomes: &[StoreOutcome]) -> KnownState {
        match outcomes.last() {
            Some(StoreOutcome::Stored(known)) => known.clone(),
            other => panic!("expected Stored, got {other:?}"),
        }
    }

    async fn round_trip_across_cadences<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        for cadence in CADENCES {
            let storage = make(cadence).await;
            let mut source = writer.co_value(&format!("rt{cadence}"));
            let (one, two) = (writer.session("one"), writer.session("two"));

            writer.write(&mut source, &one, 6);
            writer.write(&mut source, &two, 2);
            storage.store(&source.new_content_since(None)).await.unwrap();

            let before = source.known_state();
            writer.write(&mut source, &one, 5);
            writer.write(&mut source, &two, 7);
            let outcomes = storage.store(&source.new_content_since(Some(&before))).await.unwrap();
            assert_eq!(stored(&outcomes), source.known_state());

            let pieces = storage.load(source.id()).await.unwrap().unwrap();
            assert!(pieces[0].header.is_some());
            if cadence == 64 {
                assert!(pieces.len() > 1);
            }
            assert_eq!(writer.replay(pieces).known_state(), source.known_state());
            assert_eq!(storage.known_state(source.id()).await.unwrap(), Some(source.known_state()));
        }
    }

    async fn overlapping_store_is_trimmed<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let mut source = writer.co_value("overlap");
        let session = writer.session("s");

        writer.write(&mut source, &session, 3);
        storage.store(&source.new_content_since(None)).await.unwrap();
        writer.write(&mut source, &session, 3);

        // Resending from zero only appends the tail
        let outcomes = storage.store(&source.new_content_since(None)).await.unwrap();
        assert_eq!(stored(&outcomes).session_count(&session), 6);
        let pieces = storage.load(source.id()).await.unwrap().unwrap();
        assert_eq!(writer.replay(pieces).known_state(), source.known_state());
    }

    async fn gap_needs_correction<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let mut source = writer.co_value("gap");
        let session = writer.session("s");
        writer.write(&mut source, &session, 6);

        let mut header_only = NewContent::empty(source.id().clone(), source.header().priority());
        header_only.header = Some(source.header().clone());
        storage.store(&[header_only]).await.unwrap();

        let mut claimed = KnownState::empty(source.id().clone());
        claimed.header = true;
        claimed.set_session(session.clone(), 3);
        let outcomes = storage.store(&source.new_content_since(Some(&claimed))).await.unwrap();

        match &outcomes[0] {
            StoreOutcome::NeedsCorrection(known) => {
                assert!(known.header);
                assert_eq!(known.session_count(&session), 0);
            }
            other => panic!("expected NeedsCorrection, got {other:?}"),
        }
    }

    async fn missing_header<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let mut source = writer.co_value("headless");
        let session = writer.session("s");
        writer.write(&mut source, &session, 2);

        let mut pieces = source.new_content_since(None);
        pieces[0].header = None;
        let outcomes = storage.store(&pieces).await.unwrap();
        assert_eq!(outcomes[0], StoreOutcome::MissingHeader(source.id().clone()));
        assert!(storage.load(source.id()).await.unwrap().is_none());
        assert!(storage.known_state(source.id()).await.unwrap().is_none());
    }

    async fn deletion_keeps_tombstone<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let mut source = writer.co_value("doomed");
        let session = writer.session("s");
        writer.write(&mut source, &session, 4);
        storage.store(&source.new_content_since(None)).await.unwrap();

        let before = source.known_state();
        let deleted_session = SessionId::new_deleted(&writer.owner, "d");
        source
            .make_transaction(
                &writer.crypto,
                &deleted_session,
                writer.agent.signer_secret(),
                Transaction::tombstone(5_000).unwrap(),
            )
            .unwrap();
        storage.store(&source.new_content_since(Some(&before))).await.unwrap();
        assert_eq!(storage.deleted_status(source.id()).await.unwrap(), Some(DeletedStatus::Pending));

        // Marking again is a no-op
        storage.mark_deleted(source.id()).await.unwrap();
        assert_eq!(storage.deleted_status(source.id()).await.unwrap(), Some(DeletedStatus::Pending));

        assert_eq!(storage.erase_all_deleted().await.unwrap(), vec![source.id().clone()]);
        assert_eq!(storage.deleted_status(source.id()).await.unwrap(), Some(DeletedStatus::Done));
        assert!(storage.erase_all_deleted().await.unwrap().is_empty());

        let known = storage.known_state(source.id()).await.unwrap().unwrap();
        assert!(known.header);
        assert_eq!(known.session_count(&session), 0);
        assert_eq!(known.session_count(&deleted_session), 1);

        // Late content for ordinary sessions is dropped
        let outcomes = storage.store(&source.new_content_since(None)).await.unwrap();
        assert_eq!(stored(&outcomes).session_count(&session), 0);
    }

    async fn unsynced_tracking<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let a = RawCoId::parse("co_zAlpha").unwrap();
        let b = RawCoId::parse("co_zBeta").unwrap();
        let (server, backup) = (PeerId::from("server"), PeerId::from("backup"));

        storage.track_sync_state(&a, &server, false).await.unwrap();
        storage.track_sync_state(&a, &backup, false).await.unwrap();
        storage.track_sync_state(&b, &server, false).await.unwrap();
        storage.track_sync_state(&b, &server, false).await.unwrap();
        assert_eq!(storage.unsynced_co_value_ids().await.unwrap(), vec![a.clone(), b.clone()]);

        storage.track_sync_state(&a, &server, true).await.unwrap();
        assert_eq!(storage.unsynced_co_value_ids().await.unwrap(), vec![a.clone(), b.clone()]);

        storage.track_sync_state(&b, &server, true).await.unwrap();
        assert_eq!(storage.unsynced_co_value_ids().await.unwrap(), vec![a.clone()]);

        storage.stop_tracking_sync_state(&a).await.unwrap();
        assert!(storage.unsynced_co_value_ids().await.unwrap().is_empty());
    }

    async fn locks_resume_offset<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let key = "reconcile:server";

        let first = storage.try_acquire_lock(key, "a", 1_000).await.unwrap().unwrap();
        assert_eq!(first.last_processed_offset, 0);
        assert!(storage.try_acquire_lock(key, "b", 2_000).await.unwrap().is_none());

        assert!(storage.update_lock_offset(key, "a", 40, 3_000).await.unwrap());
        assert!(!storage.update_lock_offset(key, "b", 80, 3_000).await.unwrap());
        assert!(storage.release_lock(key, "a", false, 4_000).await.unwrap());

        let resumed = storage.try_acquire_lock(key, "b", 5_000).await.unwrap().unwrap();
        assert_eq!(resumed.last_processed_offset, 40);

        // A stale holder can be taken over
        let stale_at = 5_000 + LOCK_STALE_AFTER_MS + 1;
        let taken = storage.try_acquire_lock(key, "c", stale_at).await.unwrap().unwrap();
        assert_eq!(taken.holder_session_id, "c");
        assert!(!storage.release_lock(key, "b", true, stale_at).await.unwrap());

        assert!(storage.release_lock(key, "c", true, stale_at + 1).await.unwrap());
        let fresh = storage.try_acquire_lock(key, "d", stale_at + 2).await.unwrap().unwrap();
        assert_eq!(fresh.last_processed_offset, 0);
    }

    async fn stored_ids_paging<Fut: Future<Output = SharedStorage>>(make: impl Fn(usize) -> Fut) {
        let writer = Writer::new();
        let storage = make(DEFAULT_MAX_BYTES_PER_SIGNATURE).await;
        let mut expected = Vec::new();
        for i in 0..5 {
            let source = writer.co_value(&format!("page{i}"));
            storage.store(&source.new_content_since(None)).await.unwrap();
            expected.push(source.id().clone());
        }

        let mut seen = Vec::new();
        let mut offset = 0;
        loop {
            let page = storage.stored_co_value_ids(offset, 2).await.unwrap();
            if page.is_empty() {
                break;
            }
            assert!(page.len() <= 2);
            offset += page.len() as u64;
            seen.extend(page);
        }
        assert_eq!(seen, expected);
    }

    macro_rules! conformance_suite {
        ($($backend:ident),* $(,)?) => {
            $(
                mod $backend {
                    #[tokio::test]
                    async fn test_round_trip_across_cadences() {
                        super::round_trip_across_cadences(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_overlapping_store_is_trimmed() {
                        super::overlapping_store_is_trimmed(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_gap_needs_correction() {
                        super::gap_needs_correction(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_missing_header() {
                        super::missing_header(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_deletion_keeps_tombstone() {
                        super::deletion_keeps_tombstone(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_unsynced_tracking() {
                        super::unsynced_tracking(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_locks_resume_offset() {
                        super::locks_resume_offset(super::$backend).await;
                    }

                    #[tokio::test]
                    async fn test_stored_ids_paging() {
                        super::stored_ids_paging(super::$backend).await;
                    }
                }
            )*
        };
    }

    conformance_suite!(sqlite_sync, sqlite_async, redb, memory);

    #[tokio::test]
    async fn test_open_storage_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::new();
        let source = writer.co_value("opened");
        for backend in [crate::config::StorageBackend::Sqlite, crate::config::StorageBackend::Redb] {
            let config = crate::config::StorageConfig {
                backend,
                path: dir.path().join(format!("{backend:?}")).join("store.db"),
            };
            let storage = open_storage(&config, DEFAULT_MAX_BYTES_PER_SIGNATURE).await.unwrap();
            storage.store(&source.new_content_since(None)).await.unwrap();
            drop(storage);

            let reopened = open_storage(&config, DEFAULT_MAX_BYTES_PER_SIGNATURE).await.unwrap();
            assert_eq!(reopened.known_state(source.id()).await.unwrap(), Some(source.known_state()));
        }
    }
}
