//! In-memory SyncHost for protocol tests
//!
//! Holds UnsafeAllowAll CoValues in a map and verifies agent-signed
//! sessions only. Storage, when given, is used only by reconciliation.

use super::manager::{IngestOutcome, SyncHost, SyncManager};
use super::peer::{locked, PeerId};
use crate::config::SyncConfig;
use crate::core_covalue::{
    CoValueError, CoValueHeader, CoValuePriority, CoValueType, KnownState, LoadingState, NewContent, RawCoId,
    Ruleset, SessionId, SessionOwner, SourceLoadState, Transaction, VerifiedState, DEFAULT_MAX_BYTES_PER_SIGNATURE,
};
use crate::core_crypto::{AgentSecret, CryptoProvider, PureCrypto};
use crate::core_storage::SharedStorage;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Host over a plain map
pub(crate) struct FakeHost {
    pub sync: SyncManager,
    pub crypto: PureCrypto,
    pub values: Mutex<HashMap<RawCoId, VerifiedState>>,
    peer_states: Mutex<HashMap<(RawCoId, PeerId), SourceLoadState>>,
    storage: Option<SharedStorage>,
    changed: Notify,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Self::build(SyncConfig::default(), None)
    }

    /// Storage is only used by reconciliation; loads stay in memory
    pub fn with_storage(config: SyncConfig, storage: SharedStorage) -> Arc<Self> {
        Self::build(config, Some(storage))
    }

    fn build(config: SyncConfig, storage: Option<SharedStorage>) -> Arc<Self> {
        Arc::new(Self {
            sync: SyncManager::new(config),
            crypto: PureCrypto::new(),
            values: Mutex::new(HashMap::new()),
            peer_states: Mutex::new(HashMap::new()),
            storage,
            changed: Notify::new(),
        })
    }

    pub fn create(&self, agent: &AgentSecret, writes: usize) -> RawCoId {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!(rand::random::<u64>()));
        let id = header.id().unwrap();
        let mut state = VerifiedState::new(id.clone(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();
        let owner = SessionOwner::Agent(self.crypto.agent_id(agent).unwrap());
        let session = SessionId::new(&owner, "s");
        for i in 0..writes {
            let tx = Transaction::trusting(i as u64, &[json!({"op": "set", "key": "k", "value": i})], None).unwrap();
            state.make_transaction(&self.crypto, &session, agent.signer_secret(), tx).unwrap();
        }
        locked(&self.values).insert(id.clone(), state);
        id
    }

    pub fn peer_state(&self, id: &RawCoId, peer: &str) -> SourceLoadState {
        locked(&self.peer_states)
            .get(&(id.clone(), PeerId::from(peer)))
            .copied()
            .unwrap_or(SourceLoadState::Unknown)
    }

    pub async fn wait_for(&self, check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::select! {
                    _ = self.changed.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        })
        .await
        .expect("condition not reached");
    }
}

#[async_trait]
impl SyncHost for FakeHost {
    fn sync(&self) -> &SyncManager {
        &self.sync
    }

    fn storage(&self) -> Option<SharedStorage> {
        self.storage.clone()
    }

    fn holder(&self) -> String {
        "fake".to_string()
    }

    fn known_state(&self, id: &RawCoId) -> Option<KnownState> {
        locked(&self.values).get(id).map(|s| s.known_state())
    }

    fn loading_state(&self, id: &RawCoId) -> LoadingState {
        if locked(&self.values).contains_key(id) {
            LoadingState::Available
        } else {
            LoadingState::Unknown
        }
    }

    fn priority(&self, _id: &RawCoId) -> CoValuePriority {
        CoValuePriority::Medium
    }

    fn content_since(&self, id: &RawCoId, since: Option<&KnownState>) -> Option<(Vec<NewContent>, KnownState)> {
        let values = locked(&self.values);
        let state = values.get(id)?;
        Some((state.new_content_since(since), state.known_state()))
    }

    fn loaded_ids(&self) -> Vec<RawCoId> {
        locked(&self.values).keys().cloned().collect()
    }

    fn mark_peer_state(&self, id: &RawCoId, peer: &PeerId, state: SourceLoadState) {
        locked(&self.peer_states).insert((id.clone(), peer.clone()), state);
        self.changed.notify_waiters();
    }

    fn forget_peer(&self, peer: &PeerId) {
        locked(&self.peer_states).retain(|(_, p), _| p != peer);
    }

    async fn load_for_peer(&self, id: &RawCoId, from: Option<&PeerId>) -> bool {
        if self.known_state(id).is_some() {
            return true;
        }
        if from.is_none() {
            return false;
        }
        self.sync.request(self, id, from);
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while self.known_state(id).is_none()
                && locked(&self.peer_states).values().any(|s| *s == SourceLoadState::Pending)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        self.known_state(id).is_some()
    }

    async fn ingest(&self, _from: &PeerId, content: &[NewContent]) -> IngestOutcome {
        let mut values = locked(&self.values);
        let mut added = 0;
        for piece in content {
            if !values.contains_key(&piece.id) {
                let Some(header) = piece.header.clone() else {
                    return IngestOutcome::MissingHeader;
                };
                match VerifiedState::new(piece.id.clone(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE) {
                    Ok(state) => values.insert(piece.id.clone(), state),
                    Err(err) => return IngestOutcome::Rejected(err.to_string()),
                };
            }
            let Some(state) = values.get_mut(&piece.id) else { continue };
            for (session, chunk) in &piece.new {
                let signer = match session.owner() {
                    SessionOwner::Agent(agent) => agent.signer_id(),
                    SessionOwner::Account(_) => return IngestOutcome::Rejected("no accounts".into()),
                };
                let result = state.try_add_transactions(
                    &self.crypto,
                    session,
                    Some(&signer),
                    chunk.after,
                    chunk.new_transactions.clone(),
                    chunk.last_signature.clone(),
                    false,
                );
                match result {
                    Ok(n) => added += n,
                    Err(CoValueError::NonContiguous { .. }) => {
                        return IngestOutcome::Gap { known: state.known_state() }
                    }
                    Err(err) => return IngestOutcome::Rejected(err.to_string()),
                }
            }
        }
        let known = values.get(&content[0].id).map(|s| s.known_state());
        drop(values);
        self.changed.notify_waiters();
        match known {
            Some(known) => IngestOutcome::Applied { known, new_transactions: added },
            None => IngestOutcome::MissingHeader,
        }
    }
}
