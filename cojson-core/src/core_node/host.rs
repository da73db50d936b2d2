/*
    host.rs - The node as seen by the peer protocol

    Received content is verified against the signer of each session. A
    session owned by an account we do not hold yet cannot be verified, so
    the whole message is handed back as MissingDependencies; the protocol
    loads those accounts and retries. Everything that gets applied is
    written through to storage, and a valid tombstone marks the CoValue
    deleted.
*/

use super::node::NodeInner;
use crate::core_covalue::{
    CoValueError, CoValuePriority, KnownState, LoadingState, NewContent, RawCoId, SessionId, SourceLoadState,
};
use crate::core_crypto::SignerId;
use crate::core_group::signer_for_session;
use crate::core_storage::SharedStorage;
use crate::core_sync::{IngestOutcome, PeerId, SyncHost, SyncManager};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What applying one message did
struct Applied {
    outcome: IngestOutcome,
    changed: bool,
    newly_deleted: bool,
}

impl NodeInner {
    fn apply_received(&self, from: &PeerId, id: &RawCoId, content: &[NewContent]) -> Applied {
        let unchanged = |outcome| Applied { outcome, changed: false, newly_deleted: false };
        let mut registry = self.registry();

        let header = match registry.verified(id) {
            Some(state) => state.header().clone(),
            None => match content.iter().find_map(|piece| piece.header.clone()) {
                Some(header) => header,
                None => return unchanged(IngestOutcome::MissingHeader),
            },
        };

        let mut signers: HashMap<&SessionId, SignerId> = HashMap::new();
        let mut missing: Vec<RawCoId> = Vec::new();
        for session in content.iter().flat_map(|piece| piece.new.keys()) {
            if signers.contains_key(session) {
                continue;
            }
            match signer_for_session(id, &header, session, &*registry) {
                Some(signer) => {
                    signers.insert(session, signer);
                }
                None => {
                    if let Some(account) = session.owner().as_account() {
                        if account != id && !missing.contains(account) {
                            missing.push(account.clone());
                        }
                    }
                }
            }
        }
        if !missing.is_empty() {
            return unchanged(IngestOutcome::MissingDependencies(missing));
        }

        let max_bytes = self.max_bytes_per_signature();
        let core = registry.entry(id);
        let header_new = match core.provide_header(header.clone(), max_bytes) {
            Ok(new) => new,
            Err(err) => {
                warn!(peer = %from, id = %id, error = %err, "Rejected header");
                return unchanged(IngestOutcome::Rejected(err.to_string()));
            }
        };
        let Some(state) = core.verified_mut() else {
            return unchanged(IngestOutcome::MissingHeader);
        };

        let mut added = 0;
        let mut gap = false;
        let mut rejected = None;
        let mut tombstone_seen = false;
        for piece in content {
            for (session, chunk) in &piece.new {
                let result = state.try_add_transactions(
                    self.crypto.as_ref(),
                    session,
                    signers.get(session),
                    chunk.after,
                    chunk.new_transactions.clone(),
                    chunk.last_signature.clone(),
                    false,
                );
                match result {
                    Ok(count) => {
                        added += count;
                        tombstone_seen |= count > 0 && session.is_deleted_session();
                    }
                    Err(CoValueError::NonContiguous { .. }) => gap = true,
                    Err(err) => {
                        warn!(peer = %from, id = %id, session = %session, error = %err, "Rejected session content");
                        rejected = Some(err.to_string());
                    }
                }
            }
        }
        let known = state.known_state();
        let changed = added > 0 || header_new;
        if changed {
            core.notify_updated();
        }

        let newly_deleted = tombstone_seen && registry.settle_deletion(id);

        let outcome = if gap {
            IngestOutcome::Gap { known }
        } else if let Some(reason) = rejected.filter(|_| !changed) {
            IngestOutcome::Rejected(reason)
        } else {
            IngestOutcome::Applied { known, new_transactions: added }
        };
        Applied { outcome, changed, newly_deleted }
    }

    async fn mark_deleted_in(&self, storage: &SharedStorage, id: &RawCoId) {
        if let Err(err) = storage.mark_deleted(id).await {
            warn!(id = %id, error = %err, "Cannot record deletion");
        }
    }
}

#[async_trait]
impl SyncHost for NodeInner {
    fn sync(&self) -> &SyncManager {
        &self.sync
    }

    fn storage(&self) -> Option<SharedStorage> {
        self.current_storage()
    }

    fn holder(&self) -> String {
        self.session.to_string()
    }

    fn known_state(&self, id: &RawCoId) -> Option<KnownState> {
        self.registry().verified(id).map(|state| state.known_state())
    }

    fn loading_state(&self, id: &RawCoId) -> LoadingState {
        self.registry().get(id).map_or(LoadingState::Unknown, |core| core.loading_state())
    }

    fn priority(&self, id: &RawCoId) -> CoValuePriority {
        self.registry()
            .verified(id)
            .map_or(CoValuePriority::Medium, |state| state.header().priority())
    }

    fn content_since(&self, id: &RawCoId, since: Option<&KnownState>) -> Option<(Vec<NewContent>, KnownState)> {
        let registry = self.registry();
        let state = registry.verified(id)?;
        Some((state.new_content_since(since), state.known_state()))
    }

    fn loaded_ids(&self) -> Vec<RawCoId> {
        self.registry().available_ids()
    }

    fn mark_peer_state(&self, id: &RawCoId, peer: &PeerId, state: SourceLoadState) {
        self.registry().entry(id).mark_peer(peer, state);
    }

    fn forget_peer(&self, peer: &PeerId) {
        for core in self.registry().iter_mut() {
            core.forget_peer(peer);
        }
    }

    async fn load_for_peer(&self, id: &RawCoId, from: Option<&PeerId>) -> bool {
        self.load_co_value(id, from, false).await
    }

    async fn ingest(&self, from: &PeerId, content: &[NewContent]) -> IngestOutcome {
        let Some(first) = content.first() else {
            return IngestOutcome::Rejected("empty content".to_string());
        };
        let id = first.id.clone();

        let Applied { outcome, changed, newly_deleted } = self.apply_received(from, &id, content);
        if let IngestOutcome::Applied { new_transactions, .. } = &outcome {
            debug!(peer = %from, id = %id, new_transactions, "Ingested content");
        }

        if changed {
            self.persist(std::slice::from_ref(&id)).await;
        }
        if newly_deleted {
            info!(peer = %from, id = %id, "CoValue deleted remotely");
            if let Some(storage) = self.current_storage() {
                self.mark_deleted_in(&storage, &id).await;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_covalue::{CoValueHeader, CoValueType, Ruleset};
    use crate::core_node::LocalNode;
    use serde_json::json;

    fn peer() -> PeerId {
        PeerId::from("peer")
    }

    #[tokio::test]
    async fn test_unknown_account_session_is_a_dependency() {
        let alice = LocalNode::with_new_account(Config::default()).unwrap();
        let bob = LocalNode::with_new_account(Config::default()).unwrap();

        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("shared"));
        let id = alice.create_co_value(header).await.unwrap();
        alice.mutate_trusting(&id, vec![json!({"op": "set", "key": "a", "value": 1})]).await.unwrap();
        let (content, _) = alice.inner.content_since(&id, None).unwrap();

        let outcome = bob.inner.ingest(&peer(), &content).await;
        assert_eq!(outcome, IngestOutcome::MissingDependencies(vec![alice.account_id().clone()]));
        assert!(!bob.is_loaded(&id));

        // Once the author's account is known the same content goes through
        let (account, _) = alice.inner.content_since(alice.account_id(), None).unwrap();
        assert!(matches!(bob.inner.ingest(&peer(), &account).await, IngestOutcome::Applied { .. }));
        match bob.inner.ingest(&peer(), &content).await {
            IngestOutcome::Applied { known, new_transactions } => {
                assert_eq!(new_transactions, 1);
                assert_eq!(Some(known), alice.inner.known_state(&id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_without_header_nothing_is_created() {
        let alice = LocalNode::with_new_account(Config::default()).unwrap();
        let bob = LocalNode::with_new_account(Config::default()).unwrap();
        let (mut account, _) = alice.inner.content_since(alice.account_id(), None).unwrap();
        account[0].header = None;

        assert_eq!(bob.inner.ingest(&peer(), &account).await, IngestOutcome::MissingHeader);
        assert!(!bob.is_loaded(alice.account_id()));
    }

    #[tokio::test]
    async fn test_tampered_content_is_rejected() {
        let alice = LocalNode::with_new_account(Config::default()).unwrap();
        let bob = LocalNode::with_new_account(Config::default()).unwrap();
        let (mut account, _) = alice.inner.content_since(alice.account_id(), None).unwrap();
        let forged = bob.inner.content_since(bob.account_id(), None).unwrap().0;
        let (session, chunk) = account[0].new.iter_mut().next().unwrap();
        let other_chunk = forged[0].new.values().next().unwrap();
        chunk.last_signature = other_chunk.last_signature.clone();
        let session = session.clone();

        match bob.inner.ingest(&peer(), &account).await {
            IngestOutcome::Rejected(_) | IngestOutcome::Applied { new_transactions: 0, .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        let known = bob.inner.known_state(alice.account_id()).unwrap_or_else(|| KnownState::empty(alice.account_id().clone()));
        assert_eq!(known.session_count(&session), 0);
    }
}
