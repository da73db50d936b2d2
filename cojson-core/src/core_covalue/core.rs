/*
    core.rs - Registry entry for one CoValue

    Wraps the (optional) VerifiedState with everything the node tracks
    around it: per-source load states, last access time for the garbage
    collector, the deleted flag and the update/loading watch channels.
*/

use super::errors::{CoValueError, CoValueResult};
use super::header::CoValueHeader;
use super::ids::{RawCoId, SessionId};
use super::transaction::{now_millis, Transaction};
use super::verified_state::VerifiedState;
use crate::core_crypto::{CryptoProvider, SignerSecret};
use crate::core_group::{PermissionError, Role};
use crate::core_sync::PeerId;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::watch;

/// Load progress of a CoValue from one source (a peer or storage)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLoadState {
    Unknown,
    Pending,
    Available,
    Unavailable,
}

/// Derived load progress of a CoValue across all sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Unknown,
    Loading,
    Available,
    Unavailable,
}

#[derive(Debug)]
pub struct CoValueCore {
    id: RawCoId,
    verified: Option<VerifiedState>,
    peer_states: HashMap<PeerId, SourceLoadState>,
    storage_state: SourceLoadState,
    last_accessed: Option<Instant>,
    is_deleted: bool,
    update_count: u64,
    updates: watch::Sender<u64>,
    loading: watch::Sender<LoadingState>,
}

impl CoValueCore {
    pub fn new(id: RawCoId) -> Self {
        Self {
            id,
            verified: None,
            peer_states: HashMap::new(),
            storage_state: SourceLoadState::Unknown,
            last_accessed: None,
            is_deleted: false,
            update_count: 0,
            updates: watch::channel(0).0,
            loading: watch::channel(LoadingState::Unknown).0,
        }
    }

    pub fn from_verified(state: VerifiedState) -> Self {
        let mut core = Self::new(state.id().clone());
        core.verified = Some(state);
        core.refresh_loading();
        core
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn verified(&self) -> Option<&VerifiedState> {
        self.verified.as_ref()
    }

    pub(crate) fn verified_mut(&mut self) -> Option<&mut VerifiedState> {
        self.verified.as_mut()
    }

    pub fn is_available(&self) -> bool {
        self.verified.is_some()
    }

    /// Install the header if we have none yet
    pub fn provide_header(&mut self, header: CoValueHeader, max_bytes_per_signature: usize) -> CoValueResult<bool> {
        if self.verified.is_some() {
            return Ok(false);
        }
        self.verified = Some(VerifiedState::new(self.id.clone(), header, max_bytes_per_signature)?);
        self.refresh_loading();
        Ok(true)
    }

    pub fn loading_state(&self) -> LoadingState {
        if self.verified.is_some() {
            return LoadingState::Available;
        }
        let sources = || self.peer_states.values().chain(std::iter::once(&self.storage_state));
        if sources().any(|s| *s == SourceLoadState::Pending) {
            LoadingState::Loading
        } else if sources().any(|s| *s == SourceLoadState::Unavailable) {
            LoadingState::Unavailable
        } else {
            LoadingState::Unknown
        }
    }

    pub fn peer_state(&self, peer: &PeerId) -> SourceLoadState {
        self.peer_states.get(peer).copied().unwrap_or(SourceLoadState::Unknown)
    }

    pub fn storage_state(&self) -> SourceLoadState {
        self.storage_state
    }

    pub fn mark_peer(&mut self, peer: &PeerId, state: SourceLoadState) {
        self.peer_states.insert(peer.clone(), state);
        self.refresh_loading();
    }

    pub fn mark_storage(&mut self, state: SourceLoadState) {
        self.storage_state = state;
        self.refresh_loading();
    }

    /// Drop what we know about a disconnected peer
    pub fn forget_peer(&mut self, peer: &PeerId) {
        if self.peer_states.remove(peer).is_some() {
            self.refresh_loading();
        }
    }

    fn refresh_loading(&mut self) {
        let state = self.loading_state();
        self.loading.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    pub fn watch_loading(&self) -> watch::Receiver<LoadingState> {
        self.loading.subscribe()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = Some(now);
    }

    pub fn last_accessed(&self) -> Option<Instant> {
        self.last_accessed
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub(crate) fn set_deleted(&mut self) {
        if !self.is_deleted {
            self.is_deleted = true;
            self.notify_updated();
        }
    }

    /// Bump the update counter seen by subscribers
    pub fn notify_updated(&mut self) {
        self.update_count += 1;
        self.updates.send_replace(self.update_count);
        self.refresh_loading();
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.updates.subscribe()
    }

    pub fn has_subscribers(&self) -> bool {
        self.updates.receiver_count() > 0
    }

    /// Nothing held, nothing pending and nobody waiting: the entry only
    /// records where a load failed
    pub fn is_placeholder(&self) -> bool {
        self.verified.is_none()
            && !self.is_deleted
            && !self.has_subscribers()
            && self.loading.receiver_count() == 0
            && self.loading_state() != LoadingState::Loading
    }

    /// Active -> Deleted.
    ///
    /// Appends a single trusting tombstone to `deleted_session`. Groups and
    /// accounts can never be deleted; ordinary CoValues only by an admin of
    /// the owning group (`caller_role`).
    pub fn delete_co_value(
        &mut self,
        crypto: &dyn CryptoProvider,
        deleted_session: &SessionId,
        signer_secret: &SignerSecret,
        caller_role: Option<Role>,
    ) -> CoValueResult<()> {
        let id = self.id.clone();
        let verified = self.verified.as_mut().ok_or(CoValueError::NotAvailable(id))?;

        if verified.header().is_group() {
            return Err(PermissionError::CannotDeleteGroupOrAccount.into());
        }
        if caller_role != Some(Role::Admin) {
            return Err(PermissionError::OnlyAdminsCanDelete.into());
        }
        if self.is_deleted {
            return Ok(());
        }

        verified.make_transaction(crypto, deleted_session, signer_secret, Transaction::tombstone(now_millis())?)?;
        self.set_deleted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::header::{CoValueType, Ruleset};
    use crate::core_covalue::ids::SessionOwner;
    use crate::core_covalue::session_log::DEFAULT_MAX_BYTES_PER_SIGNATURE;
    use crate::core_crypto::PureCrypto;
    use serde_json::json;

    fn core_for(ruleset: Ruleset, meta: Option<serde_json::Value>) -> CoValueCore {
        let mut header = CoValueHeader::new(CoValueType::CoMap, ruleset, json!("u"));
        header.meta = meta;
        let state = VerifiedState::new(header.id().unwrap(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();
        CoValueCore::from_verified(state)
    }

    fn owner(crypto: &PureCrypto) -> (SessionOwner, SignerSecret) {
        let agent = crypto.new_agent_secret();
        (SessionOwner::Agent(crypto.agent_id(&agent).unwrap()), agent.signer_secret().clone())
    }

    #[test]
    fn test_loading_state_derivation() {
        let mut core = CoValueCore::new(RawCoId::parse("co_zA").unwrap());
        let peer = PeerId::from("server");
        assert_eq!(core.loading_state(), LoadingState::Unknown);

        core.mark_peer(&peer, SourceLoadState::Pending);
        assert_eq!(core.loading_state(), LoadingState::Loading);

        core.mark_storage(SourceLoadState::Unavailable);
        assert_eq!(core.loading_state(), LoadingState::Loading);

        core.mark_peer(&peer, SourceLoadState::Unavailable);
        assert_eq!(core.loading_state(), LoadingState::Unavailable);
        assert_eq!(*core.watch_loading().borrow(), LoadingState::Unavailable);
    }

    #[test]
    fn test_cannot_delete_group() {
        let crypto = PureCrypto::new();
        let (admin, secret) = owner(&crypto);
        let mut core = core_for(Ruleset::Group { initial_admin: admin.clone() }, None);
        let err = core
            .delete_co_value(&crypto, &SessionId::new_deleted(&admin, "d"), &secret, Some(Role::Admin))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete Group or Account coValues");
    }

    #[test]
    fn test_cannot_delete_account() {
        let crypto = PureCrypto::new();
        let (admin, secret) = owner(&crypto);
        let mut core = core_for(Ruleset::Group { initial_admin: admin.clone() }, Some(json!({"type": "account"})));
        let err = core
            .delete_co_value(&crypto, &SessionId::new_deleted(&admin, "d"), &secret, Some(Role::Admin))
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete Group or Account coValues");
    }

    #[test]
    fn test_only_admins_can_delete() {
        let crypto = PureCrypto::new();
        let (writer, secret) = owner(&crypto);
        let group = RawCoId::parse("co_zGroup").unwrap();
        let mut core = core_for(Ruleset::OwnedByGroup { group }, None);

        for role in [None, Some(Role::Reader), Some(Role::Writer)] {
            let err = core
                .delete_co_value(&crypto, &SessionId::new_deleted(&writer, "d"), &secret, role)
                .unwrap_err();
            assert_eq!(err.to_string(), "Only admins can delete coValues");
        }
        assert!(!core.is_deleted());
    }

    #[test]
    fn test_admin_delete_appends_one_tombstone() {
        let crypto = PureCrypto::new();
        let (admin, secret) = owner(&crypto);
        let group = RawCoId::parse("co_zGroup").unwrap();
        let mut core = core_for(Ruleset::OwnedByGroup { group }, None);
        let updates = core.subscribe();

        let session = SessionId::new_deleted(&admin, "d");
        core.delete_co_value(&crypto, &session, &secret, Some(Role::Admin)).unwrap();

        assert!(core.is_deleted());
        let log = core.verified().unwrap().session(&session).unwrap();
        assert_eq!(log.len(), 1);
        assert!(log.transactions()[0].is_trusting());
        assert!(log.transactions()[0].is_tombstone());
        assert!(updates.has_changed().unwrap());
    }
}
