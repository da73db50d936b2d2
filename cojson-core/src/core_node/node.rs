/*
    node.rs - LocalNode, the context handle

    One node is one account acting through one session. It owns the
    registry of CoValues, the optional storage, the peer protocol and the
    node's background tasks. Any number of nodes can live in a process;
    nothing here is global.

    Lock order: the registry mutex is never held across an await and
    never while calling into the sync manager.
*/

use super::errors::{NodeError, NodeResult};
use super::registry::Registry;
use crate::config::Config;
use crate::core_covalue::{
    now_millis, CoValueCore, CoValueHeader, KnownState, NewContent, RawCoId, SessionId, SessionOwner, Transaction,
    VerifiedState,
};
use crate::core_crypto::{AgentId, AgentSecret, CryptoProvider, PureCrypto};
use crate::core_group::{account_agent_from_header, initial_group_ops, MapOp};
use crate::core_storage::SharedStorage;
use crate::core_sync::peer::locked;
use crate::core_sync::{run_reconciliation, PeerConnection, PeerEntry, PeerId, ReconcileReport, SyncError, SyncHost, SyncManager};
use crate::shutdown::ShutdownCoordinator;
use serde_json::{json, Value as JsonValue};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct NodeInner {
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) agent_secret: AgentSecret,
    pub(crate) agent_id: AgentId,
    pub(crate) account_id: RawCoId,
    pub(crate) session_suffix: String,
    pub(crate) session: SessionId,
    registry: Mutex<Registry>,
    storage: RwLock<Option<SharedStorage>>,
    pub(crate) sync: SyncManager,
    pub(crate) config: Config,
    pub(crate) shutdown: ShutdownCoordinator,
}

impl NodeInner {
    fn new(
        crypto: Arc<dyn CryptoProvider>,
        agent_secret: AgentSecret,
        account_id: RawCoId,
        config: Config,
    ) -> NodeResult<Self> {
        let agent_id = crypto.agent_id(&agent_secret)?;
        let session_suffix = crypto.random_suffix();
        let session = SessionId::new(&SessionOwner::Account(account_id.clone()), &session_suffix);
        Ok(Self {
            crypto,
            agent_secret,
            agent_id,
            account_id,
            session_suffix,
            session,
            registry: Mutex::new(Registry::new()),
            storage: RwLock::new(None),
            sync: SyncManager::new(config.sync.clone()),
            shutdown: ShutdownCoordinator::new(config.server.shutdown_timeout),
            config,
        })
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        locked(&self.registry)
    }

    pub(crate) fn current_storage(&self) -> Option<SharedStorage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace_storage(&self, storage: SharedStorage) {
        *self.storage.write().unwrap_or_else(PoisonError::into_inner) = Some(storage);
    }

    pub(crate) fn max_bytes_per_signature(&self) -> usize {
        self.config.node.max_bytes_per_signature
    }

    /// Who this node acts as in groups
    pub(crate) fn me(&self) -> SessionOwner {
        SessionOwner::Account(self.account_id.clone())
    }

    /// Key entries in our own account are addressed to its agent
    pub(crate) fn member_in(&self, group: &RawCoId) -> SessionOwner {
        if group == &self.account_id {
            SessionOwner::Agent(self.agent_id.clone())
        } else {
            self.me()
        }
    }

    /// Start a fresh CoValue from `header` with one initial trusting transaction
    pub(crate) fn install(&self, header: CoValueHeader, initial: Option<&[JsonValue]>) -> NodeResult<RawCoId> {
        let id = header.id()?;
        let mut state = VerifiedState::new(id.clone(), header, self.max_bytes_per_signature())?;
        if let Some(changes) = initial {
            let tx = Transaction::trusting(now_millis(), changes, None)?;
            state.make_transaction(self.crypto.as_ref(), &self.session, self.agent_secret.signer_secret(), tx)?;
        }

        let mut registry = self.registry();
        if registry.verified(&id).is_none() {
            registry.insert(CoValueCore::from_verified(state));
        }
        Ok(id)
    }

    /// Write everything storage lacks of `ids` in one store call.
    ///
    /// The delta is taken against what storage reports, so concurrent or
    /// partially failed writes heal on the next call.
    pub(crate) async fn persist(&self, ids: &[RawCoId]) {
        let Some(storage) = self.current_storage() else { return };
        let mut content: Vec<NewContent> = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            let stored = match storage.known_state(id).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(id = %id, error = %err, "Cannot read stored known state");
                    continue;
                }
            };
            if let Some((pieces, _)) = self.content_since(id, stored.as_ref()) {
                content.extend(pieces.into_iter().filter(|p| !p.is_empty()));
            }
        }
        if content.is_empty() {
            return;
        }

        match storage.store(&content).await {
            Ok(outcomes) => debug!(pieces = content.len(), outcomes = outcomes.len(), "Persisted content"),
            Err(err) => warn!(error = %err, "Storing content failed"),
        }
    }
}

pub(crate) fn ops_to_changes(ops: &[MapOp]) -> Vec<JsonValue> {
    ops.iter().map(MapOp::to_json).collect()
}

/// Handle to a running node; cheap to clone
#[derive(Clone)]
pub struct LocalNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl LocalNode {
    /// New account with a fresh agent, using the default crypto provider
    pub fn with_new_account(config: Config) -> NodeResult<Self> {
        Self::with_new_account_and_crypto(config, Arc::new(PureCrypto::new()))
    }

    pub fn with_new_account_and_crypto(config: Config, crypto: Arc<dyn CryptoProvider>) -> NodeResult<Self> {
        let agent_secret = crypto.new_agent_secret();
        let agent_id = crypto.agent_id(&agent_secret)?;
        let agent_owner = SessionOwner::Agent(agent_id.clone());
        let header = CoValueHeader::account(agent_owner.clone(), json!(crypto.random_suffix()))
            .with_created_at(now_millis());
        let account_id = header.id()?;

        let inner = NodeInner::new(crypto.clone(), agent_secret, account_id.clone(), config)?;
        let ops = initial_group_ops(
            crypto.as_ref(),
            &account_id,
            &agent_owner,
            &inner.agent_secret,
            &agent_id,
            true,
        )?;
        inner.install(header, Some(&ops_to_changes(&ops)))?;

        info!(account = %account_id, session = %inner.session, "Created account");
        Ok(Self { inner: Arc::new(inner) })
    }

    /// Reopen an existing account from `storage` under a new session
    pub async fn with_account(
        config: Config,
        crypto: Arc<dyn CryptoProvider>,
        agent_secret: AgentSecret,
        account_id: RawCoId,
        storage: SharedStorage,
    ) -> NodeResult<Self> {
        let inner = NodeInner::new(crypto, agent_secret, account_id.clone(), config)?;
        inner.replace_storage(storage);
        if !inner.load_co_value(&account_id, None, false).await {
            return Err(NodeError::Unavailable(account_id));
        }

        let agent = inner.registry().verified(&account_id).and_then(|s| account_agent_from_header(s.header()));
        if agent.as_ref() != Some(&inner.agent_id) {
            return Err(NodeError::AccountMismatch(account_id));
        }

        info!(account = %account_id, session = %inner.session, "Reopened account");
        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn account_id(&self) -> &RawCoId {
        &self.inner.account_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.inner.agent_id
    }

    /// Needed to reopen the account later
    pub fn agent_secret(&self) -> &AgentSecret {
        &self.inner.agent_secret
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session
    }

    pub fn crypto(&self) -> Arc<dyn CryptoProvider> {
        self.inner.crypto.clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn sync(&self) -> &SyncManager {
        &self.inner.sync
    }

    pub fn storage(&self) -> Option<SharedStorage> {
        self.inner.current_storage()
    }

    /// Number of CoValues currently held in memory
    pub fn loaded_count(&self) -> usize {
        self.inner.registry().available_ids().len()
    }

    pub fn is_loaded(&self, id: &RawCoId) -> bool {
        self.inner.registry().verified(id).is_some()
    }

    /// What this node holds of `id`, `None` unless it is loaded
    pub fn known_state(&self, id: &RawCoId) -> Option<KnownState> {
        self.inner.registry().verified(id).map(|state| state.known_state())
    }

    /// Attach storage and write everything already held into it
    pub async fn set_storage(&self, storage: SharedStorage) {
        self.inner.replace_storage(storage);
        let ids = self.inner.registry().available_ids();
        self.inner.persist(&ids).await;
        info!(co_values = ids.len(), "Storage attached");
    }

    pub fn add_peer(&self, connection: PeerConnection) -> Arc<PeerEntry> {
        self.inner.sync.add_peer(&self.inner, connection)
    }

    /// Update counter of `id`, bumped on every change
    pub async fn subscribe(&self, id: &RawCoId) -> NodeResult<watch::Receiver<u64>> {
        if !self.load(id).await.is_available() {
            return Err(NodeError::Unavailable(id.clone()));
        }
        let mut registry = self.inner.registry();
        let core = registry.get_mut(id).ok_or_else(|| NodeError::Unavailable(id.clone()))?;
        core.touch(std::time::Instant::now());
        Ok(core.subscribe())
    }

    /// Resolves `true` once every upstream peer confirmed all of `id` we
    /// hold, `false` as soon as one of them disconnects first
    pub async fn wait_for_sync(&self, id: &RawCoId) -> bool {
        for peer in self.inner.sync.upstream_peers() {
            if !self.inner.sync.wait_for_upload(self.inner.as_ref(), &peer, id).await {
                return false;
            }
        }
        true
    }

    /// Replay the known state of everything in storage to `peer`
    pub async fn reconcile_with(&self, peer: &PeerId) -> NodeResult<ReconcileReport> {
        let entry = self.inner.sync.peer(peer).ok_or_else(|| SyncError::UnknownPeer(peer.clone()))?;
        Ok(run_reconciliation(self.inner.clone(), entry).await?)
    }

    /// Stop background tasks and close every peer
    pub async fn shutdown(&self) {
        self.inner.shutdown.shutdown().await;
        self.inner.sync.close_all(self.inner.as_ref());
        info!(account = %self.inner.account_id, "Node shut down");
    }

    pub(crate) async fn ensure_running(&self) -> NodeResult<()> {
        if self.inner.shutdown.is_shutting_down().await {
            return Err(NodeError::ShuttingDown);
        }
        Ok(())
    }
}
