/*
    manager.rs - The peer protocol

    SyncManager owns the peer registry, upload tracking and reconciliation
    acks. Everything it needs from the replicas goes through `SyncHost`,
    which the node implements; handlers take the host as `&Arc<H>` so that
    work needing replies from the same peer can move to its own task while
    the peer's reader keeps draining.

    Per peer, messages are handled in arrival order:

    - pull       -> PullRequestHandler, exactly one data reply
    - data       -> ingest, then push back whatever the peer lacks
    - push       -> ingest, known ack (or correction), fan out
    - known      -> confirm, resend on correction
    - reconcile  -> pull what we lack, push what they lack, ack the batch
    - ack        -> resolve the batch waiters
*/

use super::ack_tracker::StorageReconciliationAckTracker;
use super::message::SyncMessage;
use super::peer::{locked, PeerEntry, PeerId, PeerRole};
use super::peers::Peers;
use super::pull::PullRequestHandler;
use super::reconcile::run_reconciliation;
use super::sync_state::SyncStateManager;
use super::transport::PeerConnection;
use crate::config::SyncConfig;
use crate::core_covalue::{CoValuePriority, KnownState, LoadingState, NewContent, RawCoId, SourceLoadState};
use crate::core_storage::SharedStorage;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Result of applying received content
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Content accepted; `known` is our state afterwards
    Applied { known: KnownState, new_transactions: usize },
    /// Content does not continue what we hold
    Gap { known: KnownState },
    /// No header received and none held
    MissingHeader,
    /// Session owners whose accounts must be loaded first
    MissingDependencies(Vec<RawCoId>),
    /// Invalid content; nothing was applied
    Rejected(String),
}

/// What the protocol needs from the node holding the replicas
#[async_trait]
pub trait SyncHost: Send + Sync + 'static {
    fn sync(&self) -> &SyncManager;

    fn storage(&self) -> Option<SharedStorage>;

    /// Lock holder name for reconciliation (our session)
    fn holder(&self) -> String;

    /// In-memory known state, `None` unless available
    fn known_state(&self, id: &RawCoId) -> Option<KnownState>;

    fn loading_state(&self, id: &RawCoId) -> LoadingState;

    fn priority(&self, id: &RawCoId) -> CoValuePriority;

    /// Content beyond `since`, together with our known state at that instant
    fn content_since(&self, id: &RawCoId, since: Option<&KnownState>) -> Option<(Vec<NewContent>, KnownState)>;

    /// CoValues currently held in memory
    fn loaded_ids(&self) -> Vec<RawCoId>;

    fn mark_peer_state(&self, id: &RawCoId, peer: &PeerId, state: SourceLoadState);

    /// The peer is gone: nothing is pending from it any more
    fn forget_peer(&self, peer: &PeerId);

    /// Make `id` available: storage first, then `from` and the upstream
    /// peers when `from` is given. Resolves with availability.
    async fn load_for_peer(&self, id: &RawCoId, from: Option<&PeerId>) -> bool;

    /// Verify and apply content received from `from`
    async fn ingest(&self, from: &PeerId, content: &[NewContent]) -> IngestOutcome;
}

/// The state a peer must hold after sending `content`
fn known_from_content(content: &[NewContent]) -> Option<KnownState> {
    let first = content.first()?;
    let mut known = KnownState::empty(first.id.clone());
    known.header = true;
    for piece in content {
        for (session, chunk) in &piece.new {
            if chunk.end() > known.session_count(session) {
                known.set_session(session.clone(), chunk.end());
            }
        }
    }
    Some(known)
}

pub struct SyncManager {
    peers: Mutex<Peers>,
    sync_state: SyncStateManager,
    acks: StorageReconciliationAckTracker,
    config: SyncConfig,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            peers: Mutex::new(Peers::new()),
            sync_state: SyncStateManager::new(),
            acks: StorageReconciliationAckTracker::new(),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sync_state(&self) -> &SyncStateManager {
        &self.sync_state
    }

    pub fn acks(&self) -> &StorageReconciliationAckTracker {
        &self.acks
    }

    pub fn peer(&self, id: &PeerId) -> Option<Arc<PeerEntry>> {
        locked(&self.peers).get(id)
    }

    pub fn peers(&self) -> Vec<Arc<PeerEntry>> {
        locked(&self.peers).all()
    }

    pub fn upstream_peers(&self) -> Vec<Arc<PeerEntry>> {
        locked(&self.peers).upstream()
    }

    /// Register a connection and start its reader and writer tasks
    pub fn add_peer<H: SyncHost>(&self, host: &Arc<H>, connection: PeerConnection) -> Arc<PeerEntry> {
        let PeerConnection { id, role, priority, incoming, outgoing } = connection;
        let entry = Arc::new(PeerEntry::new(id, role, priority));

        let replaced = locked(&self.peers).add(entry.clone());
        if let Some(old) = replaced {
            self.cleanup_peer(host.as_ref(), &old);
        }
        info!(peer = %entry.id(), role = ?role, priority, "Peer added");
        metrics::gauge!("cojson_sync_peers").increment(1.0);

        tokio::spawn(entry.clone().run_writer(outgoing));
        tokio::spawn(Self::run_reader(host.clone(), entry.clone(), incoming));

        if role.is_upstream() {
            tokio::spawn(Self::upstream_connected(host.clone(), entry.clone()));
        }
        entry
    }

    async fn run_reader<H: SyncHost>(host: Arc<H>, entry: Arc<PeerEntry>, mut incoming: mpsc::Receiver<SyncMessage>) {
        loop {
            tokio::select! {
                message = incoming.recv() => match message {
                    Some(message) => host.sync().handle_message(&host, &entry, message).await,
                    None => break,
                },
                _ = entry.wait_closed() => break,
            }
        }
        host.sync().disconnect(host.as_ref(), &entry);
    }

    /// Ask a new upstream peer about everything we hold and resume uploads
    async fn upstream_connected<H: SyncHost>(host: Arc<H>, entry: Arc<PeerEntry>) {
        let sync = host.sync();
        for id in host.loaded_ids() {
            sync.send_pull(host.as_ref(), &entry, &id);
        }

        let Some(storage) = host.storage() else { return };
        match storage.unsynced_co_value_ids().await {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!(peer = %entry.id(), count = ids.len(), "Resuming unsynced uploads");
                }
                for id in ids {
                    if entry.is_interested(&id) {
                        continue;
                    }
                    if host.load_for_peer(&id, None).await {
                        sync.send_pull(host.as_ref(), &entry, &id);
                    }
                }
            }
            Err(err) => warn!(peer = %entry.id(), error = %err, "Cannot list unsynced CoValues"),
        }

        if sync.config.reconcile_on_connect {
            if let Err(err) = run_reconciliation(host.clone(), entry.clone()).await {
                warn!(peer = %entry.id(), error = %err, "Storage reconciliation stopped");
            }
        }
    }

    /// Drop `entry` if it is still the registered instance for its id
    pub fn disconnect<H: SyncHost>(&self, host: &H, entry: &Arc<PeerEntry>) {
        let removed = locked(&self.peers).remove_instance(entry);
        entry.close();
        if removed {
            self.cleanup_peer(host, entry);
        }
    }

    fn cleanup_peer<H: SyncHost>(&self, host: &H, entry: &Arc<PeerEntry>) {
        let batches = self.acks.handle_peer_closed(entry.id());
        self.sync_state.handle_peer_closed(entry.id());
        host.forget_peer(entry.id());
        metrics::gauge!("cojson_sync_peers").decrement(1.0);
        info!(peer = %entry.id(), abandoned_batches = batches, "Peer removed");
    }

    /// Close every peer, resolving all of their waiters
    pub fn close_all<H: SyncHost>(&self, host: &H) {
        let closed = locked(&self.peers).close_all();
        for entry in &closed {
            self.cleanup_peer(host, entry);
        }
    }

    pub fn send_pull<H: SyncHost>(&self, host: &H, peer: &PeerEntry, id: &RawCoId) {
        let known = host.known_state(id).unwrap_or_else(|| KnownState::empty(id.clone()));
        peer.touch(id);
        peer.enqueue(SyncMessage::Pull { known });
    }

    /// Pull `id` from every upstream peer, plus `from` if given.
    ///
    /// Marks each asked peer pending; returns how many were asked.
    pub fn request<H: SyncHost>(&self, host: &H, id: &RawCoId, from: Option<&PeerId>) -> usize {
        let mut asked = 0;
        for peer in self.peers() {
            let chosen = peer.role().is_upstream() || Some(peer.id()) == from;
            if !chosen || peer.is_closed() {
                continue;
            }
            host.mark_peer_state(id, peer.id(), SourceLoadState::Pending);
            self.send_pull(host, &peer, id);
            asked += 1;
        }
        asked
    }

    /// Queue whatever `peer` lacks of `id`, computed when the slot is sent
    pub fn push_content<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, id: &RawCoId) {
        let weak_host = Arc::downgrade(host);
        let weak_peer = Arc::downgrade(peer);
        let co_id = id.clone();
        peer.touch(id);
        peer.enqueue_lazy(
            host.priority(id),
            Box::new(move || {
                let host = weak_host.upgrade()?;
                let peer = weak_peer.upgrade()?;
                let since = peer.optimistic(&co_id);
                let (content, ours) = host.content_since(&co_id, since.as_ref())?;
                if content.is_empty() {
                    return None;
                }
                peer.record_optimistic(&ours);
                Some(SyncMessage::Push { content })
            }),
        );
    }

    /// A CoValue changed locally or from `except`: tell everyone who cares
    pub async fn broadcast<H: SyncHost>(&self, host: &Arc<H>, id: &RawCoId, except: Option<&PeerId>) {
        let storage = host.storage();
        for peer in self.peers() {
            if Some(peer.id()) == except || peer.is_closed() {
                continue;
            }
            let upstream = peer.role().is_upstream();
            if !upstream && !peer.is_interested(id) {
                continue;
            }
            self.push_content(host, &peer, id);
            self.sync_state.notify(peer.id(), id, || self.is_uploaded_to(host.as_ref(), &peer, id));

            if let (true, Some(storage)) = (upstream, &storage) {
                if let Err(err) = storage.track_sync_state(id, peer.id(), false).await {
                    warn!(id = %id, peer = %peer.id(), error = %err, "Cannot track pending upload");
                }
            }
        }
    }

    pub fn is_uploaded_to<H: SyncHost>(&self, host: &H, peer: &PeerEntry, id: &RawCoId) -> bool {
        host.known_state(id)
            .is_some_and(|local| SyncStateManager::is_uploaded(&local, peer.confirmed(id).as_ref()))
    }

    /// Resolves `true` once `peer` confirmed everything we hold of `id`,
    /// `false` if it disconnects first
    pub async fn wait_for_upload<H: SyncHost>(&self, host: &H, peer: &Arc<PeerEntry>, id: &RawCoId) -> bool {
        tokio::select! {
            uploaded = self.sync_state.wait_for_uploaded(peer.id(), id, || self.is_uploaded_to(host, peer, id)) => uploaded,
            _ = peer.wait_closed() => false,
        }
    }

    pub async fn handle_message<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, message: SyncMessage) {
        let action = message.action();
        metrics::counter!("cojson_sync_messages_received_total", "action" => action).increment(1);
        trace!(peer = %peer.id(), action, id = ?message.co_value_id(), "Handling message");

        match message {
            SyncMessage::Pull { known } => PullRequestHandler::handle(host, peer, known),
            SyncMessage::Data { known, content } => self.handle_data(host, peer, known, content).await,
            SyncMessage::Push { content } => self.handle_push(host, peer, content).await,
            SyncMessage::Known { known, correction } => self.handle_known(host, peer, known, correction).await,
            SyncMessage::Reconcile { batch_id, offset, known_states } => {
                self.handle_reconcile(host, peer, batch_id, offset, known_states)
            }
            SyncMessage::Ack { batch_id, next_offset } => {
                self.acks.handle_ack(peer.id(), &batch_id, next_offset);
            }
        }
    }

    /// Pieces of one push must all name the same CoValue
    fn single_id(peer: &PeerEntry, content: &[NewContent]) -> Option<RawCoId> {
        let id = content.first()?.id.clone();
        if content.iter().any(|c| c.id != id) {
            warn!(peer = %peer.id(), "Content for several CoValues in one message, dropping");
            return None;
        }
        Some(id)
    }

    async fn handle_data<H: SyncHost>(
        &self,
        host: &Arc<H>,
        peer: &Arc<PeerEntry>,
        known: KnownState,
        content: Vec<NewContent>,
    ) {
        let id = known.id.clone();
        peer.record_confirmed(&known);

        if content.is_empty() {
            if !known.header {
                debug!(peer = %peer.id(), id = %id, "Peer does not have CoValue");
                host.mark_peer_state(&id, peer.id(), SourceLoadState::Unavailable);
            } else {
                self.settle_data(host, peer, &id).await;
            }
            return;
        }
        if content.iter().any(|c| c.id != id) {
            warn!(peer = %peer.id(), id = %id, "Data content does not match its known state");
            host.mark_peer_state(&id, peer.id(), SourceLoadState::Unavailable);
            return;
        }

        match host.ingest(peer.id(), &content).await {
            IngestOutcome::MissingDependencies(deps) => {
                let (host, peer) = (host.clone(), peer.clone());
                tokio::spawn(async move {
                    for dep in &deps {
                        host.load_for_peer(dep, Some(peer.id())).await;
                    }
                    let outcome = host.ingest(peer.id(), &content).await;
                    host.sync().finish_data(&host, &peer, &id, outcome).await;
                });
            }
            outcome => self.finish_data(host, peer, &id, outcome).await,
        }
    }

    async fn finish_data<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, id: &RawCoId, outcome: IngestOutcome) {
        match outcome {
            IngestOutcome::Applied { new_transactions, .. } => {
                if new_transactions > 0 {
                    self.broadcast(host, id, Some(peer.id())).await;
                }
                self.settle_data(host, peer, id).await;
            }
            IngestOutcome::Gap { .. } | IngestOutcome::MissingHeader => {
                debug!(peer = %peer.id(), id = %id, "Data does not continue our state, pulling again");
                self.send_pull(host.as_ref(), peer, id);
            }
            IngestOutcome::MissingDependencies(deps) => {
                warn!(peer = %peer.id(), id = %id, missing = deps.len(), "Dependencies unavailable, dropping data");
                host.mark_peer_state(id, peer.id(), SourceLoadState::Unavailable);
            }
            IngestOutcome::Rejected(reason) => {
                warn!(peer = %peer.id(), id = %id, reason = %reason, "Rejected data");
                host.mark_peer_state(id, peer.id(), SourceLoadState::Unavailable);
            }
        }
    }

    /// After a data reply: record where the peer stands and send what it lacks
    async fn settle_data<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, id: &RawCoId) {
        let state = if host.known_state(id).is_some() {
            SourceLoadState::Available
        } else {
            SourceLoadState::Unavailable
        };
        host.mark_peer_state(id, peer.id(), state);
        if state == SourceLoadState::Available {
            self.push_content(host, peer, id);
        }
        self.after_confirmation(host.as_ref(), peer, id).await;
    }

    async fn handle_push<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, content: Vec<NewContent>) {
        let Some(id) = Self::single_id(peer, &content) else { return };
        peer.touch(&id);

        match host.ingest(peer.id(), &content).await {
            IngestOutcome::MissingDependencies(deps) => {
                let (host, peer) = (host.clone(), peer.clone());
                tokio::spawn(async move {
                    for dep in &deps {
                        host.load_for_peer(dep, Some(peer.id())).await;
                    }
                    let outcome = host.ingest(peer.id(), &content).await;
                    host.sync().finish_push(&host, &peer, &id, &content, outcome).await;
                });
            }
            outcome => self.finish_push(host, peer, &id, &content, outcome).await,
        }
    }

    async fn finish_push<H: SyncHost>(
        &self,
        host: &Arc<H>,
        peer: &Arc<PeerEntry>,
        id: &RawCoId,
        content: &[NewContent],
        outcome: IngestOutcome,
    ) {
        match outcome {
            IngestOutcome::Applied { known, new_transactions } => {
                if let Some(theirs) = known_from_content(content) {
                    peer.record_confirmed(&theirs);
                }
                peer.enqueue(SyncMessage::Known { known, correction: false });
                if new_transactions > 0 {
                    self.broadcast(host, id, Some(peer.id())).await;
                }
            }
            IngestOutcome::Gap { known } => {
                debug!(peer = %peer.id(), id = %id, "Push leaves a gap, asking for correction");
                peer.enqueue(SyncMessage::Known { known, correction: true });
            }
            IngestOutcome::MissingHeader => {
                debug!(peer = %peer.id(), id = %id, "Push without header for unknown CoValue");
                peer.enqueue(SyncMessage::Known { known: KnownState::empty(id.clone()), correction: true });
            }
            IngestOutcome::MissingDependencies(deps) => {
                warn!(peer = %peer.id(), id = %id, missing = deps.len(), "Dependencies unavailable, dropping push");
            }
            IngestOutcome::Rejected(reason) => {
                warn!(peer = %peer.id(), id = %id, reason = %reason, "Rejected push");
            }
        }
    }

    async fn handle_known<H: SyncHost>(&self, host: &Arc<H>, peer: &Arc<PeerEntry>, known: KnownState, correction: bool) {
        let id = known.id.clone();
        if correction {
            debug!(peer = %peer.id(), id = %id, "Peer asked for correction");
            peer.reset_optimistic(&known);
            if host.known_state(&id).is_some() {
                self.push_content(host, peer, &id);
            }
        } else {
            peer.record_confirmed(&known);
        }
        self.after_confirmation(host.as_ref(), peer, &id).await;
    }

    /// The peer's confirmed state moved: update waiters and the unsynced set
    async fn after_confirmation<H: SyncHost>(&self, host: &H, peer: &PeerEntry, id: &RawCoId) {
        self.sync_state.notify(peer.id(), id, || self.is_uploaded_to(host, peer, id));

        if !peer.role().is_upstream() {
            return;
        }
        let Some(storage) = host.storage() else { return };
        if self.is_uploaded_to(host, peer, id) {
            if let Err(err) = storage.track_sync_state(id, peer.id(), true).await {
                warn!(id = %id, peer = %peer.id(), error = %err, "Cannot record completed upload");
            }
        }
    }

    fn handle_reconcile<H: SyncHost>(
        &self,
        host: &Arc<H>,
        peer: &Arc<PeerEntry>,
        batch_id: String,
        offset: u64,
        known_states: Vec<KnownState>,
    ) {
        let (host, peer) = (host.clone(), peer.clone());
        tokio::spawn(async move {
            let sync = host.sync();
            let count = known_states.len() as u64;
            for theirs in known_states {
                let id = theirs.id.clone();
                peer.record_confirmed(&theirs);

                if !host.load_for_peer(&id, None).await {
                    sync.send_pull(host.as_ref(), &peer, &id);
                    continue;
                }
                let Some(ours) = host.known_state(&id) else { continue };
                if !theirs.is_covered_by(&ours) {
                    sync.send_pull(host.as_ref(), &peer, &id);
                }
                if !ours.is_covered_by(&theirs) {
                    sync.push_content(&host, &peer, &id);
                }
            }
            trace!(peer = %peer.id(), batch_id = %batch_id, count, "Reconcile batch processed");
            peer.enqueue(SyncMessage::Ack { batch_id, next_offset: offset + count });
        });
    }

    pub fn peer_count(&self) -> usize {
        locked(&self.peers).len()
    }

    pub fn has_role(&self, role: PeerRole) -> bool {
        self.peers().iter().any(|p| p.role() == role)
    }
}
