/*
    peer.rs - One connected peer

    A PeerEntry tracks what we believe the peer holds and owns its outgoing
    queue. Two views are kept per CoValue:

    - confirmed: what the peer told us (data / known messages)
    - optimistic: confirmed plus everything we already queued for it

    Pushes are computed against the optimistic view so nothing is sent
    twice; sync completion is judged on the confirmed view only.
*/

use super::message::SyncMessage;
use super::priority_queue::{PriorityQueue, Thunk};
use crate::core_covalue::{CoValuePriority, KnownState, RawCoId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, trace};

/// Lock a std mutex; a panicked holder leaves plain data behind, so keep going
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    /// Sync server: loads go here, uploads are tracked against it
    Server,
    /// Storage-only peer, treated like a server
    Storage,
    Client,
}

impl PeerRole {
    /// Server and storage peers are sources of truth for loads and uploads
    pub fn is_upstream(&self) -> bool {
        matches!(self, PeerRole::Server | PeerRole::Storage)
    }
}

#[derive(Debug, Clone, Default)]
struct PeerKnown {
    confirmed: Option<KnownState>,
    optimistic: Option<KnownState>,
}

fn merge(slot: &mut Option<KnownState>, known: &KnownState) {
    match slot {
        Some(existing) => existing.combine_with(known),
        None => *slot = Some(known.clone()),
    }
}

pub struct PeerEntry {
    id: PeerId,
    role: PeerRole,
    priority: i32,
    known: Mutex<HashMap<RawCoId, PeerKnown>>,
    queue: Mutex<PriorityQueue<SyncMessage>>,
    wake: Notify,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEntry")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("priority", &self.priority)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PeerEntry {
    pub fn new(id: PeerId, role: PeerRole, priority: i32) -> Self {
        Self {
            id,
            role,
            priority,
            known: Mutex::new(HashMap::new()),
            queue: Mutex::new(PriorityQueue::new()),
            wake: Notify::new(),
            closed: watch::channel(false).0,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// What the peer told us it holds
    pub fn confirmed(&self, id: &RawCoId) -> Option<KnownState> {
        locked(&self.known).get(id).and_then(|k| k.confirmed.clone())
    }

    /// What the peer will hold once our queue drains
    pub fn optimistic(&self, id: &RawCoId) -> Option<KnownState> {
        let known = locked(&self.known);
        let entry = known.get(id)?;
        entry.optimistic.clone().or_else(|| entry.confirmed.clone())
    }

    /// First contact creates an empty entry
    pub fn touch(&self, id: &RawCoId) {
        locked(&self.known).entry(id.clone()).or_default();
    }

    pub fn record_confirmed(&self, known: &KnownState) {
        let mut map = locked(&self.known);
        let entry = map.entry(known.id.clone()).or_default();
        merge(&mut entry.confirmed, known);
        merge(&mut entry.optimistic, known);
    }

    pub fn record_optimistic(&self, known: &KnownState) {
        let mut map = locked(&self.known);
        merge(&mut map.entry(known.id.clone()).or_default().optimistic, known);
    }

    /// The peer reported a gap: forget what we assumed it got
    pub fn reset_optimistic(&self, known: &KnownState) {
        let mut map = locked(&self.known);
        let entry = map.entry(known.id.clone()).or_default();
        entry.optimistic = Some(known.clone());
        entry.confirmed = Some(known.clone());
    }

    /// Whether we have exchanged anything about `id` with this peer
    pub fn is_interested(&self, id: &RawCoId) -> bool {
        locked(&self.known).contains_key(id)
    }

    /// Drop per-CoValue state when the CoValue is unmounted
    pub fn forget(&self, id: &RawCoId) {
        locked(&self.known).remove(id);
    }

    pub fn tracked_ids(&self) -> Vec<RawCoId> {
        locked(&self.known).keys().cloned().collect()
    }

    pub fn enqueue(&self, message: SyncMessage) {
        let priority = message.priority();
        self.enqueue_lazy(priority, Box::new(move || Some(message)));
    }

    pub fn enqueue_lazy(&self, priority: CoValuePriority, thunk: Thunk<SyncMessage>) {
        if self.is_closed() {
            trace!(peer = %self.id, "Dropping message for closed peer");
            return;
        }
        locked(&self.queue).push_lazy(priority, thunk);
        self.wake.notify_one();
    }

    pub fn queued(&self) -> usize {
        locked(&self.queue).len()
    }

    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        locked(&self.queue).clear();
        locked(&self.known).clear();
        self.wake.notify_one();
        debug!(peer = %self.id, "Peer closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the peer is closed
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so this only ends on close
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Drain the queue into the transport until the peer closes
    pub async fn run_writer(self: Arc<Self>, outgoing: mpsc::Sender<SyncMessage>) {
        loop {
            // Thunks read node state, so they run outside the queue lock
            let next = locked(&self.queue).pop_thunk();
            match next {
                Some(thunk) => {
                    let Some(message) = thunk() else { continue };
                    let action = message.action();
                    if outgoing.send(message).await.is_err() {
                        debug!(peer = %self.id, "Transport gone, closing peer");
                        self.close();
                        break;
                    }
                    metrics::counter!("cojson_sync_messages_sent_total", "action" => action).increment(1);
                }
                None if self.is_closed() => break,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = self.wait_closed() => break,
                    }
                }
            }
        }
    }
}
