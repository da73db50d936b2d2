/*
    sync_state.rs - Upload status per (peer, CoValue)

    A CoValue is uploaded to a peer once every session we hold is covered
    by the peer's last confirmed known state. The comparison only runs when
    somebody is observing: a broadcast subscriber or a pending waiter.
*/

use super::peer::{locked, PeerId};
use crate::core_covalue::{KnownState, RawCoId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateEvent {
    pub peer: PeerId,
    pub id: RawCoId,
    pub uploaded: bool,
}

pub struct SyncStateManager {
    events: broadcast::Sender<SyncStateEvent>,
    waiters: Mutex<HashMap<(PeerId, RawCoId), Vec<oneshot::Sender<bool>>>>,
}

impl Default for SyncStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStateManager {
    pub fn new() -> Self {
        Self { events: broadcast::channel(256).0, waiters: Mutex::new(HashMap::new()) }
    }

    /// Every session of `local` is held at least as far by the peer
    pub fn is_uploaded(local: &KnownState, confirmed: Option<&KnownState>) -> bool {
        match confirmed {
            Some(confirmed) => local.is_covered_by(confirmed),
            None => false,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncStateEvent> {
        self.events.subscribe()
    }

    fn is_observed(&self, key: &(PeerId, RawCoId)) -> bool {
        self.events.receiver_count() > 0 || locked(&self.waiters).contains_key(key)
    }

    /// Either side of (peer, id) changed; `evaluate` runs only if observed
    pub fn notify(&self, peer: &PeerId, id: &RawCoId, evaluate: impl FnOnce() -> bool) {
        let key = (peer.clone(), id.clone());
        if !self.is_observed(&key) {
            return;
        }
        let uploaded = evaluate();
        trace!(peer = %peer, id = %id, uploaded, "Sync state evaluated");

        if uploaded {
            if let Some(waiters) = locked(&self.waiters).remove(&key) {
                for waiter in waiters {
                    let _ = waiter.send(true);
                }
            }
        }
        if self.events.receiver_count() > 0 {
            let _ = self.events.send(SyncStateEvent { peer: peer.clone(), id: id.clone(), uploaded });
        }
    }

    /// Resolves `true` once uploaded, `false` if the peer closes first.
    ///
    /// `already` is checked under the waiter lock so an upload finishing
    /// concurrently is never missed.
    pub async fn wait_for_uploaded(&self, peer: &PeerId, id: &RawCoId, already: impl FnOnce() -> bool) -> bool {
        let rx = {
            let mut waiters = locked(&self.waiters);
            if already() {
                return true;
            }
            let (tx, rx) = oneshot::channel();
            waiters.entry((peer.clone(), id.clone())).or_default().push(tx);
            rx
        };
        rx.await.unwrap_or(false)
    }

    /// Resolve every waiter of `peer` as not uploaded
    pub fn handle_peer_closed(&self, peer: &PeerId) {
        let closed: Vec<_> = {
            let mut waiters = locked(&self.waiters);
            let keys: Vec<_> = waiters.keys().filter(|(p, _)| p == peer).cloned().collect();
            keys.iter().filter_map(|k| waiters.remove(k)).flatten().collect()
        };
        for waiter in closed {
            let _ = waiter.send(false);
        }
    }

    pub fn waiting(&self) -> usize {
        locked(&self.waiters).values().map(Vec::len).sum()
    }
}
