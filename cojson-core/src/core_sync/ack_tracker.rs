/*
    ack_tracker.rs - Completion tracking for reconciliation batches

    Every batch sent to a peer is registered with the offset the peer is
    expected to acknowledge. Waiters are oneshot channels, so each one is
    resolved exactly once: by the peer's ack, or by the peer closing,
    whichever comes first.
*/

use super::peer::{locked, PeerId};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How a reconciliation batch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The peer processed the batch; resume from `next_offset`
    Acked { next_offset: u64 },
    /// The peer went away first
    PeerClosed,
    /// No such batch is in flight
    Untracked,
}

/// Resolution of one tracked batch
#[derive(Debug)]
pub struct AckWaiter(oneshot::Receiver<AckOutcome>);

impl AckWaiter {
    pub async fn wait(self) -> AckOutcome {
        self.0.await.unwrap_or(AckOutcome::PeerClosed)
    }
}

struct PendingBatch {
    expected_next_offset: u64,
    waiters: Vec<oneshot::Sender<AckOutcome>>,
}

#[derive(Default)]
pub struct StorageReconciliationAckTracker {
    pending: Mutex<HashMap<(PeerId, String), PendingBatch>>,
}

impl StorageReconciliationAckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch before it is sent; the returned waiter cannot miss the ack
    pub fn track_batch(&self, peer: &PeerId, batch_id: &str, expected_next_offset: u64) -> AckWaiter {
        let (tx, rx) = oneshot::channel();
        locked(&self.pending).insert(
            (peer.clone(), batch_id.to_string()),
            PendingBatch { expected_next_offset, waiters: vec![tx] },
        );
        AckWaiter(rx)
    }

    /// Resolves once the batch is acked or its peer closes
    pub async fn wait_for_ack(&self, peer: &PeerId, batch_id: &str) -> AckOutcome {
        let rx = {
            let mut pending = locked(&self.pending);
            let Some(batch) = pending.get_mut(&(peer.clone(), batch_id.to_string())) else {
                return AckOutcome::Untracked;
            };
            let (tx, rx) = oneshot::channel();
            batch.waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(AckOutcome::PeerClosed)
    }

    /// Resolve the waiters of an acked batch. False if it was not in flight
    pub fn handle_ack(&self, peer: &PeerId, batch_id: &str, next_offset: u64) -> bool {
        let Some(batch) = locked(&self.pending).remove(&(peer.clone(), batch_id.to_string())) else {
            debug!(peer = %peer, batch_id, "Ack for unknown batch");
            return false;
        };
        if batch.expected_next_offset != next_offset {
            warn!(
                peer = %peer,
                batch_id,
                expected = batch.expected_next_offset,
                next_offset,
                "Ack offset differs from the batch sent"
            );
        }
        for waiter in batch.waiters {
            let _ = waiter.send(AckOutcome::Acked { next_offset });
        }
        true
    }

    /// Give up on one batch, resolving its waiters as if the peer closed
    pub fn abandon(&self, peer: &PeerId, batch_id: &str) -> bool {
        let Some(batch) = locked(&self.pending).remove(&(peer.clone(), batch_id.to_string())) else {
            return false;
        };
        for waiter in batch.waiters {
            let _ = waiter.send(AckOutcome::PeerClosed);
        }
        true
    }

    /// Give up on every batch in flight to `peer`; returns how many there were
    pub fn handle_peer_closed(&self, peer: &PeerId) -> usize {
        let closed: Vec<PendingBatch> = {
            let mut pending = locked(&self.pending);
            let keys: Vec<_> = pending.keys().filter(|(p, _)| p == peer).cloned().collect();
            keys.iter().filter_map(|k| pending.remove(k)).collect()
        };
        for batch in &closed {
            debug!(peer = %peer, waiters = batch.waiters.len(), "Batch abandoned on peer close");
        }
        let count = closed.len();
        for batch in closed {
            for waiter in batch.waiters {
                let _ = waiter.send(AckOutcome::PeerClosed);
            }
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        locked(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ack_resolves_all_waiters_once() {
        let tracker = Arc::new(StorageReconciliationAckTracker::new());
        let peer = PeerId::from("server");
        let first = tracker.track_batch(&peer, "b1", 100);

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let tracker = tracker.clone();
            let peer = peer.clone();
            waiters.push(tokio::spawn(async move { tracker.wait_for_ack(&peer, "b1").await }));
        }
        while locked(&tracker.pending).get(&(peer.clone(), "b1".into())).map_or(0, |b| b.waiters.len()) < 4 {
            tokio::task::yield_now().await;
        }

        assert!(tracker.handle_ack(&peer, "b1", 100));
        assert_eq!(first.wait().await, AckOutcome::Acked { next_offset: 100 });
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), AckOutcome::Acked { next_offset: 100 });
        }
        // A second ack finds nothing to resolve
        assert!(!tracker.handle_ack(&peer, "b1", 100));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_resolves_waiters() {
        let tracker = Arc::new(StorageReconciliationAckTracker::new());
        let peer = PeerId::from("server");
        let other = PeerId::from("other");
        let b1 = tracker.track_batch(&peer, "b1", 10);
        let _b2 = tracker.track_batch(&peer, "b2", 20);
        let _b3 = tracker.track_batch(&other, "b3", 30);

        let waiting = {
            let tracker = tracker.clone();
            let peer = peer.clone();
            tokio::spawn(async move { tracker.wait_for_ack(&peer, "b2").await })
        };
        while locked(&tracker.pending).get(&(peer.clone(), "b2".into())).map_or(0, |b| b.waiters.len()) < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(tracker.handle_peer_closed(&peer), 2);
        assert_eq!(waiting.await.unwrap(), AckOutcome::PeerClosed);
        assert_eq!(b1.wait().await, AckOutcome::PeerClosed);
        assert_eq!(tracker.in_flight(), 1);

        // Late ack after close changes nothing
        assert!(!tracker.handle_ack(&peer, "b2", 20));
    }

    #[tokio::test]
    async fn test_abandon_resolves_one_batch() {
        let tracker = StorageReconciliationAckTracker::new();
        let peer = PeerId::from("server");
        let b1 = tracker.track_batch(&peer, "b1", 10);
        let _b2 = tracker.track_batch(&peer, "b2", 20);

        assert!(tracker.abandon(&peer, "b1"));
        assert_eq!(b1.wait().await, AckOutcome::PeerClosed);
        assert_eq!(tracker.in_flight(), 1);
        assert!(!tracker.abandon(&peer, "b1"));
    }

    #[tokio::test]
    async fn test_untracked_batch() {
        let tracker = StorageReconciliationAckTracker::new();
        assert_eq!(tracker.wait_for_ack(&PeerId::from("p"), "nope").await, AckOutcome::Untracked);
    }
}
