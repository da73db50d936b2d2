/*
    reconcile.rs - Storage reconciliation with one upstream peer

    Replays the known state of everything in local storage to a peer in
    batches, so content written while disconnected (or by a crashed
    session) reaches the server. Progress lives in the storage lock
    `reconcile:<peer>`: a later run resumes from the last acknowledged
    offset, and a concurrent run by another session finds the lock held.
*/

use super::ack_tracker::AckOutcome;
use super::errors::{SyncError, SyncResult};
use super::manager::SyncHost;
use super::message::SyncMessage;
use super::peer::PeerEntry;
use crate::core_covalue::now_millis;
use std::sync::Arc;
use tracing::{debug, info};

/// What one run got through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub batches: u64,
    pub co_values: u64,
    /// Offset the run started from
    pub resumed_from: u64,
}

pub fn lock_key(peer: &PeerEntry) -> String {
    format!("reconcile:{}", peer.id())
}

pub async fn run_reconciliation<H: SyncHost>(host: Arc<H>, peer: Arc<PeerEntry>) -> SyncResult<ReconcileReport> {
    let Some(storage) = host.storage() else {
        return Ok(ReconcileReport::default());
    };
    let sync = host.sync();
    let key = lock_key(&peer);
    let holder = host.holder();
    let batch_size = sync.config().reconcile_batch_size.max(1);

    let lock = storage
        .try_acquire_lock(&key, &holder, now_millis())
        .await?
        .ok_or_else(|| SyncError::LockHeld(key.clone()))?;

    let mut offset = lock.last_processed_offset;
    let mut report = ReconcileReport { resumed_from: offset, ..Default::default() };
    info!(peer = %peer.id(), offset, "Storage reconciliation started");

    loop {
        if peer.is_closed() {
            storage.release_lock(&key, &holder, false, now_millis()).await?;
            return Err(SyncError::PeerClosed(peer.id().clone()));
        }

        let ids = storage.stored_co_value_ids(offset, batch_size).await?;
        if ids.is_empty() {
            break;
        }
        let next_offset = offset + ids.len() as u64;

        let mut known_states = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(known) = storage.known_state(id).await? {
                peer.touch(id);
                known_states.push(known);
            }
        }

        let batch_id = format!("{}@{}", key, offset);
        let waiter = sync.acks().track_batch(peer.id(), &batch_id, next_offset);
        let sent = known_states.len() as u64;
        peer.enqueue(SyncMessage::Reconcile { batch_id: batch_id.clone(), offset, known_states });
        debug!(peer = %peer.id(), batch_id = %batch_id, sent, "Reconcile batch sent");

        // The peer may have closed while storage was being read, after its
        // in-flight batches were already resolved
        let outcome = tokio::select! {
            biased;
            outcome = waiter.wait() => outcome,
            _ = peer.wait_closed() => {
                sync.acks().abandon(peer.id(), &batch_id);
                AckOutcome::PeerClosed
            }
        };

        match outcome {
            AckOutcome::Acked { next_offset: acked } => {
                offset = acked.max(offset + 1);
                storage.update_lock_offset(&key, &holder, offset, now_millis()).await?;
                report.batches += 1;
                report.co_values += sent;
                metrics::counter!("cojson_sync_reconcile_batches_total").increment(1);
            }
            AckOutcome::PeerClosed | AckOutcome::Untracked => {
                storage.release_lock(&key, &holder, false, now_millis()).await?;
                info!(peer = %peer.id(), offset, "Storage reconciliation interrupted");
                return Err(SyncError::PeerClosed(peer.id().clone()));
            }
        }
    }

    storage.release_lock(&key, &holder, true, now_millis()).await?;
    info!(peer = %peer.id(), batches = report.batches, co_values = report.co_values, "Storage reconciliation complete");
    Ok(report)
}
