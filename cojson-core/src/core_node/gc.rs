/*
    gc.rs - Unmounting idle CoValues

    A CoValue is unmounted when it was last accessed more than `max_age`
    ago, nobody is subscribed to it and every upstream peer has confirmed
    all of it. Never-accessed CoValues (just created, or only passed
    through) are left alone, as is our own account. Unmounting drops the
    in-memory replica and what each peer is known to hold of it; a later
    load reads it back from storage or the peers.

    Entries that hold nothing and wait for nothing (a peer answered
    "unknown" with no load running) are dropped on every pass.
*/

use super::node::{LocalNode, NodeInner};
use crate::core_covalue::{KnownState, RawCoId};
use crate::core_sync::SyncStateManager;
use crate::shutdown::ShutdownHandler;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub evicted: Vec<RawCoId>,
    /// Idle, but some upstream peer still lacks part of it
    pub kept_unsynced: usize,
    /// Entries left behind by loads that found nothing
    pub discarded: usize,
}

impl NodeInner {
    pub(crate) fn collect_garbage_at(&self, now: Instant) -> GcReport {
        let max_age = self.config.gc.max_age;
        let candidates: Vec<(RawCoId, Option<KnownState>, Instant)> = {
            let registry = self.registry();
            registry
                .iter()
                .filter(|core| core.id() != &self.account_id && !core.has_subscribers())
                .filter_map(|core| {
                    let accessed = core.last_accessed()?;
                    (now.saturating_duration_since(accessed) > max_age).then(|| {
                        (core.id().clone(), core.verified().map(|s| s.known_state()), accessed)
                    })
                })
                .collect()
        };

        let mut report = GcReport::default();
        let upstream = self.sync.upstream_peers();
        let mut evictable = Vec::new();
        for (id, local, accessed) in candidates {
            let synced = local.as_ref().map_or(true, |local| {
                upstream.iter().all(|peer| SyncStateManager::is_uploaded(local, peer.confirmed(&id).as_ref()))
            });
            if synced {
                evictable.push((id, accessed));
            } else {
                report.kept_unsynced += 1;
            }
        }

        {
            let mut registry = self.registry();
            for (id, accessed) in evictable {
                // Skip anything touched or subscribed to since the scan
                let still_idle = registry
                    .get(&id)
                    .is_some_and(|core| core.last_accessed() == Some(accessed) && !core.has_subscribers());
                if still_idle {
                    registry.remove(&id);
                    report.evicted.push(id);
                }
            }

            let placeholders: Vec<RawCoId> =
                registry.iter().filter(|core| core.is_placeholder()).map(|core| core.id().clone()).collect();
            for id in &placeholders {
                registry.remove(id);
            }
            report.discarded = placeholders.len();
        }

        for peer in self.sync.peers() {
            for id in &report.evicted {
                peer.forget(id);
            }
        }

        if !report.evicted.is_empty() || report.discarded > 0 {
            metrics::counter!("cojson_gc_evictions_total").increment(report.evicted.len() as u64);
            debug!(
                evicted = report.evicted.len(),
                discarded = report.discarded,
                kept_unsynced = report.kept_unsynced,
                "Garbage collected"
            );
        }
        report
    }
}

impl LocalNode {
    /// One collection pass as of `now`
    pub fn collect_garbage_at(&self, now: Instant) -> GcReport {
        self.inner.collect_garbage_at(now)
    }

    /// Collect every `gc.interval` until shutdown. `None` when disabled.
    pub fn spawn_gc(&self) -> Option<JoinHandle<()>> {
        let config = &self.inner.config.gc;
        if !config.enabled {
            return None;
        }
        let interval = config.interval;
        let weak = Arc::downgrade(&self.inner);
        let handler = ShutdownHandler::new(&self.inner.shutdown, "gc");

        Some(tokio::spawn(handler.run(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.collect_garbage_at(Instant::now());
            }
        })))
    }
}
