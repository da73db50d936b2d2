/*
    loading.rs - Making CoValues available

    Storage is asked first; when it has nothing, the upstream peers (and the
    peer that triggered the load, if any) are pulled and the load waits until
    no source is pending any more, or the load timeout passes. Consumer loads
    also pull in what a CoValue needs to be read: its owning group and the
    accounts behind its sessions, plus referenced CoValues up to a depth.
*/

use super::errors::LoadOutcome;
use super::node::{LocalNode, NodeInner};
use crate::core_covalue::{LoadingState, NewContent, RawCoId, Ruleset, SourceLoadState};
use crate::core_storage::SharedStorage;
use crate::core_sync::{PeerId, SyncHost};
use serde_json::Value as JsonValue;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

impl NodeInner {
    pub(crate) fn is_available(&self, id: &RawCoId) -> bool {
        self.registry().verified(id).is_some()
    }

    /// Storage first, then peers when `ask_peers`. Resolves with availability.
    ///
    /// A failed load leaves no entry behind, so the next one asks storage again.
    pub(crate) async fn load_co_value(&self, id: &RawCoId, from: Option<&PeerId>, ask_peers: bool) -> bool {
        let available = self.load_from_sources(id, from, ask_peers).await;
        if !available {
            self.discard_placeholder(id);
        }
        available
    }

    pub(crate) fn discard_placeholder(&self, id: &RawCoId) -> bool {
        let mut registry = self.registry();
        if registry.get(id).is_some_and(|core| core.is_placeholder()) {
            registry.remove(id);
            trace!(id = %id, "Dropped entry of unavailable CoValue");
            return true;
        }
        false
    }

    async fn load_from_sources(&self, id: &RawCoId, from: Option<&PeerId>, ask_peers: bool) -> bool {
        if self.is_available(id) {
            return true;
        }

        if let Some(storage) = self.current_storage() {
            self.load_from_storage(&storage, id).await;
            if self.is_available(id) {
                metrics::counter!("cojson_node_loads_total", "source" => "storage").increment(1);
                return true;
            }
        }
        if !ask_peers && from.is_none() {
            return false;
        }

        let asked = self.sync.request(self, id, from);
        if asked == 0 {
            trace!(id = %id, "No peer to load from");
            return self.is_available(id);
        }

        // Subscribed after the request so the pending state is already visible
        let loading = self.registry().entry(id).watch_loading();
        if !self.wait_settled(loading).await {
            debug!(id = %id, asked, "Load timed out");
            self.give_up_pending(id);
        }

        let available = self.is_available(id);
        let outcome = if available { "available" } else { "unavailable" };
        metrics::counter!("cojson_node_loads_total", "source" => "peers", "outcome" => outcome).increment(1);
        available
    }

    /// Wait until nothing is loading; `false` on timeout
    async fn wait_settled(&self, mut loading: watch::Receiver<LoadingState>) -> bool {
        let settled = tokio::time::timeout(self.config.sync.load_timeout, async {
            // A dropped sender means the entry was unmounted: nothing to wait for
            let _ = loading.wait_for(|state| *state != LoadingState::Loading).await;
        })
        .await;
        settled.is_ok()
    }

    fn give_up_pending(&self, id: &RawCoId) {
        let peers = self.sync.peers();
        let mut registry = self.registry();
        let Some(core) = registry.get_mut(id) else { return };
        for peer in peers {
            if core.peer_state(peer.id()) == SourceLoadState::Pending {
                core.mark_peer(peer.id(), SourceLoadState::Unavailable);
            }
        }
    }

    async fn load_from_storage(&self, storage: &SharedStorage, id: &RawCoId) {
        let in_flight = {
            let mut registry = self.registry();
            let core = registry.entry(id);
            match core.storage_state() {
                SourceLoadState::Unknown => {
                    core.mark_storage(SourceLoadState::Pending);
                    None
                }
                SourceLoadState::Pending => Some(core.watch_loading()),
                SourceLoadState::Available | SourceLoadState::Unavailable => return,
            }
        };
        if let Some(loading) = in_flight {
            // Another task is reading it
            self.wait_settled(loading).await;
            return;
        }

        let started = Instant::now();
        let loaded = storage.load(id).await;

        let mut registry = self.registry();
        match loaded {
            Ok(Some(content)) => {
                self.apply_stored(id, content, &mut registry);
                registry.settle_deletion(id);
                debug!(id = %id, elapsed_ms = started.elapsed().as_millis() as u64, "Loaded from storage");
            }
            Ok(None) => {}
            Err(err) => warn!(id = %id, error = %err, "Storage load failed"),
        }

        let core = registry.entry(id);
        let state = if core.is_available() { SourceLoadState::Available } else { SourceLoadState::Unavailable };
        core.mark_storage(state);
    }

    /// Stored content is trusted: it was verified before it was written
    fn apply_stored(&self, id: &RawCoId, content: Vec<NewContent>, registry: &mut super::registry::Registry) {
        let max_bytes = self.max_bytes_per_signature();
        let core = registry.entry(id);
        for piece in content {
            if let Some(header) = piece.header {
                if let Err(err) = core.provide_header(header, max_bytes) {
                    warn!(id = %id, error = %err, "Stored header rejected");
                    return;
                }
            }
            let Some(state) = core.verified_mut() else {
                warn!(id = %id, "Stored content without header");
                return;
            };
            for (session, chunk) in piece.new {
                if let Err(err) = state.try_add_transactions(
                    self.crypto.as_ref(),
                    &session,
                    None,
                    chunk.after,
                    chunk.new_transactions,
                    chunk.last_signature,
                    true,
                ) {
                    warn!(id = %id, session = %session, error = %err, "Stored session rejected");
                }
            }
        }
        core.notify_updated();
    }

    /// What must be loaded to read `id`: its owning group and the accounts
    /// that wrote to it
    pub(crate) fn dependencies(&self, id: &RawCoId) -> Vec<RawCoId> {
        let registry = self.registry();
        let Some(state) = registry.verified(id) else { return Vec::new() };

        let mut deps = Vec::new();
        if let Ruleset::OwnedByGroup { group } = &state.header().ruleset {
            deps.push(group.clone());
        }
        for session in state.sessions().keys() {
            if let Some(account) = session.owner().as_account() {
                if account != id && account != &self.account_id && !deps.contains(account) {
                    deps.push(account.clone());
                }
            }
        }
        deps
    }

    /// Load `root` with its dependencies and references `depth` levels deep
    pub(crate) async fn load_tree(&self, root: &RawCoId, depth: usize) -> LoadOutcome {
        let mut queue = VecDeque::from([(root.clone(), depth)]);
        let mut seen = HashSet::new();

        while let Some((id, depth)) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if !self.load_co_value(&id, None, true).await {
                if &id == root {
                    return LoadOutcome::Unavailable;
                }
                debug!(root = %root, id = %id, "Dependency unavailable");
                continue;
            }
            self.touch(&id);

            for dep in self.dependencies(&id) {
                queue.push_back((dep, 0));
            }
            if depth > 0 {
                for reference in self.references(&id) {
                    queue.push_back((reference, depth - 1));
                }
            }
        }

        // The owning group may only have arrived with the dependencies
        let mut registry = self.registry();
        registry.settle_deletion(root);
        match registry.get(root) {
            Some(core) if core.is_deleted() => LoadOutcome::Deleted,
            Some(core) if core.is_available() => LoadOutcome::Available,
            _ => LoadOutcome::Unavailable,
        }
    }

    pub(crate) fn touch(&self, id: &RawCoId) {
        if let Some(core) = self.registry().get_mut(id) {
            core.touch(Instant::now());
        }
    }

    /// CoValue ids mentioned in the readable content of `id`
    fn references(&self, id: &RawCoId) -> Vec<RawCoId> {
        let Ok(transactions) = self.decrypt_valid(id) else { return Vec::new() };
        let mut found = Vec::new();
        for tx in &transactions {
            for change in &tx.changes {
                collect_ids(change, &mut found);
            }
        }
        found.retain(|r| r != id);
        found
    }
}

fn collect_ids(value: &JsonValue, found: &mut Vec<RawCoId>) {
    match value {
        JsonValue::String(s) if RawCoId::looks_like(s) => {
            if let Ok(id) = RawCoId::parse(s.as_str()) {
                if !found.contains(&id) {
                    found.push(id);
                }
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|item| collect_ids(item, found)),
        JsonValue::Object(map) => map.values().for_each(|item| collect_ids(item, found)),
        _ => {}
    }
}

impl LocalNode {
    pub async fn load(&self, id: &RawCoId) -> LoadOutcome {
        self.inner.load_tree(id, 0).await
    }

    /// Load `id` and, `depth` levels deep, the CoValues its content refers to
    pub async fn load_with_depth(&self, id: &RawCoId, depth: usize) -> LoadOutcome {
        self.inner.load_tree(id, depth).await
    }

    pub fn loading_state(&self, id: &RawCoId) -> LoadingState {
        SyncHost::loading_state(self.inner.as_ref(), id)
    }
}
