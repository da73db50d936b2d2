//! Registry of connected peers
//!
//! Kept sorted by priority (descending), ties in insertion order. Adding a
//! peer whose id is already registered closes the previous entry first.

use super::peer::{PeerEntry, PeerId};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
pub struct Peers {
    entries: Vec<Arc<PeerEntry>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `entry`; returns the replaced (already closed) entry
    pub fn add(&mut self, entry: Arc<PeerEntry>) -> Option<Arc<PeerEntry>> {
        let replaced = self.remove(entry.id());
        if let Some(old) = &replaced {
            info!(peer = %old.id(), "Replacing existing peer");
            old.close();
        }

        // After every peer of equal priority, so ties keep insertion order
        let at = self
            .entries
            .iter()
            .position(|e| e.priority() < entry.priority())
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
        replaced
    }

    pub fn remove(&mut self, id: &PeerId) -> Option<Arc<PeerEntry>> {
        let at = self.entries.iter().position(|e| e.id() == id)?;
        Some(self.entries.remove(at))
    }

    /// Remove `entry` only if it is still the registered instance for its id
    pub fn remove_instance(&mut self, entry: &Arc<PeerEntry>) -> bool {
        match self.entries.iter().position(|e| Arc::ptr_eq(e, entry)) {
            Some(at) => {
                self.entries.remove(at);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<PeerEntry>> {
        self.entries.iter().find(|e| e.id() == id).cloned()
    }

    /// All peers in priority order
    pub fn all(&self) -> Vec<Arc<PeerEntry>> {
        self.entries.clone()
    }

    /// Server and storage peers in priority order
    pub fn upstream(&self) -> Vec<Arc<PeerEntry>> {
        self.entries.iter().filter(|e| e.role().is_upstream()).cloned().collect()
    }

    pub fn clients(&self) -> Vec<Arc<PeerEntry>> {
        self.entries.iter().filter(|e| !e.role().is_upstream()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and close every peer
    pub fn close_all(&mut self) -> Vec<Arc<PeerEntry>> {
        let closed: Vec<_> = self.entries.drain(..).collect();
        for entry in &closed {
            entry.close();
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_sync::peer::PeerRole;

    fn entry(id: &str, role: PeerRole, priority: i32) -> Arc<PeerEntry> {
        Arc::new(PeerEntry::new(PeerId::from(id), role, priority))
    }

    fn ids(peers: &[Arc<PeerEntry>]) -> Vec<&str> {
        peers.iter().map(|p| p.id().as_str()).collect()
    }

    #[test]
    fn test_sorted_by_priority_then_insertion() {
        let mut peers = Peers::new();
        peers.add(entry("low", PeerRole::Client, 0));
        peers.add(entry("high", PeerRole::Server, 10));
        peers.add(entry("mid-a", PeerRole::Client, 5));
        peers.add(entry("mid-b", PeerRole::Storage, 5));

        let all = peers.all();
        assert_eq!(ids(&all), vec!["high", "mid-a", "mid-b", "low"]);
        assert_eq!(ids(&peers.upstream()), vec!["high", "mid-b"]);
        assert_eq!(ids(&peers.clients()), vec!["mid-a", "low"]);
    }

    #[test]
    fn test_duplicate_id_closes_previous() {
        let mut peers = Peers::new();
        let first = entry("server", PeerRole::Server, 0);
        peers.add(first.clone());

        let second = entry("server", PeerRole::Server, 0);
        let replaced = peers.add(second.clone()).unwrap();

        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(peers.len(), 1);

        // A stale instance cannot remove its replacement
        assert!(!peers.remove_instance(&first));
        assert!(peers.remove_instance(&second));
        assert!(peers.is_empty());
    }

    #[test]
    fn test_close_all() {
        let mut peers = Peers::new();
        let a = entry("a", PeerRole::Client, 0);
        peers.add(a.clone());
        assert_eq!(peers.close_all().len(), 1);
        assert!(a.is_closed());
        assert!(peers.get(&PeerId::from("a")).is_none());
    }
}
