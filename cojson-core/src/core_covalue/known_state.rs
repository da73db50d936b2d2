/*
    known_state.rs - What a replica holds of a CoValue

    `{ id, header, sessions: session -> transaction count }`. Used both for
    our own holdings and for what we believe a peer holds.
*/

use super::ids::{RawCoId, SessionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: RawCoId,
    pub header: bool,
    #[serde(default)]
    pub sessions: BTreeMap<SessionId, u32>,
}

impl KnownState {
    pub fn empty(id: RawCoId) -> Self {
        Self { id, header: false, sessions: BTreeMap::new() }
    }

    pub fn session_count(&self, session: &SessionId) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Merge in another view, keeping the larger count per session
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            if *count > *entry {
                *entry = *count;
            }
        }
    }

    pub fn set_session(&mut self, session: SessionId, count: u32) {
        self.sessions.insert(session, count);
    }

    /// Every session we hold is held at least as far by `other`
    pub fn is_covered_by(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self.sessions.iter().all(|(s, count)| other.session_count(s) >= *count)
    }

    pub fn total_transactions(&self) -> u64 {
        self.sessions.values().map(|c| *c as u64).sum()
    }
}
