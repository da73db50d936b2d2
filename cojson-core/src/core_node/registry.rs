/*
    registry.rs - The node's CoValues by id

    Lives behind the node's single registry mutex. Also answers "which agent
    is behind this account" for signature checks and key unsealing, from
    whatever accounts happen to be loaded.
*/

use crate::core_covalue::{CoValueCore, CoValueHeader, RawCoId, Ruleset, VerifiedState};
use crate::core_crypto::AgentId;
use crate::core_group::{account_agent_from_header, is_deleted, AgentResolver, GroupState};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Registry {
    values: HashMap<RawCoId, CoValueCore>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &RawCoId) -> Option<&CoValueCore> {
        self.values.get(id)
    }

    pub fn get_mut(&mut self, id: &RawCoId) -> Option<&mut CoValueCore> {
        self.values.get_mut(id)
    }

    /// Entry for `id`, created empty (not yet available) if missing
    pub fn entry(&mut self, id: &RawCoId) -> &mut CoValueCore {
        self.values.entry(id.clone()).or_insert_with(|| CoValueCore::new(id.clone()))
    }

    pub fn insert(&mut self, core: CoValueCore) {
        self.values.insert(core.id().clone(), core);
    }

    pub fn remove(&mut self, id: &RawCoId) -> Option<CoValueCore> {
        self.values.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoValueCore> {
        self.values.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut CoValueCore> {
        self.values.values_mut()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn verified(&self, id: &RawCoId) -> Option<&VerifiedState> {
        self.values.get(id).and_then(|core| core.verified())
    }

    pub fn available_ids(&self) -> Vec<RawCoId> {
        self.values.values().filter(|core| core.is_available()).map(|core| core.id().clone()).collect()
    }

    /// `id` interpreted as a group, if it is one and available
    pub fn group(&self, id: &RawCoId) -> Option<GroupState> {
        self.verified(id).and_then(GroupState::from_verified)
    }

    /// The group a CoValue with this header is owned by
    pub fn owning_group(&self, header: &CoValueHeader) -> Option<GroupState> {
        match &header.ruleset {
            Ruleset::OwnedByGroup { group } => self.group(group),
            Ruleset::Group { .. } | Ruleset::UnsafeAllowAll => None,
        }
    }

    /// Flag `id` deleted once its ruleset accepts one of its tombstones.
    /// True if it was not deleted before.
    pub fn settle_deletion(&mut self, id: &RawCoId) -> bool {
        let deleted = self.verified(id).is_some_and(|state| {
            let group = self.owning_group(state.header());
            is_deleted(state, group.as_ref())
        });
        match self.values.get_mut(id) {
            Some(core) if deleted && !core.is_deleted() => {
                core.set_deleted();
                true
            }
            _ => false,
        }
    }
}

impl AgentResolver for Registry {
    fn account_agent(&self, account: &RawCoId) -> Option<AgentId> {
        self.verified(account).and_then(|state| account_agent_from_header(state.header()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::{CoValueType, SessionOwner, DEFAULT_MAX_BYTES_PER_SIGNATURE};
    use crate::core_crypto::{CryptoProvider, PureCrypto};
    use serde_json::json;

    #[test]
    fn test_resolves_loaded_accounts_only() {
        let crypto = PureCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret()).unwrap();
        let header = CoValueHeader::account(SessionOwner::Agent(agent.clone()), json!("acc"));
        let id = header.id().unwrap();

        let mut registry = Registry::new();
        registry.entry(&id);
        assert_eq!(registry.account_agent(&id), None);
        assert!(registry.available_ids().is_empty());

        let state = VerifiedState::new(id.clone(), header, DEFAULT_MAX_BYTES_PER_SIGNATURE).unwrap();
        registry.insert(CoValueCore::from_verified(state));
        assert_eq!(registry.account_agent(&id), Some(agent));
        assert!(registry.group(&id).is_some());
    }

    #[test]
    fn test_owning_group_needs_the_group_loaded() {
        let registry = Registry::new();
        let group = RawCoId::parse("co_zGroup").unwrap();
        let header = CoValueHeader::new(CoValueType::CoList, Ruleset::OwnedByGroup { group }, json!(1));
        assert!(registry.owning_group(&header).is_none());
    }
}
