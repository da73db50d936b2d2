/*
    transaction.rs - The write path

    Every local write goes through a TransactionContext, even a single
    mutate. Commit happens in three steps:

    1. validate every intended mutation under the registry lock: the
       CoValue is available and not deleted, our role in the owning group
       allows it, and private changes have a read key to encrypt with
    2. apply them all while still holding the lock
    3. write the touched CoValues to storage in one store call, then queue
       one push per touched CoValue to the peers

    A refused mutation fails the whole context before anything is applied.
*/

use super::errors::{NodeError, NodeResult};
use super::node::{LocalNode, NodeInner};
use crate::core_covalue::{
    now_millis, CoValueError, CoValueHeader, CoValueType, RawCoId, Ruleset, SessionId, Transaction, TransactionId,
};
use crate::core_group::{current_read_key, GroupState, KeyAccess, PermissionError, Role};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

/// How the changes of a transaction are stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privacy {
    /// Encrypted with the owning group's current read key
    Private,
    /// Plaintext
    Trusting,
}

#[derive(Debug, Clone)]
struct PendingMutation {
    id: RawCoId,
    changes: Vec<JsonValue>,
    privacy: Privacy,
}

/// Mutations that commit together or not at all
#[derive(Debug, Default)]
pub struct TransactionContext {
    mutations: Vec<PendingMutation>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Private where the ruleset allows it
    pub fn mutate(&mut self, id: &RawCoId, changes: Vec<JsonValue>) -> &mut Self {
        self.mutate_with(id, changes, Privacy::Private)
    }

    pub fn mutate_trusting(&mut self, id: &RawCoId, changes: Vec<JsonValue>) -> &mut Self {
        self.mutate_with(id, changes, Privacy::Trusting)
    }

    pub fn mutate_with(&mut self, id: &RawCoId, changes: Vec<JsonValue>, privacy: Privacy) -> &mut Self {
        self.mutations.push(PendingMutation { id: id.clone(), changes, privacy });
        self
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    fn ids(&self) -> Vec<RawCoId> {
        let mut ids: Vec<RawCoId> = Vec::new();
        for mutation in &self.mutations {
            if !ids.contains(&mutation.id) {
                ids.push(mutation.id.clone());
            }
        }
        ids
    }
}

impl NodeInner {
    /// Validate, then apply. Returns the touched ids in first-touch order.
    fn commit(&self, context: &TransactionContext) -> NodeResult<Vec<RawCoId>> {
        let mut registry = self.registry();
        let me = self.me();

        let mut planned: Vec<(RawCoId, Transaction)> = Vec::with_capacity(context.len());
        let mut next_index: HashMap<RawCoId, u32> = HashMap::new();
        for mutation in &context.mutations {
            let id = &mutation.id;
            let core = registry.get(id).ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            let state = core.verified().ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            if core.is_deleted() {
                return Err(NodeError::Deleted(id.clone()));
            }

            let index = next_index
                .entry(id.clone())
                .or_insert_with(|| state.session(&self.session).map_or(0, |log| log.len()));
            let made_at = now_millis();

            let tx = match &state.header().ruleset {
                Ruleset::Group { .. } => {
                    let group = GroupState::from_verified(state).ok_or_else(|| NodeError::NotAGroup(id.clone()))?;
                    if group.role_of(&me) != Some(Role::Admin) {
                        return Err(PermissionError::AdminRequired("edit groups").into());
                    }
                    Transaction::trusting(made_at, &mutation.changes, None)?
                }
                Ruleset::OwnedByGroup { group: group_id } => {
                    let group = registry.group(group_id).ok_or_else(|| NodeError::Unavailable(group_id.clone()))?;
                    if !group.role_of(&me).is_some_and(|role| role.can_write()) {
                        return Err(PermissionError::WriteDenied { member: me.to_string(), id: id.clone() }.into());
                    }
                    match mutation.privacy {
                        Privacy::Trusting => Transaction::trusting(made_at, &mutation.changes, None)?,
                        Privacy::Private => {
                            let member = self.member_in(group_id);
                            let access = KeyAccess {
                                crypto: self.crypto.as_ref(),
                                resolver: &*registry,
                                member: &member,
                                secret: &self.agent_secret,
                            };
                            let (key_id, key_secret) = current_read_key(&group, &access)
                                .ok_or_else(|| PermissionError::NoReadKey(group_id.clone()))?;
                            let tx_id = TransactionId::new(self.session.clone(), *index);
                            let plaintext = serde_json::to_vec(&mutation.changes).map_err(CoValueError::from)?;
                            let encrypted =
                                self.crypto.encrypt(&plaintext, &key_secret, &tx_id.nonce_material(id))?;
                            Transaction::private(made_at, key_id, encrypted)
                        }
                    }
                }
                Ruleset::UnsafeAllowAll => Transaction::trusting(made_at, &mutation.changes, None)?,
            };
            *index += 1;
            planned.push((id.clone(), tx));
        }

        let now = Instant::now();
        let mut touched: Vec<RawCoId> = Vec::new();
        for (id, tx) in planned {
            let core = registry.get_mut(&id).ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            core.verified_mut()
                .ok_or_else(|| NodeError::Unavailable(id.clone()))?
                .make_transaction(self.crypto.as_ref(), &self.session, self.agent_secret.signer_secret(), tx)?;
            core.touch(now);
            core.notify_updated();
            if !touched.contains(&id) {
                touched.push(id);
            }
        }
        Ok(touched)
    }
}

impl LocalNode {
    /// Run `build` against a fresh context and commit what it queued
    pub async fn transaction<F>(&self, build: F) -> NodeResult<()>
    where
        F: FnOnce(&mut TransactionContext) -> NodeResult<()>,
    {
        let mut context = TransactionContext::new();
        build(&mut context)?;
        self.commit(context).await
    }

    pub async fn commit(&self, context: TransactionContext) -> NodeResult<()> {
        if context.is_empty() {
            return Ok(());
        }
        self.ensure_running().await?;

        let ids = context.ids();
        for id in &ids {
            if !self.load(id).await.is_available() {
                return Err(NodeError::Unavailable(id.clone()));
            }
        }

        let touched = self.inner.commit(&context)?;
        metrics::counter!("cojson_node_transactions_total").increment(context.len() as u64);
        debug!(mutations = context.len(), co_values = touched.len(), "Committed transaction");

        self.inner.persist(&touched).await;
        for id in &touched {
            self.inner.sync.broadcast(&self.inner, id, None).await;
        }
        Ok(())
    }

    /// Append one transaction; private for group-owned CoValues
    pub async fn mutate(&self, id: &RawCoId, changes: Vec<JsonValue>) -> NodeResult<()> {
        self.mutate_with(id, changes, Privacy::Private).await
    }

    pub async fn mutate_trusting(&self, id: &RawCoId, changes: Vec<JsonValue>) -> NodeResult<()> {
        self.mutate_with(id, changes, Privacy::Trusting).await
    }

    pub async fn mutate_with(&self, id: &RawCoId, changes: Vec<JsonValue>, privacy: Privacy) -> NodeResult<()> {
        let mut context = TransactionContext::new();
        context.mutate_with(id, changes, privacy);
        self.commit(context).await
    }

    /// Register a CoValue for `header` and announce it
    pub async fn create_co_value(&self, header: CoValueHeader) -> NodeResult<RawCoId> {
        self.ensure_running().await?;
        let id = self.inner.install(header, None)?;
        self.inner.touch(&id);
        self.inner.persist(std::slice::from_ref(&id)).await;
        self.inner.sync.broadcast(&self.inner, &id, None).await;
        debug!(id = %id, "Created CoValue");
        Ok(id)
    }

    /// New CoValue of `co_type` owned by `group`
    pub async fn create_owned(&self, co_type: CoValueType, group: &RawCoId) -> NodeResult<RawCoId> {
        let role = self.my_role(group).await?;
        if !role.is_some_and(|r| r.can_write()) {
            let member = self.inner.me().to_string();
            return Err(PermissionError::WriteDenied { member, id: group.clone() }.into());
        }
        let ruleset = Ruleset::OwnedByGroup { group: group.clone() };
        let header = CoValueHeader::new(co_type, ruleset, json!(self.inner.crypto.random_suffix()))
            .with_created_at(now_millis());
        self.create_co_value(header).await
    }

    /// Tombstone `id`. Only admins of the owning group may; groups and
    /// accounts never can be deleted.
    pub async fn delete_co_value(&self, id: &RawCoId) -> NodeResult<()> {
        self.ensure_running().await?;
        if !self.load(id).await.is_available() {
            return Err(NodeError::Unavailable(id.clone()));
        }

        {
            let mut registry = self.inner.registry();
            let header = registry
                .verified(id)
                .map(|state| state.header().clone())
                .ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            let role = registry.owning_group(&header).and_then(|group| group.role_of(&self.inner.me()));
            let deleted_session = SessionId::new_deleted(&self.inner.me(), &self.inner.session_suffix);
            let core = registry.get_mut(id).ok_or_else(|| NodeError::Unavailable(id.clone()))?;
            core.delete_co_value(
                self.inner.crypto.as_ref(),
                &deleted_session,
                self.inner.agent_secret.signer_secret(),
                role,
            )?;
        }
        info!(id = %id, "Deleted CoValue");

        self.inner.persist(std::slice::from_ref(id)).await;
        if let Some(storage) = self.inner.current_storage() {
            storage.mark_deleted(id).await?;
        }
        self.inner.sync.broadcast(&self.inner, id, None).await;
        Ok(())
    }

    pub fn is_deleted(&self, id: &RawCoId) -> bool {
        self.inner.registry().get(id).is_some_and(|core| core.is_deleted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_group::PermissionError;
    use crate::core_sync::{PeerId, SyncHost};

    fn set(key: &str, value: i64) -> JsonValue {
        json!({ "op": "set", "key": key, "value": value })
    }

    #[tokio::test]
    async fn test_private_mutation_round_trips() {
        let node = LocalNode::with_new_account(Config::default()).unwrap();
        let group = node.create_group().await.unwrap();
        let map = node.create_owned(CoValueType::CoMap, &group).await.unwrap();

        node.mutate(&map, vec![set("a", 1)]).await.unwrap();
        node.mutate_trusting(&map, vec![set("b", 2)]).await.unwrap();

        let txs = node.decrypted_changes(&map).await.unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].changes, vec![set("a", 1)]);
        assert_eq!(txs[1].changes, vec![set("b", 2)]);
        assert_eq!(txs[0].privacy, Privacy::Private);
        assert_eq!(txs[1].privacy, Privacy::Trusting);
    }

    #[tokio::test]
    async fn test_refused_context_applies_nothing() {
        let node = LocalNode::with_new_account(Config::default()).unwrap();
        let group = node.create_group().await.unwrap();
        let map = node.create_owned(CoValueType::CoMap, &group).await.unwrap();
        let before = node.inner.registry().verified(&map).unwrap().known_state();

        // Second mutation targets a group we are not admin of
        let foreign = LocalNode::with_new_account(Config::default()).unwrap();
        let foreign_group = foreign.create_group().await.unwrap();
        let from = PeerId::from("foreign");
        for id in [foreign.account_id(), &foreign_group] {
            let (content, _) = foreign.inner.content_since(id, None).unwrap();
            node.inner.ingest(&from, &content).await;
        }

        let err = node
            .transaction(|ctx| {
                ctx.mutate(&map, vec![set("a", 1)]);
                ctx.mutate_trusting(&foreign_group, vec![set("x", 1)]);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.permission(), Some(&PermissionError::AdminRequired("edit groups")));
        assert_eq!(node.inner.registry().verified(&map).unwrap().known_state(), before);
    }

    #[tokio::test]
    async fn test_context_advances_nonce_index_per_mutation() {
        let node = LocalNode::with_new_account(Config::default()).unwrap();
        let group = node.create_group().await.unwrap();
        let map = node.create_owned(CoValueType::CoMap, &group).await.unwrap();

        node.transaction(|ctx| {
            ctx.mutate(&map, vec![set("a", 1)]).mutate(&map, vec![set("a", 2)]);
            Ok(())
        })
        .await
        .unwrap();

        let values: Vec<_> = node.decrypted_changes(&map).await.unwrap().into_iter().map(|tx| tx.changes).collect();
        assert_eq!(values, vec![vec![set("a", 1)], vec![set("a", 2)]]);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let node = LocalNode::with_new_account(Config::default()).unwrap();
        let group = node.create_group().await.unwrap();
        let map = node.create_owned(CoValueType::CoMap, &group).await.unwrap();

        let err = node.delete_co_value(&group).await.unwrap_err();
        assert_eq!(err.to_string(), "Cannot delete Group or Account coValues");

        node.delete_co_value(&map).await.unwrap();
        assert!(node.is_deleted(&map));
        assert_eq!(node.load(&map).await, crate::core_node::LoadOutcome::Deleted);
        assert!(matches!(node.mutate(&map, vec![set("a", 1)]).await, Err(NodeError::Deleted(_))));
    }

    #[tokio::test]
    async fn test_unowned_values_cannot_be_deleted_either_way() {
        let owner = LocalNode::with_new_account(Config::default()).unwrap();
        let other = LocalNode::with_new_account(Config::default()).unwrap();
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, serde_json::json!("open"));
        let id = owner.create_co_value(header).await.unwrap();

        let err = owner.delete_co_value(&id).await.unwrap_err();
        assert_eq!(err.permission(), Some(&PermissionError::OnlyAdminsCanDelete));

        let peer = PeerId::from("peer");
        for source in [owner.account_id(), &id] {
            let (content, _) = owner.inner.content_since(source, None).unwrap();
            other.inner.ingest(&peer, &content).await;
        }
        let (account, _) = other.inner.content_since(other.account_id(), None).unwrap();
        owner.inner.ingest(&peer, &account).await;

        // A tombstone written around the node API still arrives as content
        let before = other.inner.registry().verified(&id).unwrap().known_state();
        {
            let inner = &other.inner;
            let session = SessionId::new_deleted(&inner.me(), "forged");
            let mut registry = inner.registry();
            let state = registry.get_mut(&id).unwrap().verified_mut().unwrap();
            state
                .make_transaction(
                    inner.crypto.as_ref(),
                    &session,
                    inner.agent_secret.signer_secret(),
                    Transaction::tombstone(now_millis()).unwrap(),
                )
                .unwrap();
        }
        let (content, _) = other.inner.content_since(&id, Some(&before)).unwrap();
        owner.inner.ingest(&peer, &content).await;

        assert!(!owner.is_deleted(&id));
        assert_eq!(owner.load(&id).await, crate::core_node::LoadOutcome::Available);
        assert_eq!(
            owner.inner.registry().verified(&id).unwrap().known_state(),
            other.inner.registry().verified(&id).unwrap().known_state()
        );
    }
}
