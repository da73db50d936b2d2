//! Groups and membership from the node's point of view
//!
//! Role changes are built by `GroupEditor` as map operations and committed
//! as one trusting transaction on the group.

use super::errors::{NodeError, NodeResult};
use super::node::{ops_to_changes, LocalNode};
use super::transaction::{Privacy, TransactionContext};
use crate::core_covalue::{now_millis, CoValueHeader, CoValueResult, CoValueType, RawCoId, Ruleset, SessionOwner};
use crate::core_group::{initial_group_ops, GroupEditor, KeyAccess, MapOp, Role};
use serde_json::{json, Value as JsonValue};
use tracing::info;

/// Options for `create_group_with`
#[derive(Debug, Clone)]
pub struct GroupOptions {
    /// Legacy groups were created without a group sealer
    pub with_group_sealer: bool,
    pub meta: Option<JsonValue>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self { with_group_sealer: true, meta: None }
    }
}

impl LocalNode {
    /// New group with this account as its only admin
    pub async fn create_group(&self) -> NodeResult<RawCoId> {
        self.create_group_with(GroupOptions::default()).await
    }

    pub async fn create_group_with(&self, options: GroupOptions) -> NodeResult<RawCoId> {
        self.ensure_running().await?;
        let inner = &self.inner;
        let me = inner.me();

        let mut header = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::Group { initial_admin: me.clone() },
            json!(inner.crypto.random_suffix()),
        )
        .with_created_at(now_millis());
        header.meta = options.meta;
        let id = header.id()?;

        let ops = initial_group_ops(
            inner.crypto.as_ref(),
            &id,
            &me,
            &inner.agent_secret,
            &inner.agent_id,
            options.with_group_sealer,
        )?;
        inner.install(header, Some(&ops_to_changes(&ops)))?;
        inner.touch(&id);
        info!(group = %id, legacy = !options.with_group_sealer, "Created group");

        inner.persist(std::slice::from_ref(&id)).await;
        inner.sync.broadcast(&self.inner, &id, None).await;
        Ok(id)
    }

    /// Our role in `group`, `None` without one
    pub async fn my_role(&self, group: &RawCoId) -> NodeResult<Option<Role>> {
        let me = self.inner.me();
        self.role_of(group, &me).await
    }

    pub async fn role_of(&self, group: &RawCoId, member: &SessionOwner) -> NodeResult<Option<Role>> {
        if !self.load(group).await.is_available() {
            return Err(NodeError::Unavailable(group.clone()));
        }
        let state = self.inner.registry().group(group).ok_or_else(|| NodeError::NotAGroup(group.clone()))?;
        Ok(state.role_of(member))
    }

    /// Members with an explicit role, revoked ones included
    pub async fn members(&self, group: &RawCoId) -> NodeResult<Vec<(SessionOwner, Role)>> {
        if !self.load(group).await.is_available() {
            return Err(NodeError::Unavailable(group.clone()));
        }
        let state = self.inner.registry().group(group).ok_or_else(|| NodeError::NotAGroup(group.clone()))?;
        Ok(state.members())
    }

    /// Grant `role` to `member`, sealing the current read key to them.
    ///
    /// An account member must be loadable so the key can be sealed to its agent.
    pub async fn add_member(&self, group: &RawCoId, member: &SessionOwner, role: Role) -> NodeResult<()> {
        if let Some(account) = member.as_account() {
            if !self.load(account).await.is_available() {
                return Err(NodeError::Unavailable(account.clone()));
            }
        }
        self.edit_group(group, "change roles", |editor| editor.add_member(member, role)).await?;
        info!(group = %group, member = %member, role = %role, "Member added");
        Ok(())
    }

    /// Revoke `member` and rotate the read key away from them
    pub async fn remove_member(&self, group: &RawCoId, member: &SessionOwner) -> NodeResult<()> {
        self.edit_group(group, "change roles", |editor| editor.remove_member(member)).await?;
        info!(group = %group, member = %member, "Member removed");
        Ok(())
    }

    pub async fn rotate_read_key(&self, group: &RawCoId) -> NodeResult<()> {
        self.edit_group(group, "rotate keys", |editor| editor.rotate_read_key()).await
    }

    /// Open the group to everyone as reader or writer, or close it again
    pub async fn set_everyone_role(&self, group: &RawCoId, role: Role) -> NodeResult<()> {
        self.edit_group(group, "change roles", |editor| editor.set_everyone_role(role)).await
    }

    async fn edit_group<F>(&self, group: &RawCoId, action: &'static str, build: F) -> NodeResult<()>
    where
        F: FnOnce(&GroupEditor<'_>) -> CoValueResult<Vec<MapOp>>,
    {
        if !self.load(group).await.is_available() {
            return Err(NodeError::Unavailable(group.clone()));
        }
        let ops = {
            let inner = &self.inner;
            let registry = inner.registry();
            let state = registry.group(group).ok_or_else(|| NodeError::NotAGroup(group.clone()))?;
            let member = inner.member_in(group);
            let access = KeyAccess {
                crypto: inner.crypto.as_ref(),
                resolver: &*registry,
                member: &member,
                secret: &inner.agent_secret,
            };
            let editor = GroupEditor::new(&state, access, action)?;
            build(&editor)?
        };

        let mut context = TransactionContext::new();
        context.mutate_with(group, ops_to_changes(&ops), Privacy::Trusting);
        self.commit(context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core_covalue::Transaction;
    use crate::core_group::PermissionError;
    use crate::core_sync::{PeerId, SyncHost};

    /// Copy `ids` from one node to another as a peer would
    async fn hand_over(from: &LocalNode, to: &LocalNode, ids: &[&RawCoId]) {
        let peer = PeerId::from("hand");
        for id in ids {
            let (content, _) = from.inner.content_since(id, None).unwrap();
            to.inner.ingest(&peer, &content).await;
        }
    }

    #[tokio::test]
    async fn test_creator_is_admin_with_sealer() {
        let node = LocalNode::with_new_account(Config::default()).unwrap();
        let group = node.create_group().await.unwrap();
        assert_eq!(node.my_role(&group).await.unwrap(), Some(Role::Admin));
        assert!(node.inner.registry().group(&group).unwrap().group_sealer().is_some());

        let legacy = node
            .create_group_with(GroupOptions { with_group_sealer: false, meta: None })
            .await
            .unwrap();
        assert!(node.inner.registry().group(&legacy).unwrap().group_sealer().is_none());
        assert_eq!(node.my_role(&legacy).await.unwrap(), Some(Role::Admin));
    }

    #[tokio::test]
    async fn test_writer_cannot_change_roles() {
        let admin = LocalNode::with_new_account(Config::default()).unwrap();
        let writer = LocalNode::with_new_account(Config::default()).unwrap();
        hand_over(&writer, &admin, &[writer.account_id()]).await;

        let group = admin.create_group().await.unwrap();
        let writer_owner = SessionOwner::Account(writer.account_id().clone());
        admin.add_member(&group, &writer_owner, Role::Writer).await.unwrap();
        assert_eq!(admin.role_of(&group, &writer_owner).await.unwrap(), Some(Role::Writer));

        hand_over(&admin, &writer, &[admin.account_id(), &group]).await;
        assert_eq!(writer.my_role(&group).await.unwrap(), Some(Role::Writer));

        let err = writer.rotate_read_key(&group).await.unwrap_err();
        assert_eq!(err.permission(), Some(&PermissionError::AdminRequired("rotate keys")));
    }

    #[tokio::test]
    async fn test_non_member_writes_never_become_valid() {
        let admin = LocalNode::with_new_account(Config::default()).unwrap();
        let stranger = LocalNode::with_new_account(Config::default()).unwrap();
        hand_over(&stranger, &admin, &[stranger.account_id()]).await;

        let group = admin
            .create_group_with(GroupOptions { with_group_sealer: false, meta: None })
            .await
            .unwrap();
        let doc = admin.create_owned(CoValueType::CoMap, &group).await.unwrap();
        admin.mutate_trusting(&doc, vec![json!({"op": "set", "key": "k", "value": "admin"})]).await.unwrap();
        hand_over(&admin, &stranger, &[admin.account_id(), &group, &doc]).await;

        // Signed by the stranger, written around the permission check
        let before = stranger.inner.registry().verified(&doc).unwrap().known_state();
        {
            let inner = &stranger.inner;
            let tx = Transaction::trusting(now_millis(), &[json!({"op": "set", "key": "k", "value": "intruder"})], None)
                .unwrap();
            let mut registry = inner.registry();
            let state = registry.get_mut(&doc).unwrap().verified_mut().unwrap();
            state
                .make_transaction(inner.crypto.as_ref(), stranger.session_id(), inner.agent_secret.signer_secret(), tx)
                .unwrap();
        }
        let (content, _) = stranger.inner.content_since(&doc, Some(&before)).unwrap();
        admin.inner.ingest(&PeerId::from("stranger"), &content).await;

        let values: Vec<_> = admin
            .decrypted_changes(&doc)
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.changes[0]["value"].clone())
            .collect();
        assert_eq!(values, vec![json!("admin")]);
    }

    #[tokio::test]
    async fn test_members_lists_explicit_roles() {
        let admin = LocalNode::with_new_account(Config::default()).unwrap();
        let other = LocalNode::with_new_account(Config::default()).unwrap();
        hand_over(&other, &admin, &[other.account_id()]).await;

        let group = admin.create_group().await.unwrap();
        let other_owner = SessionOwner::Account(other.account_id().clone());
        admin.add_member(&group, &other_owner, Role::Reader).await.unwrap();
        admin.remove_member(&group, &other_owner).await.unwrap();

        let members = admin.members(&group).await.unwrap();
        assert!(members.contains(&(admin.inner.me(), Role::Admin)));
        assert!(members.contains(&(other_owner, Role::Revoked)));
    }
}
