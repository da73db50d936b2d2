/*
    ops.rs - Admin operations on a group

    Builds the map operations for role changes and key rotation. Every
    operation is checked against the caller's role first; the caller then
    appends the returned operations as one trusting transaction.
*/

use super::errors::PermissionError;
use super::keys::{chain_key, current_read_key, group_sealer_op, reveal_key, seal_key_for_member, set_read_key, KeyAccess};
use super::role::Role;
use super::state::{GroupState, MapOp, EVERYONE};
use crate::core_covalue::{CoValueResult, RawCoId, SessionOwner};
use crate::core_crypto::{AgentId, AgentSecret, CryptoProvider};
use tracing::warn;

/// Operations for a freshly created group: the creator as admin, a first
/// read key sealed to them and, unless legacy, a group sealer
pub fn initial_group_ops(
    crypto: &dyn CryptoProvider,
    group: &RawCoId,
    me: &SessionOwner,
    my_secret: &AgentSecret,
    my_agent: &AgentId,
    with_sealer: bool,
) -> CoValueResult<Vec<MapOp>> {
    let (key_id, key_secret) = crypto.new_key_secret();
    let mut ops = vec![
        MapOp::set(me.to_string(), Role::Admin.as_str()),
        seal_key_for_member(crypto, group, &key_id, &key_secret, my_secret, me, my_agent)?,
        set_read_key(&key_id),
    ];
    if with_sealer {
        ops.push(group_sealer_op(crypto, &key_secret)?);
    }
    Ok(ops)
}

pub struct GroupEditor<'a> {
    group: &'a GroupState,
    access: KeyAccess<'a>,
}

impl<'a> GroupEditor<'a> {
    /// Editor acting as `access.member`, who must be an admin
    pub fn new(group: &'a GroupState, access: KeyAccess<'a>, action: &'static str) -> Result<Self, PermissionError> {
        if group.role_of(access.member) != Some(Role::Admin) {
            return Err(PermissionError::AdminRequired(action));
        }
        Ok(Self { group, access })
    }

    fn agent_of(&self, member: &SessionOwner) -> Result<AgentId, PermissionError> {
        self.access
            .resolver
            .agent_of(member)
            .ok_or_else(|| PermissionError::UnknownMember(member.to_string()))
    }

    /// Grant `role` and seal the current read key to the new member
    pub fn add_member(&self, member: &SessionOwner, role: Role) -> CoValueResult<Vec<MapOp>> {
        if role == Role::Revoked {
            return self.remove_member(member);
        }
        let recipient = self.agent_of(member)?;
        let mut ops = vec![MapOp::set(member.to_string(), role.as_str())];
        if let Some((key_id, key_secret)) = current_read_key(self.group, &self.access) {
            ops.push(seal_key_for_member(
                self.access.crypto,
                self.group.id(),
                &key_id,
                &key_secret,
                self.access.secret,
                member,
                &recipient,
            )?);
        }
        Ok(ops)
    }

    /// Revoke `member` and rotate the read key away from them
    pub fn remove_member(&self, member: &SessionOwner) -> CoValueResult<Vec<MapOp>> {
        let mut ops = vec![MapOp::set(member.to_string(), Role::Revoked.as_str())];
        ops.extend(self.rotation_ops(Some(member))?);
        Ok(ops)
    }

    pub fn rotate_read_key(&self) -> CoValueResult<Vec<MapOp>> {
        self.rotation_ops(None)
    }

    fn rotation_ops(&self, excluding: Option<&SessionOwner>) -> CoValueResult<Vec<MapOp>> {
        let crypto = self.access.crypto;
        let group_id = self.group.id();
        let (new_id, new_secret) = crypto.new_key_secret();
        let mut ops = Vec::new();

        for (member, role) in self.group.members() {
            if role == Role::Revoked || Some(&member) == excluding {
                continue;
            }
            match self.access.resolver.agent_of(&member) {
                Some(agent) => ops.push(seal_key_for_member(
                    crypto,
                    group_id,
                    &new_id,
                    &new_secret,
                    self.access.secret,
                    &member,
                    &agent,
                )?),
                None => warn!(group = %group_id, member = %member, "Member account not loaded, skipping key"),
            }
        }

        if let Some((old_id, old_secret)) = current_read_key(self.group, &self.access) {
            ops.push(chain_key(crypto, group_id, &old_id, &old_secret, &new_id, &new_secret)?);
        }
        if self.group.everyone_role().is_some_and(|r| r.can_read()) {
            ops.push(reveal_key(&new_id, &new_secret));
        }
        if self.group.group_sealer().is_some() {
            ops.push(group_sealer_op(crypto, &new_secret)?);
        }
        ops.push(set_read_key(&new_id));
        Ok(ops)
    }

    /// Grant (or withdraw) a role for everyone
    pub fn set_everyone_role(&self, role: Role) -> CoValueResult<Vec<MapOp>> {
        if !role.is_valid_for_everyone() {
            return Err(PermissionError::InvalidRole(role.to_string()).into());
        }
        let mut ops = vec![MapOp::set(EVERYONE, role.as_str())];
        if role == Role::Revoked {
            // Content written from now on must not stay public
            ops.extend(self.rotation_ops(None)?);
        } else if let Some((key_id, key_secret)) = current_read_key(self.group, &self.access) {
            ops.push(reveal_key(&key_id, &key_secret));
        }
        Ok(ops)
    }
}
