/*
    state.rs - Interpreting a group CoValue as a role table

    Group content is a last-writer-wins map over the group's trusting
    transactions in `(made_at, session, index)` order. Each transaction is
    validated against the author's role at that point; invalid transactions
    are ignored as a whole. Per-key history is kept so that roles can be
    resolved at the time another CoValue's transaction was made.

    Keys:
    - `<member>`                -> admin | writer | reader | revoked
    - `everyone`                -> reader | writer | revoked
    - `readKey`                 -> current key id
    - `<keyId>_for_<member>`    -> sealed key secret
    - `<keyId>_for_everyone`    -> plaintext key secret
    - `<oldKeyId>_for_<newKeyId>` -> old secret encrypted with new secret
    - `groupSealer`             -> optional sealer id (absent on legacy groups)
*/

use super::role::Role;
use crate::core_covalue::{RawCoId, Ruleset, SessionOwner, TransactionId, VerifiedState};
use crate::core_crypto::{KeyId, SealerId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

pub const EVERYONE: &str = "everyone";
pub const READ_KEY: &str = "readKey";
pub const GROUP_SEALER: &str = "groupSealer";

/// One change in a map-like CoValue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MapOp {
    Set { key: String, value: JsonValue },
    Del { key: String },
}

impl MapOp {
    pub fn set(key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        MapOp::Set { key: key.into(), value: value.into() }
    }

    pub fn to_json(&self) -> JsonValue {
        // MapOp only holds strings and JSON values
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Key under which `key_id` is stored for `target`
pub fn key_for(key_id: &KeyId, target: &str) -> String {
    format!("{}_for_{}", key_id, target)
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupEntry {
    pub value: JsonValue,
    pub made_at: u64,
    pub tx_id: TransactionId,
    pub author: SessionOwner,
}

#[derive(Debug, Clone)]
pub struct GroupState {
    id: RawCoId,
    initial_admin: SessionOwner,
    history: BTreeMap<String, Vec<GroupEntry>>,
    valid: HashSet<TransactionId>,
}

impl GroupState {
    /// Interpret a verified group. Returns `None` for other rulesets.
    pub fn from_verified(state: &VerifiedState) -> Option<Self> {
        let initial_admin = match &state.header().ruleset {
            Ruleset::Group { initial_admin } => initial_admin.clone(),
            Ruleset::OwnedByGroup { .. } | Ruleset::UnsafeAllowAll => return None,
        };

        let mut group = GroupState {
            id: state.id().clone(),
            initial_admin,
            history: BTreeMap::new(),
            valid: HashSet::new(),
        };

        for (tx_id, tx) in state.transactions_in_order() {
            // Groups carry trusting content only and are never deletable
            if tx.is_tombstone() {
                continue;
            }
            let ops = match tx.trusting_changes() {
                Some(Ok(changes)) => changes
                    .into_iter()
                    .map(serde_json::from_value::<MapOp>)
                    .collect::<Result<Vec<_>, _>>(),
                Some(Err(_)) | None => continue,
            };
            let Ok(ops) = ops else { continue };

            let author = group.effective_author(&tx_id.session_id.owner());
            if !ops.iter().all(|op| group.is_allowed(&author, op)) {
                trace!(group = %group.id, tx = ?tx_id, "Ignoring unauthorized group transaction");
                continue;
            }

            for op in ops {
                if let MapOp::Set { key, value } = op {
                    group.history.entry(key).or_default().push(GroupEntry {
                        value,
                        made_at: tx.made_at(),
                        tx_id: tx_id.clone(),
                        author: author.clone(),
                    });
                }
            }
            group.valid.insert(tx_id);
        }

        Some(group)
    }

    /// An account writing to its own group acts as its initial agent
    fn effective_author(&self, owner: &SessionOwner) -> SessionOwner {
        match owner {
            SessionOwner::Account(id) if id == &self.id => self.initial_admin.clone(),
            other => other.clone(),
        }
    }

    fn author_role(&self, author: &SessionOwner) -> Option<Role> {
        match self.explicit_role(&author.to_string()) {
            Some(role) => Some(role),
            None if author == &self.initial_admin => Some(Role::Admin),
            None => None,
        }
    }

    fn is_allowed(&self, author: &SessionOwner, op: &MapOp) -> bool {
        if self.author_role(author) != Some(Role::Admin) {
            return false;
        }
        match op {
            MapOp::Del { .. } => false,
            MapOp::Set { key, value } => {
                if key == EVERYONE {
                    role_value(value).is_some_and(|r| r.is_valid_for_everyone())
                } else if key == GROUP_SEALER {
                    value.as_str().is_some_and(|s| SealerId::parse(s).is_ok())
                } else if key == READ_KEY {
                    value.as_str().is_some_and(|s| KeyId::parse(s).is_ok())
                } else if SessionOwner::parse(key).is_ok() {
                    role_value(value).is_some()
                } else {
                    true
                }
            }
        }
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn initial_admin(&self) -> &SessionOwner {
        &self.initial_admin
    }

    pub fn is_valid(&self, tx_id: &TransactionId) -> bool {
        self.valid.contains(tx_id)
    }

    pub fn get_entry(&self, key: &str) -> Option<&GroupEntry> {
        self.history.get(key).and_then(|h| h.last())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.get_entry(key).map(|e| &e.value)
    }

    fn entry_at(&self, key: &str, made_at: u64) -> Option<&GroupEntry> {
        self.history.get(key)?.iter().rev().find(|e| e.made_at <= made_at)
    }

    fn explicit_role(&self, member: &str) -> Option<Role> {
        self.get(member).and_then(role_value)
    }

    pub fn everyone_role(&self) -> Option<Role> {
        self.get(EVERYONE).and_then(role_value).filter(|r| *r != Role::Revoked)
    }

    /// Explicit role, then the `everyone` role, then none.
    ///
    /// A revoked member still gets whatever `everyone` is granted.
    pub fn role_of(&self, member: &SessionOwner) -> Option<Role> {
        let member = self.effective_author(member);
        let explicit = self.author_role(&member);
        resolve(explicit, self.everyone_role())
    }

    /// Role as of `made_at`
    pub fn role_of_at(&self, member: &SessionOwner, made_at: u64) -> Option<Role> {
        let member = self.effective_author(member);
        let explicit = match self.entry_at(&member.to_string(), made_at).and_then(|e| role_value(&e.value)) {
            Some(role) => Some(role),
            None if member == self.initial_admin => Some(Role::Admin),
            None => None,
        };
        let everyone = self
            .entry_at(EVERYONE, made_at)
            .and_then(|e| role_value(&e.value))
            .filter(|r| *r != Role::Revoked);
        resolve(explicit, everyone)
    }

    /// Members with an explicit role entry
    pub fn members(&self) -> Vec<(SessionOwner, Role)> {
        self.history
            .iter()
            .filter_map(|(key, entries)| {
                let owner = SessionOwner::parse(key).ok()?;
                let role = role_value(&entries.last()?.value)?;
                Some((owner, role))
            })
            .collect()
    }

    pub fn read_key_id(&self) -> Option<KeyId> {
        self.get(READ_KEY).and_then(|v| v.as_str()).and_then(|s| KeyId::parse(s).ok())
    }

    /// Missing on legacy groups; that is not an error
    pub fn group_sealer(&self) -> Option<SealerId> {
        self.get(GROUP_SEALER).and_then(|v| v.as_str()).and_then(|s| SealerId::parse(s).ok())
    }

    /// Newer keys that `key_id` was re-encrypted for
    pub fn newer_keys_for(&self, key_id: &KeyId) -> Vec<KeyId> {
        let prefix = format!("{}_for_", key_id);
        self.history
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|target| KeyId::parse(target).ok())
            .collect()
    }
}

fn role_value(value: &JsonValue) -> Option<Role> {
    value.as_str().and_then(|s| s.parse().ok())
}

fn resolve(explicit: Option<Role>, everyone: Option<Role>) -> Option<Role> {
    match explicit {
        Some(Role::Revoked) => everyone.or(Some(Role::Revoked)),
        Some(role) => Some(role),
        None => everyone,
    }
}
