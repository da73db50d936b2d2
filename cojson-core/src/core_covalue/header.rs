/*
    header.rs - Immutable CoValue header

    The id of a CoValue is derived from the canonical JSON of its header,
    so a header can be checked against the id it arrives under.
*/

use super::errors::{CoValueError, CoValueResult};
use super::ids::{RawCoId, SessionOwner};
use crate::core_crypto::short_hash_bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Content type of a CoValue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoValueType {
    CoMap,
    CoList,
    CoStream,
    BinaryCoStream,
    CoPlainText,
}

/// Access-control ruleset, fixed at creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ruleset {
    /// The CoValue is a group (or account); content is its role table
    Group { initial_admin: SessionOwner },
    /// Mutations are authorized against the owning group
    OwnedByGroup { group: RawCoId },
    /// No access control
    UnsafeAllowAll,
}

/// Sync lane of a CoValue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoValuePriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub co_type: CoValueType,
    pub ruleset: Ruleset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonValue>,
    pub uniqueness: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

impl CoValueHeader {
    pub fn new(co_type: CoValueType, ruleset: Ruleset, uniqueness: JsonValue) -> Self {
        Self { co_type, ruleset, meta: None, uniqueness, created_at: None }
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Header of an account: a group whose initial admin is an agent
    pub fn account(initial_admin: SessionOwner, uniqueness: JsonValue) -> Self {
        Self::new(CoValueType::CoMap, Ruleset::Group { initial_admin }, uniqueness)
            .with_meta(serde_json::json!({ "type": "account" }))
    }

    /// Content-derived id
    pub fn id(&self) -> CoValueResult<RawCoId> {
        let bytes = serde_json::to_vec(self)?;
        Ok(RawCoId::from_short_hash(&short_hash_bytes(&bytes)))
    }

    /// Check the header hashes to `id`
    pub fn verify_id(&self, id: &RawCoId) -> CoValueResult<()> {
        if &self.id()? != id {
            return Err(CoValueError::HeaderMismatch(id.clone()));
        }
        Ok(())
    }

    pub fn is_group(&self) -> bool {
        matches!(self.ruleset, Ruleset::Group { .. })
    }

    pub fn is_account(&self) -> bool {
        self.is_group()
            && self
                .meta
                .as_ref()
                .and_then(|m| m.get("type"))
                .and_then(|t| t.as_str())
                == Some("account")
    }

    /// Groups and accounts travel first, binary streams last
    pub fn priority(&self) -> CoValuePriority {
        match (&self.ruleset, self.co_type) {
            (Ruleset::Group { .. }, _) => CoValuePriority::High,
            (_, CoValueType::BinaryCoStream) => CoValuePriority::Low,
            _ => CoValuePriority::Medium,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> SessionOwner {
        SessionOwner::parse("sealer_zAAA/signer_zBBB").unwrap()
    }

    #[test]
    fn test_id_is_content_derived() {
        let a = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("u1"));
        let b = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("u2"));

        assert_eq!(a.id().unwrap(), a.clone().id().unwrap());
        assert_ne!(a.id().unwrap(), b.id().unwrap());
        assert!(a.id().unwrap().as_str().starts_with("co_z"));
    }

    #[test]
    fn test_verify_id_rejects_tampered_header() {
        let header = CoValueHeader::new(CoValueType::CoList, Ruleset::UnsafeAllowAll, json!("x"));
        let id = header.id().unwrap();
        assert!(header.verify_id(&id).is_ok());

        let tampered = header.with_meta(json!({"evil": true}));
        assert!(matches!(tampered.verify_id(&id), Err(CoValueError::HeaderMismatch(_))));
    }

    #[test]
    fn test_account_header() {
        let header = CoValueHeader::account(owner(), json!("acc"));
        assert!(header.is_group());
        assert!(header.is_account());
        assert_eq!(header.priority(), CoValuePriority::High);
    }

    #[test]
    fn test_priority_lanes() {
        let group = RawCoId::parse("co_zGroup").unwrap();
        let plain = CoValueHeader::new(
            CoValueType::CoMap,
            Ruleset::OwnedByGroup { group: group.clone() },
            json!("a"),
        );
        let binary = CoValueHeader::new(
            CoValueType::BinaryCoStream,
            Ruleset::OwnedByGroup { group },
            json!("b"),
        );
        assert_eq!(plain.priority(), CoValuePriority::Medium);
        assert_eq!(binary.priority(), CoValuePriority::Low);
    }

    #[test]
    fn test_ruleset_wire_format() {
        let ruleset = Ruleset::Group { initial_admin: owner() };
        let value = serde_json::to_value(&ruleset).unwrap();
        assert_eq!(value["type"], "group");
        assert_eq!(value["initial_admin"], "sealer_zAAA/signer_zBBB");
    }
}
