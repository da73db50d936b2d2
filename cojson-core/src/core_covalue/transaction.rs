/*
    transaction.rs - One signed change inside a session

    `changes` and `meta` are kept as JSON text so the bytes fed to the
    session hasher are exactly the bytes that travel over the wire.
*/

use super::errors::CoValueResult;
use crate::core_crypto::{Encrypted, KeyId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "snake_case")]
pub enum Transaction {
    /// Plaintext changes
    Trusting {
        made_at: u64,
        changes: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
    /// Changes encrypted with a group read key
    Private {
        made_at: u64,
        key_used: KeyId,
        encrypted_changes: Encrypted,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
    },
}

impl Transaction {
    pub fn trusting(made_at: u64, changes: &[JsonValue], meta: Option<&JsonValue>) -> CoValueResult<Self> {
        Ok(Transaction::Trusting {
            made_at,
            changes: serde_json::to_string(changes)?,
            meta: meta.map(serde_json::to_string).transpose()?,
        })
    }

    pub fn private(made_at: u64, key_used: KeyId, encrypted_changes: Encrypted) -> Self {
        Transaction::Private { made_at, key_used, encrypted_changes, meta: None }
    }

    /// The deletion marker
    pub fn tombstone(made_at: u64) -> CoValueResult<Self> {
        Self::trusting(made_at, &[], Some(&serde_json::json!({ "deleted": true })))
    }

    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => *made_at,
        }
    }

    pub fn is_trusting(&self) -> bool {
        matches!(self, Transaction::Trusting { .. })
    }

    pub fn meta(&self) -> Option<JsonValue> {
        let raw = match self {
            Transaction::Trusting { meta, .. } | Transaction::Private { meta, .. } => meta.as_deref()?,
        };
        serde_json::from_str(raw).ok()
    }

    /// Trusting transaction carrying `meta.deleted = true`
    pub fn is_tombstone(&self) -> bool {
        self.is_trusting()
            && self
                .meta()
                .and_then(|m| m.get("deleted").and_then(|d| d.as_bool()))
                .unwrap_or(false)
    }

    /// Plaintext changes of a trusting transaction
    pub fn trusting_changes(&self) -> Option<CoValueResult<Vec<JsonValue>>> {
        match self {
            Transaction::Trusting { changes, .. } => {
                Some(serde_json::from_str(changes).map_err(Into::into))
            }
            Transaction::Private { .. } => None,
        }
    }

    /// Canonical bytes fed to the session hasher
    pub fn to_bytes(&self) -> CoValueResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trusting_round_trip() {
        let tx = Transaction::trusting(10, &[json!({"op": "set", "key": "a", "value": 1})], None).unwrap();
        let changes = tx.trusting_changes().unwrap().unwrap();
        assert_eq!(changes[0]["key"], "a");
        assert_eq!(tx.made_at(), 10);
        assert!(!tx.is_tombstone());
    }

    #[test]
    fn test_tombstone_detection() {
        let tx = Transaction::tombstone(5).unwrap();
        assert!(tx.is_tombstone());
        assert_eq!(tx.meta().unwrap()["deleted"], true);
    }

    #[test]
    fn test_private_is_never_a_tombstone() {
        let tx = Transaction::Private {
            made_at: 1,
            key_used: KeyId::parse("key_zK").unwrap(),
            encrypted_changes: Encrypted::parse("encrypted_Uabc").unwrap(),
            meta: Some("{\"deleted\":true}".to_string()),
        };
        assert!(!tx.is_tombstone());
        assert!(tx.trusting_changes().is_none());
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let tx = Transaction::trusting(1, &[], None).unwrap();
        let value = serde_json::to_value(&tx).unwrap();
        assert_eq!(value["privacy"], "trusting");
        assert_eq!(value["changes"], "[]");
        assert!(value.get("meta").is_none());
    }
}
