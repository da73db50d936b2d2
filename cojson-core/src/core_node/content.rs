//! Reading CoValue content
//!
//! Only transactions the ruleset accepts are returned, in
//! `(made_at, session, index)` order. Private transactions whose read key
//! we cannot reach are skipped.

use super::errors::{NodeError, NodeResult};
use super::node::{LocalNode, NodeInner};
use super::transaction::Privacy;
use crate::core_covalue::{RawCoId, Transaction, TransactionId};
use crate::core_crypto::{KeyId, KeySecret};
use crate::core_group::{determine_valid_transactions, read_key_secret, KeyAccess};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionId,
    pub made_at: u64,
    pub privacy: Privacy,
    pub changes: Vec<JsonValue>,
    pub meta: Option<JsonValue>,
}

impl NodeInner {
    pub(crate) fn decrypt_valid(&self, id: &RawCoId) -> NodeResult<Vec<DecryptedTransaction>> {
        let registry = self.registry();
        let state = registry.verified(id).ok_or_else(|| NodeError::Unavailable(id.clone()))?;
        let group = registry.owning_group(state.header());
        let member = group.as_ref().map(|g| self.member_in(g.id()));

        let mut keys: HashMap<KeyId, Option<KeySecret>> = HashMap::new();
        let mut out = Vec::new();
        for valid in determine_valid_transactions(state, group.as_ref()) {
            let tx = valid.tx;
            let (privacy, changes) = match tx {
                Transaction::Trusting { .. } => match tx.trusting_changes() {
                    Some(Ok(changes)) => (Privacy::Trusting, changes),
                    _ => {
                        debug!(id = %id, tx = ?valid.tx_id, "Unreadable trusting changes");
                        continue;
                    }
                },
                Transaction::Private { key_used, encrypted_changes, .. } => {
                    let (Some(group), Some(member)) = (&group, &member) else { continue };
                    let secret = keys.entry(key_used.clone()).or_insert_with(|| {
                        let access = KeyAccess {
                            crypto: self.crypto.as_ref(),
                            resolver: &*registry,
                            member,
                            secret: &self.agent_secret,
                        };
                        read_key_secret(group, key_used, &access)
                    });
                    let Some(secret) = secret else {
                        debug!(id = %id, key = %key_used, "No access to read key");
                        continue;
                    };
                    let decoded = self
                        .crypto
                        .decrypt(encrypted_changes, secret, &valid.tx_id.nonce_material(id))
                        .ok()
                        .and_then(|bytes| serde_json::from_slice::<Vec<JsonValue>>(&bytes).ok());
                    match decoded {
                        Some(changes) => (Privacy::Private, changes),
                        None => {
                            debug!(id = %id, tx = ?valid.tx_id, "Cannot decrypt transaction");
                            continue;
                        }
                    }
                }
            };
            out.push(DecryptedTransaction {
                tx_id: valid.tx_id.clone(),
                made_at: tx.made_at(),
                privacy,
                changes,
                meta: tx.meta(),
            });
        }
        Ok(out)
    }
}

impl LocalNode {
    /// Readable changes of `id`, loading it first if needed
    pub async fn decrypted_changes(&self, id: &RawCoId) -> NodeResult<Vec<DecryptedTransaction>> {
        if !self.load(id).await.is_available() {
            return Err(NodeError::Unavailable(id.clone()));
        }
        self.inner.decrypt_valid(id)
    }
}
