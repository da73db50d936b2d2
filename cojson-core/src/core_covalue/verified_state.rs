/*
    verified_state.rs - The verified in-memory replica of one CoValue

    Owns the header and one SessionLog per session. Every append goes
    through signature verification unless the caller explicitly trusts the
    source (local storage).
*/

use super::content::{normalize_authoritative_session_content, NewContent, SessionChunk};
use super::errors::{CoValueError, CoValueResult};
use super::header::CoValueHeader;
use super::ids::{RawCoId, SessionId, TransactionId};
use super::known_state::KnownState;
use super::session_log::{FullSessionContent, SessionLog};
use super::transaction::Transaction;
use crate::core_crypto::{CryptoProvider, Signature, SignerId, SignerSecret};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct VerifiedState {
    id: RawCoId,
    header: CoValueHeader,
    sessions: BTreeMap<SessionId, SessionLog>,
    max_bytes_per_signature: usize,
}

impl VerifiedState {
    /// Start from a header, checking it hashes to `id`
    pub fn new(id: RawCoId, header: CoValueHeader, max_bytes_per_signature: usize) -> CoValueResult<Self> {
        header.verify_id(&id)?;
        Ok(Self { id, header, sessions: BTreeMap::new(), max_bytes_per_signature })
    }

    pub fn id(&self) -> &RawCoId {
        &self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    pub fn sessions(&self) -> &BTreeMap<SessionId, SessionLog> {
        &self.sessions
    }

    pub fn session(&self, session_id: &SessionId) -> Option<&SessionLog> {
        self.sessions.get(session_id)
    }

    pub fn known_state(&self) -> KnownState {
        KnownState {
            id: self.id.clone(),
            header: true,
            sessions: self.sessions.iter().map(|(id, log)| (id.clone(), log.len())).collect(),
        }
    }

    /// Verify and append a run of transactions to `session_id`.
    ///
    /// With `skip_verify` the signer is not consulted (content from our own
    /// storage). Returns how many transactions were new.
    #[allow(clippy::too_many_arguments)]
    pub fn try_add_transactions(
        &mut self,
        crypto: &dyn CryptoProvider,
        session_id: &SessionId,
        signer: Option<&SignerId>,
        after: u32,
        transactions: Vec<Transaction>,
        signature: Signature,
        skip_verify: bool,
    ) -> CoValueResult<usize> {
        let signer = if skip_verify {
            None
        } else {
            Some(signer.ok_or_else(|| CoValueError::UnknownSigner(session_id.clone()))?)
        };

        let max_bytes = self.max_bytes_per_signature;
        let id = self.id.clone();
        let log = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(session_id.clone()));
        let result = log.try_add(crypto, &id, signer, after, transactions, signature, max_bytes);

        if log.is_empty() {
            self.sessions.remove(session_id);
        }
        result
    }

    /// Sign and append one local transaction
    pub fn make_transaction(
        &mut self,
        crypto: &dyn CryptoProvider,
        session_id: &SessionId,
        signer_secret: &SignerSecret,
        transaction: Transaction,
    ) -> CoValueResult<Signature> {
        let max_bytes = self.max_bytes_per_signature;
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(session_id.clone()))
            .add_own(crypto, signer_secret, transaction, max_bytes)
    }

    pub fn get_full_session_content(&self, session_id: &SessionId) -> Option<FullSessionContent<'_>> {
        self.sessions.get(session_id).map(|log| log.full_content())
    }

    /// Import complete session content from an authoritative source.
    ///
    /// Chunks are normalized first; each one is then verified in order.
    pub fn import_authoritative_session(
        &mut self,
        crypto: &dyn CryptoProvider,
        session_id: &SessionId,
        signer: &SignerId,
        chunks: Vec<SessionChunk>,
    ) -> CoValueResult<usize> {
        let normalized = normalize_authoritative_session_content(chunks)?;
        let mut added = 0;
        for chunk in normalized.chunks {
            added += self.try_add_transactions(
                crypto,
                session_id,
                Some(signer),
                chunk.after,
                chunk.new_transactions,
                chunk.last_signature,
                false,
            )?;
        }
        Ok(added)
    }

    /// Content the holder of `known` is missing, split at checkpoints.
    ///
    /// The first piece carries the header when `known` lacks it. Returns an
    /// empty list when there is nothing to send.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Vec<NewContent> {
        let priority = self.header.priority();
        let mut pieces: Vec<NewContent> = Vec::new();

        for (session_id, log) in &self.sessions {
            let start = known.map_or(0, |k| k.session_count(session_id));
            if start >= log.len() {
                continue;
            }
            for (i, chunk) in log.chunks_from(start).enumerate() {
                while pieces.len() <= i {
                    pieces.push(NewContent::empty(self.id.clone(), priority));
                }
                pieces[i].new.insert(session_id.clone(), chunk);
            }
        }

        if !known.is_some_and(|k| k.header) {
            if pieces.is_empty() {
                pieces.push(NewContent::empty(self.id.clone(), priority));
            }
            pieces[0].header = Some(self.header.clone());
        }
        pieces
    }

    /// All transactions ordered by `(made_at, session, index)`
    pub fn transactions_in_order(&self) -> Vec<(TransactionId, &Transaction)> {
        let mut all: Vec<(TransactionId, &Transaction)> = self
            .sessions
            .iter()
            .flat_map(|(session_id, log)| {
                log.transactions()
                    .iter()
                    .enumerate()
                    .map(move |(idx, tx)| (TransactionId::new(session_id.clone(), idx as u32), tx))
            })
            .collect();
        all.sort_by(|(a_id, a_tx), (b_id, b_tx)| {
            a_tx.made_at().cmp(&b_tx.made_at()).then_with(|| a_id.cmp(b_id))
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_covalue::header::{CoValueType, Ruleset};
    use crate::core_covalue::ids::SessionOwner;
    use crate::core_covalue::session_log::DEFAULT_MAX_BYTES_PER_SIGNATURE;
    use crate::core_crypto::{AgentSecret, PureCrypto};
    use serde_json::json;

    fn setup() -> (PureCrypto, AgentSecret, SessionId, VerifiedState) {
        let crypto = PureCrypto::new();
        let agent = crypto.new_agent_secret();
        let owner = SessionOwner::Agent(crypto.agent_id(&agent).unwrap());
        let session = SessionId::new(&owner, "one");
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("u"));
        let state = VerifiedState::new(header.id().unwrap(), header, 200).unwrap();
        (crypto, agent, session, state)
    }

    fn tx(i: u64) -> Transaction {
        Transaction::trusting(i, &[json!({"op": "set", "key": i.to_string(), "value": "v".repeat(30)})], None)
            .unwrap()
    }

    #[test]
    fn test_rejects_mismatched_header() {
        let header = CoValueHeader::new(CoValueType::CoMap, Ruleset::UnsafeAllowAll, json!("u"));
        let wrong = RawCoId::parse("co_zNotIt").unwrap();
        assert!(matches!(
            VerifiedState::new(wrong, header, DEFAULT_MAX_BYTES_PER_SIGNATURE),
            Err(CoValueError::HeaderMismatch(_))
        ));
    }

    #[test]
    fn test_new_content_since_converges() {
        let (crypto, agent, session, mut source) = setup();
        for i in 0..8 {
            source.make_transaction(&crypto, &session, agent.signer_secret(), tx(i)).unwrap();
        }
        let signer = crypto.agent_id(&agent).unwrap().signer_id();

        let pieces = source.new_content_since(None);
        assert!(pieces.len() > 1);
        assert!(pieces[0].header.is_some());
        assert!(pieces[1..].iter().all(|p| p.header.is_none()));

        let header = pieces[0].header.clone().unwrap();
        let mut target = VerifiedState::new(source.id().clone(), header, 200).unwrap();
        for piece in pieces {
            for (sid, chunk) in piece.new {
                target
                    .try_add_transactions(
                        &crypto,
                        &sid,
                        Some(&signer),
                        chunk.after,
                        chunk.new_transactions,
                        chunk.last_signature,
                        false,
                    )
                    .unwrap();
            }
        }
        assert_eq!(target.known_state(), source.known_state());
        assert!(source.new_content_since(Some(&target.known_state())).is_empty());
    }

    #[test]
    fn test_new_content_since_header_only() {
        let (_, _, _, state) = setup();
        let pieces = state.new_content_since(None);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].header.is_some());
        assert!(pieces[0].new.is_empty());
    }

    #[test]
    fn test_unknown_signer_without_skip() {
        let (crypto, agent, session, mut state) = setup();
        let mut other = state.clone();
        let sig = other.make_transaction(&crypto, &session, agent.signer_secret(), tx(0)).unwrap();
        let result = state.try_add_transactions(&crypto, &session, None, 0, vec![tx(0)], sig, false);
        assert!(matches!(result, Err(CoValueError::UnknownSigner(_))));
        assert!(state.sessions().is_empty());
    }

    #[test]
    fn test_skip_verify_trusts_content() {
        let (crypto, agent, session, mut state) = setup();
        let mut other = state.clone();
        let sig = other.make_transaction(&crypto, &session, agent.signer_secret(), tx(0)).unwrap();
        let added = state.try_add_transactions(&crypto, &session, None, 0, vec![tx(0)], sig, true).unwrap();
        assert_eq!(added, 1);
    }

    #[test]
    fn test_import_authoritative_session_out_of_order() {
        let (crypto, agent, session, mut source) = setup();
        for i in 0..6 {
            source.make_transaction(&crypto, &session, agent.signer_secret(), tx(i)).unwrap();
        }
        let mut chunks: Vec<_> = source.get_full_session_content(&session).unwrap().collect();
        chunks.reverse();

        let mut target =
            VerifiedState::new(source.id().clone(), source.header().clone(), 200).unwrap();
        let signer = crypto.agent_id(&agent).unwrap().signer_id();
        let added = target.import_authoritative_session(&crypto, &session, &signer, chunks).unwrap();
        assert_eq!(added, 6);
        assert_eq!(target.known_state(), source.known_state());
    }

    #[test]
    fn test_transactions_in_order_sorted_by_made_at() {
        let (crypto, agent, session, mut state) = setup();
        for i in [5u64, 1, 3] {
            state.make_transaction(&crypto, &session, agent.signer_secret(), tx(i)).unwrap();
        }
        let order: Vec<u64> = state.transactions_in_order().iter().map(|(_, tx)| tx.made_at()).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }
}
