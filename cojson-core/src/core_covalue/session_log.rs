/*
    session_log.rs - One signer's append-only log

    Holds the transactions, the running hash, the latest signature and the
    signature checkpoints (`signature_after`). A checkpoint is recorded at
    the end of a run once more than `max_bytes_per_signature` bytes have been
    appended since the previous one, so content can be streamed and verified
    in bounded pieces.
*/

use super::content::SessionChunk;
use super::errors::{CoValueError, CoValueResult};
use super::ids::{RawCoId, SessionId};
use super::transaction::Transaction;
use crate::core_crypto::{CryptoProvider, SessionHasher, Signature, SignerId, SignerSecret};
use std::collections::BTreeMap;

/// Default checkpoint cadence in bytes
pub const DEFAULT_MAX_BYTES_PER_SIGNATURE: usize = 100 * 1024;

#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionId,
    transactions: Vec<Transaction>,
    last_signature: Option<Signature>,
    signature_after: BTreeMap<u32, Signature>,
    bytes_since_last_signature: usize,
    hasher: SessionHasher,
}

impl SessionLog {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            transactions: Vec::new(),
            last_signature: None,
            signature_after: BTreeMap::new(),
            bytes_since_last_signature: 0,
            hasher: SessionHasher::new(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    pub fn signature_after(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    pub fn bytes_since_last_signature(&self) -> usize {
        self.bytes_since_last_signature
    }

    /// Append a signed run of transactions starting at `after`.
    ///
    /// Transactions the log already holds are skipped; a run that would leave
    /// a gap is rejected. The running hash is advanced over the whole new
    /// suffix and the single trailing signature checked once. Nothing is
    /// committed unless verification succeeds.
    #[allow(clippy::too_many_arguments)]
    pub fn try_add(
        &mut self,
        crypto: &dyn CryptoProvider,
        co_id: &RawCoId,
        signer: Option<&SignerId>,
        after: u32,
        mut transactions: Vec<Transaction>,
        signature: Signature,
        max_bytes_per_signature: usize,
    ) -> CoValueResult<usize> {
        let len = self.len();
        if after > len {
            return Err(CoValueError::NonContiguous {
                session: self.session_id.clone(),
                expected: len,
                after,
            });
        }
        let end = after + transactions.len() as u32;
        if end <= len {
            return Ok(0);
        }
        transactions.drain(..(len - after) as usize);

        let mut candidate = self.hasher.clone();
        let mut added_bytes = 0usize;
        for tx in &transactions {
            let bytes = tx.to_bytes()?;
            added_bytes += bytes.len();
            candidate.update(&bytes);
        }

        if let Some(signer) = signer {
            let hash = candidate.current();
            if !crypto.verify(signer, hash.as_str().as_bytes(), &signature)? {
                return Err(CoValueError::InvalidSignature {
                    id: co_id.clone(),
                    session: self.session_id.clone(),
                });
            }
        }

        let added = transactions.len();
        self.hasher = candidate;
        self.transactions.extend(transactions);
        self.record_signature(signature, added_bytes, max_bytes_per_signature);
        Ok(added)
    }

    /// Append one locally made transaction, signing the new session hash
    pub fn add_own(
        &mut self,
        crypto: &dyn CryptoProvider,
        signer_secret: &SignerSecret,
        transaction: Transaction,
        max_bytes_per_signature: usize,
    ) -> CoValueResult<Signature> {
        let bytes = transaction.to_bytes()?;
        let mut candidate = self.hasher.clone();
        candidate.update(&bytes);
        let signature = crypto.sign(signer_secret, candidate.current().as_str().as_bytes())?;

        self.hasher = candidate;
        self.transactions.push(transaction);
        self.record_signature(signature.clone(), bytes.len(), max_bytes_per_signature);
        Ok(signature)
    }

    fn record_signature(&mut self, signature: Signature, added_bytes: usize, max_bytes_per_signature: usize) {
        self.bytes_since_last_signature += added_bytes;
        if self.bytes_since_last_signature > max_bytes_per_signature {
            self.signature_after.insert(self.len() - 1, signature.clone());
            self.bytes_since_last_signature = 0;
        }
        self.last_signature = Some(signature);
    }

    /// Every transaction, chunked at checkpoints
    pub fn full_content(&self) -> FullSessionContent<'_> {
        self.chunks_from(0)
    }

    /// Transactions from index `start` on, chunked at checkpoints
    pub fn chunks_from(&self, start: u32) -> FullSessionContent<'_> {
        FullSessionContent { log: self, next: start }
    }
}

/// Lazy chunk sequence over a session.
///
/// Boundaries come from the `signature_after` map alone, so creating a new
/// iterator always yields the same chunks.
#[derive(Debug, Clone)]
pub struct FullSessionContent<'a> {
    log: &'a SessionLog,
    next: u32,
}

impl Iterator for FullSessionContent<'_> {
    type Item = SessionChunk;

    fn next(&mut self) -> Option<SessionChunk> {
        let len = self.log.len();
        if self.next >= len {
            return None;
        }

        let (end, last_signature) = match self.log.signature_after.range(self.next..).next() {
            Some((idx, signature)) => (idx + 1, signature.clone()),
            None => (len, self.log.last_signature.clone()?),
        };

        let chunk = SessionChunk {
            after: self.next,
            new_transactions: self.log.transactions[self.next as usize..end as usize].to_vec(),
            last_signature,
        };
        self.next = end;
        Some(chunk)
    }
}
