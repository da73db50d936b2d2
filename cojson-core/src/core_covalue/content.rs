/*
    content.rs - Content pieces exchanged between replicas

    - SessionChunk: a signed run of transactions `{after, new_transactions, last_signature}`
    - NewContent: per-CoValue bundle of chunks, optionally carrying the header
    - normalize_authoritative_session_content: pure validation of a set of
      chunks for one session (recovery import, fuzzing)
*/

use super::errors::NormalizationError;
use super::header::{CoValueHeader, CoValuePriority};
use super::ids::{RawCoId, SessionId};
use super::transaction::Transaction;
use crate::core_crypto::Signature;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A contiguous run of transactions covered by one signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionChunk {
    /// Number of transactions in the session before this chunk
    pub after: u32,
    pub new_transactions: Vec<Transaction>,
    /// Signature over the session hash after the last transaction of the chunk
    pub last_signature: Signature,
}

impl SessionChunk {
    /// Index one past the last transaction of the chunk
    pub fn end(&self) -> u32 {
        self.after + self.new_transactions.len() as u32
    }
}

/// New content for one CoValue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewContent {
    pub id: RawCoId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<CoValueHeader>,
    pub priority: CoValuePriority,
    #[serde(default)]
    pub new: BTreeMap<SessionId, SessionChunk>,
}

impl NewContent {
    pub fn empty(id: RawCoId, priority: CoValuePriority) -> Self {
        Self { id, header: None, priority, new: BTreeMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.is_empty()
    }

    pub fn transaction_count(&self) -> usize {
        self.new.values().map(|c| c.new_transactions.len()).sum()
    }
}

/// Canonical form of one session's authoritative content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSessionContent {
    pub chunks: Vec<SessionChunk>,
    pub transactions: Vec<Transaction>,
    pub last_signature: Signature,
}

/// Sort, deduplicate and validate chunks of one session.
///
/// Chunks must tile the session from index 0 with no gaps or overlaps.
/// Exact duplicates are dropped; any other overlap is a discontinuity.
pub fn normalize_authoritative_session_content(
    mut chunks: Vec<SessionChunk>,
) -> Result<NormalizedSessionContent, NormalizationError> {
    if chunks.is_empty() {
        return Err(NormalizationError::NoChunks);
    }
    if let Some(empty) = chunks.iter().find(|c| c.new_transactions.is_empty()) {
        return Err(NormalizationError::EmptyChunk { after: empty.after });
    }

    chunks.sort_by_key(|c| c.after);
    chunks.dedup();

    let mut expected = 0u32;
    for chunk in &chunks {
        if chunk.after != expected {
            return Err(NormalizationError::Discontinuity { expected, found: chunk.after });
        }
        expected = chunk.end();
    }

    let transactions = chunks
        .iter()
        .flat_map(|c| c.new_transactions.iter().cloned())
        .collect();
    // Non-empty after the checks above
    let last_signature = match chunks.last() {
        Some(last) => last.last_signature.clone(),
        None => return Err(NormalizationError::NoChunks),
    };

    Ok(NormalizedSessionContent { chunks, transactions, last_signature })
}
