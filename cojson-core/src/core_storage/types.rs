//! Row and record types shared by every storage backend

use crate::core_covalue::{CoValueHeader, KnownState, RawCoId, SessionId};
use crate::core_crypto::Signature;
use crate::core_sync::PeerId;
use serde::{Deserialize, Serialize};

/// Backend-assigned row id
pub type RowId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct CoValueRow {
    pub row_id: RowId,
    pub id: RawCoId,
    pub header: CoValueHeader,
}

/// One session of a stored CoValue.
///
/// `last_idx` is the number of stored transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRow {
    pub row_id: RowId,
    pub co_value: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: u64,
}

/// Values written by `upsert_session`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub co_value: RowId,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: u64,
}

/// Soft-deletion progress of a CoValue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletedStatus {
    /// Tombstoned, content still present
    Pending,
    /// Content erased, tombstone kept
    Done,
}

impl DeletedStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            DeletedStatus::Pending => 0,
            DeletedStatus::Done => 1,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        if value == 0 {
            DeletedStatus::Pending
        } else {
            DeletedStatus::Done
        }
    }
}

/// Named lock used by storage reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub holder_session_id: String,
    pub acquired_at: u64,
    pub last_processed_offset: u64,
    pub released_at: Option<u64>,
}

impl LockRecord {
    pub fn is_held(&self) -> bool {
        self.released_at.is_none()
    }
}

/// Result of storing one piece of content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Content appended (possibly nothing new); the stored known state
    Stored(KnownState),
    /// Some sessions had gaps and were skipped; the stored known state
    NeedsCorrection(KnownState),
    /// Unknown CoValue and no header supplied
    MissingHeader(RawCoId),
}

/// Whether `peer` has everything of `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub id: RawCoId,
    pub peer: PeerId,
    pub synced: bool,
}
