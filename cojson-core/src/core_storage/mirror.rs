/*
    mirror.rs - Backend-independent storage algorithms

    Written once against the row traits so every backend shares the exact
    same semantics:

    - store_new_content: append chunks by contiguous index, keep the
      checkpoint map and detect gaps
    - load_co_value: rebuild NewContent pieces split at stored checkpoints
    - erase_all_deleted: drop content of tombstoned CoValues
    - reconciliation locks: acquire / advance / release
*/

use super::client::{DbReader, DbTransaction};
use super::errors::{StorageError, StorageResult};
use super::types::{DeletedStatus, LockRecord, RowId, SessionUpdate, StoreOutcome};
use crate::core_covalue::{KnownState, NewContent, RawCoId, SessionChunk, Transaction};
use tracing::{debug, warn};

/// A held lock older than this can be taken over
pub const LOCK_STALE_AFTER_MS: u64 = 5 * 60 * 1000;

pub fn known_state_of<R: DbReader + ?Sized>(reader: &R, id: &RawCoId) -> StorageResult<Option<KnownState>> {
    match reader.get_co_value(id)? {
        Some(row) => Ok(Some(known_state_for_row(reader, id, row.row_id)?)),
        None => Ok(None),
    }
}

fn known_state_for_row<R: DbReader + ?Sized>(reader: &R, id: &RawCoId, row: RowId) -> StorageResult<KnownState> {
    let mut known = KnownState::empty(id.clone());
    known.header = true;
    for session in reader.get_co_value_sessions(row)? {
        known.set_session(session.session_id, session.last_idx);
    }
    Ok(known)
}

/// Stored content of `id`, split at checkpoints; the first piece carries the header
pub fn load_co_value<R: DbReader + ?Sized>(reader: &R, id: &RawCoId) -> StorageResult<Option<Vec<NewContent>>> {
    let Some(row) = reader.get_co_value(id)? else {
        return Ok(None);
    };
    let priority = row.header.priority();
    let mut pieces = vec![NewContent::empty(id.clone(), priority)];
    pieces[0].header = Some(row.header);

    for session in reader.get_co_value_sessions(row.row_id)? {
        if session.last_idx == 0 {
            continue;
        }
        let mut transactions = reader
            .get_new_transactions_in_session(session.row_id, 0, session.last_idx)?
            .into_iter();
        if transactions.len() as u32 != session.last_idx {
            return Err(StorageError::CorruptedData(format!(
                "session {} has {} transactions, expected {}",
                session.session_id,
                transactions.len(),
                session.last_idx
            )));
        }

        let mut boundaries: Vec<(u32, _)> = reader
            .get_signatures(session.row_id, 0)?
            .into_iter()
            .filter(|(idx, _)| idx + 1 < session.last_idx)
            .map(|(idx, sig)| (idx + 1, sig))
            .collect();
        boundaries.push((session.last_idx, session.last_signature.clone()));

        let mut after = 0;
        for (i, (end, signature)) in boundaries.into_iter().enumerate() {
            let chunk = SessionChunk {
                after,
                new_transactions: transactions.by_ref().take((end - after) as usize).collect(),
                last_signature: signature,
            };
            after = end;
            while pieces.len() <= i {
                pieces.push(NewContent::empty(id.clone(), priority));
            }
            pieces[i].new.insert(session.session_id.clone(), chunk);
        }
    }
    Ok(Some(pieces))
}

fn tx_len(tx: &Transaction) -> StorageResult<u64> {
    tx.to_bytes()
        .map(|bytes| bytes.len() as u64)
        .map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Append `content` to the mirror.
///
/// Sessions are only extended at their current end; a chunk starting past
/// it is skipped and reported through `NeedsCorrection`.
pub fn store_new_content<T: DbTransaction + ?Sized>(
    tx: &mut T,
    content: &NewContent,
    max_bytes_per_signature: usize,
) -> StorageResult<StoreOutcome> {
    let id = &content.id;
    let row = match (tx.get_co_value(id)?, &content.header) {
        (Some(row), _) => row.row_id,
        (None, Some(header)) => tx.upsert_co_value(id, header)?,
        (None, None) => return Ok(StoreOutcome::MissingHeader(id.clone())),
    };

    let mut deleted = tx.get_deleted_status(id)?;
    let mut has_gaps = false;

    for (session_id, chunk) in &content.new {
        if deleted == Some(DeletedStatus::Done) && !session_id.is_deleted_session() {
            continue;
        }

        let existing = tx.get_single_co_value_session(row, session_id)?;
        let stored = existing.as_ref().map_or(0, |s| s.last_idx);
        if chunk.after > stored {
            warn!(id = %id, session = %session_id, stored, after = chunk.after, "Gap in stored session");
            has_gaps = true;
            continue;
        }
        if chunk.end() <= stored {
            continue;
        }

        let new_transactions = &chunk.new_transactions[(stored - chunk.after) as usize..];
        let mut bytes = existing.as_ref().map_or(0, |s| s.bytes_since_last_signature);
        for transaction in new_transactions {
            bytes += tx_len(transaction)?;
        }
        let checkpoint = bytes > max_bytes_per_signature as u64;
        let last_idx = chunk.end();

        let session_row = tx.upsert_session(&SessionUpdate {
            co_value: row,
            session_id: session_id.clone(),
            last_idx,
            last_signature: chunk.last_signature.clone(),
            bytes_since_last_signature: if checkpoint { 0 } else { bytes },
        })?;
        for (offset, transaction) in new_transactions.iter().enumerate() {
            tx.add_transaction(session_row, stored + offset as u32, transaction)?;
        }
        if checkpoint {
            tx.add_signature_after(session_row, last_idx - 1, &chunk.last_signature)?;
        }

        if deleted.is_none() && session_id.is_deleted_session() && new_transactions.iter().any(Transaction::is_tombstone)
        {
            debug!(id = %id, "Tombstone stored, marking as deleted");
            tx.mark_deleted(id, DeletedStatus::Pending)?;
            deleted = Some(DeletedStatus::Pending);
        }
    }

    let known = known_state_for_row(&*tx, id, row)?;
    Ok(if has_gaps {
        StoreOutcome::NeedsCorrection(known)
    } else {
        StoreOutcome::Stored(known)
    })
}

/// Erase content of every pending delete; returns the erased ids
pub fn erase_all_deleted<T: DbTransaction + ?Sized>(tx: &mut T) -> StorageResult<Vec<RawCoId>> {
    let pending = tx.get_all_pending_deletes()?;
    for id in &pending {
        tx.erase_co_value_keep_tombstone(id)?;
        tx.mark_deleted(id, DeletedStatus::Done)?;
    }
    Ok(pending)
}

/// Take `key` for `holder`, resuming at the last processed offset.
///
/// Returns `None` while another holder has a fresh lock.
pub fn try_acquire_lock<T: DbTransaction + ?Sized>(
    tx: &mut T,
    key: &str,
    holder: &str,
    now: u64,
) -> StorageResult<Option<LockRecord>> {
    let existing = tx.get_lock(key)?;
    if let Some(lock) = &existing {
        let stale = now.saturating_sub(lock.acquired_at) > LOCK_STALE_AFTER_MS;
        if lock.is_held() && lock.holder_session_id != holder && !stale {
            return Ok(None);
        }
    }

    let lock = LockRecord {
        key: key.to_string(),
        holder_session_id: holder.to_string(),
        acquired_at: now,
        last_processed_offset: existing.map_or(0, |l| l.last_processed_offset),
        released_at: None,
    };
    tx.put_lock(&lock)?;
    Ok(Some(lock))
}

/// Record progress; also refreshes the lock. False if `holder` lost it
pub fn update_lock_offset<T: DbTransaction + ?Sized>(
    tx: &mut T,
    key: &str,
    holder: &str,
    offset: u64,
    now: u64,
) -> StorageResult<bool> {
    match tx.get_lock(key)? {
        Some(mut lock) if lock.is_held() && lock.holder_session_id == holder => {
            lock.last_processed_offset = offset;
            lock.acquired_at = now;
            tx.put_lock(&lock)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Release `key`; a completed run starts from zero next time
pub fn release_lock<T: DbTransaction + ?Sized>(
    tx: &mut T,
    key: &str,
    holder: &str,
    completed: bool,
    now: u64,
) -> StorageResult<bool> {
    match tx.get_lock(key)? {
        Some(mut lock) if lock.is_held() && lock.holder_session_id == holder => {
            if completed {
                lock.last_processed_offset = 0;
            }
            lock.released_at = Some(now);
            tx.put_lock(&lock)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}
