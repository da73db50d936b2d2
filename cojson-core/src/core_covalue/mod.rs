/*
    core_covalue - The replicated object

    A CoValue is a content-addressed header plus one signed, append-only
    log per session. This module holds the data model, verification of
    incoming runs, checkpointed chunking for sync, authoritative-content
    normalization and the registry entry the node keeps per CoValue.
*/

pub mod content;
pub mod core;
pub mod errors;
pub mod header;
pub mod ids;
pub mod known_state;
pub mod session_log;
pub mod transaction;
pub mod verified_state;

pub use content::{
    normalize_authoritative_session_content, NewContent, NormalizedSessionContent, SessionChunk,
};
pub use core::{CoValueCore, LoadingState, SourceLoadState};
pub use errors::{CoValueError, CoValueResult, NormalizationError};
pub use header::{CoValueHeader, CoValuePriority, CoValueType, Ruleset};
pub use ids::{RawCoId, SessionId, SessionOwner, TransactionId};
pub use known_state::KnownState;
pub use session_log::{FullSessionContent, SessionLog, DEFAULT_MAX_BYTES_PER_SIGNATURE};
pub use transaction::{now_millis, Transaction};
pub use verified_state::VerifiedState;
