/*
    errors.rs - Error types for the CoValue subsystem

    Defines:
    - CoValueError: rejected content, bad ids, signature failures
    - NormalizationError: dedicated error for authoritative chunk import
*/

use super::ids::{RawCoId, SessionId};
use crate::core_crypto::CryptoError;
use crate::core_group::PermissionError;
use thiserror::Error;

/// Errors raised while verifying, appending or interpreting CoValue content
#[derive(Debug, Error)]
pub enum CoValueError {
    /// Signature does not cover the submitted transactions
    #[error("Invalid signature for session {session} of {id}")]
    InvalidSignature { id: RawCoId, session: SessionId },

    /// Header hash does not match the id it was sent under
    #[error("Header does not match id {0}")]
    HeaderMismatch(RawCoId),

    /// Malformed id string
    #[error("Invalid id: {0}")]
    InvalidId(String),

    /// New transactions do not continue the session
    #[error("Transactions for session {session} must continue at {expected}, got {after}")]
    NonContiguous { session: SessionId, expected: u32, after: u32 },

    /// The signer of a session could not be determined
    #[error("Unknown signer for session {0}")]
    UnknownSigner(SessionId),

    /// Authoritative content failed validation
    #[error(transparent)]
    Normalization(#[from] NormalizationError),

    /// Mutation refused by the owning group
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// Operation on a deleted CoValue
    #[error("CoValue {0} is deleted")]
    Deleted(RawCoId),

    /// Content is not available locally
    #[error("CoValue {0} is not available")]
    NotAvailable(RawCoId),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoValueError {
    fn from(err: serde_json::Error) -> Self {
        CoValueError::Serialization(err.to_string())
    }
}

/// Result type for CoValue operations
pub type CoValueResult<T> = Result<T, CoValueError>;

/// Rejections from `normalize_authoritative_session_content`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("No chunks to normalize")]
    NoChunks,

    #[error("Chunk after {after} contains no transactions")]
    EmptyChunk { after: u32 },

    #[error("Session content is not contiguous: expected chunk after {expected}, found {found}")]
    Discontinuity { expected: u32, found: u32 },
}
