//! Error types for node operations

use crate::core_covalue::{CoValueError, RawCoId};
use crate::core_crypto::CryptoError;
use crate::core_group::PermissionError;
use crate::core_storage::StorageError;
use crate::core_sync::SyncError;
use thiserror::Error;

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    CoValue(#[from] CoValueError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Neither storage nor any peer could provide the CoValue
    #[error("CoValue {0} is unavailable")]
    Unavailable(RawCoId),

    #[error("CoValue {0} is deleted")]
    Deleted(RawCoId),

    #[error("{0} is not a group")]
    NotAGroup(RawCoId),

    /// The stored account belongs to a different agent
    #[error("Account {0} is not controlled by this agent")]
    AccountMismatch(RawCoId),

    #[error("Node is shutting down")]
    ShuttingDown,
}

impl NodeError {
    /// The permission failure behind this error, however it was wrapped
    pub fn permission(&self) -> Option<&PermissionError> {
        match self {
            NodeError::Permission(err) | NodeError::CoValue(CoValueError::Permission(err)) => Some(err),
            _ => None,
        }
    }
}

/// Result of a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Available,
    /// Available, but tombstoned by an admin
    Deleted,
    Unavailable,
}

impl LoadOutcome {
    pub fn is_available(&self) -> bool {
        !matches!(self, LoadOutcome::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_through_covalue_error() {
        let err = NodeError::from(CoValueError::from(PermissionError::OnlyAdminsCanDelete));
        assert_eq!(err.permission(), Some(&PermissionError::OnlyAdminsCanDelete));
        assert_eq!(err.to_string(), "Only admins can delete coValues");

        let id = RawCoId::parse("co_zX").unwrap();
        assert!(NodeError::Unavailable(id).permission().is_none());
    }
}
