//! Error types for peer synchronization

use super::peer::PeerId;
use crate::core_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The peer disconnected before the operation finished
    #[error("Peer {0} closed")]
    PeerClosed(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    /// The transport refused an outgoing message
    #[error("Failed to send to {peer}: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Another holder owns the reconciliation lock
    #[error("Reconciliation lock {0} is held elsewhere")]
    LockHeld(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::PeerClosed(PeerId::from("server"));
        assert_eq!(err.to_string(), "Peer server closed");

        let err = SyncError::SendFailed { peer: PeerId::from("a"), reason: "channel full".into() };
        assert_eq!(err.to_string(), "Failed to send to a: channel full");
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: SyncError = json_err.into();
        assert!(matches!(err, SyncError::Malformed(_)));
    }
}
