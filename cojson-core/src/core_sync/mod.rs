/*
    core_sync - Peer synchronization

    Nodes exchange known states and the content the other side lacks over
    ordered, reliable channels. Each connected peer gets a PeerEntry with a
    three-lane outgoing queue; the SyncManager dispatches incoming messages
    against the node through the SyncHost trait.

    Upload completion is tracked per (peer, CoValue), reconciliation batches
    per (peer, batch); both resolve their waiters exactly once, on success
    or when the peer closes.
*/

pub mod ack_tracker;
pub mod errors;
pub mod manager;
pub mod message;
pub mod peer;
pub mod peers;
pub mod priority_queue;
pub mod pull;
pub mod reconcile;
pub mod sync_state;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_host;

pub use ack_tracker::{AckOutcome, AckWaiter, StorageReconciliationAckTracker};
pub use errors::{SyncError, SyncResult};
pub use manager::{IngestOutcome, SyncHost, SyncManager};
pub use message::SyncMessage;
pub use peer::{PeerEntry, PeerId, PeerRole};
pub use peers::Peers;
pub use priority_queue::PriorityQueue;
pub use pull::PullRequestHandler;
pub use reconcile::{run_reconciliation, ReconcileReport};
pub use sync_state::{SyncStateEvent, SyncStateManager};
pub use transport::{connected_peers, default_priority, PeerConnection, CHANNEL_CAPACITY};
