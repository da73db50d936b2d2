//! Message transport between nodes
//!
//! A `PeerConnection` is the node-facing end of any ordered, reliable,
//! bidirectional channel. `connected_peers` wires two nodes in-process; the
//! sync server bridges WebSocket frames onto the same shape.

use super::message::SyncMessage;
use super::peer::{PeerId, PeerRole};
use tokio::sync::mpsc;

/// Buffered messages per direction before senders wait
pub const CHANNEL_CAPACITY: usize = 1024;

/// One end of a connection, describing the remote side
#[derive(Debug)]
pub struct PeerConnection {
    pub id: PeerId,
    pub role: PeerRole,
    pub priority: i32,
    pub incoming: mpsc::Receiver<SyncMessage>,
    pub outgoing: mpsc::Sender<SyncMessage>,
}

impl PeerConnection {
    pub fn new(
        id: PeerId,
        role: PeerRole,
        incoming: mpsc::Receiver<SyncMessage>,
        outgoing: mpsc::Sender<SyncMessage>,
    ) -> Self {
        Self { id, role, priority: default_priority(role), incoming, outgoing }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Upstream peers are consulted first
pub fn default_priority(role: PeerRole) -> i32 {
    match role {
        PeerRole::Server => 100,
        PeerRole::Storage => 50,
        PeerRole::Client => 0,
    }
}

/// Connect two nodes in-process.
///
/// `a` names node A and how B sees it, `b` the reverse. The first returned
/// connection is added to node A (it describes B), the second to node B.
pub fn connected_peers(a: (PeerId, PeerRole), b: (PeerId, PeerRole)) -> (PeerConnection, PeerConnection) {
    let (to_b, from_a) = mpsc::channel(CHANNEL_CAPACITY);
    let (to_a, from_b) = mpsc::channel(CHANNEL_CAPACITY);

    let for_a = PeerConnection::new(b.0, b.1, from_b, to_b);
    let for_b = PeerConnection::new(a.0, a.1, from_a, to_a);
    (for_a, for_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connected_peers_cross_wired() {
        let (mut for_client, mut for_server) = connected_peers(
            (PeerId::from("client"), PeerRole::Client),
            (PeerId::from("server"), PeerRole::Server),
        );
        assert_eq!(for_client.id, PeerId::from("server"));
        assert_eq!(for_client.role, PeerRole::Server);
        assert_eq!(for_server.id, PeerId::from("client"));
        assert!(for_client.priority > for_server.priority);

        let ack = SyncMessage::Ack { batch_id: "b".into(), next_offset: 3 };
        for_client.outgoing.send(ack.clone()).await.unwrap();
        assert_eq!(for_server.incoming.recv().await.unwrap(), ack);

        drop(for_server);
        assert!(for_client.incoming.recv().await.is_none());
    }
}
