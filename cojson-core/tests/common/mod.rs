#![allow(dead_code)]

use cojson_core::core_sync::{connected_peers, PeerConnection, PeerId, PeerRole};
use cojson_core::{Config, LocalNode};
use std::future::Future;
use std::time::Duration;

pub fn node() -> LocalNode {
    LocalNode::with_new_account(Config::default()).unwrap()
}

/// Attach `client` to `server` as a client of a sync server
pub fn connect(client: &LocalNode, client_name: &str, server: &LocalNode, server_name: &str) {
    let (for_client, for_server) = connected_peers(
        (PeerId::from(client_name), PeerRole::Client),
        (PeerId::from(server_name), PeerRole::Server),
    );
    client.add_peer(for_client);
    server.add_peer(for_server);
}

/// Attach `client` to a server that never answers.
///
/// The returned end must be kept alive, or the client sees it close.
pub fn connect_silent(client: &LocalNode, server_name: &str) -> PeerConnection {
    let (for_client, for_server) = connected_peers(
        (PeerId::from("silent-client"), PeerRole::Client),
        (PeerId::from(server_name), PeerRole::Server),
    );
    client.add_peer(for_client);
    for_server
}

/// Poll `check` until it holds, failing after a few seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
