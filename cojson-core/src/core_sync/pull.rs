//! Answering pulls
//!
//! A pull is answered by exactly one `data` message whatever happens on
//! the way: the content the puller lacks when we hold the CoValue, an
//! explicit unknown reply when we do not. Replies that need a load run in
//! their own task so the peer's reader keeps going.

use super::manager::SyncHost;
use super::message::SyncMessage;
use super::peer::PeerEntry;
use crate::core_covalue::{KnownState, LoadingState, RawCoId};
use std::sync::Arc;
use tracing::{debug, trace};

pub struct PullRequestHandler;

impl PullRequestHandler {
    pub fn handle<H: SyncHost>(host: &Arc<H>, peer: &Arc<PeerEntry>, known: KnownState) {
        peer.record_confirmed(&known);
        let id = known.id.clone();

        match host.loading_state(&id) {
            LoadingState::Available => Self::reply(host.as_ref(), peer, &id, &known),
            state => {
                // Loading: wait for it. Unknown: only chase peers if the puller has a header to give.
                let from = (state == LoadingState::Loading || known.header).then(|| peer.id().clone());
                trace!(peer = %peer.id(), id = %id, ?state, "Deferring pull reply until loaded");
                let (host, peer) = (host.clone(), peer.clone());
                tokio::spawn(async move {
                    host.load_for_peer(&id, from.as_ref()).await;
                    Self::reply(host.as_ref(), &peer, &id, &known);
                });
            }
        }
    }

    /// Send the single data reply for a pull of `id` from `peer`
    fn reply<H: SyncHost>(host: &H, peer: &PeerEntry, id: &RawCoId, theirs: &KnownState) {
        match host.content_since(id, Some(theirs)) {
            Some((content, ours)) => {
                peer.record_optimistic(&ours);
                peer.enqueue(SyncMessage::Data { known: ours, content });
            }
            None => {
                debug!(peer = %peer.id(), id = %id, "Pulled CoValue unavailable");
                peer.enqueue(SyncMessage::unknown(id.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_crypto::CryptoProvider;
    use crate::core_sync::peer::{PeerId, PeerRole};
    use crate::core_sync::test_host::FakeHost;
    use tokio::sync::mpsc;

    fn drained(peer: &Arc<PeerEntry>) -> (mpsc::Receiver<SyncMessage>, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        (rx, tokio::spawn(peer.clone().run_writer(tx)))
    }

    #[tokio::test]
    async fn test_available_replies_with_missing_content() {
        let host = FakeHost::new();
        let agent = host.crypto.new_agent_secret();
        let id = host.create(&agent, 4);
        let peer = Arc::new(PeerEntry::new(PeerId::from("c"), PeerRole::Client, 0));
        let (mut rx, writer) = drained(&peer);

        PullRequestHandler::handle(&host, &peer, KnownState::empty(id.clone()));

        match rx.recv().await.unwrap() {
            SyncMessage::Data { known, content } => {
                assert_eq!(known, host.known_state(&id).unwrap());
                assert!(content[0].header.is_some());
                assert_eq!(content.iter().map(|c| c.transaction_count()).sum::<usize>(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(peer.optimistic(&id), host.known_state(&id));
        peer.close();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_up_to_date_puller_gets_empty_data() {
        let host = FakeHost::new();
        let agent = host.crypto.new_agent_secret();
        let id = host.create(&agent, 2);
        let peer = Arc::new(PeerEntry::new(PeerId::from("c"), PeerRole::Client, 0));
        let (mut rx, writer) = drained(&peer);

        PullRequestHandler::handle(&host, &peer, host.known_state(&id).unwrap());

        match rx.recv().await.unwrap() {
            SyncMessage::Data { known, content } => {
                assert!(known.header);
                assert!(content.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        peer.close();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_without_header_replies_unknown() {
        let host = FakeHost::new();
        let peer = Arc::new(PeerEntry::new(PeerId::from("c"), PeerRole::Client, 0));
        let (mut rx, writer) = drained(&peer);
        let id = RawCoId::parse("co_zNeverSeen").unwrap();

        PullRequestHandler::handle(&host, &peer, KnownState::empty(id.clone()));

        assert_eq!(rx.recv().await.unwrap(), SyncMessage::unknown(id));
        peer.close();
        writer.await.unwrap();
    }
}
