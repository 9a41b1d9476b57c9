//! In-process reliable-datagram fabric
//!
//! Connects a set of ranks through bounded channels with the same
//! semantics the tag-matched discipline expects from a real provider:
//! FIFO per peer pair, no ordering across pairs, and a bounded pool of
//! posted receives per endpoint. Used for same-host deployments and for
//! exercising the dispatcher without hardware.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{posted_receive_depth, Completion, FabricError, RdmEndpoint};

/// Registry wiring loopback endpoints together by rank.
#[derive(Default)]
pub struct FabricHub {
    routes: Mutex<HashMap<u16, mpsc::Sender<Completion>>>,
}

impl FabricHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint for `rank` and the completion channel its drain
    /// loop will own. Registering the same rank twice replaces the route.
    pub async fn endpoint(
        self: &Arc<Self>,
        rank: u16,
    ) -> (LoopbackEndpoint, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel(posted_receive_depth());
        self.routes.lock().await.insert(rank, tx);
        (
            LoopbackEndpoint {
                hub: Arc::clone(self),
                rank,
            },
            rx,
        )
    }

    /// Drop a rank's route; in-flight messages already queued are kept.
    pub async fn detach(&self, rank: u16) {
        self.routes.lock().await.remove(&rank);
    }

    async fn route(&self, peer: u16, completion: Completion) -> Result<(), FabricError> {
        let tx = {
            let routes = self.routes.lock().await;
            routes.get(&peer).cloned()
        };
        let tx = tx.ok_or(FabricError::UnknownPeer(peer))?;
        // Bounded send models the peer's posted-receive pool: when every
        // standing receive is consumed, the sender waits rather than the
        // message being dropped.
        tx.send(completion)
            .await
            .map_err(|_| FabricError::UnknownPeer(peer))
    }
}

/// One rank's sending half on the loopback fabric.
pub struct LoopbackEndpoint {
    hub: Arc<FabricHub>,
    rank: u16,
}

#[async_trait]
impl RdmEndpoint for LoopbackEndpoint {
    async fn post_send(&self, peer: u16, tag: u64, payload: Bytes) -> Result<(), FabricError> {
        self.hub
            .route(
                peer,
                Completion {
                    tag,
                    peer: self.rank,
                    payload,
                },
            )
            .await
    }

    fn rank(&self) -> u16 {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{pack_tag, TagDispatcher};
    use crate::rpc::RequestIdAllocator;

    #[tokio::test]
    async fn test_request_reply_across_ranks() {
        let hub = FabricHub::new();
        let (client_ep, client_rx) = hub.endpoint(0).await;
        let (server_ep, mut server_rx) = hub.endpoint(1).await;

        let dispatcher = TagDispatcher::new();
        tokio::spawn(dispatcher.clone().run_drain(client_rx));

        // Echo server: one shared receive loop serving any peer, replying
        // on the request's own tag.
        tokio::spawn(async move {
            while let Some(msg) = server_rx.recv().await {
                let mut reply = msg.payload.to_vec();
                reply.reverse();
                server_ep
                    .post_send(msg.peer, msg.tag, Bytes::from(reply))
                    .await
                    .unwrap();
            }
        });

        let ids = RequestIdAllocator::new();
        let tag = pack_tag(client_ep.rank(), 1, ids.next() as u32);
        let pending = dispatcher.register(tag).await.unwrap();
        client_ep
            .post_send(1, tag, Bytes::from_static(b"ping"))
            .await
            .unwrap();
        let completion = pending.wait().await.unwrap();
        assert_eq!(completion.payload.as_ref(), b"gnip");
        assert_eq!(completion.peer, 1);
    }

    #[tokio::test]
    async fn test_concurrent_outstanding_requests_demux_by_tag() {
        let hub = FabricHub::new();
        let (client_ep, client_rx) = hub.endpoint(0).await;
        let (server_ep, mut server_rx) = hub.endpoint(1).await;
        let client_ep = Arc::new(client_ep);

        let dispatcher = TagDispatcher::new();
        tokio::spawn(dispatcher.clone().run_drain(client_rx));

        // Server replies in reverse order of arrival to force demuxing.
        tokio::spawn(async move {
            let mut batch = Vec::new();
            for _ in 0..4 {
                batch.push(server_rx.recv().await.unwrap());
            }
            for msg in batch.into_iter().rev() {
                server_ep
                    .post_send(msg.peer, msg.tag, msg.payload)
                    .await
                    .unwrap();
            }
        });

        let ids = RequestIdAllocator::new();
        let mut waits = Vec::new();
        for i in 0..4u8 {
            let tag = pack_tag(0, 1, ids.next() as u32);
            let pending = dispatcher.register(tag).await.unwrap();
            client_ep
                .post_send(1, tag, Bytes::from(vec![i]))
                .await
                .unwrap();
            waits.push((i, pending));
        }
        for (i, pending) in waits {
            assert_eq!(pending.wait().await.unwrap().payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_unknown_peer_is_an_error() {
        let hub = FabricHub::new();
        let (ep, _rx) = hub.endpoint(0).await;
        assert!(matches!(
            ep.post_send(99, 1, Bytes::new()).await,
            Err(FabricError::UnknownPeer(99))
        ));
    }
}
