//! Tag-matched communication substrate
//!
//! Discipline for reliable-datagram transports that multiplex every peer
//! over one endpoint: each message carries a 64-bit composite tag packing
//! `(src_rank, dst_rank, request_id)`; one dedicated drain task owns the
//! completion channel, looks up the owning logical request by tag and wakes
//! exactly one waiter. Requests and replies share a tag, so a reply routes
//! back to its caller without any per-connection state.
//!
//! The concrete verbs of a real RDMA provider live behind the
//! [`RdmEndpoint`] trait; [`FabricHub`] wires loopback endpoints together
//! in-process with the same semantics (unordered delivery across peers,
//! FIFO per pair, bounded posted receives) for same-host deployments and
//! tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::constants::FABRIC_STANDING_RECVS;

mod loopback;

pub use loopback::{FabricHub, LoopbackEndpoint};

/// Peer classes for posted-receive sizing: messages from the local host
/// take a fast path separate from cross-host traffic.
pub const PEER_CLASSES: usize = 2;

/// Pack `(src_rank, dst_rank, request_id)` into a composite tag.
///
/// `src_rank` is the sender's rank as seen by the peer, so a request and
/// its reply carry the same tag and never two outstanding requests between
/// one peer pair share a tag (request ids are allocated monotonically per
/// endpoint).
pub fn pack_tag(src_rank: u16, dst_rank: u16, request_id: u32) -> u64 {
    ((src_rank as u64) << 48) | ((dst_rank as u64) << 32) | request_id as u64
}

/// Inverse of [`pack_tag`].
pub fn unpack_tag(tag: u64) -> (u16, u16, u32) {
    ((tag >> 48) as u16, (tag >> 32) as u16, tag as u32)
}

/// One completed receive drained from the completion channel.
#[derive(Debug, Clone)]
pub struct Completion {
    pub tag: u64,
    pub peer: u16,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("no route to peer rank {0}")]
    UnknownPeer(u16),

    #[error("correlation tag {0:#x} already has a pending request")]
    TagInUse(u64),

    #[error("completion channel closed")]
    ChannelClosed,

    #[error("pending request cancelled before completion")]
    Cancelled,
}

/// Reliable-datagram endpoint: post one tagged message toward a peer.
///
/// Implementations only need `send(bytes)` semantics; matching on the
/// receive side is the dispatcher's job.
#[async_trait]
pub trait RdmEndpoint: Send + Sync {
    async fn post_send(&self, peer: u16, tag: u64, payload: Bytes) -> Result<(), FabricError>;

    /// This endpoint's rank as seen by its peers.
    fn rank(&self) -> u16;
}

/// Demultiplexer for concurrent outstanding requests on one endpoint.
///
/// Invariants: a tag has at most one pending slot at a time; each
/// completion wakes exactly one waiter; completions that arrive before
/// their waiter registers are parked in the unexpected queue (bounded in
/// practice by the standing receives kept posted per peer class).
pub struct TagDispatcher {
    pending: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
    unexpected: Mutex<VecDeque<Completion>>,
    /// Completions delivered but not yet claimed; lets callers observe
    /// whether draining is keeping up without polling the queues.
    unclaimed: AtomicUsize,
}

impl TagDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            unexpected: Mutex::new(VecDeque::new()),
            unclaimed: AtomicUsize::new(0),
        })
    }

    /// Register interest in `tag` before posting the request.
    ///
    /// Registration must precede the send: a reply on an unregistered tag
    /// lands in the unexpected queue, which `register` checks first so the
    /// race resolves either way.
    pub async fn register(&self, tag: u64) -> Result<PendingRequest, FabricError> {
        // Early completion may already be parked.
        {
            let mut unexpected = self.unexpected.lock().await;
            if let Some(pos) = unexpected.iter().position(|c| c.tag == tag) {
                let completion = unexpected.remove(pos).ok_or(FabricError::ChannelClosed)?;
                self.unclaimed.fetch_sub(1, Ordering::Release);
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(completion);
                return Ok(PendingRequest { rx });
            }
        }

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&tag) {
            return Err(FabricError::TagInUse(tag));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(tag, tx);
        Ok(PendingRequest { rx })
    }

    /// Completions delivered by the drain loop but not yet claimed by a
    /// waiter.
    pub fn unclaimed(&self) -> usize {
        self.unclaimed.load(Ordering::Acquire)
    }

    /// Deliver one completion: wake the owning waiter, or park the message
    /// if nothing is registered for its tag yet.
    async fn deliver(&self, completion: Completion) {
        let waiter = self.pending.lock().await.remove(&completion.tag);
        match waiter {
            Some(tx) => {
                // A dropped receiver means the caller gave up; the message
                // is discarded with a trace, matching datagram semantics.
                if tx.send(completion).is_err() {
                    tracing::trace!("waiter vanished before completion delivery");
                }
            }
            None => {
                tracing::trace!(tag = completion.tag, "unexpected completion parked");
                self.unclaimed.fetch_add(1, Ordering::Release);
                self.unexpected.lock().await.push_back(completion);
            }
        }
    }

    /// Drain loop: the single dedicated task that owns the completion
    /// channel. Blocks on the channel (no spinning when nothing is
    /// outstanding) and re-arms itself after each delivery.
    pub async fn run_drain(self: Arc<Self>, mut completions: mpsc::Receiver<Completion>) {
        while let Some(completion) = completions.recv().await {
            self.deliver(completion).await;
        }
        tracing::debug!("completion channel closed, drain loop exiting");
    }
}

/// A request posted to the fabric, waiting for its tagged reply.
pub struct PendingRequest {
    rx: oneshot::Receiver<Completion>,
}

impl PendingRequest {
    pub async fn wait(self) -> Result<Completion, FabricError> {
        self.rx.await.map_err(|_| FabricError::Cancelled)
    }
}

/// Capacity of an endpoint's completion channel: the posted-receive pool.
///
/// Two standing receives per peer class, so an unexpected inbound message
/// is never dropped while the local side is busy sending.
pub fn posted_receive_depth() -> usize {
    FABRIC_STANDING_RECVS * PEER_CLASSES
}
