//! Client RPC engine
//!
//! Session lifecycle and request execution against one storage server:
//! two-phase connection establishment through the control port, envelope
//! send plus blocking response receive, and the short-transfer loops that
//! keep partial reads/writes from corrupting the stream.

use thiserror::Error;

use crate::proto::ProtoError;

pub mod client;
pub mod stream;

pub use client::{control_request, control_stats, RequestIdAllocator, ServerSession};

/// RPC-layer error types.
///
/// Transport failures collapse to one local error value, but a remote errno
/// actually received from the peer is preserved higher up (see
/// `nfi::NfiError`), never synthesized here.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("connect to {addr} timed out after {budget_ms} ms")]
    ConnectTimeout { addr: String, budget_ms: u64 },

    #[error("peer closed mid-transfer after {transferred} of {requested} bytes")]
    ShortTransfer { transferred: usize, requested: usize },

    #[error("control handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },
}
