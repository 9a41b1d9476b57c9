//! Global constants for StripeFS
//!
//! This module centralizes the wire-protocol and tuning constants shared by
//! the client and server so that both sides agree on the same limits.

/// Magic number validating a metadata record ("SFS1" little-endian).
///
/// A record whose magic does not match is treated as absent: the path is a
/// plain file on the backend with no stripefs-level metadata.
pub const MDATA_MAGIC: u32 = 0x3153_4653;

/// Maximum number of bytes moved by a single read/write data frame.
///
/// Larger transfers are chunked into frames of at most this size, each
/// preceded by a small size/status record so the receiver knows how many
/// bytes to expect.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

/// Number of path bytes carried inline in a request structure.
///
/// Paths longer than this send the remainder as one follow-up frame which
/// the server reads before resolving the path.
pub const PATH_INLINE_MAX: usize = 256;

/// Maximum total path length accepted on either side.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Maximum directory entry name length carried in a READDIR reply.
pub const NAME_MAX: usize = 256;

/// Total budget for establishing a connection before giving up.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Sleep between connection attempts inside the retry budget.
pub const CONNECT_RETRY_DELAY_MS: u64 = 250;

/// Standing receive buffers kept posted per peer class on the tag-matched
/// fabric so an unexpected inbound message is never dropped.
pub const FABRIC_STANDING_RECVS: usize = 2;

/// Control-channel codes spoken on a server's well-known control port.
///
/// These are separate from the per-request operation codes: the control port
/// only negotiates sessions and administrative queries.
pub mod control {
    /// Request a fresh data-port identity for a new session.
    pub const ACCEPT: u32 = 123;
    /// Query the data port used for connectionless one-shot requests.
    pub const CONNECTIONLESS_PORT: u32 = 124;
    /// Liveness probe; echoed back verbatim.
    pub const PING: u32 = 333;
    /// Query cumulative operation counters.
    pub const STATS: u32 = 444;
    /// Query operation counters since the previous STATS_WINDOW query.
    pub const STATS_WINDOW: u32 = 445;
    /// Graceful shutdown, fire-and-forget.
    pub const FINISH: u32 = 666;
    /// Graceful shutdown, blocks until the server acknowledges.
    pub const FINISH_AWAIT: u32 = 667;
}
