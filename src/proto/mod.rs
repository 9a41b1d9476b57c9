//! Wire envelope and protocol definitions
//!
//! Every message on a data connection starts with a fixed 16-byte header
//! `{op, payload_len, tag}` followed by `payload_len` bytes drawn from the
//! per-operation request/response structures in [`messages`]. The envelope
//! owns an inline buffer sized to the largest structure, so the hot path
//! never allocates for headers; bulk read/write data travels in follow-up
//! length-prefixed frames (see [`messages::RwChunkHeader`]).
//!
//! All integer fields are explicitly little-endian via `zerocopy`
//! byte-order types; nothing relies on host memory layout.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub mod messages;

pub use messages::ENVELOPE_CAPACITY;

/// Fixed envelope header size on the wire.
pub const HEADER_SIZE: usize = 16;

/// Operation codes: the stable wire contract between client and server.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    OpenFile = 0,
    CreatFile = 1,
    ReadFile = 2,
    WriteFile = 3,
    CloseFile = 4,
    RmFile = 5,
    RmFileAsync = 6,
    RenameFile = 7,
    GetattrFile = 8,
    SetattrFile = 9,
    MkdirDir = 10,
    OpendirDir = 11,
    ReaddirDir = 12,
    ClosedirDir = 13,
    RmdirDir = 14,
    RmdirDirAsync = 15,
    StatvfsDir = 16,
    ReadMdata = 17,
    WriteMdata = 18,
    WriteMdataFileSize = 19,
    Disconnect = 20,
    Finalize = 21,
}

impl OpCode {
    pub fn from_u16(value: u16) -> Result<Self, ProtoError> {
        use OpCode::*;
        Ok(match value {
            0 => OpenFile,
            1 => CreatFile,
            2 => ReadFile,
            3 => WriteFile,
            4 => CloseFile,
            5 => RmFile,
            6 => RmFileAsync,
            7 => RenameFile,
            8 => GetattrFile,
            9 => SetattrFile,
            10 => MkdirDir,
            11 => OpendirDir,
            12 => ReaddirDir,
            13 => ClosedirDir,
            14 => RmdirDir,
            15 => RmdirDirAsync,
            16 => StatvfsDir,
            17 => ReadMdata,
            18 => WriteMdata,
            19 => WriteMdataFileSize,
            20 => Disconnect,
            21 => Finalize,
            other => return Err(ProtoError::BadOpCode(other)),
        })
    }

    /// Fire-and-forget operations: the client does not wait for a response
    /// envelope and the server does not send one.
    pub fn is_async(self) -> bool {
        matches!(self, OpCode::RmFileAsync | OpCode::RmdirDirAsync)
    }
}

/// Protocol-level errors. These are never swallowed: a malformed envelope
/// fails the operation that carried it.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("unknown operation code {0}")]
    BadOpCode(u16),

    #[error("declared payload length {len} exceeds envelope capacity {capacity}")]
    Oversize { len: usize, capacity: usize },

    #[error("payload of {len} bytes too short for {expected}-byte structure")]
    ShortPayload { len: usize, expected: usize },

    #[error("path of {0} bytes exceeds maximum path length")]
    PathTooLong(usize),

    #[error("path is not valid UTF-8")]
    BadPath,
}

/// Fixed-capacity wire envelope.
///
/// `payload_len <= ENVELOPE_CAPACITY` is an invariant checked on both encode
/// and decode; a peer declaring a larger payload is rejected before any
/// buffer is touched.
pub struct Envelope {
    pub op: OpCode,
    pub tag: u64,
    len: u32,
    payload: [u8; ENVELOPE_CAPACITY],
}

impl Envelope {
    /// Build an envelope carrying `body` as its fixed payload.
    pub fn new<T: IntoBytes + Immutable>(op: OpCode, tag: u64, body: &T) -> Self {
        let bytes = body.as_bytes();
        // Request/response structures are sized into the capacity by
        // construction; see messages::ENVELOPE_CAPACITY.
        debug_assert!(bytes.len() <= ENVELOPE_CAPACITY);
        let mut payload = [0u8; ENVELOPE_CAPACITY];
        payload[..bytes.len()].copy_from_slice(bytes);
        Self {
            op,
            tag,
            len: bytes.len() as u32,
            payload,
        }
    }

    /// Empty-payload envelope (DISCONNECT, FINALIZE).
    pub fn control(op: OpCode, tag: u64) -> Self {
        Self {
            op,
            tag,
            len: 0,
            payload: [0u8; ENVELOPE_CAPACITY],
        }
    }

    /// Envelope shell awaiting `len` payload bytes from the wire.
    pub fn for_receive(op: OpCode, tag: u64, len: u32) -> Result<Self, ProtoError> {
        if len as usize > ENVELOPE_CAPACITY {
            return Err(ProtoError::Oversize {
                len: len as usize,
                capacity: ENVELOPE_CAPACITY,
            });
        }
        Ok(Self {
            op,
            tag,
            len,
            payload: [0u8; ENVELOPE_CAPACITY],
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let len = self.len as usize;
        &mut self.payload[..len]
    }

    /// Decode the payload as a fixed wire structure.
    pub fn decode_payload<T: FromBytes>(&self) -> Result<T, ProtoError> {
        let expected = std::mem::size_of::<T>();
        let payload = self.payload();
        if payload.len() < expected {
            return Err(ProtoError::ShortPayload {
                len: payload.len(),
                expected,
            });
        }
        T::read_from_bytes(&payload[..expected]).map_err(|_| ProtoError::ShortPayload {
            len: payload.len(),
            expected,
        })
    }

    /// Encode the fixed header: op u16, pad u16, len u32, tag u64, all LE.
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&(self.op as u16).to_le_bytes());
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tag.to_le_bytes());
        buf
    }

    /// Parse a fixed header into `(op, payload_len, tag)`.
    ///
    /// Rejects unknown op codes and over-capacity payload lengths.
    pub fn parse_header(buf: &[u8; HEADER_SIZE]) -> Result<(OpCode, u32, u64), ProtoError> {
        let op = OpCode::from_u16(u16::from_le_bytes([buf[0], buf[1]]))?;
        let len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if len as usize > ENVELOPE_CAPACITY {
            return Err(ProtoError::Oversize {
                len: len as usize,
                capacity: ENVELOPE_CAPACITY,
            });
        }
        let tag = u64::from_le_bytes([
            buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
        ]);
        Ok((op, len, tag))
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("op", &self.op)
            .field("tag", &self.tag)
            .field("len", &self.len)
            .finish()
    }
}
