//! Per-operation fixed request/response structures
//!
//! These are the members of the tagged-union payload carried by an
//! [`super::Envelope`]. One structure per operation, `#[repr(C)]`, every
//! integer a little-endian `zerocopy` byte-order type, so the wire format is
//! fixed and explicit. The envelope capacity is the size of the largest
//! member.

use zerocopy::little_endian::{I32, I64, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::ProtoError;
use crate::constants::{MAX_PATH_LENGTH, NAME_MAX, PATH_INLINE_MAX};
use crate::metadata::MetadataRecord;

/// Path carried inside a fixed request structure.
///
/// Up to [`PATH_INLINE_MAX`] bytes travel inline; a longer path sends the
/// remainder as one follow-up frame which the server reads before resolving
/// the path. `len` is always the full path length.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PathField {
    pub len: U32,
    pub inline: [u8; PATH_INLINE_MAX],
}

impl PathField {
    pub fn pack(path: &str) -> Result<Self, ProtoError> {
        let bytes = path.as_bytes();
        if bytes.len() > MAX_PATH_LENGTH {
            return Err(ProtoError::PathTooLong(bytes.len()));
        }
        let mut inline = [0u8; PATH_INLINE_MAX];
        let head = bytes.len().min(PATH_INLINE_MAX);
        inline[..head].copy_from_slice(&bytes[..head]);
        Ok(Self {
            len: U32::new(bytes.len() as u32),
            inline,
        })
    }

    /// Bytes that did not fit inline and follow as a separate frame.
    pub fn overflow_len(&self) -> usize {
        (self.len.get() as usize).saturating_sub(PATH_INLINE_MAX)
    }

    /// Sender-side view of the overflow bytes for `path`.
    pub fn overflow_of(path: &str) -> &[u8] {
        let bytes = path.as_bytes();
        &bytes[bytes.len().min(PATH_INLINE_MAX)..]
    }

    /// Reassemble the full path from the inline part plus `overflow`.
    ///
    /// `overflow` must be exactly [`Self::overflow_len`] bytes (empty for
    /// short paths).
    pub fn resolve(&self, overflow: &[u8]) -> Result<String, ProtoError> {
        let total = self.len.get() as usize;
        if total > MAX_PATH_LENGTH {
            return Err(ProtoError::PathTooLong(total));
        }
        if overflow.len() != self.overflow_len() {
            return Err(ProtoError::BadPath);
        }
        let head = total.min(PATH_INLINE_MAX);
        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&self.inline[..head]);
        bytes.extend_from_slice(overflow);
        String::from_utf8(bytes).map_err(|_| ProtoError::BadPath)
    }
}

/// File attributes for GETATTR/SETATTR.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct FileAttr {
    /// 0 = none, 1 = regular file, 2 = directory.
    pub kind: U32,
    pub mode: U32,
    pub nlink: U32,
    pub _pad: U32,
    pub size: I64,
    pub mtime_secs: I64,
}

impl FileAttr {
    pub const KIND_NONE: u32 = 0;
    pub const KIND_FILE: u32 = 1;
    pub const KIND_DIR: u32 = 2;
}

/// Result of a remote operation: return value plus the errno raised on the
/// remote host. Callers adopt `remote_errno` as their own errno before
/// surfacing a failure, because the error happened on a different machine.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatusReply {
    pub ret: I64,
    pub remote_errno: I32,
    pub _pad: I32,
}

impl StatusReply {
    pub fn ok(ret: i64) -> Self {
        Self {
            ret: I64::new(ret),
            remote_errno: I32::new(0),
            _pad: I32::new(0),
        }
    }

    pub fn err(errno: i32) -> Self {
        Self {
            ret: I64::new(-1),
            remote_errno: I32::new(errno),
            _pad: I32::new(0),
        }
    }

    pub fn is_err(&self) -> bool {
        self.ret.get() < 0
    }
}

/// Size/status record preceding each read/write data frame.
///
/// A `size <= 0` record terminates the chunk loop: zero signals EOF, a
/// negative size signals the error carried in `ret`/`remote_errno`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RwChunkHeader {
    pub size: I64,
    pub ret: I32,
    pub remote_errno: I32,
}

impl RwChunkHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn data(size: i64) -> Self {
        Self {
            size: I64::new(size),
            ret: I32::new(0),
            remote_errno: I32::new(0),
        }
    }

    pub fn err(errno: i32) -> Self {
        Self {
            size: I64::new(-1),
            ret: I32::new(-1),
            remote_errno: I32::new(errno),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpenRequest {
    pub flags: I32,
    pub mode: U32,
    /// Non-zero when the caller wants a persistent remote descriptor.
    pub session: U32,
    pub _pad: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CreatRequest {
    pub flags: I32,
    pub mode: U32,
    pub session: U32,
    pub _pad: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadRequest {
    /// Remote descriptor when `session` is non-zero, ignored otherwise.
    pub fd: I64,
    pub offset: I64,
    pub size: I64,
    pub session: U32,
    pub _pad: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteRequest {
    pub fd: I64,
    pub offset: I64,
    pub size: I64,
    pub session: U32,
    pub _pad: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct CloseRequest {
    pub fd: I64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RemoveRequest {
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RenameRequest {
    pub old_path: PathField,
    pub new_path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct GetattrRequest {
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct SetattrRequest {
    pub attr: FileAttr,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MkdirRequest {
    pub mode: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct OpendirRequest {
    pub session: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReaddirRequest {
    /// Cursor returned by the previous READDIR reply (0 for the first call).
    pub cookie: I64,
    /// Remote directory handle when `session` is non-zero.
    pub dir_handle: I64,
    pub session: U32,
    pub _pad: U32,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ClosedirRequest {
    pub dir_handle: I64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RmdirRequest {
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatvfsRequest {
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ReadMdataRequest {
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteMdataRequest {
    pub mdata: MetadataRecord,
    pub path: PathField,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WriteMdataFileSizeRequest {
    pub size: I64,
    pub path: PathField,
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct AttrReply {
    pub status: StatusReply,
    pub attr: FileAttr,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct DirentReply {
    pub status: StatusReply,
    /// Non-zero when the directory stream is exhausted (no entry follows).
    pub eof: U32,
    pub name_len: U32,
    /// Cursor to pass back in the next READDIR request.
    pub cookie: I64,
    pub name: [u8; NAME_MAX],
}

impl DirentReply {
    pub fn end_of_stream(cookie: i64) -> Self {
        Self {
            status: StatusReply::ok(0),
            eof: U32::new(1),
            name_len: U32::new(0),
            cookie: I64::new(cookie),
            name: [0u8; NAME_MAX],
        }
    }

    pub fn entry(name: &str, cookie: i64) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_MAX);
        let mut buf = [0u8; NAME_MAX];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            status: StatusReply::ok(0),
            eof: U32::new(0),
            name_len: U32::new(len as u32),
            cookie: I64::new(cookie),
            name: buf,
        }
    }

    pub fn name_str(&self) -> Result<&str, ProtoError> {
        let len = (self.name_len.get() as usize).min(NAME_MAX);
        std::str::from_utf8(&self.name[..len]).map_err(|_| ProtoError::BadPath)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatvfsReply {
    pub status: StatusReply,
    pub bsize: U64,
    pub blocks: U64,
    pub bfree: U64,
    pub bavail: U64,
    pub files: U64,
    pub ffree: U64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MdataReply {
    pub status: StatusReply,
    pub mdata: MetadataRecord,
}

/// Number of distinct operation codes, sizing the stats counters.
pub const OP_COUNT: usize = 22;

/// Per-operation counters returned on the control channel for STATS and
/// STATS_WINDOW queries. Indexed by `OpCode as usize`.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct StatsSnapshot {
    pub ops: [U64; OP_COUNT],
}

impl StatsSnapshot {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn total(&self) -> u64 {
        self.ops.iter().map(|c| c.get()).sum()
    }
}

// ---------------------------------------------------------------------------
// Envelope sizing
// ---------------------------------------------------------------------------

const fn max(a: usize, b: usize) -> usize {
    if a > b { a } else { b }
}

/// Size of the largest fixed request/response structure: the capacity of the
/// envelope's inline payload buffer.
pub const ENVELOPE_CAPACITY: usize = {
    use std::mem::size_of;
    let mut cap = size_of::<OpenRequest>();
    cap = max(cap, size_of::<CreatRequest>());
    cap = max(cap, size_of::<ReadRequest>());
    cap = max(cap, size_of::<WriteRequest>());
    cap = max(cap, size_of::<CloseRequest>());
    cap = max(cap, size_of::<RemoveRequest>());
    cap = max(cap, size_of::<RenameRequest>());
    cap = max(cap, size_of::<GetattrRequest>());
    cap = max(cap, size_of::<SetattrRequest>());
    cap = max(cap, size_of::<MkdirRequest>());
    cap = max(cap, size_of::<OpendirRequest>());
    cap = max(cap, size_of::<ReaddirRequest>());
    cap = max(cap, size_of::<ClosedirRequest>());
    cap = max(cap, size_of::<RmdirRequest>());
    cap = max(cap, size_of::<StatvfsRequest>());
    cap = max(cap, size_of::<ReadMdataRequest>());
    cap = max(cap, size_of::<WriteMdataRequest>());
    cap = max(cap, size_of::<WriteMdataFileSizeRequest>());
    cap = max(cap, size_of::<StatusReply>());
    cap = max(cap, size_of::<AttrReply>());
    cap = max(cap, size_of::<DirentReply>());
    cap = max(cap, size_of::<StatvfsReply>());
    cap = max(cap, size_of::<MdataReply>());
    cap
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{Envelope, OpCode};

    #[test]
    fn test_capacity_covers_every_member() {
        // Two inline paths make RENAME the largest member.
        assert_eq!(ENVELOPE_CAPACITY, std::mem::size_of::<RenameRequest>());
        assert!(ENVELOPE_CAPACITY >= std::mem::size_of::<DirentReply>());
    }

    #[test]
    fn test_path_field_short_path() {
        let field = PathField::pack("/data/file.bin").unwrap();
        assert_eq!(field.overflow_len(), 0);
        assert_eq!(PathField::overflow_of("/data/file.bin"), b"");
        assert_eq!(field.resolve(b"").unwrap(), "/data/file.bin");
    }

    #[test]
    fn test_path_field_long_path_overflows() {
        let long: String = std::iter::once("/")
            .chain(std::iter::repeat("d").take(400))
            .collect();
        let field = PathField::pack(&long).unwrap();
        assert_eq!(field.overflow_len(), long.len() - PATH_INLINE_MAX);
        let overflow = PathField::overflow_of(&long);
        assert_eq!(overflow.len(), field.overflow_len());
        assert_eq!(field.resolve(overflow).unwrap(), long);
    }

    #[test]
    fn test_path_field_rejects_oversize() {
        let huge = "x".repeat(MAX_PATH_LENGTH + 1);
        assert!(PathField::pack(&huge).is_err());
    }

    #[test]
    fn test_path_field_rejects_mismatched_overflow() {
        let field = PathField::pack("/short").unwrap();
        assert!(field.resolve(b"extra").is_err());
    }

    #[test]
    fn test_envelope_round_trip_every_request() {
        let path = PathField::pack("/p").unwrap();
        let req = ReadRequest {
            fd: I64::new(7),
            offset: I64::new(4096),
            size: I64::new(65536),
            session: U32::new(1),
            _pad: U32::new(0),
            path,
        };
        let env = Envelope::new(OpCode::ReadFile, 42, &req);
        let decoded: ReadRequest = env.decode_payload().unwrap();
        assert_eq!(decoded.fd.get(), 7);
        assert_eq!(decoded.offset.get(), 4096);
        assert_eq!(decoded.size.get(), 65536);
        assert_eq!(decoded.session.get(), 1);
        assert_eq!(decoded.path.resolve(b"").unwrap(), "/p");

        let rename = RenameRequest {
            old_path: PathField::pack("/a").unwrap(),
            new_path: PathField::pack("/b").unwrap(),
        };
        let env = Envelope::new(OpCode::RenameFile, 1, &rename);
        let decoded: RenameRequest = env.decode_payload().unwrap();
        assert_eq!(decoded.old_path.resolve(b"").unwrap(), "/a");
        assert_eq!(decoded.new_path.resolve(b"").unwrap(), "/b");
    }

    #[test]
    fn test_dirent_reply_name() {
        let reply = DirentReply::entry("file-007.dat", 3);
        assert_eq!(reply.name_str().unwrap(), "file-007.dat");
        assert_eq!(reply.cookie.get(), 3);
        assert_eq!(reply.eof.get(), 0);

        let end = DirentReply::end_of_stream(9);
        assert_eq!(end.eof.get(), 1);
        assert_eq!(end.name_len.get(), 0);
    }

    #[test]
    fn test_rw_chunk_header_semantics() {
        let ok = RwChunkHeader::data(4096);
        assert_eq!(ok.size.get(), 4096);
        assert_eq!(ok.ret.get(), 0);

        let err = RwChunkHeader::err(2); // ENOENT
        assert!(err.size.get() < 0);
        assert_eq!(err.remote_errno.get(), 2);
    }
}
