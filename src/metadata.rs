//! File metadata record
//!
//! A fixed-layout, magic-versioned descriptor stored on a file's master
//! server and read back by any client to recover the striping parameters.
//! The record is deliberately tiny: everything else about placement is
//! recomputed from the placement engine, never stored.

use zerocopy::little_endian::{I32, I64, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constants::MDATA_MAGIC;

/// Fixed-size metadata record, 20 bytes, little-endian.
///
/// Written by the server that creates a file and refreshed on
/// size-extending writes. Validated by magic on read: an absent or invalid
/// record means the path has no stripefs-level metadata (e.g. a plain local
/// file reached through a passthrough backend).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct MetadataRecord {
    pub magic: U32,
    pub file_size: I64,
    pub block_size: I32,
    pub replication_level: I32,
}

impl MetadataRecord {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(file_size: i64, block_size: i32, replication_level: i32) -> Self {
        Self {
            magic: U32::new(MDATA_MAGIC),
            file_size: I64::new(file_size),
            block_size: I32::new(block_size),
            replication_level: I32::new(replication_level),
        }
    }

    /// Whether the magic number marks this as a valid stripefs record.
    pub fn is_valid(&self) -> bool {
        self.magic.get() == MDATA_MAGIC
    }

    /// Decode from a byte buffer, returning `None` when the buffer is too
    /// short or the magic does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let record = Self::read_from_bytes(bytes.get(..Self::SIZE)?).ok()?;
        record.is_valid().then_some(record)
    }
}

/// Rotation seed for a path: a stable file property spreading successive
/// files' primary server across the fleet.
pub fn rotation_seed(path: &str, server_count: usize) -> usize {
    debug_assert!(server_count > 0);
    (xxhash_rust::xxh64::xxh64(path.as_bytes(), 0) % server_count as u64) as usize
}

/// Index of the server holding a file's metadata record.
///
/// By convention this is the rotation-seed server, so the record travels
/// with the file's primary stripe of block 0.
pub fn master_server(path: &str, server_count: usize) -> usize {
    rotation_seed(path, server_count)
}
