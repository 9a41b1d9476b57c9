//! Data-placement engine
//!
//! Pure, deterministic mapping between logical file offsets and
//! `(server, in-server offset)` pairs, honoring block striping and
//! replication. Client and server compute the same mapping independently,
//! without coordination, so there is no placement metadata to keep in sync.
//!
//! # Scheme
//!
//! Let `stripe = offset / block_size`, `n = server_count`,
//! `w = replication_level + 1` and `row = stripe / n`. Replica `r` of a
//! stripe lands on
//!
//! ```text
//! server(r) = (rotation_seed + stripe + r) mod n
//! local(r)  = (row * w + r) * block_size + offset mod block_size
//! ```
//!
//! Within one row every server is primary for exactly one stripe, so primary
//! load is balanced for every rotation seed, and on a given server the pair
//! `(row, r)` identifies a storage slot uniquely, so replicas never collide.
//! The mapping is invertible per replica index (see [`unplace`]).

/// One replica's placement for a logical offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementEntry {
    /// Index into the partition's ordered server list.
    pub server_index: usize,
    /// Which copy this is, `0` being the primary.
    pub replica_index: usize,
    /// Byte offset inside the file fragment stored on that server.
    pub in_server_offset: i64,
}

/// Map a logical offset to one placement entry per replica.
///
/// Returns `replication_level + 1` entries, primary first.
///
/// # Panics
///
/// Panics if `block_size == 0`, `server_count == 0` or
/// `replication_level >= server_count` (replicas of one stripe must land on
/// distinct servers). These are precondition violations, not runtime
/// failures: the partition config is validated at load time.
pub fn place(
    offset: i64,
    block_size: i64,
    replication_level: usize,
    server_count: usize,
    rotation_seed: usize,
) -> Vec<PlacementEntry> {
    assert!(block_size > 0, "block_size must be positive");
    assert!(server_count > 0, "server_count must be positive");
    assert!(
        replication_level < server_count,
        "replication_level must be below server_count"
    );
    assert!(offset >= 0, "offset must be non-negative");

    let n = server_count as i64;
    let width = replication_level as i64 + 1;
    let stripe = offset / block_size;
    let row = stripe / n;
    let in_block = offset % block_size;

    (0..=replication_level)
        .map(|r| PlacementEntry {
            server_index: ((rotation_seed as i64 + stripe + r as i64) % n) as usize,
            replica_index: r,
            in_server_offset: (row * width + r as i64) * block_size + in_block,
        })
        .collect()
}

/// Left inverse of [`place`] for a given replica index.
///
/// Returns the logical offset whose replica `replica_index` lives at
/// `(server_index, in_server_offset)`, or `None` if that slot is not a
/// `replica_index` slot under the scheme (e.g. asking for the primary offset
/// of a secondary-copy slot).
pub fn unplace(
    server_index: usize,
    in_server_offset: i64,
    replica_index: usize,
    block_size: i64,
    replication_level: usize,
    server_count: usize,
    rotation_seed: usize,
) -> Option<i64> {
    assert!(block_size > 0, "block_size must be positive");
    assert!(server_count > 0, "server_count must be positive");
    assert!(
        replication_level < server_count,
        "replication_level must be below server_count"
    );

    let n = server_count as i64;
    let width = replication_level as i64 + 1;
    let local_block = in_server_offset / block_size;
    let in_block = in_server_offset % block_size;

    if local_block % width != replica_index as i64 {
        return None;
    }
    let row = local_block / width;

    // stripe mod n recovered from the server index.
    let shifted = server_index as i64 - rotation_seed as i64 - replica_index as i64;
    let stripe_mod = shifted.rem_euclid(n);
    let stripe = row * n + stripe_mod;

    Some(stripe * block_size + in_block)
}

/// One contiguous segment of a logical byte range that falls inside a single
/// block, produced by [`StripeWalker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSegment {
    /// Logical offset of the segment start.
    pub offset: i64,
    /// Segment length; never crosses a block boundary.
    pub len: usize,
    /// Offset of this segment within the caller's buffer.
    pub buf_offset: usize,
}

/// Splits a `(offset, len)` byte range into block-aligned segments.
///
/// The read/write paths place each segment independently; a segment never
/// spans two blocks so it maps to exactly one server per replica.
pub struct StripeWalker {
    offset: i64,
    remaining: usize,
    buf_offset: usize,
    block_size: i64,
}

impl StripeWalker {
    pub fn new(offset: i64, len: usize, block_size: i64) -> Self {
        assert!(block_size > 0, "block_size must be positive");
        assert!(offset >= 0, "offset must be non-negative");
        Self {
            offset,
            remaining: len,
            buf_offset: 0,
            block_size,
        }
    }
}

impl Iterator for StripeWalker {
    type Item = StripeSegment;

    fn next(&mut self) -> Option<StripeSegment> {
        if self.remaining == 0 {
            return None;
        }
        let in_block = self.offset % self.block_size;
        let to_block_end = (self.block_size - in_block) as usize;
        let len = self.remaining.min(to_block_end);
        let seg = StripeSegment {
            offset: self.offset,
            len,
            buf_offset: self.buf_offset,
        };
        self.offset += len as i64;
        self.buf_offset += len;
        self.remaining -= len;
        Some(seg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_place_primary_round_robin() {
        // replication 0: plain RAID-0 striping
        let bs = 1024;
        for stripe in 0..12 {
            let entries = place(stripe * bs, bs, 0, 3, 0);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].server_index, (stripe % 3) as usize);
            assert_eq!(entries[0].in_server_offset, (stripe / 3) * bs);
        }
    }

    #[test]
    fn test_place_replicas_distinct_servers() {
        let bs = 4096;
        for seed in 0..5 {
            for stripe in 0..40 {
                let entries = place(stripe * bs + 17, bs, 2, 5, seed);
                assert_eq!(entries.len(), 3);
                let servers: HashSet<_> = entries.iter().map(|e| e.server_index).collect();
                assert_eq!(servers.len(), 3, "replicas collided for stripe {stripe}");
                // all replicas carry the same in-block offset
                for e in &entries {
                    assert_eq!(e.in_server_offset % bs, 17);
                }
            }
        }
    }

    #[test]
    fn test_place_no_storage_slot_collision() {
        // No two (stripe, replica) pairs may share a (server, local block).
        let bs = 512;
        let mut used = HashSet::new();
        for stripe in 0..60 {
            for e in place(stripe * bs, bs, 1, 4, 2) {
                let slot = (e.server_index, e.in_server_offset / bs);
                assert!(used.insert(slot), "slot reused: {slot:?}");
            }
        }
    }

    #[test]
    fn test_unplace_inverts_place() {
        let bs = 1024;
        for seed in 0..4 {
            for offset in (0..50 * bs).step_by(333) {
                for (rl, n) in [(0usize, 3usize), (1, 4), (2, 5)] {
                    for e in place(offset, bs, rl, n, seed) {
                        let back = unplace(
                            e.server_index,
                            e.in_server_offset,
                            e.replica_index,
                            bs,
                            rl,
                            n,
                            seed,
                        );
                        assert_eq!(back, Some(offset));
                    }
                }
            }
        }
    }

    #[test]
    fn test_unplace_inverts_place_random_offsets() {
        use rand::{Rng, SeedableRng};

        let mut rng = rand::rngs::StdRng::seed_from_u64(0xc0ffee);
        for _ in 0..2000 {
            let bs = [512i64, 4096, 65536][rng.gen_range(0..3)];
            let n = rng.gen_range(1..=8usize);
            let rl = rng.gen_range(0..n);
            let seed = rng.gen_range(0..n);
            let offset = rng.gen_range(0i64..(1i64 << 40));
            for e in place(offset, bs, rl, n, seed) {
                let back = unplace(
                    e.server_index,
                    e.in_server_offset,
                    e.replica_index,
                    bs,
                    rl,
                    n,
                    seed,
                );
                assert_eq!(back, Some(offset));
            }
        }
    }

    #[test]
    fn test_unplace_rejects_wrong_replica_slot() {
        let bs = 1024;
        let entries = place(0, bs, 1, 4, 0);
        let secondary = entries[1];
        // A secondary slot is not a primary slot.
        assert_eq!(
            unplace(secondary.server_index, secondary.in_server_offset, 0, bs, 1, 4, 0),
            None
        );
    }

    #[test]
    fn test_primary_balance() {
        // Over full rows, each server is primary exactly stripes/n times.
        let bs = 1024;
        let n = 7;
        let stripes = 7 * 11;
        for seed in 0..n {
            let mut counts = vec![0usize; n];
            for stripe in 0..stripes {
                let e = place(stripe as i64 * bs, bs, 1, n, seed);
                counts[e[0].server_index] += 1;
            }
            for c in &counts {
                assert_eq!(*c, stripes / n);
            }
        }
    }

    #[test]
    fn test_stripe_walker_splits_on_block_boundaries() {
        let segs: Vec<_> = StripeWalker::new(1000, 3000, 1024).collect();
        assert_eq!(segs.len(), 4);
        assert_eq!(segs[0], StripeSegment { offset: 1000, len: 24, buf_offset: 0 });
        assert_eq!(segs[1], StripeSegment { offset: 1024, len: 1024, buf_offset: 24 });
        assert_eq!(segs[2], StripeSegment { offset: 2048, len: 1024, buf_offset: 1048 });
        assert_eq!(segs[3], StripeSegment { offset: 3072, len: 928, buf_offset: 2072 });
        assert_eq!(segs.iter().map(|s| s.len).sum::<usize>(), 3000);
    }

    #[test]
    fn test_stripe_walker_empty_range() {
        assert_eq!(StripeWalker::new(512, 0, 1024).count(), 0);
    }

    #[test]
    #[should_panic(expected = "block_size must be positive")]
    fn test_place_rejects_zero_block_size() {
        place(0, 0, 0, 3, 0);
    }
}
