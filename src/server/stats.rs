//! Per-operation server counters
//!
//! Two banks of counters: cumulative since startup (STATS) and a window
//! bank that resets on every STATS_WINDOW query, so an external prober can
//! sample throughput without tracking deltas itself.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::proto::messages::{StatsSnapshot, OP_COUNT};
use crate::proto::OpCode;

#[derive(Debug)]
pub struct ServerStats {
    total: [AtomicU64; OP_COUNT],
    window: [AtomicU64; OP_COUNT],
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            total: std::array::from_fn(|_| AtomicU64::new(0)),
            window: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn record(&self, op: OpCode) {
        let idx = op as usize;
        self.total[idx].fetch_add(1, Ordering::Relaxed);
        self.window[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_total(&self) -> StatsSnapshot {
        StatsSnapshot {
            ops: std::array::from_fn(|i| self.total[i].load(Ordering::Relaxed).into()),
        }
    }

    /// Counters since the previous window query; resets the window bank.
    pub fn snapshot_window(&self) -> StatsSnapshot {
        StatsSnapshot {
            ops: std::array::from_fn(|i| self.window[i].swap(0, Ordering::Relaxed).into()),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_resets_total_accumulates() {
        let stats = ServerStats::new();
        stats.record(OpCode::ReadFile);
        stats.record(OpCode::ReadFile);
        stats.record(OpCode::WriteFile);

        let window = stats.snapshot_window();
        assert_eq!(window.ops[OpCode::ReadFile as usize].get(), 2);
        assert_eq!(window.total(), 3);

        stats.record(OpCode::ReadFile);
        let window = stats.snapshot_window();
        assert_eq!(window.total(), 1);

        let total = stats.snapshot_total();
        assert_eq!(total.ops[OpCode::ReadFile as usize].get(), 3);
        assert_eq!(total.total(), 4);
    }
}
