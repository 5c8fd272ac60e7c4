//! Lookup counters.
//!
//! Every index lookup on the dispatch path bumps exactly one of sixteen
//! counters, selected by four flags: write, hit, on-buffer and full-size.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of distinct lookup counters.
pub const STAT_SLOTS: usize = 16;

/// Classification of one index lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatFlags {
    pub write: bool,
    pub hit: bool,
    pub on_buffer: bool,
    pub fullsize: bool,
}

impl StatFlags {
    /// Counter slot: bit 0 write, bit 1 hit, bit 2 on-buffer, bit 3 full-size.
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.write)
            | usize::from(self.hit) << 1
            | usize::from(self.on_buffer) << 2
            | usize::from(self.fullsize) << 3
    }

    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self {
            write: index & 1 != 0,
            hit: index & 2 != 0,
            on_buffer: index & 4 != 0,
            fullsize: index & 8 != 0,
        }
    }
}

/// Pad a counter to 64 bytes so hot counters bumped from different cores do
/// not share a cache line.
#[repr(C, align(64))]
#[derive(Default)]
struct CacheLinePadded<T>(T);

/// Lock-free lookup counters plus the non-full flush count.
pub(crate) struct CacheStats {
    lookups: [CacheLinePadded<AtomicU64>; STAT_SLOTS],
    non_full_flushed: CacheLinePadded<AtomicU64>,
}

impl CacheStats {
    pub(crate) fn new() -> Self {
        Self {
            lookups: std::array::from_fn(|_| CacheLinePadded(AtomicU64::new(0))),
            non_full_flushed: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    pub(crate) fn record(&self, flags: StatFlags) {
        self.lookups[flags.index()].0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_non_full_flush(&self) {
        self.non_full_flushed.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn clear(&self) {
        for counter in &self.lookups {
            counter.0.store(0, Ordering::Relaxed);
        }
        self.non_full_flushed.0.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            lookups: std::array::from_fn(|i| self.lookups[i].0.load(Ordering::Relaxed)),
            non_full_flushed: self.non_full_flushed.0.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.snapshot().fmt(f)
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub lookups: [u64; STAT_SLOTS],
    pub non_full_flushed: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn get(&self, flags: StatFlags) -> u64 {
        self.lookups[flags.index()]
    }

    /// Sum of the counters matching `filter`.
    #[must_use]
    pub fn sum_where(&self, filter: impl Fn(StatFlags) -> bool) -> u64 {
        (0..STAT_SLOTS)
            .filter(|i| filter(StatFlags::from_index(*i)))
            .map(|i| self.lookups[i])
            .sum()
    }

    #[must_use]
    pub fn total_lookups(&self) -> u64 {
        self.lookups.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_index_round_trips_every_slot() {
        for i in 0..STAT_SLOTS {
            assert_eq!(StatFlags::from_index(i).index(), i);
        }
        let write_hit_full = StatFlags {
            write: true,
            hit: true,
            on_buffer: false,
            fullsize: true,
        };
        assert_eq!(write_hit_full.index(), 0b1011);
    }

    #[test]
    fn record_snapshot_and_clear() {
        let stats = CacheStats::new();
        let read_miss = StatFlags {
            fullsize: true,
            ..StatFlags::default()
        };
        stats.record(read_miss);
        stats.record(read_miss);
        stats.record(StatFlags {
            write: true,
            ..StatFlags::default()
        });
        stats.record_non_full_flush();

        let snap = stats.snapshot();
        assert_eq!(snap.get(read_miss), 2);
        assert_eq!(snap.total_lookups(), 3);
        assert_eq!(snap.sum_where(|f| f.write), 1);
        assert_eq!(snap.non_full_flushed, 1);

        stats.clear();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
