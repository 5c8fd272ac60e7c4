//! Cache line registry: per-line key, valid bits and dirty flag.
//!
//! One lock covers the dirtiness of every line. The dirty-line counter lives
//! under the same lock so `drain_dirty` can wait on it with a condvar.

use lgc_types::{LineIdx, Sector, SectorMask};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::Duration;

/// Metadata of one cache line.
///
/// `data_bits` are the sub-sectors holding valid data. While `dirty` is set
/// they are also the sub-sectors the backing device has not seen yet, so the
/// dirty bitmap is `data_bits` when dirty and empty otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineState {
    pub key: Option<Sector>,
    pub data_bits: SectorMask,
    pub dirty: bool,
}

impl LineState {
    #[must_use]
    pub fn dirty_bits(&self) -> SectorMask {
        if self.dirty {
            self.data_bits
        } else {
            SectorMask::EMPTY
        }
    }
}

struct RegistryState {
    lines: Vec<LineState>,
    nr_dirty: u64,
}

pub(crate) struct LineRegistry {
    state: Mutex<RegistryState>,
    all_clean: Condvar,
}

impl LineRegistry {
    pub(crate) fn new(nr_caches: u32) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                lines: vec![LineState::default(); nr_caches as usize],
                nr_dirty: 0,
            }),
            all_clean: Condvar::new(),
        }
    }

    pub(crate) fn read(&self, line: LineIdx) -> LineState {
        self.state.lock().lines[line.as_usize()]
    }

    pub(crate) fn snapshot(&self, range: Range<u32>) -> Vec<LineState> {
        let state = self.state.lock();
        state.lines[range.start as usize..range.end as usize].to_vec()
    }

    /// Reset a freshly claimed line. Refuses (returning the stale state) if
    /// the line is still dirty.
    pub(crate) fn prepare_claim(&self, line: LineIdx) -> std::result::Result<(), LineState> {
        let mut state = self.state.lock();
        let slot = &mut state.lines[line.as_usize()];
        if slot.dirty {
            return Err(*slot);
        }
        *slot = LineState::default();
        Ok(())
    }

    /// OR `mask` into the line's bits and mark it dirty.
    pub(crate) fn taint(&self, line: LineIdx, key: Sector, mask: SectorMask) {
        let mut state = self.state.lock();
        let slot = &mut state.lines[line.as_usize()];
        let flipped = !slot.dirty;
        slot.key = Some(key);
        slot.data_bits = slot.data_bits.union(mask);
        slot.dirty = true;
        if flipped {
            state.nr_dirty += 1;
        }
    }

    /// Record a clean, fully valid line (read-ahead injection).
    pub(crate) fn fill_clean(&self, line: LineIdx, key: Sector) {
        let mut state = self.state.lock();
        let slot = &mut state.lines[line.as_usize()];
        slot.key = Some(key);
        slot.data_bits = SectorMask::FULL;
        slot.dirty = false;
    }

    /// Clear the dirty flag. Returns whether this call made the transition;
    /// the dirty-line counter drops exactly once per dirty period.
    pub(crate) fn mark_clean(&self, line: LineIdx) -> bool {
        let mut state = self.state.lock();
        let slot = &mut state.lines[line.as_usize()];
        if !slot.dirty {
            return false;
        }
        slot.dirty = false;
        state.nr_dirty -= 1;
        if state.nr_dirty == 0 {
            self.all_clean.notify_all();
        }
        true
    }

    pub(crate) fn count_dirty(&self, range: Range<u32>) -> usize {
        let state = self.state.lock();
        state.lines[range.start as usize..range.end as usize]
            .iter()
            .filter(|line| line.dirty)
            .count()
    }

    pub(crate) fn nr_dirty(&self) -> u64 {
        self.state.lock().nr_dirty
    }

    /// Wait up to `timeout` for the dirty-line counter to reach zero.
    pub(crate) fn wait_all_clean(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.nr_dirty == 0 {
            return true;
        }
        let _ = self.all_clean.wait_for(&mut state, timeout);
        state.nr_dirty == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn taint_ors_bits_and_counts_once() {
        let registry = LineRegistry::new(4);
        registry.taint(LineIdx(1), Sector(16), SectorMask(0b0000_0001));
        registry.taint(LineIdx(1), Sector(16), SectorMask(0b0000_0100));
        let line = registry.read(LineIdx(1));
        assert_eq!(line.dirty_bits(), SectorMask(0b0000_0101));
        assert_eq!(registry.nr_dirty(), 1);

        assert!(registry.mark_clean(LineIdx(1)));
        assert!(!registry.mark_clean(LineIdx(1)));
        assert_eq!(registry.nr_dirty(), 0);
        let line = registry.read(LineIdx(1));
        assert_eq!(line.dirty_bits(), SectorMask::EMPTY);
        assert_eq!(line.data_bits, SectorMask(0b0000_0101));
    }

    #[test]
    fn claim_refuses_dirty_lines() {
        let registry = LineRegistry::new(2);
        registry.fill_clean(LineIdx(0), Sector(8));
        registry.prepare_claim(LineIdx(0)).expect("clean line");
        assert_eq!(registry.read(LineIdx(0)), LineState::default());

        registry.taint(LineIdx(0), Sector(8), SectorMask::FULL);
        let stale = registry.prepare_claim(LineIdx(0)).expect_err("dirty line");
        assert!(stale.dirty);
        assert_eq!(registry.count_dirty(0..2), 1);
    }

    #[test]
    fn drain_waiter_wakes_when_last_line_cleans() {
        let registry = std::sync::Arc::new(LineRegistry::new(2));
        registry.taint(LineIdx(0), Sector(0), SectorMask::FULL);
        let cleaner = {
            let registry = std::sync::Arc::clone(&registry);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                registry.mark_clean(LineIdx(0));
            })
        };
        let mut clean = false;
        for _ in 0..100 {
            if registry.wait_all_clean(Duration::from_millis(50)) {
                clean = true;
                break;
            }
        }
        cleaner.join().expect("cleaner");
        assert!(clean);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn dirty_bits_are_the_union_of_written_masks(masks in proptest::collection::vec(1_u8..=255, 1..12)) {
            let registry = LineRegistry::new(1);
            let mut expected = SectorMask::EMPTY;
            for bits in &masks {
                registry.taint(LineIdx(0), Sector(0), SectorMask(*bits));
                expected = expected.union(SectorMask(*bits));
                prop_assert_eq!(registry.read(LineIdx(0)).dirty_bits(), expected);
            }
            prop_assert_eq!(registry.nr_dirty(), 1);
            prop_assert!(registry.mark_clean(LineIdx(0)));
            prop_assert_eq!(registry.nr_dirty(), 0);
        }
    }
}
