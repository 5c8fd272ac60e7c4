//! Cache index: logical 4 KiB key to cache line.
//!
//! The engine only needs three operations; the storage behind them is
//! pluggable through [`CacheIndex`]. [`HashCacheIndex`] is the default.

use lgc_types::{LineIdx, Sector};
use std::collections::HashMap;

/// Map from line-aligned logical sector to the cache line holding it.
///
/// All calls are made with the engine's I/O lock held, so implementations do
/// not need interior synchronisation.
pub trait CacheIndex: Send {
    /// Line currently caching `key`, if any.
    fn lookup(&self, key: Sector) -> Option<LineIdx>;

    /// Map `key` to `line`, replacing any previous mapping of either.
    fn insert(&mut self, key: Sector, line: LineIdx);

    /// Drop whatever key maps to `line`. No-op when `line` is not indexed.
    fn remove(&mut self, line: LineIdx);

    /// Number of indexed keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `HashMap`-backed index with a per-line reverse table so removal by line
/// is O(1).
#[derive(Debug, Clone)]
pub struct HashCacheIndex {
    forward: HashMap<Sector, LineIdx>,
    reverse: Vec<Option<Sector>>,
}

impl HashCacheIndex {
    #[must_use]
    pub fn new(nr_caches: u32) -> Self {
        Self {
            forward: HashMap::with_capacity(nr_caches as usize),
            reverse: vec![None; nr_caches as usize],
        }
    }
}

impl CacheIndex for HashCacheIndex {
    fn lookup(&self, key: Sector) -> Option<LineIdx> {
        self.forward.get(&key).copied()
    }

    fn insert(&mut self, key: Sector, line: LineIdx) {
        self.remove(line);
        if let Some(previous) = self.forward.insert(key, line) {
            if previous != line {
                self.reverse[previous.as_usize()] = None;
            }
        }
        self.reverse[line.as_usize()] = Some(key);
    }

    fn remove(&mut self, line: LineIdx) {
        let Some(key) = self.reverse.get_mut(line.as_usize()).and_then(Option::take) else {
            return;
        };
        if self.forward.get(&key) == Some(&line) {
            self.forward.remove(&key);
        }
    }

    fn len(&self) -> usize {
        self.forward.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let mut index = HashCacheIndex::new(16);
        index.insert(Sector(8), LineIdx(3));
        assert_eq!(index.lookup(Sector(8)), Some(LineIdx(3)));
        assert_eq!(index.len(), 1);

        index.remove(LineIdx(3));
        assert_eq!(index.lookup(Sector(8)), None);
        assert!(index.is_empty());

        index.remove(LineIdx(3));
        assert!(index.is_empty());
    }

    #[test]
    fn reinserting_a_key_moves_it_to_the_new_line() {
        let mut index = HashCacheIndex::new(16);
        index.insert(Sector(64), LineIdx(1));
        index.insert(Sector(64), LineIdx(9));
        assert_eq!(index.lookup(Sector(64)), Some(LineIdx(9)));

        // The old line no longer owns the key.
        index.remove(LineIdx(1));
        assert_eq!(index.lookup(Sector(64)), Some(LineIdx(9)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn reusing_a_line_drops_its_old_key() {
        let mut index = HashCacheIndex::new(16);
        index.insert(Sector(0), LineIdx(5));
        index.insert(Sector(800), LineIdx(5));
        assert_eq!(index.lookup(Sector(0)), None);
        assert_eq!(index.lookup(Sector(800)), Some(LineIdx(5)));
        assert_eq!(index.len(), 1);
    }
}
