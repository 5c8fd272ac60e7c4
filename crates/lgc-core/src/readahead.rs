//! Read-ahead cache: remember full-line read misses and inject them as clean
//! lines once a whole generation of cells has been filled.
//!
//! Cells are reserved from the top of a flat array downwards while an ordered
//! map (sector → cell) answers "is this sector already reserved?" and lets the
//! batch pass find sequential runs. Sequential streams are not worth caching:
//! a run of more than `threshold` consecutive line misses is cancelled, once
//! in the foreground as it grows and again retrospectively before injection.

use crate::engine::CacheInner;
use crossbeam_channel::Receiver;
use lgc_types::{LINE_SIZE, SECTORS_PER_LINE, Sector};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, trace};

const LINE_STRIDE: u64 = SECTORS_PER_LINE as u64;

struct ReadCacheCell {
    sector: AtomicU64,
    cancelled: AtomicBool,
    data: Mutex<Box<[u8]>>,
}

/// Cell storage shared between the dispatcher, completions and the
/// injection worker.
pub(crate) struct ReadCacheCells {
    cells: Vec<ReadCacheCell>,
    ack_count: AtomicU32,
}

impl ReadCacheCells {
    pub(crate) fn new(size: u32) -> Self {
        Self {
            cells: (0..size)
                .map(|_| ReadCacheCell {
                    sector: AtomicU64::new(0),
                    cancelled: AtomicBool::new(false),
                    data: Mutex::new(vec![0_u8; LINE_SIZE].into_boxed_slice()),
                })
                .collect(),
            ack_count: AtomicU32::new(size),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // at most 2048 cells
    pub(crate) fn size(&self) -> u32 {
        self.cells.len() as u32
    }

    fn cell(&self, idx: u32) -> &ReadCacheCell {
        &self.cells[idx as usize]
    }

    pub(crate) fn cancel(&self, idx: u32) {
        self.cell(idx).cancelled.store(true, Ordering::Release);
    }

    pub(crate) fn is_cancelled(&self, idx: u32) -> bool {
        self.cell(idx).cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn sector(&self, idx: u32) -> Sector {
        Sector(self.cell(idx).sector.load(Ordering::Acquire))
    }

    /// Record the backing read of cell `idx`. Returns `true` when this was
    /// the last outstanding cell of the generation.
    pub(crate) fn complete(&self, idx: u32, payload: Option<&[u8]>) -> bool {
        let cell = self.cell(idx);
        match payload {
            Some(data) if data.len() == LINE_SIZE => {
                if !cell.cancelled.load(Ordering::Acquire) {
                    cell.data.lock().copy_from_slice(data);
                }
            }
            _ => cell.cancelled.store(true, Ordering::Release),
        }
        self.ack_count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Copy the payload of cell `idx` into `out`.
    pub(crate) fn copy_data(&self, idx: u32, out: &mut [u8]) {
        out.copy_from_slice(&self.cell(idx).data.lock());
    }

    pub(crate) fn outstanding(&self) -> u32 {
        self.ack_count.load(Ordering::Acquire)
    }
}

/// Reservation bookkeeping. Lives in the I/O-locked state.
#[derive(Debug)]
pub(crate) struct ReadCacheBook {
    by_sector: BTreeMap<Sector, u32>,
    cursor: u32,
    threshold: u32,
    last_sector: Option<Sector>,
    seqcount: u32,
    over_threshold: bool,
}

impl ReadCacheBook {
    /// Until the first reset adopts a real threshold every run is cacheable.
    pub(crate) fn new(size: u32) -> Self {
        Self {
            by_sector: BTreeMap::new(),
            cursor: size,
            threshold: u32::MAX,
            last_sector: None,
            seqcount: 0,
            over_threshold: false,
        }
    }

    pub(crate) fn threshold(&self) -> u32 {
        self.threshold
    }

    pub(crate) fn reserved(&self) -> usize {
        self.by_sector.len()
    }

    /// Reserve a cell for a read miss on `key`.
    pub(crate) fn reserve(
        &mut self,
        cells: &ReadCacheCells,
        key: Sector,
        enabled: bool,
        fullsize: bool,
    ) -> Option<u32> {
        if !enabled || self.cursor == 0 || !fullsize || self.by_sector.contains_key(&key) {
            return None;
        }
        self.cursor -= 1;
        let idx = self.cursor;
        cells.cell(idx).sector.store(key.0, Ordering::Release);
        self.by_sector.insert(key, idx);
        self.track_sequential(cells, key);
        trace!(target: "lgc::readahead", sector = key.0, cell = idx, "read_cache_reserved");
        Some(idx)
    }

    fn track_sequential(&mut self, cells: &ReadCacheCells, key: Sector) {
        let continues = self
            .last_sector
            .is_some_and(|last| last.0.checked_add(LINE_STRIDE) == Some(key.0));
        if continues {
            self.seqcount += 1;
        } else {
            self.seqcount = 1;
            self.over_threshold = false;
        }

        if self.seqcount > self.threshold {
            if self.over_threshold {
                cells.cancel(self.cursor);
            } else {
                self.over_threshold = true;
                let end = self
                    .cursor
                    .saturating_add(self.seqcount)
                    .min(cells.size());
                for idx in self.cursor..end {
                    cells.cancel(idx);
                }
            }
        }
        self.last_sector = Some(key);
    }

    /// A write to `key` makes a pending reservation stale.
    pub(crate) fn cancel_for_write(&self, cells: &ReadCacheCells, key: Sector) {
        if let Some(idx) = self.by_sector.get(&key) {
            cells.cancel(*idx);
        }
    }

    /// Cancel every run of consecutive reserved lines longer than the
    /// threshold.
    pub(crate) fn cancel_sequential_runs(&self, cells: &ReadCacheCells) {
        let mut run: Vec<u32> = Vec::new();
        let mut last: Option<Sector> = None;
        for (sector, idx) in &self.by_sector {
            let continues = last.is_some_and(|l| l.0.checked_add(LINE_STRIDE) == Some(sector.0));
            if !continues {
                self.cancel_run(cells, &run);
                run.clear();
            }
            run.push(*idx);
            last = Some(*sector);
        }
        self.cancel_run(cells, &run);
    }

    fn cancel_run(&self, cells: &ReadCacheCells, run: &[u32]) {
        if run.len() as u64 > u64::from(self.threshold) {
            for idx in run {
                cells.cancel(*idx);
            }
        }
    }

    /// Start a new generation. A non-zero `threshold` different from the
    /// current one is adopted.
    pub(crate) fn reset(&mut self, cells: &ReadCacheCells, threshold: u32) {
        for cell in &cells.cells {
            cell.cancelled.store(false, Ordering::Release);
        }
        cells.ack_count.store(cells.size(), Ordering::Release);
        self.by_sector.clear();
        self.cursor = cells.size();
        if threshold != 0 && threshold != self.threshold {
            self.threshold = threshold;
            self.last_sector = None;
            self.seqcount = 0;
            self.over_threshold = false;
        }
    }
}

pub(crate) enum InjectMsg {
    GenerationComplete,
    Shutdown,
}

/// Injection worker: waits for full generations and turns surviving cells
/// into clean cache lines.
pub(crate) fn run_injector(inner: &Arc<CacheInner>, rx: &Receiver<InjectMsg>) {
    debug!(target: "lgc::readahead", "read_cache_injector_started");
    while let Ok(InjectMsg::GenerationComplete) = rx.recv() {
        inject_generation(inner);
    }
    debug!(target: "lgc::readahead", "read_cache_injector_stopped");
}

fn inject_generation(inner: &CacheInner) {
    inner.io.lock().read_cache.cancel_sequential_runs(&inner.cells);

    let mut injected = 0_u32;
    for idx in 0..inner.cells.size() {
        if inner.inject_cell(idx) {
            injected += 1;
        }
    }

    let mut io = inner.io.lock();
    let threshold = io.tunables.read_cache_threshold;
    io.read_cache.reset(&inner.cells, threshold);
    let threshold = io.read_cache.threshold();
    drop(io);
    debug!(
        target: "lgc::readahead",
        injected,
        threshold,
        cells = inner.cells.size(),
        "read_cache_generation_injected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve_run(book: &mut ReadCacheBook, cells: &ReadCacheCells, start: u64, lines: u64) {
        for i in 0..lines {
            book.reserve(cells, Sector(start + i * LINE_STRIDE), true, true);
        }
    }

    fn survivors(cells: &ReadCacheCells, book: &ReadCacheBook) -> usize {
        book.by_sector
            .values()
            .filter(|idx| !cells.is_cancelled(**idx))
            .count()
    }

    #[test]
    fn admission_rules() {
        let cells = ReadCacheCells::new(2);
        let mut book = ReadCacheBook::new(2);
        assert_eq!(book.reserve(&cells, Sector(0), false, true), None);
        assert_eq!(book.reserve(&cells, Sector(0), true, false), None);
        assert_eq!(book.reserve(&cells, Sector(0), true, true), Some(1));
        assert_eq!(book.reserve(&cells, Sector(0), true, true), None);
        assert_eq!(book.reserve(&cells, Sector(80), true, true), Some(0));
        assert_eq!(book.reserve(&cells, Sector(160), true, true), None);
        assert_eq!(cells.sector(1), Sector(0));
        assert_eq!(cells.sector(0), Sector(80));
    }

    #[test]
    fn long_sequential_run_is_cancelled_in_the_foreground() {
        let cells = ReadCacheCells::new(16);
        let mut book = ReadCacheBook::new(16);
        book.reset(&cells, 4);
        reserve_run(&mut book, &cells, 0, 10);
        assert_eq!(book.reserved(), 10);
        assert!(survivors(&cells, &book) <= 4);
        assert_eq!(survivors(&cells, &book), 0);
    }

    #[test]
    fn random_misses_survive_and_late_run_extensions_are_caught() {
        let cells = ReadCacheCells::new(16);
        let mut book = ReadCacheBook::new(16);
        book.reset(&cells, 4);
        reserve_run(&mut book, &cells, 0, 4);
        for sector in [800_u64, 96, 4000, 32, 40, 2048] {
            book.reserve(&cells, Sector(sector), true, true);
        }
        assert_eq!(book.reserved(), 10);
        assert_eq!(survivors(&cells, &book), 10);

        book.cancel_sequential_runs(&cells);
        // 32 and 40 extend the 0..32 run to six lines; the rest are isolated.
        let cancelled: Vec<u64> = book
            .by_sector
            .iter()
            .filter(|(_, idx)| cells.is_cancelled(**idx))
            .map(|(sector, _)| sector.0)
            .collect();
        assert_eq!(cancelled, vec![0, 8, 16, 24, 32, 40]);
    }

    #[test]
    fn background_pass_catches_interleaved_runs() {
        let cells = ReadCacheCells::new(16);
        let mut book = ReadCacheBook::new(16);
        book.reset(&cells, 2);
        // Interleaving two streams defeats the foreground detector.
        for i in 0..4_u64 {
            book.reserve(&cells, Sector(i * LINE_STRIDE), true, true);
            book.reserve(&cells, Sector(1000 + i * LINE_STRIDE), true, true);
        }
        assert_eq!(survivors(&cells, &book), 8);
        book.cancel_sequential_runs(&cells);
        assert_eq!(survivors(&cells, &book), 0);
    }

    #[test]
    fn completion_fills_or_cancels_and_counts_acks() {
        let cells = ReadCacheCells::new(2);
        let mut book = ReadCacheBook::new(2);
        let a = book.reserve(&cells, Sector(0), true, true).expect("cell a");
        let b = book.reserve(&cells, Sector(64), true, true).expect("cell b");

        assert!(!cells.complete(a, Some(&[7_u8; LINE_SIZE])));
        assert!(cells.complete(b, None));
        assert!(cells.is_cancelled(b));
        assert!(!cells.is_cancelled(a));
        let mut out = vec![0_u8; LINE_SIZE];
        cells.copy_data(a, &mut out);
        assert!(out.iter().all(|v| *v == 7));

        book.reset(&cells, 0);
        assert_eq!(cells.outstanding(), 2);
        assert!(!cells.is_cancelled(b));
        assert_eq!(book.reserved(), 0);
        assert_eq!(book.threshold(), u32::MAX);
    }

    #[test]
    fn write_cancels_a_pending_reservation() {
        let cells = ReadCacheCells::new(4);
        let mut book = ReadCacheBook::new(4);
        let idx = book.reserve(&cells, Sector(24), true, true).expect("cell");
        book.cancel_for_write(&cells, Sector(32));
        assert!(!cells.is_cancelled(idx));
        book.cancel_for_write(&cells, Sector(24));
        assert!(cells.is_cancelled(idx));
    }
}
