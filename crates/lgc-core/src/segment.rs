//! Segment ring: geometry, per-slot state and the segment header codec.
//!
//! The cache device is cut into regions of `2^order` sectors. Region 0 is
//! reserved for a superblock; region `slot + 1` holds segment slot `slot`.
//! Each region starts with a 4 KiB header followed by
//! `lines_per_segment = 2^(order-3) - 1` cache lines.
//!
//! Segment id `n` (ids start at 1) always lives in slot
//! `(n - 1) mod nr_segments`, so the id doubles as a generation check for
//! the slot.

use crate::ParseErrorExt;
use lgc_error::{CacheError, Result};
use lgc_types::{
    LINE_SECTOR_SHIFT, LINE_SIZE, LineIdx, MAX_SEGMENT_ORDER, MIN_SEGMENT_ORDER, ParseError,
    SECTOR_SIZE, Sector, SectorMask, SegmentId, ensure_slice, read_le_u32, read_le_u64,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::error;

/// Derived sizes of an attached cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub segment_order: u8,
    pub lines_per_segment: u32,
    pub nr_segments: u32,
    pub nr_caches: u32,
}

impl Geometry {
    pub fn new(cache_len_bytes: u64, segment_order: u8) -> Result<Self> {
        if !(MIN_SEGMENT_ORDER..=MAX_SEGMENT_ORDER).contains(&segment_order) {
            return Err(CacheError::InvalidGeometry(format!(
                "segment_size_order={segment_order} outside {MIN_SEGMENT_ORDER}..={MAX_SEGMENT_ORDER}"
            )));
        }
        let segment_sectors = 1_u64 << segment_order;
        let regions = cache_len_bytes / SECTOR_SIZE as u64 / segment_sectors;
        if regions < 2 {
            return Err(CacheError::InvalidGeometry(format!(
                "cache device of {cache_len_bytes} bytes holds {regions} regions of \
                 {segment_sectors} sectors; need a superblock region and at least one segment"
            )));
        }
        let nr_segments = u32::try_from(regions - 1).map_err(|_| {
            CacheError::InvalidGeometry(format!("{} segments overflow u32", regions - 1))
        })?;
        let lines_per_segment = (1_u32 << (segment_order - LINE_SECTOR_SHIFT as u8)) - 1;
        let nr_caches = nr_segments.checked_mul(lines_per_segment).ok_or_else(|| {
            CacheError::InvalidGeometry(format!(
                "{nr_segments} segments of {lines_per_segment} lines overflow u32"
            ))
        })?;
        Ok(Self {
            segment_order,
            lines_per_segment,
            nr_segments,
            nr_caches,
        })
    }

    #[must_use]
    pub fn segment_bytes(&self) -> usize {
        (1_usize << self.segment_order) * SECTOR_SIZE
    }

    #[must_use]
    pub fn slot_for_id(&self, id: SegmentId) -> usize {
        ((id.0 - 1) % u64::from(self.nr_segments)) as usize
    }

    #[must_use]
    pub fn slot_of_line(&self, line: LineIdx) -> usize {
        (line.0 / self.lines_per_segment) as usize
    }

    /// Position of `line` inside its segment.
    #[must_use]
    pub fn pos_in_segment(&self, line: LineIdx) -> u32 {
        line.0 % self.lines_per_segment
    }

    #[must_use]
    pub fn start_line(&self, slot: usize) -> LineIdx {
        #[allow(clippy::cast_possible_truncation)] // slot < nr_segments: u32
        LineIdx(slot as u32 * self.lines_per_segment)
    }

    #[must_use]
    pub fn line_range(&self, slot: usize) -> Range<u32> {
        let start = self.start_line(slot).0;
        start..start + self.lines_per_segment
    }

    /// First sector of the region holding `slot` (its header).
    #[must_use]
    pub fn segment_start_sector(&self, slot: usize) -> Sector {
        Sector((slot as u64 + 1) << self.segment_order)
    }

    /// Physical sector of `line` on the cache device.
    #[must_use]
    pub fn line_sector(&self, line: LineIdx) -> Sector {
        let slot = self.slot_of_line(line);
        let pos = u64::from(self.pos_in_segment(line)) + 1;
        Sector(self.segment_start_sector(slot).0 + (pos << LINE_SECTOR_SHIFT))
    }
}

/// Lifecycle of a segment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentState {
    /// Never used since attach.
    Free = 0,
    /// Accepting new lines. At most one slot is in this state.
    Current = 1,
    /// Handed to the flush worker.
    Sealed = 2,
    /// Durable on the cache device.
    Flushed = 3,
    /// Dirty lines written back; the slot may be reused.
    Migrated = 4,
}

impl SegmentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Current,
            2 => Self::Sealed,
            3 => Self::Flushed,
            4 => Self::Migrated,
            _ => Self::Free,
        }
    }
}

#[derive(Debug, Default)]
struct SegmentSlot {
    id: AtomicU64,
    length: AtomicU32,
    inflight: AtomicU32,
    state: AtomicU8,
}

/// Fixed array of segment slots with in-flight tracking.
///
/// `id` and `length` only change under the engine's I/O lock; other threads
/// read them atomically.
#[derive(Debug)]
pub(crate) struct SegmentArena {
    slots: Vec<SegmentSlot>,
    drain_lock: Mutex<()>,
    drained: Condvar,
}

impl SegmentArena {
    pub(crate) fn new(nr_segments: u32) -> Self {
        Self {
            slots: (0..nr_segments).map(|_| SegmentSlot::default()).collect(),
            drain_lock: Mutex::new(()),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn id(&self, slot: usize) -> SegmentId {
        SegmentId(self.slots[slot].id.load(Ordering::Acquire))
    }

    pub(crate) fn length(&self, slot: usize) -> u32 {
        self.slots[slot].length.load(Ordering::Acquire)
    }

    /// Bump the fill length, returning the new value.
    pub(crate) fn grow(&self, slot: usize) -> u32 {
        self.slots[slot].length.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Give `slot` to segment `id` as the new current segment.
    pub(crate) fn assign(&self, slot: usize, id: SegmentId) {
        let entry = &self.slots[slot];
        entry.length.store(0, Ordering::Release);
        entry.id.store(id.0, Ordering::Release);
        self.set_state(slot, SegmentState::Current);
    }

    pub(crate) fn state(&self, slot: usize) -> SegmentState {
        SegmentState::from_u8(self.slots[slot].state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, slot: usize, state: SegmentState) {
        self.slots[slot].state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn count_in_state(&self, state: SegmentState) -> usize {
        (0..self.slots.len())
            .filter(|slot| self.state(*slot) == state)
            .count()
    }

    pub(crate) fn inflight(&self, slot: usize) -> u32 {
        self.slots[slot].inflight.load(Ordering::Acquire)
    }

    pub(crate) fn inc_inflight(&self, slot: usize) {
        self.slots[slot].inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_inflight(&self, slot: usize) {
        let previous = self.slots[slot]
            .inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                let _guard = self.drain_lock.lock();
                self.drained.notify_all();
            }
            Ok(_) => {}
            Err(_) => {
                error!(target: "lgc::segment", slot, "inflight_underflow");
            }
        }
    }

    /// Block until no I/O references `slot`.
    pub(crate) fn wait_inflight_drained(&self, slot: usize) {
        let mut guard = self.drain_lock.lock();
        while self.inflight(slot) > 0 {
            self.drained.wait(&mut guard);
        }
    }
}

// ── Segment header ──────────────────────────────────────────────────────────

pub const SEGMENT_HEADER_MAGIC: u32 = 0x5347_434C; // "LCGS" little-endian
const HEADER_FIXED_BYTES: usize = 24;
const HEADER_ENTRY_BYTES: usize = 9;
const NO_KEY: u64 = u64::MAX;

/// One line's record in a segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: Option<Sector>,
    pub dirty_bits: SectorMask,
}

/// Self-describing summary written in front of every flushed segment.
///
/// Layout (little-endian): magic u32, crc32c u32 over everything after it,
/// id u64, length u32, reserved u32, then `length` entries of key u64 and
/// dirty bitmap u8. Lines without a key are stored as `u64::MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub id: SegmentId,
    pub entries: Vec<HeaderEntry>,
}

impl SegmentHeader {
    /// Encode into a 4 KiB block.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0_u8; LINE_SIZE];
        let used = HEADER_FIXED_BYTES + self.entries.len() * HEADER_ENTRY_BYTES;
        debug_assert!(used <= LINE_SIZE, "segment header overflows its block");

        block[0..4].copy_from_slice(&SEGMENT_HEADER_MAGIC.to_le_bytes());
        block[8..16].copy_from_slice(&self.id.0.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)] // at most 255 lines per segment
        block[16..20].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (i, entry) in self.entries.iter().enumerate() {
            let at = HEADER_FIXED_BYTES + i * HEADER_ENTRY_BYTES;
            let key = entry.key.map_or(NO_KEY, |sector| sector.0);
            block[at..at + 8].copy_from_slice(&key.to_le_bytes());
            block[at + 8] = entry.dirty_bits.bits();
        }
        let crc = crc32c::crc32c(&block[8..used]);
        block[4..8].copy_from_slice(&crc.to_le_bytes());
        block
    }

    pub fn decode(block: &[u8]) -> std::result::Result<Self, ParseError> {
        let magic = read_le_u32(block, 0)?;
        if magic != SEGMENT_HEADER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SEGMENT_HEADER_MAGIC),
                actual: u64::from(magic),
            });
        }
        let stored = read_le_u32(block, 4)?;
        let id = read_le_u64(block, 8)?;
        let length = read_le_u32(block, 16)? as usize;
        let used = length
            .checked_mul(HEADER_ENTRY_BYTES)
            .and_then(|n| n.checked_add(HEADER_FIXED_BYTES))
            .filter(|used| *used <= LINE_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "length",
                reason: "entries overflow the header block",
            })?;
        let covered = ensure_slice(block, 8, used - 8)?;
        let computed = crc32c::crc32c(covered);
        if computed != stored {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }
        if id == 0 {
            return Err(ParseError::InvalidField {
                field: "id",
                reason: "segment id 0 is reserved",
            });
        }

        let entries = (0..length)
            .map(|i| {
                let at = HEADER_FIXED_BYTES + i * HEADER_ENTRY_BYTES;
                let key = read_le_u64(block, at)?;
                Ok(HeaderEntry {
                    key: (key != NO_KEY).then_some(Sector(key)),
                    dirty_bits: SectorMask(block[at + 8]),
                })
            })
            .collect::<std::result::Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            id: SegmentId(id),
            entries,
        })
    }

    /// Decode a header read back from the cache device.
    pub fn decode_for(segment: SegmentId, block: &[u8]) -> Result<Self> {
        Self::decode(block).map_err(|e| e.into_corruption(segment))
    }
}
