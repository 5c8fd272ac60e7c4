#![forbid(unsafe_code)]
//! Units, identifiers and sub-sector masks shared by the LogCache crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Size of one sector (the request addressing unit) in bytes.
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_SHIFT: u32 = 9;

/// Size of one cache line (metablock) in bytes.
pub const LINE_SIZE: usize = 4096;

/// Sectors per cache line. One bit of a [`SectorMask`] per sector.
pub const SECTORS_PER_LINE: u8 = 8;
pub const LINE_SECTOR_SHIFT: u32 = 3;

/// Segment size order bounds, in log2(sectors).
pub const MIN_SEGMENT_ORDER: u8 = 4;
pub const MAX_SEGMENT_ORDER: u8 = 11;

/// 512-byte sector address on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

impl Sector {
    /// Round down to the first sector of the containing cache line.
    #[must_use]
    pub fn line_aligned(self) -> Self {
        Self(self.0 & !u64::from(SECTORS_PER_LINE - 1))
    }

    /// Position of this sector within its cache line (0..8).
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // masked to 3 bits
    pub fn offset_in_line(self) -> u8 {
        (self.0 & u64::from(SECTORS_PER_LINE - 1)) as u8
    }

    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }

    /// Byte offset of this sector, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(SECTOR_SIZE as u64)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Global segment id. Strictly increasing, never reused; 0 means "none".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub const INVALID: Self = Self(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// `self - distance`, clamped to [`SegmentId::INVALID`].
    ///
    /// Waiting on the result of a clamped subtraction is always satisfied,
    /// which is what the ring and buffer-pool waits rely on for the first lap.
    #[must_use]
    pub fn saturating_back(self, distance: u64) -> Self {
        Self(self.0.saturating_sub(distance))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a cache line slot on the cache device (0..nr_caches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineIdx(pub u32);

impl LineIdx {
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One bit per 512-byte sector of a cache line.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorMask(pub u8);

impl SectorMask {
    pub const EMPTY: Self = Self(0);
    pub const FULL: Self = Self(0xFF);

    /// Mask covering `count` sectors starting at `offset` within a line.
    ///
    /// Returns `None` for an empty range or one that crosses the line end.
    #[must_use]
    pub fn from_range(offset: u8, count: u8) -> Option<Self> {
        if count == 0 || offset.checked_add(count)? > SECTORS_PER_LINE {
            return None;
        }
        if count == SECTORS_PER_LINE {
            return Some(Self::FULL);
        }
        let bits = ((1_u16 << count) - 1) << offset;
        u8::try_from(bits).ok().map(Self)
    }

    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn is_full(self) -> bool {
        self.0 == 0xFF
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn contains(self, sector: u8) -> bool {
        sector < SECTORS_PER_LINE && self.0 & (1 << sector) != 0
    }

    #[must_use]
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Sectors in `self` that are not in `other`.
    #[must_use]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Contiguous runs of set bits as `(first_sector, sector_count)`.
    pub fn runs(self) -> impl Iterator<Item = (u8, u8)> {
        let mut bits = u32::from(self.0);
        let mut pos = 0_u32;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let skip = bits.trailing_zeros();
            bits >>= skip;
            pos += skip;
            let len = (!bits).trailing_zeros();
            let start = pos;
            bits >>= len;
            pos += len;
            #[allow(clippy::cast_possible_truncation)] // both bounded by 8
            Some((start as u8, len as u8))
        })
    }
}

impl fmt::Display for SectorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Byte range of the sectors `[start, start + count)` inside a line buffer.
#[must_use]
pub fn sector_span(start: u8, count: u8) -> std::ops::Range<usize> {
    let begin = usize::from(start) * SECTOR_SIZE;
    begin..begin + usize::from(count) * SECTOR_SIZE
}

/// Copy the sectors selected by `mask` from `src` into `dst`.
///
/// Both slices are line-sized buffers laid out sector by sector.
pub fn copy_masked(dst: &mut [u8], src: &[u8], mask: SectorMask) {
    for (start, count) in mask.runs() {
        let span = sector_span(start, count);
        dst[span.clone()].copy_from_slice(&src[span]);
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
