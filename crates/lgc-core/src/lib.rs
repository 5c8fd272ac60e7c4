#![forbid(unsafe_code)]
//! LogCache engine.
//!
//! Writes are appended to the current segment in a RAM staging buffer and
//! acknowledged immediately. Full segments are sealed and flushed to the
//! cache device in id order by a flush worker, then a migration worker
//! copies their dirty lines back to the backing device. Reads are served
//! from the staging buffer, the cache device or the backing device,
//! sub-sector by sub-sector. Full-line read misses feed a read-ahead cache
//! that injects them as clean lines.
//!
//! [`CacheDevice`] is the entry point.

mod allocator;
mod barrier;
mod buffer;
pub mod config;
mod device;
mod dispatch;
mod engine;
mod flusher;
pub mod index;
mod migrate;
mod progress;
mod readahead;
pub mod registry;
mod request;
pub mod segment;
pub mod stats;

pub use barrier::BarrierTicket;
pub use config::{CacheConfig, Tunables};
pub use device::{CacheDevice, CacheStatus, LineInfo};
pub use index::{CacheIndex, HashCacheIndex};
pub use registry::LineState;
pub use request::{Disposition, IoContext, IoKind, IoRequest, Remap, Target};
pub use segment::{Geometry, HeaderEntry, SegmentHeader, SegmentState};
pub use stats::{StatFlags, StatsSnapshot};

use lgc_error::CacheError;
use lgc_types::{ParseError, SegmentId};

/// Conversion of header decode failures into runtime errors.
///
/// `InvalidField` and `InsufficientData` mean the bytes are not a header at
/// all (`Format`); a bad magic or checksum on a block that should hold
/// segment `segment` is corruption of that segment.
pub(crate) trait ParseErrorExt {
    fn into_corruption(self, segment: SegmentId) -> CacheError;
}

impl ParseErrorExt for ParseError {
    fn into_corruption(self, segment: SegmentId) -> CacheError {
        match self {
            ParseError::InvalidMagic { .. } | ParseError::ChecksumMismatch { .. } => {
                CacheError::Corruption {
                    segment: segment.0,
                    detail: self.to_string(),
                }
            }
            ParseError::InsufficientData { .. } | ParseError::InvalidField { .. } => {
                CacheError::Format(self.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_errors_map_by_kind() {
        let bad_sum = ParseError::ChecksumMismatch {
            stored: 1,
            computed: 2,
        };
        assert!(matches!(
            bad_sum.into_corruption(SegmentId(7)),
            CacheError::Corruption { segment: 7, .. }
        ));
        let short = ParseError::InsufficientData {
            needed: 4096,
            offset: 0,
            actual: 12,
        };
        assert!(matches!(
            short.into_corruption(SegmentId(7)),
            CacheError::Format(_)
        ));
    }
}
