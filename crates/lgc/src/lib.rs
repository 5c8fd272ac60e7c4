#![forbid(unsafe_code)]
//! LogCache public API facade.
//!
//! Re-exports the engine from `lgc-core` together with the device layer,
//! the shared units and the error type, so downstream consumers need a
//! single dependency.

pub use lgc_block::{ByteDevice, FaultMode, FileByteDevice, IoStats, MemoryByteDevice, SectorIo};
pub use lgc_core::*;
pub use lgc_error::{CacheError, Result};
pub use lgc_types::{
    LINE_SIZE, LineIdx, SECTOR_SIZE, SECTORS_PER_LINE, Sector, SectorMask, SegmentId,
};
