//! Request and completion types exchanged with the dispatcher.

use crate::barrier::BarrierTicket;
use lgc_error::{CacheError, Result};
use lgc_types::{SECTOR_SIZE, SECTORS_PER_LINE, Sector, SectorMask, SegmentId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    /// Empty flush: acknowledged once everything written before it is durable.
    Flush,
}

/// One block request. Reads and writes cover 1..=8 sectors inside a single
/// 4 KiB line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub kind: IoKind,
    pub sector: Sector,
    pub sectors: u8,
    /// Write payload, `sectors * 512` bytes. Empty for reads and flushes.
    pub data: Vec<u8>,
    /// Force unit access: the write is acknowledged only once durable.
    pub fua: bool,
}

impl IoRequest {
    #[must_use]
    pub fn read(sector: Sector, sectors: u8) -> Self {
        Self {
            kind: IoKind::Read,
            sector,
            sectors,
            data: Vec::new(),
            fua: false,
        }
    }

    #[must_use]
    pub fn write(sector: Sector, data: Vec<u8>) -> Self {
        #[allow(clippy::cast_possible_truncation)] // validated against 8 later
        let sectors = (data.len() / SECTOR_SIZE).min(usize::from(u8::MAX)) as u8;
        Self {
            kind: IoKind::Write,
            sector,
            sectors,
            data,
            fua: false,
        }
    }

    #[must_use]
    pub fn flush() -> Self {
        Self {
            kind: IoKind::Flush,
            sector: Sector(0),
            sectors: 0,
            data: Vec::new(),
            fua: false,
        }
    }

    #[must_use]
    pub fn with_fua(mut self) -> Self {
        self.fua = true;
        self
    }

    /// Line-aligned key of the line this request touches.
    #[must_use]
    pub fn key(&self) -> Sector {
        self.sector.line_aligned()
    }

    #[must_use]
    pub fn is_fullsize(&self) -> bool {
        self.sectors == SECTORS_PER_LINE
    }

    /// Sub-sectors of the line covered by this request.
    pub fn mask(&self) -> Result<SectorMask> {
        SectorMask::from_range(self.sector.offset_in_line(), self.sectors).ok_or_else(|| {
            CacheError::InvalidRequest(format!(
                "{} sectors at {} do not fit in one 4 KiB line",
                self.sectors, self.sector
            ))
        })
    }

    pub(crate) fn validate(&self, backing_sectors: u64) -> Result<()> {
        if self.kind == IoKind::Flush {
            return Ok(());
        }
        self.mask()?;
        if self.kind == IoKind::Write && self.data.len() != usize::from(self.sectors) * SECTOR_SIZE
        {
            return Err(CacheError::InvalidRequest(format!(
                "write payload is {} bytes, expected {}",
                self.data.len(),
                usize::from(self.sectors) * SECTOR_SIZE
            )));
        }
        let end = self
            .sector
            .checked_add(u64::from(self.sectors))
            .ok_or_else(|| CacheError::InvalidRequest("sector range overflows".to_owned()))?;
        if end.0 > backing_sectors {
            return Err(CacheError::InvalidRequest(format!(
                "sectors {}..{} past end of backing device ({backing_sectors} sectors)",
                self.sector, end
            )));
        }
        Ok(())
    }
}

/// Device a remapped request must be issued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Backing,
    Cache,
}

/// Per-request side channel carried from dispatch to [`end_io`].
///
/// Must be handed back exactly once, whatever the outcome of the I/O.
///
/// [`end_io`]: crate::CacheDevice::end_io
#[derive(Debug, PartialEq, Eq)]
#[must_use = "pass the context back to end_io once the remapped I/O completes"]
pub enum IoContext {
    None,
    /// The backing read fills read-ahead cell `cell`.
    WillCache { cell: u32 },
    /// The read pins segment `id`; completion releases it.
    ReadSegment { id: SegmentId },
}

/// Where the caller must send a request the cache did not complete itself.
#[derive(Debug, PartialEq, Eq)]
pub struct Remap {
    pub target: Target,
    pub sector: Sector,
    pub context: IoContext,
}

/// Dispatcher verdict for one request.
#[derive(Debug)]
pub enum Disposition {
    /// Served by the cache. Reads carry their payload, writes an empty vec.
    Completed(Vec<u8>),
    /// Issue the I/O to `target` at `sector`, then call `end_io`.
    Remapped(Remap),
    /// Acknowledge once the ticket resolves.
    Deferred(BarrierTicket),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_infers_sector_count() {
        let request = IoRequest::write(Sector(10), vec![0_u8; 1024]);
        assert_eq!(request.sectors, 2);
        assert_eq!(request.key(), Sector(8));
        assert_eq!(request.mask().expect("mask"), SectorMask(0b0000_1100));
        request.validate(64).expect("valid");
    }

    #[test]
    fn requests_may_not_cross_a_line() {
        let request = IoRequest::read(Sector(6), 4);
        assert!(matches!(
            request.validate(64),
            Err(CacheError::InvalidRequest(_))
        ));
        assert!(IoRequest::read(Sector(0), 0).validate(64).is_err());
        assert!(IoRequest::read(Sector(0), 9).validate(64).is_err());
    }

    #[test]
    fn payload_and_bounds_are_checked() {
        let mut short = IoRequest::write(Sector(0), vec![0_u8; 512]);
        short.sectors = 2;
        assert!(short.validate(64).is_err());

        assert!(IoRequest::read(Sector(60), 4).validate(64).is_ok());
        assert!(IoRequest::read(Sector(64), 1).validate(64).is_err());
        assert!(IoRequest::flush().validate(0).is_ok());
    }
}
