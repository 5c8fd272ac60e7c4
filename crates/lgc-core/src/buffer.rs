//! Staging buffers: in-memory images of segments being filled.
//!
//! A buffer has the same layout as a segment region on the cache device:
//! the 4 KiB header block, then one 4 KiB block per line.

use lgc_types::{LINE_SIZE, SectorMask, SegmentId, copy_masked};
use parking_lot::{RwLock, RwLockReadGuard};

pub(crate) struct StagingPool {
    buffers: Vec<RwLock<Box<[u8]>>>,
}

impl StagingPool {
    pub(crate) fn new(nr_buffers: usize, segment_bytes: usize) -> Self {
        Self {
            buffers: (0..nr_buffers)
                .map(|_| RwLock::new(vec![0_u8; segment_bytes].into_boxed_slice()))
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Buffer used by segment `id`; the same buffer served `id - len()`.
    pub(crate) fn buffer_for_id(&self, id: SegmentId) -> usize {
        ((id.0 - 1) % self.buffers.len() as u64) as usize
    }

    fn line_span(pos: u32) -> std::ops::Range<usize> {
        let start = (pos as usize + 1) * LINE_SIZE;
        start..start + LINE_SIZE
    }

    /// Copy the sectors of `line` selected by `mask` into line `pos`.
    pub(crate) fn write_line(&self, buffer: usize, pos: u32, line: &[u8], mask: SectorMask) {
        let mut guard = self.buffers[buffer].write();
        copy_masked(&mut guard[Self::line_span(pos)], line, mask);
    }

    /// Copy the sectors of line `pos` selected by `mask` into `out`.
    pub(crate) fn read_line(&self, buffer: usize, pos: u32, out: &mut [u8], mask: SectorMask) {
        let guard = self.buffers[buffer].read();
        copy_masked(out, &guard[Self::line_span(pos)], mask);
    }

    pub(crate) fn write_header(&self, buffer: usize, header: &[u8]) {
        let mut guard = self.buffers[buffer].write();
        guard[..LINE_SIZE].copy_from_slice(header);
    }

    pub(crate) fn clear_header(&self, buffer: usize) {
        self.buffers[buffer].write()[..LINE_SIZE].fill(0);
    }

    /// Shared view for the flush worker.
    pub(crate) fn lock_read(&self, buffer: usize) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buffers[buffer].read()
    }
}
