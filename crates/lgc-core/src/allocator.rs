//! Segment and staging-buffer allocation.
//!
//! Lines are handed out sequentially from the current segment. When it is
//! full, the next claim seals it (header snapshot, flush job with the pending
//! barriers) and rotates to the next segment id. Rotation is the only place
//! the dispatch path blocks: on the retiring segment's in-flight I/O, on the
//! flush of the buffer's previous user and on the migration of the slot's
//! previous occupant. All of it happens with the I/O lock held, so no other
//! claim can slip in between.

use crate::engine::{CacheInner, ForcedMigration, IoState};
use crate::flusher::{FlushJob, FlushMsg};
use crate::progress::WaitError;
use crate::segment::{HeaderEntry, SegmentHeader, SegmentState};
use lgc_error::{CacheError, Result};
use lgc_types::{LINE_SIZE, LineIdx, SectorMask, SegmentId};
use tracing::{debug, trace};

/// A freshly claimed line, pinned by an in-flight reference on `slot`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Claim {
    pub(crate) line: LineIdx,
    pub(crate) slot: usize,
}

impl CacheInner {
    /// Hand out the next line of the current segment.
    pub(crate) fn advance_cursor(&self, io: &mut IoState) -> Result<LineIdx> {
        if io.cursor == self.geometry.nr_caches {
            io.cursor = 0;
        }
        let line = LineIdx(io.cursor);
        io.cursor += 1;

        let length = self.segments.grow(io.current_slot);
        if length > self.geometry.lines_per_segment {
            return Err(self.fatal(format!(
                "segment {} filled to {length} lines, capacity {}",
                io.current, self.geometry.lines_per_segment
            )));
        }
        self.segments.inc_inflight(io.current_slot);
        Ok(line)
    }

    /// Claim a line and reset its registry entry.
    pub(crate) fn claim_line(&self, io: &mut IoState) -> Result<Claim> {
        let line = self.advance_cursor(io)?;
        let slot = io.current_slot;
        if let Err(stale) = self.registry.prepare_claim(line) {
            self.segments.dec_inflight(slot);
            return Err(self.fatal(format!(
                "claimed line {} of segment {} is still dirty (bits {})",
                line.0, io.current, stale.data_bits
            )));
        }
        trace!(target: "lgc::allocator", line = line.0, segment = io.current.0, "line_claimed");
        Ok(Claim { line, slot })
    }

    pub(crate) fn seal_if_full(&self, io: &mut IoState) -> Result<()> {
        if self.segments.length(io.current_slot) == self.geometry.lines_per_segment {
            self.rotate(io)?;
        }
        Ok(())
    }

    /// Seal the current segment and make the next id current. Returns the
    /// sealed id.
    pub(crate) fn rotate(&self, io: &mut IoState) -> Result<SegmentId> {
        let sealed = io.current;
        self.queue_flush_job(io)?;
        self.acquire_segment(io, sealed.next())?;
        Ok(sealed)
    }

    fn queue_flush_job(&self, io: &mut IoState) -> Result<()> {
        let slot = io.current_slot;
        self.segments.wait_inflight_drained(slot);

        let length = self.segments.length(slot);
        if length < self.geometry.lines_per_segment {
            self.stats.record_non_full_flush();
        }
        let range = self.geometry.line_range(slot);
        let entries = self
            .registry
            .snapshot(range.start..range.start + length)
            .into_iter()
            .map(|line| HeaderEntry {
                key: line.key,
                dirty_bits: line.dirty_bits(),
            })
            .collect();
        let header = SegmentHeader {
            id: io.current,
            entries,
        };
        self.pool.write_header(io.current_buffer, &header.encode());
        self.segments.set_state(slot, SegmentState::Sealed);

        let barriers = self.barriers.take_all();
        debug!(
            target: "lgc::allocator",
            segment = io.current.0,
            slot,
            length,
            barriers = barriers.len(),
            "segment_sealed"
        );
        self.flush_tx
            .send(FlushMsg::Job(FlushJob {
                id: io.current,
                slot,
                buffer: io.current_buffer,
                length,
                barriers,
            }))
            .map_err(|_| CacheError::Detached)
    }

    /// Make `id` the current segment.
    ///
    /// The id is published only after every wait on the slot's previous
    /// occupant, and the cursor is initialised exactly once.
    pub(crate) fn acquire_segment(&self, io: &mut IoState, id: SegmentId) -> Result<()> {
        let buffer = self.pool.buffer_for_id(id);
        let previous_user = id.saturating_back(self.pool.len() as u64);
        // Only completion matters here; a failed flush has already been
        // reported to its own waiters.
        if let Err(WaitError::Closed) = self.flush_progress.wait(previous_user) {
            return Err(CacheError::Detached);
        }
        self.pool.clear_header(buffer);

        let slot = self.geometry.slot_for_id(id);
        self.segments.wait_inflight_drained(slot);

        let previous_occupant = id.saturating_back(u64::from(self.geometry.nr_segments));
        // The slot cannot be reused until its previous occupant is written
        // back, so migration runs for the duration of the wait even when
        // `allow_migrate` is off.
        let urged = (self.migrate_progress.last_finished() < previous_occupant).then(|| {
            debug!(
                target: "lgc::allocator",
                segment = id.0,
                waiting_on = previous_occupant.0,
                "migration_urged"
            );
            ForcedMigration::engage(self)
        });
        let migrated = self.migrate_progress.wait(previous_occupant);
        drop(urged);
        match migrated {
            Ok(()) => {}
            Err(WaitError::Failed(detail)) => {
                return Err(self.fail_with(CacheError::MigrationFailed {
                    segment: previous_occupant.0,
                    detail,
                }));
            }
            Err(WaitError::Closed) => return Err(CacheError::Detached),
        }

        let dirty = self.registry.count_dirty(self.geometry.line_range(slot));
        if dirty > 0 {
            return Err(self.fatal(format!(
                "slot {slot} reused for segment {id} with {dirty} dirty lines left by segment \
                 {previous_occupant}"
            )));
        }
        self.discard_lines(io, slot);

        self.segments.assign(slot, id);
        io.current = id;
        io.current_slot = slot;
        io.current_buffer = buffer;
        io.cursor = self.geometry.start_line(slot).0;
        debug!(
            target: "lgc::allocator",
            segment = id.0,
            slot,
            buffer,
            "segment_acquired"
        );
        Ok(())
    }

    /// Forget every line of `slot` before it is reused.
    fn discard_lines(&self, io: &mut IoState, slot: usize) {
        for line in self.geometry.line_range(slot) {
            io.index.remove(LineIdx(line));
        }
    }

    /// Seal the current segment even if it is not full, and wait for its
    /// flush.
    pub(crate) fn force_flush(&self) -> Result<()> {
        let sealed = {
            let mut io = self.io.lock();
            self.check_alive()?;
            self.rotate(&mut io)?
        };
        self.wait_flushed(sealed)
    }

    /// Turn read-ahead cell `idx` into a clean line. Returns whether it was
    /// injected; cancelled cells and failures are dropped silently.
    pub(crate) fn inject_cell(&self, idx: u32) -> bool {
        let mut io = self.io.lock();
        if self.check_alive().is_err() || self.cells.is_cancelled(idx) {
            return false;
        }
        let key = self.cells.sector(idx);
        if io.index.lookup(key).is_some() {
            return false;
        }
        let claim = match self.seal_if_full(&mut io).and_then(|()| self.claim_line(&mut io)) {
            Ok(claim) => claim,
            Err(err) => {
                debug!(target: "lgc::readahead", cell = idx, error = %err, "read_cache_inject_dropped");
                return false;
            }
        };

        let mut data = vec![0_u8; LINE_SIZE];
        self.cells.copy_data(idx, &mut data);
        self.pool.write_line(
            io.current_buffer,
            self.geometry.pos_in_segment(claim.line),
            &data,
            SectorMask::FULL,
        );
        self.registry.fill_clean(claim.line, key);
        io.index.insert(key, claim.line);
        drop(io);

        self.segments.dec_inflight(claim.slot);
        true
    }
}
