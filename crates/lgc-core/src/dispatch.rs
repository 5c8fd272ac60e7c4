//! Request dispatch: hit/miss decisions, write placement, read assembly.
//!
//! Every lookup pins the hit segment with an in-flight reference that is
//! dropped exactly once: on completion in place, on error, or through
//! `end_io` for remapped reads of on-device lines.

use crate::allocator::Claim;
use crate::engine::{CacheInner, Hit};
use crate::readahead::InjectMsg;
use crate::registry::LineState;
use crate::request::{Disposition, IoContext, IoKind, IoRequest, Remap, Target};
use crate::stats::StatFlags;
use lgc_block::SectorIo;
use lgc_error::Result;
use lgc_types::{LINE_SIZE, LineIdx, Sector, SectorMask, SegmentId, copy_masked, sector_span};
use tracing::{trace, warn};

/// Dirty data of an on-device line, fetched with the I/O lock released.
struct MergeSource {
    line: LineIdx,
    id: SegmentId,
    bits: SectorMask,
    data: Vec<u8>,
}

impl CacheInner {
    pub(crate) fn handle(&self, request: &IoRequest) -> Result<Disposition> {
        self.check_alive()?;
        request.validate(self.backing_sectors)?;
        trace!(
            target: "lgc::dispatch",
            kind = ?request.kind,
            sector = request.sector.0,
            sectors = request.sectors,
            fua = request.fua,
            "request"
        );
        match request.kind {
            IoKind::Flush => Ok(Disposition::Deferred(self.barriers.queue())),
            IoKind::Write => {
                let write_around = self.io.lock().tunables.write_around_mode;
                if write_around {
                    self.process_write_around(request)
                } else {
                    self.process_write(request)
                }
            }
            IoKind::Read => self.process_read(request),
        }
    }

    fn process_write(&self, request: &IoRequest) -> Result<Disposition> {
        let key = request.key();
        let mask = request.mask()?;
        let mut line_buf = vec![0_u8; LINE_SIZE];
        line_buf[sector_span(request.sector.offset_in_line(), request.sectors)]
            .copy_from_slice(&request.data);

        let stat = StatFlags {
            write: true,
            fullsize: request.is_fullsize(),
            ..StatFlags::default()
        };
        let mut record = Some(stat);
        let mut merged: Option<MergeSource> = None;

        loop {
            let mut io = self.io.lock();
            self.check_alive()?;
            let hit = self.lookup(&io, key, record.take());
            let mut write_mask = mask;

            let target = match hit {
                Some(hit) if hit.on_buffer => Claim {
                    line: hit.line,
                    slot: hit.slot,
                },
                Some(hit) => {
                    let old = self.registry.read(hit.line);
                    if old.dirty && !mask.is_full() {
                        match merged.take() {
                            Some(src) if src.line == hit.line && src.id == hit.id => {
                                let carried = old.data_bits.intersect(src.bits).without(mask);
                                copy_masked(&mut line_buf, &src.data, carried);
                                write_mask = mask.union(carried);
                            }
                            _ => {
                                drop(io);
                                let fetched = self.fetch_dirty(&hit, old);
                                self.segments.dec_inflight(hit.slot);
                                merged = Some(fetched?);
                                continue;
                            }
                        }
                    }
                    self.registry.mark_clean(hit.line);
                    io.index.remove(hit.line);
                    self.segments.dec_inflight(hit.slot);
                    self.seal_if_full(&mut io)?;
                    self.claim_line(&mut io)?
                }
                None => {
                    io.read_cache.cancel_for_write(&self.cells, key);
                    self.seal_if_full(&mut io)?;
                    self.claim_line(&mut io)?
                }
            };

            self.pool.write_line(
                io.current_buffer,
                self.geometry.pos_in_segment(target.line),
                &line_buf,
                write_mask,
            );
            self.registry.taint(target.line, key, write_mask);
            io.index.insert(key, target.line);
            drop(io);
            self.segments.dec_inflight(target.slot);
            break;
        }

        if request.fua {
            return Ok(Disposition::Deferred(self.barriers.queue()));
        }
        Ok(Disposition::Completed(Vec::new()))
    }

    /// Read the dirty sub-sectors of an on-device line back from the cache
    /// device. The caller holds an in-flight reference on the segment.
    fn fetch_dirty(&self, hit: &Hit, old: LineState) -> Result<MergeSource> {
        self.wait_flushed(hit.id)?;
        let bits = old.dirty_bits();
        let mut data = vec![0_u8; LINE_SIZE];
        self.read_cached_sectors(hit.line, bits, &mut data)?;
        trace!(
            target: "lgc::dispatch",
            line = hit.line.0,
            segment = hit.id.0,
            bits = bits.bits(),
            "merge_source_fetched"
        );
        Ok(MergeSource {
            line: hit.line,
            id: hit.id,
            bits,
            data,
        })
    }

    fn process_write_around(&self, request: &IoRequest) -> Result<Disposition> {
        let key = request.key();
        let stat = StatFlags {
            write: true,
            fullsize: request.is_fullsize(),
            ..StatFlags::default()
        };
        let mut io = self.io.lock();
        if let Some(hit) = self.lookup(&io, key, Some(stat)) {
            self.segments.dec_inflight(hit.slot);
            io.index.remove(hit.line);
        }
        io.read_cache.cancel_for_write(&self.cells, key);
        drop(io);
        Ok(Disposition::Remapped(Remap {
            target: Target::Backing,
            sector: request.sector,
            context: IoContext::None,
        }))
    }

    fn process_read(&self, request: &IoRequest) -> Result<Disposition> {
        let key = request.key();
        let mask = request.mask()?;
        let fullsize = request.is_fullsize();
        let stat = StatFlags {
            fullsize,
            ..StatFlags::default()
        };

        let mut io = self.io.lock();
        let Some(hit) = self.lookup(&io, key, Some(stat)) else {
            let enabled = io.tunables.read_cache_threshold != 0;
            let context = io
                .read_cache
                .reserve(&self.cells, key, enabled, fullsize)
                .map_or(IoContext::None, |cell| IoContext::WillCache { cell });
            drop(io);
            return Ok(Disposition::Remapped(Remap {
                target: Target::Backing,
                sector: request.sector,
                context,
            }));
        };
        drop(io);

        let line = self.registry.read(hit.line);
        match self.read_hit(request, mask, &hit, line) {
            Ok(Some(payload)) => {
                self.segments.dec_inflight(hit.slot);
                Ok(Disposition::Completed(payload))
            }
            Ok(None) => {
                let base = self.geometry.line_sector(hit.line);
                Ok(Disposition::Remapped(Remap {
                    target: Target::Cache,
                    sector: Sector(base.0 + u64::from(request.sector.offset_in_line())),
                    context: IoContext::ReadSegment { id: hit.id },
                }))
            }
            Err(err) => {
                self.segments.dec_inflight(hit.slot);
                warn!(
                    target: "lgc::dispatch",
                    sector = request.sector.0,
                    error = %err,
                    "read_hit_failed"
                );
                Err(err)
            }
        }
    }

    /// Serve a read hit in place, or return `None` when the whole line is
    /// valid on the cache device and the read can be remapped there.
    fn read_hit(
        &self,
        request: &IoRequest,
        mask: SectorMask,
        hit: &Hit,
        line: LineState,
    ) -> Result<Option<Vec<u8>>> {
        let cached = line.data_bits.intersect(mask);
        let mut line_buf = vec![0_u8; LINE_SIZE];

        if hit.on_buffer {
            self.read_backing_sectors(request.key(), mask.without(cached), &mut line_buf)?;
            self.pool.read_line(
                self.pool.buffer_for_id(hit.id),
                self.geometry.pos_in_segment(hit.line),
                &mut line_buf,
                cached,
            );
        } else {
            self.wait_flushed(hit.id)?;
            if line.data_bits.is_full() {
                return Ok(None);
            }
            self.read_backing_sectors(request.key(), mask.without(cached), &mut line_buf)?;
            self.read_cached_sectors(hit.line, cached, &mut line_buf)?;
        }

        let span = sector_span(request.sector.offset_in_line(), request.sectors);
        Ok(Some(line_buf[span].to_vec()))
    }

    /// Fill the sectors in `bits` of `line_buf` from the backing device.
    fn read_backing_sectors(&self, key: Sector, bits: SectorMask, line_buf: &mut [u8]) -> Result<()> {
        for (start, count) in bits.runs() {
            self.backing.read_sectors(
                Sector(key.0 + u64::from(start)),
                &mut line_buf[sector_span(start, count)],
            )?;
        }
        Ok(())
    }

    /// Fill the sectors in `bits` of `line_buf` from `line` on the cache device.
    pub(crate) fn read_cached_sectors(
        &self,
        line: LineIdx,
        bits: SectorMask,
        line_buf: &mut [u8],
    ) -> Result<()> {
        let base = self.geometry.line_sector(line);
        for (start, count) in bits.runs() {
            self.cache.read_sectors(
                Sector(base.0 + u64::from(start)),
                &mut line_buf[sector_span(start, count)],
            )?;
        }
        Ok(())
    }

    /// Completion of a remapped request. `payload` is the data read for a
    /// `WillCache` read, or `None` when the remapped I/O failed.
    ///
    /// Contexts this device could not have handed out are logged and
    /// ignored.
    pub(crate) fn end_io(&self, context: IoContext, payload: Option<&[u8]>) {
        match context {
            IoContext::None => {}
            IoContext::ReadSegment { id } if !self.occupies_slot(id) => {
                warn!(target: "lgc::dispatch", segment = id.0, "end_io_unknown_segment");
            }
            IoContext::WillCache { cell } if cell >= self.cells.size() => {
                warn!(
                    target: "lgc::dispatch",
                    cell,
                    cells = self.cells.size(),
                    "end_io_unknown_cell"
                );
            }
            IoContext::ReadSegment { id } => self.release_segment(id),
            IoContext::WillCache { cell } => {
                if self.cells.complete(cell, payload)
                    && self.inject_tx.send(InjectMsg::GenerationComplete).is_err()
                {
                    trace!(target: "lgc::readahead", "read_cache_injector_gone");
                }
            }
        }
    }
}
