//! Migration worker: writes the dirty lines of flushed segments back to the
//! backing device.
//!
//! Segments are migrated strictly in id order, in batches of up to
//! `nr_max_batched_migration`, with one backing-device sync per batch. Lines
//! are marked clean only after that sync. Whether migration runs at all is
//! the `allow_migrate` tunable, overridden while a dirty drain is in
//! progress.

use crate::engine::CacheInner;
use crate::segment::SegmentState;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use lgc_block::SectorIo;
use lgc_error::{CacheError, Result};
use lgc_types::{LINE_SIZE, LineIdx, Sector, SegmentId, sector_span};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, trace};

const IDLE_POLL: Duration = Duration::from_millis(20);

pub(crate) enum MigrateMsg {
    /// Segment `id` finished flushing (successfully or not).
    Segment { id: SegmentId, flushed: bool },
    /// Re-check the migration policy now.
    Wake,
    Shutdown,
}

pub(crate) fn run_migrator(inner: &Arc<CacheInner>, rx: &Receiver<MigrateMsg>) {
    debug!(target: "lgc::migrate", "migration_worker_started");
    let mut backlog: VecDeque<(SegmentId, bool)> = VecDeque::new();
    'worker: loop {
        let first = if backlog.is_empty() {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(IDLE_POLL)
        };
        let mut pending = match first {
            Ok(msg) => vec![msg],
            Err(RecvTimeoutError::Timeout) => Vec::new(),
            Err(RecvTimeoutError::Disconnected) => break,
        };
        pending.extend(rx.try_iter());
        for msg in pending {
            match msg {
                MigrateMsg::Segment { id, flushed } => backlog.push_back((id, flushed)),
                MigrateMsg::Wake => {}
                MigrateMsg::Shutdown => break 'worker,
            }
        }

        while !backlog.is_empty() && inner.migration_allowed() {
            let batch_size = inner.migration_batch.load(Ordering::Acquire) as usize;
            let batch: Vec<_> = backlog
                .drain(..batch_size.clamp(1, backlog.len()))
                .collect();
            migrate_batch(inner, &batch);
        }
    }
    debug!(
        target: "lgc::migrate",
        unmigrated = backlog.len(),
        "migration_worker_stopped"
    );
}

fn migrate_batch(inner: &CacheInner, batch: &[(SegmentId, bool)]) {
    let mut results: Vec<(SegmentId, Result<Vec<LineIdx>>)> = batch
        .iter()
        .map(|&(id, flushed)| {
            let result = if flushed {
                write_back_segment(inner, id)
            } else {
                Err(CacheError::FlushFailed {
                    segment: id.0,
                    detail: "segment never reached the cache device".to_owned(),
                })
            };
            (id, result)
        })
        .collect();

    if results.iter().any(|(_, r)| r.is_ok()) {
        if let Err(err) = inner.backing.sync() {
            let detail = err.to_string();
            for (id, result) in &mut results {
                if result.is_ok() {
                    *result = Err(CacheError::MigrationFailed {
                        segment: id.0,
                        detail: detail.clone(),
                    });
                }
            }
        }
    }

    for (id, result) in results {
        match result {
            Ok(lines) => {
                let cleaned = lines
                    .iter()
                    .filter(|line| inner.registry.mark_clean(**line))
                    .count();
                inner
                    .segments
                    .set_state(inner.geometry.slot_for_id(id), SegmentState::Migrated);
                inner.migrate_progress.finish(id, Ok(()));
                trace!(target: "lgc::migrate", segment = id.0, cleaned, "segment_migrated");
            }
            Err(err) => {
                error!(target: "lgc::migrate", segment = id.0, error = %err, "segment_migration_failed");
                inner.migrate_progress.finish(id, Err(err.to_string()));
            }
        }
    }
}

/// Copy every dirty sub-sector of segment `id` from the cache device to the
/// backing device. Returns the lines written back.
fn write_back_segment(inner: &CacheInner, id: SegmentId) -> Result<Vec<LineIdx>> {
    let slot = inner.geometry.slot_for_id(id);
    let owner = inner.segments.id(slot);
    if owner != id {
        return Err(CacheError::InvariantViolation(format!(
            "slot {slot} holds segment {owner} while migrating segment {id}"
        )));
    }
    let range = inner.geometry.line_range(slot);
    let length = inner.segments.length(slot);
    let states = inner.registry.snapshot(range.start..range.start + length);

    let mut written = Vec::new();
    let mut buf = vec![0_u8; LINE_SIZE];
    for (offset, state) in (range.start..).zip(states) {
        let bits = state.dirty_bits();
        let Some(key) = state.key.filter(|_| !bits.is_empty()) else {
            continue;
        };
        let line = LineIdx(offset);
        let base = inner.geometry.line_sector(line);
        for (start, count) in bits.runs() {
            let span = sector_span(start, count);
            inner
                .cache
                .read_sectors(Sector(base.0 + u64::from(start)), &mut buf[span.clone()])?;
            inner
                .backing
                .write_sectors(Sector(key.0 + u64::from(start)), &buf[span])?;
        }
        written.push(line);
    }
    Ok(written)
}
