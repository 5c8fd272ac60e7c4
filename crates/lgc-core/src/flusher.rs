//! Flush worker: writes sealed segments to the cache device in id order.

use crate::barrier::BarrierTicket;
use crate::engine::CacheInner;
use crate::migrate::MigrateMsg;
use crate::segment::SegmentState;
use crossbeam_channel::Receiver;
use lgc_block::SectorIo;
use lgc_error::Result;
use lgc_types::{LINE_SIZE, SegmentId};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// A sealed segment on its way to the cache device.
pub(crate) struct FlushJob {
    pub(crate) id: SegmentId,
    pub(crate) slot: usize,
    pub(crate) buffer: usize,
    pub(crate) length: u32,
    /// Barriers acknowledged by this flush.
    pub(crate) barriers: Vec<BarrierTicket>,
}

pub(crate) enum FlushMsg {
    Job(FlushJob),
    Shutdown,
}

pub(crate) fn run_flusher(inner: &Arc<CacheInner>, rx: &Receiver<FlushMsg>) {
    debug!(target: "lgc::flusher", "flush_worker_started");
    while let Ok(FlushMsg::Job(job)) = rx.recv() {
        flush_one(inner, job);
    }
    debug!(target: "lgc::flusher", "flush_worker_stopped");
}

fn flush_one(inner: &CacheInner, job: FlushJob) {
    let result = write_segment(inner, &job);
    let flushed = result.is_ok();
    match &result {
        Ok(()) => {
            inner.segments.set_state(job.slot, SegmentState::Flushed);
            trace!(
                target: "lgc::flusher",
                segment = job.id.0,
                length = job.length,
                barriers = job.barriers.len(),
                "segment_flushed"
            );
        }
        Err(err) => error!(
            target: "lgc::flusher",
            segment = job.id.0,
            error = %err,
            "segment_flush_failed"
        ),
    }
    let failure = result.err().map(|err| err.to_string());
    inner
        .flush_progress
        .finish(job.id, failure.clone().map_or(Ok(()), Err));
    for ticket in &job.barriers {
        match &failure {
            None => ticket.resolve_durable(),
            Some(detail) => ticket.resolve_failed(job.id, detail),
        }
    }
    if inner
        .migrate_tx
        .send(MigrateMsg::Segment {
            id: job.id,
            flushed,
        })
        .is_err()
    {
        trace!(target: "lgc::flusher", segment = job.id.0, "migrator_gone");
    }
}

/// Header plus used lines in one write; a sync when barriers ride along.
fn write_segment(inner: &CacheInner, job: &FlushJob) -> Result<()> {
    let bytes = (job.length as usize + 1) * LINE_SIZE;
    let start = inner.geometry.segment_start_sector(job.slot);
    {
        let buffer = inner.pool.lock_read(job.buffer);
        inner.cache.write_sectors(start, &buffer[..bytes])?;
    }
    if !job.barriers.is_empty() {
        inner.cache.sync()?;
    }
    Ok(())
}
