//! Deferred acknowledgement of flush/FUA requests.
//!
//! A barrier request is parked on the pending list and answered with a
//! [`BarrierTicket`]. The list rides along with the flush job of the next
//! sealed segment; the flush worker resolves every ticket with the outcome
//! of that flush. A deadline worker seals a partial segment when barriers
//! wait too long.

use crate::engine::CacheInner;
use lgc_error::{CacheError, Result};
use lgc_types::SegmentId;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
enum TicketOutcome {
    Durable,
    FlushFailed { segment: SegmentId, detail: String },
    Detached,
}

#[derive(Debug)]
struct TicketInner {
    outcome: Mutex<Option<TicketOutcome>>,
    resolved: Condvar,
}

/// Completion handle for a barrier (flush or FUA) request.
#[derive(Debug, Clone)]
#[must_use = "a barrier is only durable once its ticket resolves"]
pub struct BarrierTicket {
    inner: Arc<TicketInner>,
}

impl BarrierTicket {
    fn new() -> Self {
        Self {
            inner: Arc::new(TicketInner {
                outcome: Mutex::new(None),
                resolved: Condvar::new(),
            }),
        }
    }

    fn convert(outcome: &TicketOutcome) -> Result<()> {
        match outcome {
            TicketOutcome::Durable => Ok(()),
            TicketOutcome::FlushFailed { segment, detail } => Err(CacheError::FlushFailed {
                segment: segment.0,
                detail: detail.clone(),
            }),
            TicketOutcome::Detached => Err(CacheError::Detached),
        }
    }

    /// Block until the barrier is acknowledged.
    pub fn wait(&self) -> Result<()> {
        let mut outcome = self.inner.outcome.lock();
        while outcome.is_none() {
            self.inner.resolved.wait(&mut outcome);
        }
        outcome.as_ref().map_or(Ok(()), Self::convert)
    }

    /// Like [`Self::wait`]; `None` if still pending after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.inner.outcome.lock();
        while outcome.is_none() {
            if self
                .inner
                .resolved
                .wait_until(&mut outcome, deadline)
                .timed_out()
            {
                break;
            }
        }
        outcome.as_ref().map(Self::convert)
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.inner.outcome.lock().is_some()
    }

    fn resolve(&self, outcome: TicketOutcome) {
        let mut slot = self.inner.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.inner.resolved.notify_all();
        }
    }

    pub(crate) fn resolve_durable(&self) {
        self.resolve(TicketOutcome::Durable);
    }

    pub(crate) fn resolve_failed(&self, segment: SegmentId, detail: &str) {
        self.resolve(TicketOutcome::FlushFailed {
            segment,
            detail: detail.to_owned(),
        });
    }
}

#[derive(Debug, Default)]
struct Pending {
    tickets: Vec<BarrierTicket>,
    since: Option<Instant>,
}

/// Barriers waiting for the next sealed segment.
#[derive(Debug, Default)]
pub(crate) struct BarrierQueue {
    pending: Mutex<Pending>,
}

impl BarrierQueue {
    pub(crate) fn queue(&self) -> BarrierTicket {
        let ticket = BarrierTicket::new();
        let mut pending = self.pending.lock();
        pending.since.get_or_insert_with(Instant::now);
        pending.tickets.push(ticket.clone());
        trace!(
            target: "lgc::barrier",
            pending = pending.tickets.len(),
            "barrier_queued"
        );
        ticket
    }

    /// Move every pending ticket out (into a flush job).
    pub(crate) fn take_all(&self) -> Vec<BarrierTicket> {
        let mut pending = self.pending.lock();
        pending.since = None;
        std::mem::take(&mut pending.tickets)
    }

    /// When the oldest pending barrier was queued.
    pub(crate) fn pending_since(&self) -> Option<Instant> {
        self.pending.lock().since
    }

    /// Resolve every pending ticket with `Detached`.
    pub(crate) fn fail_all_detached(&self) {
        for ticket in self.take_all() {
            ticket.resolve(TicketOutcome::Detached);
        }
    }
}

/// Deadline worker: seal the current segment when barriers have been pending
/// for longer than `barrier_deadline_ms`.
pub(crate) fn run_deadline_worker(inner: &Arc<CacheInner>) {
    debug!(target: "lgc::barrier", "barrier_deadline_worker_started");
    loop {
        let deadline = inner.io.lock().tunables.barrier_deadline();
        let wait = match inner.barriers.pending_since() {
            Some(since) => deadline.saturating_sub(since.elapsed()),
            None => deadline,
        };
        if inner.shutdown.sleep(wait) {
            break;
        }
        let overdue = inner
            .barriers
            .pending_since()
            .is_some_and(|since| since.elapsed() >= deadline);
        if !overdue {
            continue;
        }
        trace!(target: "lgc::barrier", "barrier_deadline_flush");
        if let Err(err) = inner.force_flush() {
            warn!(target: "lgc::barrier", error = %err, "barrier_deadline_flush_failed");
            if err.is_fatal() || matches!(err, CacheError::Detached) {
                break;
            }
        }
    }
    debug!(target: "lgc::barrier", "barrier_deadline_worker_stopped");
}
