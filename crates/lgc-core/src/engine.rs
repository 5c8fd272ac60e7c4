//! Shared state of an attached cache.
//!
//! `CacheInner` is owned by an `Arc` shared between the public handle and
//! the background workers. The I/O lock (`io`) serialises the index, the
//! allocation cursor, the current segment and buffer, read-ahead bookkeeping
//! and the tunables. Device I/O never happens under it.

use crate::barrier::BarrierQueue;
use crate::buffer::StagingPool;
use crate::config::Tunables;
use crate::flusher::FlushMsg;
use crate::index::CacheIndex;
use crate::migrate::MigrateMsg;
use crate::progress::{ProgressNotifier, WaitError};
use crate::readahead::{InjectMsg, ReadCacheBook, ReadCacheCells};
use crate::registry::LineRegistry;
use crate::segment::{Geometry, SegmentArena};
use crate::stats::{CacheStats, StatFlags};
use crossbeam_channel::Sender;
use lgc_block::ByteDevice;
use lgc_error::{CacheError, Result};
use lgc_types::{LineIdx, Sector, SegmentId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// State guarded by the I/O lock.
pub(crate) struct IoState {
    pub(crate) index: Box<dyn CacheIndex>,
    /// Next line to hand out.
    pub(crate) cursor: u32,
    pub(crate) current: SegmentId,
    pub(crate) current_slot: usize,
    pub(crate) current_buffer: usize,
    pub(crate) read_cache: ReadCacheBook,
    pub(crate) tunables: Tunables,
}

/// Stop flag that sleeping workers can wait on.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub(crate) fn trigger(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep for `duration` unless shutdown is triggered first. Returns
    /// `true` when shutting down.
    pub(crate) fn sleep(&self, duration: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            let _ = self.wake.wait_for(&mut stopped, duration);
        }
        *stopped
    }
}

/// A cache hit, pinned by an in-flight reference on its segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hit {
    pub(crate) line: LineIdx,
    pub(crate) slot: usize,
    pub(crate) id: SegmentId,
    pub(crate) on_buffer: bool,
}

pub(crate) struct CacheInner {
    pub(crate) geometry: Geometry,
    pub(crate) cache: Arc<dyn ByteDevice>,
    pub(crate) backing: Arc<dyn ByteDevice>,
    pub(crate) backing_sectors: u64,
    pub(crate) io: Mutex<IoState>,
    pub(crate) registry: LineRegistry,
    pub(crate) segments: SegmentArena,
    pub(crate) pool: StagingPool,
    pub(crate) cells: ReadCacheCells,
    pub(crate) barriers: BarrierQueue,
    pub(crate) flush_progress: ProgressNotifier,
    pub(crate) migrate_progress: ProgressNotifier,
    pub(crate) stats: CacheStats,
    pub(crate) flush_tx: Sender<FlushMsg>,
    pub(crate) migrate_tx: Sender<MigrateMsg>,
    pub(crate) inject_tx: Sender<InjectMsg>,
    pub(crate) failed: AtomicBool,
    /// Non-zero while someone drains dirty lines; overrides `allow_migrate`.
    pub(crate) force_migrate: AtomicU32,
    /// Copies of the migration tunables, readable without the I/O lock: the
    /// migrator must make progress while a rotation holds the lock waiting
    /// for it.
    pub(crate) allow_migrate: AtomicBool,
    pub(crate) migration_batch: AtomicU32,
    pub(crate) shutdown: ShutdownSignal,
}

impl CacheInner {
    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(CacheError::DeviceFailed);
        }
        if self.shutdown.is_set() {
            return Err(CacheError::Detached);
        }
        Ok(())
    }

    /// Stop the device after an invariant violation.
    pub(crate) fn fatal(&self, detail: String) -> CacheError {
        self.failed.store(true, Ordering::Release);
        error!(target: "lgc::engine", detail = %detail, "invariant_violation_device_stopped");
        CacheError::InvariantViolation(detail)
    }

    /// Stop the device with a specific error.
    pub(crate) fn fail_with(&self, err: CacheError) -> CacheError {
        self.failed.store(true, Ordering::Release);
        error!(target: "lgc::engine", error = %err, "device_stopped");
        err
    }

    /// Look `key` up and pin the segment of a hit. When `stat` is given the
    /// matching lookup counter is bumped.
    pub(crate) fn lookup(&self, io: &IoState, key: Sector, stat: Option<StatFlags>) -> Option<Hit> {
        let hit = io.index.lookup(key).map(|line| {
            let slot = self.geometry.slot_of_line(line);
            self.segments.inc_inflight(slot);
            Hit {
                line,
                slot,
                id: self.segments.id(slot),
                on_buffer: slot == io.current_slot,
            }
        });
        if let Some(flags) = stat {
            self.stats.record(StatFlags {
                hit: hit.is_some(),
                on_buffer: hit.is_some_and(|h| h.on_buffer),
                ..flags
            });
        }
        hit
    }

    /// Drop the in-flight reference a completed request held on segment `id`.
    pub(crate) fn release_segment(&self, id: SegmentId) {
        self.segments.dec_inflight(self.geometry.slot_for_id(id));
    }

    /// Whether `id` is the segment currently assigned to its slot. A pinned
    /// segment always is: its slot cannot be reused while the pin is held.
    pub(crate) fn occupies_slot(&self, id: SegmentId) -> bool {
        id.is_valid() && self.segments.id(self.geometry.slot_for_id(id)) == id
    }

    pub(crate) fn wait_flushed(&self, id: SegmentId) -> Result<()> {
        self.flush_progress.wait(id).map_err(|err| match err {
            WaitError::Failed(detail) => CacheError::FlushFailed {
                segment: id.0,
                detail,
            },
            WaitError::Closed => CacheError::Detached,
        })
    }

    pub(crate) fn migration_allowed(&self) -> bool {
        self.force_migrate.load(Ordering::Acquire) > 0 || self.allow_migrate.load(Ordering::Acquire)
    }

    /// Mirror the migration tunables. Called with the I/O lock held.
    pub(crate) fn publish_tunables(&self, tunables: &Tunables) {
        self.allow_migrate
            .store(tunables.allow_migrate, Ordering::Release);
        self.migration_batch
            .store(tunables.nr_max_batched_migration, Ordering::Release);
    }
}

/// Keeps migration forced on, whatever `allow_migrate` says, for as long as
/// it lives.
pub(crate) struct ForcedMigration<'a>(&'a CacheInner);

impl<'a> ForcedMigration<'a> {
    pub(crate) fn engage(inner: &'a CacheInner) -> Self {
        inner.force_migrate.fetch_add(1, Ordering::AcqRel);
        if inner.migrate_tx.send(MigrateMsg::Wake).is_err() {
            debug!(target: "lgc::engine", "migrator_gone");
        }
        Self(inner)
    }
}

impl Drop for ForcedMigration<'_> {
    fn drop(&mut self) {
        self.0.force_migrate.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_interrupts_sleep() {
        let signal = Arc::new(ShutdownSignal::default());
        assert!(!signal.sleep(Duration::from_millis(1)));
        let sleeper = {
            let signal = Arc::clone(&signal);
            std::thread::spawn(move || signal.sleep(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(10));
        signal.trigger();
        assert!(sleeper.join().expect("sleeper"));
        assert!(signal.is_set());
    }
}
