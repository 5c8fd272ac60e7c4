//! The attached cache: construction, the request entry points, operator
//! controls and teardown.

use crate::barrier::{BarrierQueue, run_deadline_worker};
use crate::buffer::StagingPool;
use crate::config::{CacheConfig, Tunables};
use crate::engine::{CacheInner, ForcedMigration, IoState, ShutdownSignal};
use crate::flusher::{FlushMsg, run_flusher};
use crate::index::HashCacheIndex;
use crate::migrate::{MigrateMsg, run_migrator};
use crate::progress::ProgressNotifier;
use crate::readahead::{InjectMsg, ReadCacheBook, ReadCacheCells, run_injector};
use crate::registry::LineRegistry;
use crate::request::{Disposition, IoContext, IoKind, IoRequest, Target};
use crate::segment::{Geometry, SegmentArena, SegmentState};
use crate::stats::{CacheStats, StatsSnapshot};
use lgc_block::{ByteDevice, SectorIo};
use lgc_error::{CacheError, Result};
use lgc_types::{SECTOR_SHIFT, SECTOR_SIZE, Sector, SectorMask, SegmentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Point-in-time view of an attached cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub geometry: Geometry,
    /// Next line the allocator hands out.
    pub cursor: u32,
    pub current_id: SegmentId,
    pub last_flushed_id: SegmentId,
    pub last_migrated_id: SegmentId,
    pub nr_dirty_lines: u64,
    pub read_cache_reserved: usize,
    pub read_cache_outstanding: u32,
    pub stats: StatsSnapshot,
    pub tunables: Tunables,
    pub failed: bool,
}

/// Where and in what state a cached sector lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInfo {
    pub line: u32,
    pub segment: SegmentId,
    pub on_buffer: bool,
    pub key: Sector,
    pub data_bits: SectorMask,
    pub dirty_bits: SectorMask,
}

#[derive(Default)]
struct Workers {
    flusher: Option<JoinHandle<()>>,
    migrator: Option<JoinHandle<()>>,
    injector: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

/// A backing device fronted by a log-structured write-back cache.
///
/// Created by [`CacheDevice::attach`], torn down by [`CacheDevice::detach`]
/// (or on drop, without the final flush).
pub struct CacheDevice {
    inner: Arc<CacheInner>,
    workers: Workers,
}

impl std::fmt::Debug for CacheDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDevice")
            .field("geometry", &self.inner.geometry)
            .field("backing_sectors", &self.inner.backing_sectors)
            .field("failed", &self.inner.failed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

fn spawn_worker(
    name: &str,
    inner: &Arc<CacheInner>,
    body: impl FnOnce(Arc<CacheInner>) + Send + 'static,
) -> Result<JoinHandle<()>> {
    let inner = Arc::clone(inner);
    Ok(thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || body(inner))?)
}

impl CacheDevice {
    /// Attach `cache` in front of `backing` and start the background
    /// workers.
    ///
    /// The cache device contents are not read: every attach starts cold.
    pub fn attach(
        config: CacheConfig,
        backing: impl ByteDevice + 'static,
        cache: impl ByteDevice + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let geometry = Geometry::new(cache.len_bytes(), config.segment_size_order)?;
        let backing_sectors = backing.len_bytes() >> SECTOR_SHIFT;

        let (flush_tx, flush_rx) = crossbeam_channel::unbounded();
        let (migrate_tx, migrate_rx) = crossbeam_channel::unbounded();
        let (inject_tx, inject_rx) = crossbeam_channel::unbounded();

        let tunables = config.tunables;
        let inner = Arc::new(CacheInner {
            geometry,
            cache: Arc::new(cache),
            backing: Arc::new(backing),
            backing_sectors,
            io: Mutex::new(IoState {
                index: Box::new(HashCacheIndex::new(geometry.nr_caches)),
                cursor: 0,
                current: SegmentId::INVALID,
                current_slot: 0,
                current_buffer: 0,
                read_cache: ReadCacheBook::new(config.nr_read_cache_cells),
                tunables,
            }),
            registry: LineRegistry::new(geometry.nr_caches),
            segments: SegmentArena::new(geometry.nr_segments),
            pool: StagingPool::new(config.nr_rambuf_pool, geometry.segment_bytes()),
            cells: ReadCacheCells::new(config.nr_read_cache_cells),
            barriers: BarrierQueue::default(),
            flush_progress: ProgressNotifier::new(),
            migrate_progress: ProgressNotifier::new(),
            stats: CacheStats::new(),
            flush_tx,
            migrate_tx,
            inject_tx,
            failed: AtomicBool::new(false),
            force_migrate: AtomicU32::new(0),
            allow_migrate: AtomicBool::new(tunables.allow_migrate),
            migration_batch: AtomicU32::new(tunables.nr_max_batched_migration),
            shutdown: ShutdownSignal::default(),
        });

        let mut device = Self {
            inner,
            workers: Workers::default(),
        };
        device.workers.flusher = Some(spawn_worker("lgc-flusher", &device.inner, move |inner| {
            run_flusher(&inner, &flush_rx);
        })?);
        device.workers.migrator = Some(spawn_worker("lgc-migrator", &device.inner, move |inner| {
            run_migrator(&inner, &migrate_rx);
        })?);
        device.workers.injector = Some(spawn_worker("lgc-injector", &device.inner, move |inner| {
            run_injector(&inner, &inject_rx);
        })?);
        device.workers.deadline = Some(spawn_worker("lgc-deadline", &device.inner, |inner| {
            run_deadline_worker(&inner);
        })?);

        {
            let inner = &device.inner;
            let mut io = inner.io.lock();
            inner.acquire_segment(&mut io, SegmentId(1))?;
            let threshold = io.tunables.read_cache_threshold;
            io.read_cache.reset(&inner.cells, threshold);
        }

        info!(
            target: "lgc::device",
            backing_sectors,
            nr_segments = geometry.nr_segments,
            lines_per_segment = geometry.lines_per_segment,
            nr_caches = geometry.nr_caches,
            rambuf_pool = config.nr_rambuf_pool,
            read_cache_cells = config.nr_read_cache_cells,
            "cache_attached"
        );
        Ok(device)
    }

    /// Dispatch one request. Remapped requests must be completed through
    /// [`Self::end_io`]; deferred ones are acknowledged by their ticket.
    pub fn handle(&self, request: &IoRequest) -> Result<Disposition> {
        self.inner.handle(request)
    }

    /// Complete a remapped request. `payload` is the data the remapped I/O
    /// read (or wrote), `None` when it failed.
    pub fn end_io(&self, context: IoContext, payload: Option<&[u8]>) {
        self.inner.end_io(context, payload);
    }

    /// Dispatch `request` and carry it to completion, doing any remapped
    /// I/O against the attached devices. Returns the read payload (empty for
    /// writes and flushes).
    pub fn submit(&self, request: &IoRequest) -> Result<Vec<u8>> {
        let remap = match self.handle(request)? {
            Disposition::Completed(payload) => return Ok(payload),
            Disposition::Deferred(ticket) => {
                ticket.wait()?;
                return Ok(Vec::new());
            }
            Disposition::Remapped(remap) => remap,
        };
        let device = match remap.target {
            Target::Backing => &self.inner.backing,
            Target::Cache => &self.inner.cache,
        };
        let result = match request.kind {
            IoKind::Read => {
                let mut buf = vec![0_u8; usize::from(request.sectors) * SECTOR_SIZE];
                device.read_sectors(remap.sector, &mut buf).map(|()| buf)
            }
            IoKind::Write => device
                .write_sectors(remap.sector, &request.data)
                .and_then(|()| if request.fua { device.sync() } else { Ok(()) })
                .map(|()| Vec::new()),
            IoKind::Flush => Ok(Vec::new()),
        };
        if let Err(err) = &result {
            warn!(
                target: "lgc::device",
                target_device = ?remap.target,
                sector = remap.sector.0,
                error = %err,
                "remapped_io_failed"
            );
        }
        self.end_io(remap.context, result.as_deref().ok());
        result
    }

    /// Seal the current segment, full or not, and wait until it is on the
    /// cache device.
    pub fn force_flush(&self) -> Result<()> {
        self.inner.force_flush()
    }

    /// Write every dirty line back to the backing device, regardless of
    /// `allow_migrate`, and wait until none is left.
    pub fn drain_dirty(&self) -> Result<()> {
        let inner = &*self.inner;
        inner.check_alive()?;
        if inner.registry.nr_dirty() == 0 {
            return Ok(());
        }
        info!(target: "lgc::device", dirty = inner.registry.nr_dirty(), "drain_started");
        let _forced = ForcedMigration::engage(inner);
        loop {
            if self.current_has_dirty() {
                inner.force_flush()?;
            }
            if inner.registry.wait_all_clean(DRAIN_POLL) {
                break;
            }
            inner.check_alive()?;
            if let Some((segment, detail)) = inner.migrate_progress.first_failure() {
                return Err(CacheError::MigrationFailed {
                    segment: segment.0,
                    detail,
                });
            }
        }
        info!(target: "lgc::device", "drain_finished");
        Ok(())
    }

    fn current_has_dirty(&self) -> bool {
        let slot = self.inner.io.lock().current_slot;
        self.inner
            .registry
            .count_dirty(self.inner.geometry.line_range(slot))
            > 0
    }

    /// Handle an operator message: `clear_stat`, `drop_caches`, or
    /// `<tunable> <value>`.
    pub fn message(&self, args: &[&str]) -> Result<()> {
        match args {
            ["clear_stat"] => {
                self.clear_stats();
                Ok(())
            }
            ["drop_caches"] => self.drain_dirty(),
            [key, value] => {
                let inner = &*self.inner;
                let mut io = inner.io.lock();
                let mut tunables = io.tunables;
                tunables.apply(key, value)?;
                io.tunables = tunables;
                inner.publish_tunables(&tunables);
                drop(io);
                info!(target: "lgc::device", key = *key, value = *value, "tunable_updated");
                if *key == "allow_migrate" && inner.migrate_tx.send(MigrateMsg::Wake).is_err() {
                    debug!(target: "lgc::device", "migrator_gone");
                }
                Ok(())
            }
            _ => Err(CacheError::InvalidArgument(format!(
                "unrecognised message {args:?}"
            ))),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn clear_stats(&self) {
        self.inner.stats.clear();
    }

    #[must_use]
    pub fn status(&self) -> CacheStatus {
        let inner = &*self.inner;
        let io = inner.io.lock();
        CacheStatus {
            geometry: inner.geometry,
            cursor: io.cursor,
            current_id: io.current,
            last_flushed_id: inner.flush_progress.last_finished(),
            last_migrated_id: inner.migrate_progress.last_finished(),
            nr_dirty_lines: inner.registry.nr_dirty(),
            read_cache_reserved: io.read_cache.reserved(),
            read_cache_outstanding: inner.cells.outstanding(),
            stats: inner.stats.snapshot(),
            tunables: io.tunables,
            failed: inner.failed.load(Ordering::Acquire),
        }
    }

    /// Describe the line caching `sector`, if any.
    #[must_use]
    pub fn inspect_line(&self, sector: Sector) -> Option<LineInfo> {
        let inner = &*self.inner;
        let io = inner.io.lock();
        let line = io.index.lookup(sector.line_aligned())?;
        let slot = inner.geometry.slot_of_line(line);
        let state = inner.registry.read(line);
        Some(LineInfo {
            line: line.0,
            segment: inner.segments.id(slot),
            on_buffer: slot == io.current_slot,
            key: state.key.unwrap_or(sector.line_aligned()),
            data_bits: state.data_bits,
            dirty_bits: state.dirty_bits(),
        })
    }

    #[must_use]
    pub fn segments_in_state(&self, state: SegmentState) -> usize {
        self.inner.segments.count_in_state(state)
    }

    #[must_use]
    pub fn tunables(&self) -> Tunables {
        self.inner.io.lock().tunables
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.inner.geometry
    }

    /// Flush the current segment, sync the cache device and stop the
    /// workers. Dirty lines stay on the cache device.
    pub fn detach(mut self) -> Result<()> {
        let result = if self.inner.failed.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.inner
                .force_flush()
                .and_then(|()| self.inner.cache.sync())
        };
        self.shutdown_workers();
        info!(
            target: "lgc::device",
            clean = result.is_ok(),
            dirty = self.inner.registry.nr_dirty(),
            "cache_detached"
        );
        result
    }

    fn shutdown_workers(&mut self) {
        let inner = &*self.inner;
        inner.shutdown.trigger();

        if inner.flush_tx.send(FlushMsg::Shutdown).is_ok() {
            join(self.workers.flusher.take(), "lgc-flusher");
        }
        if inner.migrate_tx.send(MigrateMsg::Shutdown).is_ok() {
            join(self.workers.migrator.take(), "lgc-migrator");
        }
        inner.flush_progress.close();
        inner.migrate_progress.close();

        if inner.inject_tx.send(InjectMsg::Shutdown).is_ok() {
            join(self.workers.injector.take(), "lgc-injector");
        }
        join(self.workers.deadline.take(), "lgc-deadline");
        inner.barriers.fail_all_detached();
    }
}

fn join(handle: Option<JoinHandle<()>>, name: &str) {
    let Some(handle) = handle else {
        return;
    };
    if handle.join().is_err() {
        warn!(target: "lgc::device", worker = name, "worker_panicked");
    }
}

impl Drop for CacheDevice {
    fn drop(&mut self) {
        self.shutdown_workers();
    }
}
