//! Static cache geometry and runtime tunables.

use lgc_error::{CacheError, Result};
use lgc_types::{MAX_SEGMENT_ORDER, MIN_SEGMENT_ORDER};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on read-ahead cells per generation.
pub const MAX_READ_CACHE_CELLS: u32 = 2048;
/// Upper bound on the sequential-run threshold (0 disables read-ahead).
pub const MAX_READ_CACHE_THRESHOLD: u32 = 127;
/// Upper bound on segments migrated per batch.
pub const MAX_BATCHED_MIGRATION: u32 = 32;
/// Upper bound on the barrier deadline.
pub const MAX_BARRIER_DEADLINE_MS: u64 = 10_000;

/// Options fixed for the lifetime of an attached cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// log2 of the segment size in sectors (4..=11).
    pub segment_size_order: u8,
    /// Number of in-memory staging buffers.
    pub nr_rambuf_pool: usize,
    /// Read-ahead cells per generation (1..=2048).
    pub nr_read_cache_cells: u32,
    /// Initial values of the runtime tunables.
    pub tunables: Tunables,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            segment_size_order: 10,
            nr_rambuf_pool: 8,
            nr_read_cache_cells: MAX_READ_CACHE_CELLS,
            tunables: Tunables::default(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn with_segment_size_order(mut self, order: u8) -> Self {
        self.segment_size_order = order;
        self
    }

    #[must_use]
    pub fn with_rambuf_pool(mut self, buffers: usize) -> Self {
        self.nr_rambuf_pool = buffers;
        self
    }

    #[must_use]
    pub fn with_read_cache_cells(mut self, cells: u32) -> Self {
        self.nr_read_cache_cells = cells;
        self
    }

    #[must_use]
    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_SEGMENT_ORDER..=MAX_SEGMENT_ORDER).contains(&self.segment_size_order) {
            return Err(out_of_range(
                "segment_size_order",
                u64::from(self.segment_size_order),
                u64::from(MIN_SEGMENT_ORDER),
                u64::from(MAX_SEGMENT_ORDER),
            ));
        }
        if self.nr_rambuf_pool == 0 {
            return Err(CacheError::InvalidGeometry(
                "nr_rambuf_pool must be > 0".to_owned(),
            ));
        }
        if !(1..=MAX_READ_CACHE_CELLS).contains(&self.nr_read_cache_cells) {
            return Err(out_of_range(
                "nr_read_cache_cells",
                u64::from(self.nr_read_cache_cells),
                1,
                u64::from(MAX_READ_CACHE_CELLS),
            ));
        }
        self.tunables.validate()
    }
}

/// Knobs the operator may change while the cache is attached (except
/// `write_around_mode`, which is chosen at attach time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunables {
    /// Sequential read-miss runs longer than this are not cached. 0 disables
    /// read-ahead caching altogether.
    pub read_cache_threshold: u32,
    /// Writes bypass the cache and go straight to the backing device.
    pub write_around_mode: bool,
    /// Whether the migration worker may write dirty lines back.
    pub allow_migrate: bool,
    /// Flushed segments migrated per batch before one backing-device sync.
    pub nr_max_batched_migration: u32,
    /// Pending barriers force a partial segment flush after this long.
    pub barrier_deadline_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            read_cache_threshold: 0,
            write_around_mode: false,
            allow_migrate: true,
            nr_max_batched_migration: MAX_BATCHED_MIGRATION,
            barrier_deadline_ms: 10,
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if self.read_cache_threshold > MAX_READ_CACHE_THRESHOLD {
            return Err(out_of_range(
                "read_cache_threshold",
                u64::from(self.read_cache_threshold),
                0,
                u64::from(MAX_READ_CACHE_THRESHOLD),
            ));
        }
        if !(1..=MAX_BATCHED_MIGRATION).contains(&self.nr_max_batched_migration) {
            return Err(out_of_range(
                "nr_max_batched_migration",
                u64::from(self.nr_max_batched_migration),
                1,
                u64::from(MAX_BATCHED_MIGRATION),
            ));
        }
        if !(1..=MAX_BARRIER_DEADLINE_MS).contains(&self.barrier_deadline_ms) {
            return Err(out_of_range(
                "barrier_deadline_ms",
                self.barrier_deadline_ms,
                1,
                MAX_BARRIER_DEADLINE_MS,
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn barrier_deadline(&self) -> Duration {
        Duration::from_millis(self.barrier_deadline_ms)
    }

    /// Apply one `<key> <value>` operator message.
    ///
    /// The receiver is left untouched when the value is rejected.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "read_cache_threshold" => {
                self.read_cache_threshold = u32::try_from(parse_ranged(
                    key,
                    value,
                    0,
                    u64::from(MAX_READ_CACHE_THRESHOLD),
                )?)
                .map_err(|_| CacheError::InvalidArgument(format!("{key}={value}")))?;
            }
            "allow_migrate" => {
                self.allow_migrate = parse_ranged(key, value, 0, 1)? == 1;
            }
            "nr_max_batched_migration" => {
                self.nr_max_batched_migration = u32::try_from(parse_ranged(
                    key,
                    value,
                    1,
                    u64::from(MAX_BATCHED_MIGRATION),
                )?)
                .map_err(|_| CacheError::InvalidArgument(format!("{key}={value}")))?;
            }
            "barrier_deadline_ms" => {
                self.barrier_deadline_ms = parse_ranged(key, value, 1, MAX_BARRIER_DEADLINE_MS)?;
            }
            "write_around_mode" | "nr_read_cache_cells" | "segment_size_order"
            | "nr_rambuf_pool" => return Err(CacheError::StaticOption(key.to_owned())),
            _ => {
                return Err(CacheError::InvalidArgument(format!(
                    "unknown tunable {key:?}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_ranged(key: &str, value: &str, min: u64, max: u64) -> Result<u64> {
    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|_| CacheError::InvalidArgument(format!("{key}: {value:?} is not a number")))?;
    if !(min..=max).contains(&parsed) {
        return Err(out_of_range(key, parsed, min, max));
    }
    Ok(parsed)
}

fn out_of_range(name: &str, value: u64, min: u64, max: u64) -> CacheError {
    CacheError::OutOfRange {
        name: name.to_owned(),
        value,
        min,
        max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CacheConfig::default().validate().expect("default config");
    }

    #[test]
    fn geometry_bounds_are_enforced() {
        let too_small = CacheConfig::default().with_segment_size_order(3);
        assert!(matches!(
            too_small.validate(),
            Err(CacheError::OutOfRange { min: 4, max: 11, .. })
        ));
        let no_pool = CacheConfig::default().with_rambuf_pool(0);
        assert!(matches!(
            no_pool.validate(),
            Err(CacheError::InvalidGeometry(_))
        ));
        let too_many_cells = CacheConfig::default().with_read_cache_cells(4096);
        assert!(too_many_cells.validate().is_err());
    }

    #[test]
    fn apply_parses_and_range_checks() {
        let mut tunables = Tunables::default();
        tunables.apply("read_cache_threshold", "4").expect("threshold");
        assert_eq!(tunables.read_cache_threshold, 4);

        tunables.apply("allow_migrate", "0").expect("allow_migrate");
        assert!(!tunables.allow_migrate);

        tunables
            .apply("nr_max_batched_migration", " 7 ")
            .expect("batch");
        assert_eq!(tunables.nr_max_batched_migration, 7);

        let before = tunables.clone();
        assert!(matches!(
            tunables.apply("read_cache_threshold", "128"),
            Err(CacheError::OutOfRange { value: 128, .. })
        ));
        assert!(matches!(
            tunables.apply("nr_max_batched_migration", "zero"),
            Err(CacheError::InvalidArgument(_))
        ));
        assert_eq!(tunables, before);
    }

    #[test]
    fn static_and_unknown_keys_are_rejected() {
        let mut tunables = Tunables::default();
        assert!(matches!(
            tunables.apply("write_around_mode", "1"),
            Err(CacheError::StaticOption(_))
        ));
        assert!(matches!(
            tunables.apply("nr_read_cache_cells", "16"),
            Err(CacheError::StaticOption(_))
        ));
        assert!(matches!(
            tunables.apply("writeback_threshold", "50"),
            Err(CacheError::InvalidArgument(_))
        ));
    }
}
