#![forbid(unsafe_code)]
//! Error types for LogCache.
//!
//! # Error Taxonomy
//!
//! LogCache uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `lgc-types` | Segment header bytes that do not decode |
//! | Runtime | `CacheError` | `lgc-error` (this crate) | Errors returned to request submitters and the operator layer |
//!
//! `lgc-error` does not depend on `lgc-types`. The conversion from
//! `ParseError` to `CacheError` lives in `lgc-core`, which depends on both.
//!
//! ## Fatal vs. per-request errors
//!
//! Most variants fail one request and leave the cache usable. Two are fatal:
//! `InvariantViolation` (the engine found state it must never reach, such as
//! a dirty line in a segment slot that is about to be reused) and
//! `MigrationFailed` observed while reusing a slot. After a fatal error the
//! device is marked failed and every later request gets `DeviceFailed`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`CacheError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error or `EIO` |
//! | `Corruption` | `EIO` |
//! | `FlushFailed` | `EIO` |
//! | `MigrationFailed` | `EIO` |
//! | `InvariantViolation` | `EIO` |
//! | `DeviceFailed` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidRequest` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `StaticOption` | `EPERM` |
//! | `OutOfRange` | `ERANGE` |
//! | `Detached` | `ENODEV` |

use thiserror::Error;

/// Unified error type for all LogCache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment metadata read back from the cache device does not decode.
    #[error("corrupt segment {segment}: {detail}")]
    Corruption { segment: u64, detail: String },

    /// Invalid device or buffer shape (bad length, out-of-bounds access).
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the caller.
    #[error("parse error: {0}")]
    Parse(String),

    /// Cache geometry derived from the configuration or device sizes is unusable.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A request that the dispatcher cannot accept as-is (crosses a line
    /// boundary, wrong payload length, past the end of the backing device).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed operator message or tunable value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Tunable that can only be chosen at attach time.
    #[error("{0} is a static option")]
    StaticOption(String),

    /// Tunable value outside its accepted range.
    #[error("{name}={value} out of range {min}..={max}")]
    OutOfRange {
        name: String,
        value: u64,
        min: u64,
        max: u64,
    },

    /// The durable flush of a sealed segment failed.
    #[error("flush of segment {segment} failed: {detail}")]
    FlushFailed { segment: u64, detail: String },

    /// Writing a segment's dirty lines back to the backing device failed.
    #[error("migration of segment {segment} failed: {detail}")]
    MigrationFailed { segment: u64, detail: String },

    /// Internal consistency check failed; the device stops serving I/O.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A previous fatal error stopped the device.
    #[error("cache device failed")]
    DeviceFailed,

    /// The cache device has been detached.
    #[error("cache device detached")]
    Detached,
}

impl CacheError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive. Adding a variant without updating this
    /// function is a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. }
            | Self::FlushFailed { .. }
            | Self::MigrationFailed { .. }
            | Self::InvariantViolation(_)
            | Self::DeviceFailed => libc::EIO,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidRequest(_)
            | Self::InvalidArgument(_) => libc::EINVAL,
            Self::StaticOption(_) => libc::EPERM,
            Self::OutOfRange { .. } => libc::ERANGE,
            Self::Detached => libc::ENODEV,
        }
    }

    /// Whether this error stops the device for all later requests.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvariantViolation(_) | Self::MigrationFailed { .. } | Self::DeviceFailed
        )
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CacheError, libc::c_int)> = vec![
            (CacheError::Io(std::io::Error::other("test")), libc::EIO),
            (
                CacheError::Corruption {
                    segment: 3,
                    detail: "crc".into(),
                },
                libc::EIO,
            ),
            (CacheError::Format("test".into()), libc::EINVAL),
            (CacheError::Parse("test".into()), libc::EINVAL),
            (CacheError::InvalidGeometry("order=3".into()), libc::EINVAL),
            (CacheError::InvalidRequest("span".into()), libc::EINVAL),
            (CacheError::InvalidArgument("key".into()), libc::EINVAL),
            (
                CacheError::StaticOption("write_around_mode".into()),
                libc::EPERM,
            ),
            (
                CacheError::OutOfRange {
                    name: "read_cache_threshold".into(),
                    value: 200,
                    min: 0,
                    max: 127,
                },
                libc::ERANGE,
            ),
            (
                CacheError::FlushFailed {
                    segment: 1,
                    detail: "eio".into(),
                },
                libc::EIO,
            ),
            (
                CacheError::MigrationFailed {
                    segment: 1,
                    detail: "eio".into(),
                },
                libc::EIO,
            ),
            (CacheError::InvariantViolation("dirty".into()), libc::EIO),
            (CacheError::DeviceFailed, libc::EIO),
            (CacheError::Detached, libc::ENODEV),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(CacheError::Io(raw).to_errno(), libc::ENOSPC);
    }

    #[test]
    fn display_formatting() {
        let err = CacheError::FlushFailed {
            segment: 42,
            detail: "short write".into(),
        };
        assert_eq!(err.to_string(), "flush of segment 42 failed: short write");

        let range = CacheError::OutOfRange {
            name: "nr_max_batched_migration".into(),
            value: 64,
            min: 1,
            max: 32,
        };
        assert_eq!(range.to_string(), "nr_max_batched_migration=64 out of range 1..=32");

        let stat = CacheError::StaticOption("nr_read_cache_cells".into());
        assert_eq!(stat.to_string(), "nr_read_cache_cells is a static option");
    }

    #[test]
    fn only_engine_stopping_errors_are_fatal() {
        assert!(CacheError::InvariantViolation("x".into()).is_fatal());
        assert!(CacheError::DeviceFailed.is_fatal());
        assert!(
            CacheError::MigrationFailed {
                segment: 1,
                detail: "x".into()
            }
            .is_fatal()
        );
        assert!(
            !CacheError::FlushFailed {
                segment: 1,
                detail: "x".into()
            }
            .is_fatal()
        );
        assert!(!CacheError::Io(std::io::Error::other("x")).is_fatal());
        assert!(!CacheError::InvalidRequest("x".into()).is_fatal());
    }
}
