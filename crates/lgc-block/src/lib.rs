#![forbid(unsafe_code)]
//! Block device layer for LogCache.
//!
//! Provides the `ByteDevice` trait used for both the cache device and the
//! backing device, a file-backed implementation, an in-memory implementation
//! with I/O counters and fault injection, and sector-addressed helpers.

mod mem;

pub use mem::{FaultMode, IoStats, MemoryByteDevice};

use lgc_error::{CacheError, Result};
use lgc_types::{SECTOR_SIZE, Sector};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Check that `[offset, offset + len)` lies inside a device of `dev_len` bytes.
pub(crate) fn check_range(op: &str, offset: u64, len: usize, dev_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| CacheError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| CacheError::Format(format!("{op} range overflows u64")))?;
    if end > dev_len {
        return Err(CacheError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={dev_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not share a seek position, so one
/// handle serves the dispatcher and every background worker.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing file or block device read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) a regular file of `len` bytes and open it.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    #[must_use]
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Sector-addressed helpers over any [`ByteDevice`].
pub trait SectorIo: ByteDevice {
    /// Device length in whole sectors.
    fn len_sectors(&self) -> u64 {
        self.len_bytes() / SECTOR_SIZE as u64
    }

    /// Read `buf.len()` bytes starting at `sector`. `buf` must be sector-sized.
    fn read_sectors(&self, sector: Sector, buf: &mut [u8]) -> Result<()> {
        let offset = sector_offset(sector, buf.len())?;
        self.read_exact_at(offset, buf)
    }

    /// Write `buf` starting at `sector`. `buf` must be sector-sized.
    fn write_sectors(&self, sector: Sector, buf: &[u8]) -> Result<()> {
        let offset = sector_offset(sector, buf.len())?;
        self.write_all_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> SectorIo for D {}

fn sector_offset(sector: Sector, len: usize) -> Result<u64> {
    if len % SECTOR_SIZE != 0 {
        return Err(CacheError::Format(format!(
            "buffer length {len} is not a multiple of {SECTOR_SIZE}"
        )));
    }
    sector
        .to_byte_offset()
        .ok_or_else(|| CacheError::Format(format!("sector {sector} overflows byte offset")))
}
