//! In-memory byte device for tests and benchmarks.

use crate::{ByteDevice, check_range};
use lgc_error::{CacheError, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// I/O statistics collected by [`MemoryByteDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Total reads served.
    pub reads: u64,
    /// Total writes served.
    pub writes: u64,
    /// Total syncs served.
    pub syncs: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
}

/// Which operations an in-memory device should fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultMode {
    #[default]
    Healthy,
    FailReads,
    FailWrites,
    FailAll,
}

impl FaultMode {
    fn fails_reads(self) -> bool {
        matches!(self, Self::FailReads | Self::FailAll)
    }

    fn fails_writes(self) -> bool {
        matches!(self, Self::FailWrites | Self::FailAll)
    }
}

#[derive(Debug)]
struct MemInner {
    bytes: Mutex<Vec<u8>>,
    stats: Mutex<IoStats>,
    fault: Mutex<FaultMode>,
}

/// Shared in-memory device. Clones refer to the same storage, so a test can
/// hand one clone to the cache and keep another to inspect contents.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    inner: Arc<MemInner>,
}

impl MemoryByteDevice {
    /// Zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                bytes: Mutex::new(bytes),
                stats: Mutex::new(IoStats::default()),
                fault: Mutex::new(FaultMode::Healthy),
            }),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.bytes.lock().clone()
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        *self.inner.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.inner.stats.lock() = IoStats::default();
    }

    pub fn set_fault(&self, mode: FaultMode) {
        debug!(target: "lgc::block", ?mode, "memory device fault mode changed");
        *self.inner.fault.lock() = mode;
    }

    fn injected(op: &str) -> CacheError {
        CacheError::Io(std::io::Error::other(format!("injected {op} fault")))
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.inner.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.inner.fault.lock().fails_reads() {
            return Err(Self::injected("read"));
        }
        let bytes = self.inner.bytes.lock();
        check_range("read", offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| CacheError::Format("offset overflows usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);

        let mut stats = self.inner.stats.lock();
        stats.reads += 1;
        stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.inner.fault.lock().fails_writes() {
            return Err(Self::injected("write"));
        }
        let mut bytes = self.inner.bytes.lock();
        check_range("write", offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| CacheError::Format("offset overflows usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);

        let mut stats = self.inner.stats.lock();
        stats.writes += 1;
        stats.bytes_written += buf.len() as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.inner.fault.lock().fails_writes() {
            return Err(Self::injected("sync"));
        }
        self.inner.stats.lock().syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SectorIo;
    use lgc_types::Sector;

    #[test]
    fn clones_share_storage_and_stats() {
        let dev = MemoryByteDevice::new(4096);
        let view = dev.clone();
        dev.write_sectors(Sector(2), &[9_u8; 512]).expect("write");

        let mut buf = [0_u8; 512];
        view.read_sectors(Sector(2), &mut buf).expect("read");
        assert_eq!(buf, [9_u8; 512]);
        assert_eq!(
            view.stats(),
            IoStats {
                reads: 1,
                writes: 1,
                syncs: 0,
                bytes_read: 512,
                bytes_written: 512,
            }
        );
    }

    #[test]
    fn fault_modes_fail_selected_operations() {
        let dev = MemoryByteDevice::new(4096);
        let mut buf = [0_u8; 512];

        dev.set_fault(FaultMode::FailReads);
        assert!(dev.read_exact_at(0, &mut buf).is_err());
        dev.write_all_at(0, &buf).expect("writes still work");

        dev.set_fault(FaultMode::FailWrites);
        assert!(dev.write_all_at(0, &buf).is_err());
        assert!(dev.sync().is_err());
        dev.read_exact_at(0, &mut buf).expect("reads still work");

        dev.set_fault(FaultMode::Healthy);
        dev.sync().expect("healthy sync");
        assert_eq!(dev.stats().syncs, 1);
    }

    #[test]
    fn out_of_bounds_is_a_format_error() {
        let dev = MemoryByteDevice::new(1024);
        let err = dev.write_all_at(1000, &[0_u8; 100]).expect_err("oob");
        assert!(matches!(err, CacheError::Format(_)));
    }
}
