#![forbid(unsafe_code)]

use lgc_block::{ByteDevice, FaultMode, FileByteDevice, MemoryByteDevice};
use lgc_core::{
    CacheConfig, CacheDevice, Disposition, IoContext, IoRequest, SegmentHeader, SegmentState,
    StatFlags, Target, Tunables,
};
use lgc_error::CacheError;
use lgc_types::{LINE_SIZE, SECTOR_SIZE, Sector, SectorMask, SegmentId};

/// Order 5: three lines per segment, 16 KiB regions.
const ORDER: u8 = 5;
const REGION_BYTES: usize = 32 * SECTOR_SIZE;
const BACKING_BYTES: usize = 1 << 20;

struct Rig {
    device: CacheDevice,
    backing: MemoryByteDevice,
    cache: MemoryByteDevice,
}

fn rig_with(tunables: Tunables, backing: MemoryByteDevice) -> Rig {
    let cache = MemoryByteDevice::new(9 * REGION_BYTES);
    let config = CacheConfig::default()
        .with_segment_size_order(ORDER)
        .with_tunables(tunables);
    let device = CacheDevice::attach(config, backing.clone(), cache.clone()).expect("attach");
    Rig {
        device,
        backing,
        cache,
    }
}

fn rig() -> Rig {
    rig_with(Tunables::default(), MemoryByteDevice::new(BACKING_BYTES))
}

fn rig_no_migrate() -> Rig {
    rig_with(
        Tunables {
            allow_migrate: false,
            ..Tunables::default()
        },
        MemoryByteDevice::new(BACKING_BYTES),
    )
}

/// Backing device whose every sector holds a recognisable pattern.
fn patterned_backing() -> MemoryByteDevice {
    let bytes = (0..BACKING_BYTES)
        .map(|i| ((i / SECTOR_SIZE) as u8).wrapping_mul(31) ^ 0x0F)
        .collect();
    MemoryByteDevice::from_bytes(bytes)
}

fn line_of(fill: u8) -> Vec<u8> {
    (0..LINE_SIZE)
        .map(|i| fill.wrapping_add((i / SECTOR_SIZE) as u8))
        .collect()
}

fn read_line(device: &CacheDevice, key: Sector) -> Vec<u8> {
    device
        .submit(&IoRequest::read(key, 8))
        .expect("read full line")
}

/// Rotate once per slot. Every slot gets reused, so each older segment must
/// have been migrated and have no I/O in flight.
fn cycle_ring(device: &CacheDevice) {
    for _ in 0..device.geometry().nr_segments {
        device.force_flush().expect("rotate");
    }
}

/// Bytes the backing device holds for the line at `key`.
fn backing_line(backing: &MemoryByteDevice, key: Sector) -> Vec<u8> {
    let at = key.0 as usize * SECTOR_SIZE;
    backing.snapshot()[at..at + LINE_SIZE].to_vec()
}

#[test]
fn full_write_then_read_never_touches_the_backing_device() {
    let Rig {
        device,
        backing,
        cache,
    } = rig();
    let key = Sector(64);
    let data = line_of(0x40);
    device
        .submit(&IoRequest::write(key, data.clone()))
        .expect("write");
    backing.reset_stats();

    // On-buffer hit.
    assert_eq!(read_line(&device, key), data);

    // On-device hit with a full line: remapped to the cache device.
    device.force_flush().expect("flush");
    let remap = match device.handle(&IoRequest::read(key, 8)).expect("dispatch") {
        Disposition::Remapped(remap) => remap,
        other => panic!("expected a remap, got {other:?}"),
    };
    assert_eq!(remap.target, Target::Cache);
    assert_eq!(
        remap.context,
        IoContext::ReadSegment {
            id: SegmentId(1)
        }
    );
    let mut buf = vec![0_u8; LINE_SIZE];
    cache
        .read_exact_at(remap.sector.to_byte_offset().expect("offset"), &mut buf)
        .expect("cache read");
    device.end_io(remap.context, Some(&buf));
    assert_eq!(blake3::hash(&buf), blake3::hash(&data));

    assert_eq!(backing.stats().reads, 0);
    let stats = device.stats();
    let full_write_miss = StatFlags {
        write: true,
        fullsize: true,
        ..StatFlags::default()
    };
    let full_read_buffer_hit = StatFlags {
        hit: true,
        on_buffer: true,
        fullsize: true,
        ..StatFlags::default()
    };
    let full_read_device_hit = StatFlags {
        hit: true,
        fullsize: true,
        ..StatFlags::default()
    };
    assert_eq!(stats.get(full_write_miss), 1);
    assert_eq!(stats.get(full_read_buffer_hit), 1);
    assert_eq!(stats.get(full_read_device_hit), 1);
    assert_eq!(stats.non_full_flushed, 1);
    device.detach().expect("detach");
}

#[test]
fn partial_write_into_a_migrated_clean_line_keeps_the_backing_data() {
    let Rig {
        device, backing, ..
    } = rig_with(Tunables::default(), patterned_backing());
    let key = Sector(128);
    let old = line_of(0x10);
    device
        .submit(&IoRequest::write(key, old.clone()))
        .expect("full write");
    device.drain_dirty().expect("drain");
    let info = device.inspect_line(key).expect("still cached");
    assert_eq!(info.data_bits, SectorMask::FULL);
    assert!(info.dirty_bits.is_empty());

    let patch = vec![0xEE_u8; SECTOR_SIZE];
    device
        .submit(&IoRequest::write(Sector(key.0 + 2), patch.clone()))
        .expect("partial write");
    let info = device.inspect_line(key).expect("rewritten");
    assert!(info.on_buffer);
    assert_eq!(info.dirty_bits, SectorMask(0b0000_0100));

    backing.reset_stats();
    let mut expected = old;
    expected[2 * SECTOR_SIZE..3 * SECTOR_SIZE].copy_from_slice(&patch);
    assert_eq!(read_line(&device, key), expected);
    assert!(backing.stats().reads > 0);
    device.detach().expect("detach");
}

#[test]
fn filling_a_segment_rotates_and_persists_its_header() {
    let Rig { device, cache, .. } = rig_no_migrate();
    let keys: Vec<Sector> = (0..4).map(|i| Sector(8 * (10 + i))).collect();
    for (i, key) in keys.iter().enumerate() {
        device
            .submit(&IoRequest::write(*key, line_of(i as u8)))
            .expect("write");
    }
    let status = device.status();
    assert_eq!(status.current_id, SegmentId(2));
    assert_eq!(device.segments_in_state(SegmentState::Current), 1);

    device.force_flush().expect("flush");
    assert!(device.status().last_flushed_id >= SegmentId(2));

    let image = cache.snapshot();
    let header_at = REGION_BYTES;
    let header = SegmentHeader::decode_for(
        SegmentId(1),
        &image[header_at..header_at + LINE_SIZE],
    )
    .expect("segment 1 header");
    assert_eq!(header.id, SegmentId(1));
    let recorded: Vec<Option<Sector>> = header.entries.iter().map(|e| e.key).collect();
    assert_eq!(recorded, keys[..3].iter().copied().map(Some).collect::<Vec<_>>());
    assert!(header.entries.iter().all(|e| e.dirty_bits.is_full()));

    // Line 0 payload follows the header.
    assert_eq!(
        &image[header_at + LINE_SIZE..header_at + 2 * LINE_SIZE],
        &line_of(0)[..]
    );
    let stats = device.stats();
    assert_eq!(stats.non_full_flushed, 1);
    device.detach().expect("detach");
}

#[test]
fn dirty_bits_accumulate_and_clear_once_on_migration() {
    let Rig {
        device, backing, ..
    } = rig_no_migrate();
    let key = Sector(256);
    let first = vec![0xA1_u8; SECTOR_SIZE];
    let second = vec![0xB2_u8; 2 * SECTOR_SIZE];
    device
        .submit(&IoRequest::write(Sector(key.0 + 1), first.clone()))
        .expect("write 1");
    device
        .submit(&IoRequest::write(Sector(key.0 + 5), second.clone()))
        .expect("write 2");

    let info = device.inspect_line(key).expect("cached");
    assert_eq!(info.dirty_bits, SectorMask(0b0110_0010));
    assert_eq!(device.status().nr_dirty_lines, 1);

    device.drain_dirty().expect("drain");
    let status = device.status();
    assert_eq!(status.nr_dirty_lines, 0);
    assert!(!status.tunables.allow_migrate);
    let info = device.inspect_line(key).expect("still cached");
    assert!(info.dirty_bits.is_empty());
    assert_eq!(info.data_bits, SectorMask(0b0110_0010));

    let image = backing.snapshot();
    let at = |sector: u64| (sector as usize) * SECTOR_SIZE;
    assert_eq!(&image[at(key.0 + 1)..at(key.0 + 2)], &first[..]);
    assert_eq!(&image[at(key.0 + 5)..at(key.0 + 7)], &second[..]);
    assert!(image[at(key.0)..at(key.0 + 1)].iter().all(|b| *b == 0));

    // A second drain has nothing to do.
    device.drain_dirty().expect("idle drain");
    device.detach().expect("detach");
}

#[test]
fn buffer_and_device_reads_return_identical_bytes() {
    let Rig { device, .. } = rig_with(Tunables::default(), patterned_backing());
    let full = Sector(512);
    let partial = Sector(520);
    device
        .submit(&IoRequest::write(full, line_of(0x77)))
        .expect("full write");
    device
        .submit(&IoRequest::write(partial, vec![0x99; 4 * SECTOR_SIZE]))
        .expect("partial write");

    let before_full = blake3::hash(&read_line(&device, full));
    let before_partial = blake3::hash(&read_line(&device, partial));
    let before_tail = device
        .submit(&IoRequest::read(Sector(partial.0 + 3), 3))
        .expect("sub-line read");

    device.force_flush().expect("flush");
    assert!(!device.inspect_line(full).expect("cached").on_buffer);

    assert_eq!(blake3::hash(&read_line(&device, full)), before_full);
    assert_eq!(blake3::hash(&read_line(&device, partial)), before_partial);
    assert_eq!(
        device
            .submit(&IoRequest::read(Sector(partial.0 + 3), 3))
            .expect("sub-line read"),
        before_tail
    );
    device.detach().expect("detach");
}

#[test]
fn partial_write_over_a_dirty_on_device_line_merges_old_data() {
    let Rig {
        device, backing, ..
    } = rig_no_migrate();
    let key = Sector(1024);
    let old = line_of(0x30);
    device
        .submit(&IoRequest::write(key, old.clone()))
        .expect("full write");
    device.force_flush().expect("flush");
    let before = device.inspect_line(key).expect("cached");
    assert!(!before.on_buffer);

    let patch = vec![0x5C_u8; SECTOR_SIZE];
    device
        .submit(&IoRequest::write(Sector(key.0 + 3), patch.clone()))
        .expect("partial write");
    let after = device.inspect_line(key).expect("cached");
    assert!(after.on_buffer);
    assert_ne!(after.line, before.line);
    assert_eq!(after.dirty_bits, SectorMask::FULL);
    assert_eq!(device.status().nr_dirty_lines, 1);

    backing.reset_stats();
    let mut expected = old;
    expected[3 * SECTOR_SIZE..4 * SECTOR_SIZE].copy_from_slice(&patch);
    assert_eq!(read_line(&device, key), expected);
    assert_eq!(backing.stats().reads, 0);
    device.detach().expect("detach");
}

#[test]
fn barriers_resolve_after_a_synced_flush() {
    let Rig { device, cache, .. } = rig();
    cache.reset_stats();
    device
        .submit(&IoRequest::write(Sector(16), line_of(1)).with_fua())
        .expect("fua write");
    assert!(device.status().last_flushed_id >= SegmentId(1));
    assert!(cache.stats().syncs >= 1);

    let ticket = match device.handle(&IoRequest::flush()).expect("dispatch") {
        Disposition::Deferred(ticket) => ticket,
        other => panic!("expected a deferred barrier, got {other:?}"),
    };
    ticket.wait().expect("flush barrier");
    assert!(ticket.is_resolved());
    device.detach().expect("detach");
}

#[test]
fn failed_flushes_reach_barriers_readers_and_drain() {
    let Rig { device, cache, .. } = rig();
    let key = Sector(24);
    device
        .submit(&IoRequest::write(key, line_of(2)))
        .expect("write lands in RAM");
    cache.set_fault(FaultMode::FailWrites);

    let err = device
        .submit(&IoRequest::flush())
        .expect_err("flush cannot be durable");
    assert!(matches!(err, CacheError::FlushFailed { segment: 1, .. }), "{err:?}");

    let err = device
        .submit(&IoRequest::read(key, 8))
        .expect_err("line never reached the cache device");
    assert!(matches!(err, CacheError::FlushFailed { .. }), "{err:?}");

    let err = device.drain_dirty().expect_err("cannot migrate");
    assert!(matches!(err, CacheError::MigrationFailed { segment: 1, .. }), "{err:?}");
    assert!(!device.status().failed);
}

#[test]
fn failed_merge_read_back_leaves_the_old_line_in_place() {
    let Rig { device, cache, .. } = rig_no_migrate();
    let key = Sector(64);
    device
        .submit(&IoRequest::write(key, line_of(5)))
        .expect("write");
    device.force_flush().expect("flush");
    let before = device.inspect_line(key).expect("cached line");
    assert!(!before.on_buffer);
    assert_eq!(before.dirty_bits, SectorMask::FULL);

    cache.set_fault(FaultMode::FailReads);
    let err = device
        .submit(&IoRequest::write(Sector(key.0 + 2), vec![0xEE; SECTOR_SIZE]))
        .expect_err("old dirty data is unreadable");
    assert!(matches!(err, CacheError::Io(_)), "{err:?}");
    assert_eq!(device.inspect_line(key), Some(before));
    assert_eq!(device.status().nr_dirty_lines, 1);
    assert!(!device.status().failed);

    cache.set_fault(FaultMode::Healthy);
    cycle_ring(&device);
    assert!(device.inspect_line(key).is_none());
    assert_eq!(read_line(&device, key), line_of(5));
    device.detach().expect("detach");
}

#[test]
fn failed_backing_fill_of_an_on_buffer_line_is_retryable() {
    let Rig {
        device, backing, ..
    } = rig_with(
        Tunables {
            allow_migrate: false,
            ..Tunables::default()
        },
        patterned_backing(),
    );
    let key = Sector(72);
    let mut expected = backing_line(&backing, key);
    let head = vec![0x5A_u8; SECTOR_SIZE];
    device
        .submit(&IoRequest::write(key, head.clone()))
        .expect("partial write");
    let before = device.inspect_line(key).expect("cached line");
    assert!(before.on_buffer);

    backing.set_fault(FaultMode::FailReads);
    let err = device
        .submit(&IoRequest::read(key, 8))
        .expect_err("uncached sectors are unreadable");
    assert!(matches!(err, CacheError::Io(_)), "{err:?}");
    assert_eq!(device.inspect_line(key), Some(before));
    assert!(!device.status().failed);

    backing.set_fault(FaultMode::Healthy);
    expected[..SECTOR_SIZE].copy_from_slice(&head);
    assert_eq!(read_line(&device, key), expected);
    // Sealing waits for the current segment's in-flight I/O.
    device.force_flush().expect("flush");
    device.detach().expect("detach");
}

#[test]
fn failed_cache_read_of_an_on_device_partial_line_is_retryable() {
    let Rig {
        device,
        backing,
        cache,
    } = rig_with(
        Tunables {
            allow_migrate: false,
            ..Tunables::default()
        },
        patterned_backing(),
    );
    let key = Sector(96);
    let mut expected = backing_line(&backing, key);
    let head = vec![0xC3_u8; 2 * SECTOR_SIZE];
    device
        .submit(&IoRequest::write(key, head.clone()))
        .expect("partial write");
    device.force_flush().expect("flush");
    let before = device.inspect_line(key).expect("cached line");
    assert!(!before.on_buffer);
    assert_eq!(before.data_bits, SectorMask(0b0000_0011));

    cache.set_fault(FaultMode::FailReads);
    let err = device
        .submit(&IoRequest::read(key, 8))
        .expect_err("dirty sectors are unreadable");
    assert!(matches!(err, CacheError::Io(_)), "{err:?}");
    assert_eq!(device.inspect_line(key), Some(before));

    cache.set_fault(FaultMode::Healthy);
    expected[..head.len()].copy_from_slice(&head);
    assert_eq!(read_line(&device, key), expected);
    cycle_ring(&device);
    assert_eq!(backing_line(&backing, key), expected);
    device.detach().expect("detach");
}

#[test]
fn operator_messages() {
    let Rig { device, .. } = rig_no_migrate();
    device
        .submit(&IoRequest::write(Sector(40), line_of(3)))
        .expect("write");
    device.force_flush().expect("flush");
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(device.status().nr_dirty_lines, 1);

    device.message(&["drop_caches"]).expect("drop_caches");
    assert_eq!(device.status().nr_dirty_lines, 0);

    assert!(device.stats().total_lookups() > 0);
    device.message(&["clear_stat"]).expect("clear_stat");
    assert_eq!(device.stats().total_lookups(), 0);

    device
        .message(&["barrier_deadline_ms", "250"])
        .expect("deadline");
    assert_eq!(device.tunables().barrier_deadline_ms, 250);
    let err = device
        .message(&["nr_max_batched_migration", "33"])
        .expect_err("out of range");
    assert!(matches!(err, CacheError::OutOfRange { .. }), "{err:?}");
    assert_eq!(device.tunables().nr_max_batched_migration, 32);

    let json = serde_json::to_value(device.status()).expect("status serialises");
    assert_eq!(json["nr_dirty_lines"], 0);
    assert_eq!(json["tunables"]["barrier_deadline_ms"], 250);
    device.detach().expect("detach");
}

#[test]
fn write_around_mode_bypasses_the_cache() {
    let Rig {
        device,
        backing,
        cache,
    } = rig_with(
        Tunables {
            write_around_mode: true,
            ..Tunables::default()
        },
        MemoryByteDevice::new(BACKING_BYTES),
    );
    let key = Sector(80);
    let data = line_of(0x21);
    match device
        .handle(&IoRequest::write(key, data.clone()))
        .expect("dispatch")
    {
        Disposition::Remapped(remap) => {
            assert_eq!(remap.target, Target::Backing);
            assert_eq!(remap.sector, key);
            assert_eq!(remap.context, IoContext::None);
            device.end_io(remap.context, None);
        }
        other => panic!("expected a remap, got {other:?}"),
    }

    cache.reset_stats();
    device
        .submit(&IoRequest::write(key, data.clone()).with_fua())
        .expect("write around");
    assert!(device.inspect_line(key).is_none());
    assert_eq!(read_line(&device, key), data);
    let at = key.0 as usize * SECTOR_SIZE;
    assert_eq!(&backing.snapshot()[at..at + LINE_SIZE], &data[..]);
    assert_eq!(cache.stats().writes, 0);
    assert_eq!(device.status().nr_dirty_lines, 0);
    device.detach().expect("detach");
}

#[test]
fn requests_are_validated() {
    let Rig { device, .. } = rig();
    let crossing = IoRequest::write(Sector(6), vec![0; 4 * SECTOR_SIZE]);
    assert!(matches!(
        device.submit(&crossing),
        Err(CacheError::InvalidRequest(_))
    ));
    let beyond = IoRequest::read(Sector((BACKING_BYTES / SECTOR_SIZE) as u64), 1);
    assert!(device.submit(&beyond).is_err());
    assert_eq!(device.stats().total_lookups(), 0);
    device.detach().expect("detach");
}

#[test]
fn file_backed_devices_survive_detach() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backing_path = dir.path().join("backing.img");
    let cache_path = dir.path().join("cache.img");
    let backing =
        FileByteDevice::create(&backing_path, BACKING_BYTES as u64).expect("backing file");
    let cache = FileByteDevice::create(&cache_path, 9 * REGION_BYTES as u64).expect("cache file");

    let config = CacheConfig::default().with_segment_size_order(ORDER);
    let device = CacheDevice::attach(config, backing, cache).expect("attach");
    let key = Sector(96);
    let data = line_of(0x6B);
    device
        .submit(&IoRequest::write(key, data.clone()))
        .expect("write");
    device.drain_dirty().expect("drain");
    assert_eq!(read_line(&device, key), data);
    device.detach().expect("detach");

    let reopened = FileByteDevice::open(&backing_path).expect("reopen");
    let mut buf = vec![0_u8; LINE_SIZE];
    reopened
        .read_exact_at(key.to_byte_offset().expect("offset"), &mut buf)
        .expect("read back");
    assert_eq!(buf, data);
}

#[test]
fn detach_resolves_pending_barriers() {
    let Rig { device, .. } = rig();
    let pending = match device.handle(&IoRequest::flush()).expect("dispatch") {
        Disposition::Deferred(ticket) => ticket,
        other => panic!("expected a deferred barrier, got {other:?}"),
    };
    device.detach().expect("detach");
    assert!(pending.is_resolved());
    assert!(pending.wait().is_ok());
}
