#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use lgc_block::MemoryByteDevice;
use lgc_core::{CacheConfig, CacheDevice, IoRequest};
use lgc_types::{LINE_SIZE, Sector};

const BACKING_BYTES: usize = 64 << 20;
const CACHE_BYTES: usize = 16 << 20;

fn attach() -> CacheDevice {
    CacheDevice::attach(
        CacheConfig::default(),
        MemoryByteDevice::new(BACKING_BYTES),
        MemoryByteDevice::new(CACHE_BYTES),
    )
    .expect("attach in bench")
}

fn bench_dispatch(c: &mut Criterion) {
    let device = attach();
    let payload = vec![0x5A_u8; LINE_SIZE];
    let lines = (BACKING_BYTES / LINE_SIZE) as u64;

    let mut next = 0_u64;
    c.bench_function("write_fullsize_line", |b| {
        b.iter(|| {
            let sector = Sector((next % lines) * 8);
            next = next.wrapping_add(7);
            device
                .submit(black_box(&IoRequest::write(sector, payload.clone())))
                .expect("write in bench")
        });
    });

    let mut next = 0_u64;
    c.bench_function("write_partial_sector", |b| {
        b.iter(|| {
            let sector = Sector((next % lines) * 8 + 3);
            next = next.wrapping_add(13);
            device
                .submit(black_box(&IoRequest::write(sector, vec![0xA5; 512])))
                .expect("partial write in bench")
        });
    });

    for line in 0..64_u64 {
        device
            .submit(&IoRequest::write(Sector(line * 8), payload.clone()))
            .expect("warm write");
    }
    let mut next = 0_u64;
    c.bench_function("read_hit_fullsize", |b| {
        b.iter(|| {
            let sector = Sector((next % 64) * 8);
            next += 1;
            device
                .submit(black_box(&IoRequest::read(sector, 8)))
                .expect("read in bench")
        });
    });

    device.detach().expect("detach in bench");
}

criterion_group!(dispatch, bench_dispatch);
criterion_main!(dispatch);
