//! Transaction throughput microbenchmarks: uncontended commit paths and
//! the allocation lifecycle.

use criterion::{criterion_group, criterion_main, Criterion};
use txmem::{Mode, Region};

fn bench_rw_commit(c: &mut Criterion) {
    let region = Region::new(4096, 8).expect("region");
    let start = region.start();
    let payload = [0xAB_u8; 64];

    c.bench_function("rw_commit_single_write_64b", |b| {
        b.iter(|| {
            let mut tx = region.begin(Mode::ReadWrite);
            tx.write(&payload, start).expect("write");
            tx.commit().expect("commit");
        });
    });

    c.bench_function("rw_commit_eight_writes_64b", |b| {
        b.iter(|| {
            let mut tx = region.begin(Mode::ReadWrite);
            for chunk in 0..8_usize {
                let dst = start.checked_add(chunk * 64).expect("addr");
                tx.write(&payload, dst).expect("write");
            }
            tx.commit().expect("commit");
        });
    });
}

fn bench_read_only_scan(c: &mut Criterion) {
    let region = Region::new(4096, 8).expect("region");
    let start = region.start();

    c.bench_function("ro_scan_4k", |b| {
        let mut out = [0_u8; 4096];
        b.iter(|| {
            let mut tx = region.begin(Mode::ReadOnly);
            tx.read(start, &mut out).expect("read");
            tx.commit().expect("commit");
        });
    });
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let region = Region::new(4096, 8).expect("region");

    c.bench_function("alloc_write_free_256b", |b| {
        let payload = [0x5A_u8; 256];
        b.iter(|| {
            let mut tx = region.begin(Mode::ReadWrite);
            let addr = tx.alloc(256).expect("alloc");
            tx.write(&payload, addr).expect("write");
            tx.commit().expect("commit");

            let mut tx = region.begin(Mode::ReadWrite);
            tx.write(&payload[..8], addr).expect("intent write");
            tx.free(addr).expect("free");
            tx.commit().expect("commit");
        });
    });
}

criterion_group!(
    benches,
    bench_rw_commit,
    bench_read_only_scan,
    bench_alloc_free_cycle
);
criterion_main!(benches);
