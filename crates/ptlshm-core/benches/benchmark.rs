//! Performance benchmarks for ptlshm
//!
//! Run with: cargo bench --package ptlshm-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ptlshm_core::loopback::LoopbackFabric;
use ptlshm_core::params::page_size;
use ptlshm_core::shm::SharedMemory;
use ptlshm_core::{
    bootstrap, BootstrapConfig, InitBarrier, LaunchParams, RawInterface, RegionLayout,
};
use std::thread;
use std::time::SystemTime;

fn unique_name() -> String {
    let ts = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("/ptlshm_bench_{}", ts)
}

fn launch(buf: usize) -> (SharedMemory, String) {
    let name = unique_name();
    let layout = RegionLayout::new(page_size(), 1, buf).unwrap();
    (SharedMemory::create(&name, layout.total_size()).unwrap(), name)
}

fn bench_init_cycle(c: &mut Criterion) {
    let (_launcher, name) = launch(65536);
    let barrier = InitBarrier::new();

    c.bench_function("init_cycle", |b| {
        b.iter(|| {
            let guard = barrier
                .acquire_with(|| LaunchParams::new(&name, 1, 0, 65536))
                .unwrap();
            black_box(guard.num_siblings());
        });
    });
}

fn bench_follower_acquire(c: &mut Criterion) {
    let (_launcher, name) = launch(4096);
    let barrier = InitBarrier::new();
    let _leader = barrier
        .acquire_with(|| LaunchParams::new(&name, 1, 0, 4096))
        .unwrap();

    let mut group = c.benchmark_group("follower");
    group.bench_function("acquire_release", |b| {
        b.iter(|| {
            let guard = barrier
                .acquire_with(|| LaunchParams::new(&name, 1, 0, 4096))
                .unwrap();
            black_box(guard.rank());
        });
    });
    group.bench_function("join_release", |b| {
        b.iter(|| {
            let guard = barrier.join().unwrap();
            black_box(guard.rank());
        });
    });
    group.finish();
}

fn bench_bootstrap(c: &mut Criterion) {
    let mut group = c.benchmark_group("bootstrap");
    group.sample_size(20);

    for size in [2usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| {
                let fabric = LoopbackFabric::new();
                let nis: Vec<_> = (0..size).map(|_| fabric.open(0)).collect();
                let collector = nis[0].id();
                thread::scope(|s| {
                    for (rank, ni) in nis.into_iter().enumerate() {
                        let fabric = &fabric;
                        s.spawn(move || {
                            let config = BootstrapConfig::new(size, rank, collector).unwrap();
                            if rank != 0 {
                                fabric.wait_for_receive(collector);
                            }
                            black_box(bootstrap(ni, &config).unwrap());
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_init_cycle,
    bench_follower_acquire,
    bench_bootstrap
);
criterion_main!(benches);
