//! Benchmarks for bitmap backends and clone/merge

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ext2fs_rs::{BackendType, Bitmap, CloneFlags, Filesystem, FsParams, IoChannel, MemDevice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const BITS: u64 = 1 << 20;

fn filled(backend: BackendType, density: f64) -> Bitmap {
    let mut rng = StdRng::seed_from_u64(42);
    let mut map = Bitmap::generic(backend, 0, BITS - 1, "bench").unwrap();
    let mut i = 0;
    while i < BITS {
        let run = rng.gen_range(1..512u64).min(BITS - i);
        if rng.gen_bool(density) {
            map.mark_range(i, run).unwrap();
        }
        i += run;
    }
    map
}

fn benchmark_mark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap_mark_sequential");

    for backend in [BackendType::BitArray, BackendType::RbTree] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", backend)),
            &backend,
            |b, &backend| {
                b.iter(|| {
                    let mut map = Bitmap::generic(backend, 0, 65535, "bench").unwrap();
                    for i in 0..65536 {
                        map.mark(black_box(i)).unwrap();
                    }
                    map
                });
            },
        );
    }

    group.finish();
}

fn benchmark_test_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap_test_random");

    for backend in [BackendType::BitArray, BackendType::RbTree] {
        let map = filled(backend, 0.5);
        let mut rng = StdRng::seed_from_u64(7);
        let probes: Vec<u64> = (0..4096).map(|_| rng.gen_range(0..BITS)).collect();

        group.bench_function(format!("{:?}", backend), |b| {
            b.iter(|| probes.iter().filter(|&&i| map.test(i).unwrap()).count());
        });
    }

    group.finish();
}

fn benchmark_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitmap_merge");

    for density in [0.05, 0.5] {
        for backend in [BackendType::BitArray, BackendType::RbTree] {
            let src = filled(backend, density);
            let id = format!("{:?}/{}", backend, density);
            group.bench_function(id, |b| {
                b.iter(|| {
                    let mut dest = Bitmap::generic(backend, 0, BITS - 1, "dest").unwrap();
                    src.merge_into(&mut dest, None).unwrap();
                    dest
                });
            });
        }
    }

    group.finish();
}

fn benchmark_clone_merge(c: &mut Criterion) {
    let io = IoChannel::new("bench.img", MemDevice::new(0), 4096);
    let params = FsParams {
        block_size: 4096,
        ..FsParams::with_blocks(1 << 18)
    };
    let mut fs = Filesystem::initialize("bench.img", &params, io).unwrap();

    c.bench_function("fs_clone_merge_block_map", |b| {
        b.iter(|| {
            let mut child = fs.clone_fs(CloneFlags::BLOCK).unwrap();
            child.block_map_mut().unwrap().mark_range(200_000, 1000).unwrap();
            fs.merge_fs(child).unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_mark,
    benchmark_test_random,
    benchmark_merge,
    benchmark_clone_merge
);
criterion_main!(benches);
