//! Translation-cache lookup benchmarks.
//!
//! Measures the three lookup tiers the executor hot path can take:
//! hot-cache hit, interval-map hit (first stab, pre-promotion), and miss.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use vortex_cache::{IntervalMap, TranslationCache};

fn populated_cache(ranges: u64) -> TranslationCache<u64> {
    let cache = TranslationCache::new(4096);
    for i in 0..ranges {
        cache.try_add(i * 0x40, 0x40, i);
    }
    cache
}

fn bench_hot_hit(c: &mut Criterion) {
    let cache = populated_cache(1024);
    // Warm the hot layer.
    for i in 0..1024u64 {
        cache.try_get(i * 0x40);
    }
    c.bench_function("try_get/hot_hit", |b| {
        let mut addr = 0u64;
        b.iter(|| {
            addr = (addr + 0x40) & 0xffff;
            black_box(cache.try_get(black_box(addr)))
        });
    });
}

fn bench_map_stab(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_map/stab");
    for size in [64u64, 1024, 16384] {
        let mut map = IntervalMap::new();
        for i in 0..size {
            map.add_or_update(i * 0x40, i * 0x40 + 0x40, i, None).unwrap();
        }
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut i = 0u64;
            b.iter(|| {
                i = (i + 7) % size;
                black_box(map.try_get(black_box(i * 0x40 + 0x20)))
            });
        });
    }
    group.finish();
}

fn bench_miss(c: &mut Criterion) {
    let cache = populated_cache(1024);
    c.bench_function("try_get/miss", |b| {
        b.iter(|| black_box(cache.try_get(black_box(0xdead_0000))));
    });
}

criterion_group!(benches, bench_hot_hit, bench_map_stab, bench_miss);
criterion_main!(benches);
