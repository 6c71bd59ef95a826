//! Benchmarks for the tile cache hot paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use vtex_cache::cache::indirection::IndirectionTable;
use vtex_cache::cache::key::{ProtectedSet, TileKey};
use vtex_cache::cache::recency::RecencyTracker;
use vtex_cache::cache::slot::{PhysicalSlot, SlotAllocator};

fn bench_recency_touch(c: &mut Criterion) {
    let mut recency = RecencyTracker::with_capacity(65_536);
    for i in 0..65_536u32 {
        recency.touch(TileKey::new(i % 256, i / 256, 0));
    }

    let mut i = 0u32;
    c.bench_function("recency_touch_64k", |b| {
        b.iter(|| {
            i = i.wrapping_add(7919) % 65_536;
            recency.touch(black_box(TileKey::new(i % 256, i / 256, 0)));
        })
    });
}

fn bench_lookup_with_fallback(c: &mut Criterion) {
    // Only the mip-8 root is resident, so every lookup walks the full chain.
    let mut table = IndirectionTable::new(8);
    let root = TileKey::new(0, 0, 8);
    table.mark_loading(root, 0);
    table.bind(root, PhysicalSlot::new(0, 0), 0).unwrap();

    c.bench_function("lookup_with_fallback_8_levels", |b| {
        b.iter(|| {
            let hit = table.lookup_with_fallback(black_box(&TileKey::new(201, 77, 0)));
            black_box(hit);
        })
    });
}

fn bench_acquire_with_eviction(c: &mut Criterion) {
    let mut alloc = SlotAllocator::new(64);
    let mut recency = RecencyTracker::with_capacity(alloc.capacity());
    let protected = ProtectedSet::new();
    for x in 0..alloc.capacity() as u32 {
        let key = TileKey::new(x, 0, 0);
        alloc.acquire(key, &protected, &mut recency).unwrap();
        recency.touch(key);
    }

    let mut next = alloc.capacity() as u32;
    c.bench_function("acquire_evict_4k_slots", |b| {
        b.iter(|| {
            let key = TileKey::new(next, 1, 0);
            next += 1;
            let acquired = alloc.acquire(key, &protected, &mut recency).unwrap();
            recency.touch(key);
            black_box(acquired);
        })
    });
}

criterion_group!(
    benches,
    bench_recency_touch,
    bench_lookup_with_fallback,
    bench_acquire_with_eviction
);
criterion_main!(benches);
