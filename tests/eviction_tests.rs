//! Integration tests for slot allocation and eviction order.

use vtex_cache::cache::indirection::IndirectionTable;
use vtex_cache::cache::key::{ProtectedSet, TileKey};
use vtex_cache::cache::recency::RecencyTracker;
use vtex_cache::cache::slot::{SlotAllocator, SlotError};

fn key(x: u32) -> TileKey {
    TileKey::new(x, 0, 0)
}

/// Acquire a slot for `k` and mark it most recently used.
fn place(alloc: &mut SlotAllocator, recency: &mut RecencyTracker, protected: &ProtectedSet, k: TileKey) -> Option<TileKey> {
    let acquired = alloc.acquire(k, protected, recency).unwrap();
    recency.touch(k);
    acquired.evicted
}

#[test]
fn test_eviction_order_follows_recency() {
    let mut alloc = SlotAllocator::new(2);
    let mut recency = RecencyTracker::new();
    let none = ProtectedSet::new();

    for x in 0..4 {
        assert_eq!(place(&mut alloc, &mut recency, &none, key(x)), None);
    }
    assert_eq!(alloc.free_count(), 0);

    // Touching key(0) makes key(1) the oldest.
    recency.touch(key(0));
    assert_eq!(place(&mut alloc, &mut recency, &none, key(10)), Some(key(1)));
    assert_eq!(place(&mut alloc, &mut recency, &none, key(11)), Some(key(2)));
    assert_eq!(place(&mut alloc, &mut recency, &none, key(12)), Some(key(3)));
    assert_eq!(place(&mut alloc, &mut recency, &none, key(13)), Some(key(0)));
    assert_eq!(alloc.allocated(), 4);
}

#[test]
fn test_eviction_skips_protected() {
    let mut alloc = SlotAllocator::new(2);
    let mut recency = RecencyTracker::new();
    let none = ProtectedSet::new();
    for x in 0..4 {
        place(&mut alloc, &mut recency, &none, key(x));
    }

    let protected: ProtectedSet = [key(0), key(1), key(9)].into_iter().collect();
    assert_eq!(place(&mut alloc, &mut recency, &protected, key(9)), Some(key(2)));
    assert!(alloc.slot_of(&key(0)).is_some());
    assert!(alloc.slot_of(&key(1)).is_some());
}

#[test]
fn test_all_protected_reports_capacity_exhausted() {
    let mut alloc = SlotAllocator::new(1);
    let mut recency = RecencyTracker::new();
    let protected: ProtectedSet = [key(0), key(1)].into_iter().collect();

    place(&mut alloc, &mut recency, &protected, key(0));
    let err = alloc.acquire(key(1), &protected, &mut recency).unwrap_err();
    assert_eq!(err, SlotError::CapacityExhausted { capacity: 1 });

    // Nothing changed.
    assert_eq!(alloc.slot_of(&key(0)).map(|_| ()), Some(()));
    assert!(recency.contains(&key(0)));
}

#[test]
fn test_released_slot_is_reused() {
    let mut alloc = SlotAllocator::new(1);
    let mut recency = RecencyTracker::new();
    let none = ProtectedSet::new();

    place(&mut alloc, &mut recency, &none, key(0));
    let slot = alloc.slot_of(&key(0)).unwrap();
    assert_eq!(alloc.release(slot), Ok(key(0)));
    recency.remove(&key(0));

    assert_eq!(place(&mut alloc, &mut recency, &none, key(5)), None);
    assert_eq!(alloc.slot_of(&key(5)), Some(slot));
}

#[test]
fn test_bind_then_lookup_round_trip() {
    let mut alloc = SlotAllocator::new(2);
    let mut recency = RecencyTracker::new();
    let mut table = IndirectionTable::new(4);
    let none = ProtectedSet::new();

    let k = TileKey::new(3, 1, 2);
    table.mark_loading(k, 1);
    let slot = alloc.acquire(k, &none, &mut recency).unwrap().slot;
    table.bind(k, slot, 1).unwrap();

    let entry = table.lookup(&k).unwrap();
    assert!(entry.is_resident());
    assert_eq!(entry.slot(), Some(slot));
    assert_eq!(table.resident_count(), 1);
}

#[test]
fn test_recency_touch_is_constant_time_at_scale() {
    let mut recency = RecencyTracker::with_capacity(100_000);
    for x in 0..100_000 {
        recency.touch(key(x));
    }

    let start = std::time::Instant::now();
    for x in (0..100_000).step_by(7) {
        recency.touch(key(x));
    }
    assert!(start.elapsed().as_secs() < 1);

    // key(1) was never re-touched and is now the oldest.
    assert_eq!(recency.least_recent_unprotected(&ProtectedSet::new()), Some(key(1)));
    assert_eq!(recency.len(), 100_000);
}
