// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Small-allocator tests: classifier routing, the large-object
// fallback, delayed-free mode and the statistics walker.

use std::ptr::NonNull;

use libslab::{ArenaFlags, Quota, SlabArena, SlabCache, SmallAlloc};

const ARENA_SLAB: usize = 4 << 20;

fn quota() -> Quota {
    Quota::new(1 << 30)
}

#[test]
fn classifier_routing() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (alloc, actual_factor) = SmallAlloc::new(&cache, 16, 8, 1.3);

    // The realized factor approximates the requested one.
    let k = 1.3f32.sqrt();
    assert!(actual_factor >= 1.3 / k && actual_factor <= 1.3 * k);

    let class = alloc.size_class();
    // Sizes 17..=24 share one class; 25 goes to a strictly larger one.
    let cls = class.offset(17);
    for size in 18..=24 {
        assert_eq!(class.offset(size), cls);
    }
    assert!(class.offset(25) > cls);
    assert!(class.size(class.offset(25)) > class.size(cls));

    // Every size up to the routing bound lands in a class that fits it.
    for size in 1..=alloc.objsize_max() {
        let cls = class.offset(size);
        assert!((cls as usize) < alloc.class_count());
        assert!(class.size(cls) >= size);
    }
}

#[test]
fn alloc_and_free_across_classes() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 8, 8, 1.3);

    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
    let mut size = 8usize;
    while size <= alloc.objsize_max() as usize {
        let ptr = alloc.alloc(size).expect("within quota");
        unsafe { ptr.as_ptr().write_bytes(0xab, size) };
        live.push((ptr, size));
        size = size * 3 / 2 + 1;
    }
    assert!(alloc.totals().used > 0);

    for (ptr, size) in live.drain(..) {
        unsafe { alloc.free(ptr, size) };
    }
    assert_eq!(alloc.totals().used, 0);
}

#[test]
fn large_objects_bypass_pools() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 8, 8, 1.5);

    let size = alloc.objsize_max() as usize + 1;
    let used_before = cache.used();
    let ptr = alloc.alloc(size).expect("large slab");
    unsafe { ptr.as_ptr().write_bytes(0xcd, size) };
    assert!(cache.used() > used_before);

    unsafe { alloc.free(ptr, size) };
    assert_eq!(cache.used(), used_before);
}

#[test]
fn free_delayed_defers_until_collection() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 8, 8, 1.3);

    let mut ptrs = Vec::new();
    for _ in 0..300 {
        ptrs.push(alloc.alloc(64).unwrap());
    }
    let used_full = alloc.totals().used;

    alloc.set_delayed_free_mode(true);
    for ptr in ptrs.drain(..) {
        unsafe { alloc.free_delayed(ptr, 64) };
    }
    // Still charged: the objects only moved to the delayed lists.
    assert_eq!(alloc.totals().used, used_full);

    alloc.set_delayed_free_mode(false);
    // Collection drains in bounded batches piggybacked on alloc.
    let keep = alloc.alloc(16).unwrap();
    assert!(alloc.totals().used < used_full);
    for _ in 0..10 {
        let p = alloc.alloc(16).unwrap();
        unsafe { alloc.free(p, 16) };
    }
    assert_eq!(alloc.totals().used, 16);
    unsafe { alloc.free(keep, 16) };
}

#[test]
fn free_delayed_outside_mode_is_immediate() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 8, 8, 1.3);

    let ptr = alloc.alloc(100).unwrap();
    unsafe { alloc.free_delayed(ptr, 100) };
    assert_eq!(alloc.totals().used, 0);
}

#[test]
fn delayed_large_objects() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 8, 8, 1.3);

    let size = alloc.objsize_max() as usize + 4096;
    let ptr = alloc.alloc(size).unwrap();
    let used_with_large = cache.used();

    alloc.set_delayed_free_mode(true);
    unsafe { alloc.free_delayed(ptr, size) };
    assert_eq!(cache.used(), used_with_large, "free is deferred");

    alloc.set_delayed_free_mode(false);
    let p = alloc.alloc(8).unwrap();
    assert!(cache.used() < used_with_large, "collection freed the large slab");
    unsafe { alloc.free(p, 8) };
}

#[test]
fn stats_walker_visits_every_class() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 16, 8, 1.2);

    let a = alloc.alloc(20).unwrap();
    let b = alloc.alloc(2000).unwrap();

    let mut visited = 0usize;
    let mut seen_used = 0usize;
    let totals = alloc.stats(|stats| {
        visited += 1;
        seen_used += stats.totals.used;
        assert!(stats.totals.total >= stats.totals.used);
        false
    });
    assert_eq!(visited, alloc.class_count());
    assert_eq!(seen_used, totals.used);
    assert!(totals.used >= 20 + 2000);

    unsafe {
        alloc.free(a, 20);
        alloc.free(b, 2000);
    }
}

// Mixed random churn over every class, mirroring a workload that
// oscillates between allocation and free streaks.
#[test]
fn random_churn() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);
    let (mut alloc, _) = SmallAlloc::new(&cache, 12, 8, 1.3);

    let mut rng = StdRng::seed_from_u64(42);
    let objsize_max = alloc.objsize_max() as usize;
    let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for round in 0..20_000usize {
        let allocating = (round / 2500) % 2 == 0;
        if (allocating && live.len() < 2000) || live.is_empty() {
            let size = rng.gen_range(12..=objsize_max.min(8000));
            let ptr = alloc.alloc(size).expect("within quota");
            let tag = (round % 251) as u8;
            unsafe { ptr.as_ptr().write_bytes(tag, size) };
            live.push((ptr, size, tag));
        } else {
            let idx = rng.gen_range(0..live.len());
            let (ptr, size, tag) = live.swap_remove(idx);
            unsafe {
                // The object must be intact before it dies.
                assert_eq!(*ptr.as_ptr(), tag);
                assert_eq!(*ptr.as_ptr().add(size - 1), tag);
                alloc.free(ptr, size);
            }
        }
    }
    for (ptr, size, _) in live {
        unsafe { alloc.free(ptr, size) };
    }
    assert_eq!(alloc.totals().used, 0);
}
