// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Buddy cache tests: order arithmetic, split/coalesce behavior, large
// slabs, and the used/total accounting.

use libslab::{slab_header_size, ArenaFlags, Quota, SlabArena, SlabCache};

const ARENA_SLAB: usize = 1 << 20;

fn quota() -> Quota {
    Quota::new(256 << 20)
}

#[test]
fn order_sizes() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    assert_eq!(
        cache.order0_size() << cache.order_max(),
        arena.slab_size(),
        "orders must span exactly one arena slab"
    );
    for order in 0..=cache.order_max() {
        let size = cache.order_size(order);
        assert_eq!(size, cache.order0_size() << order);
        assert_eq!(cache.order(size), order);
        assert_eq!(cache.order(size + 1), order + 1);
    }
    assert_eq!(cache.order(arena.slab_size() + 1), cache.order_max() + 1);
}

#[test]
fn get_returns_exact_sizes() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    let mut slabs = Vec::new();
    for order in 0..=cache.order_max() {
        let slab = cache.get_with_order(order).expect("within quota");
        let header = unsafe { slab.as_ref() };
        assert_eq!(header.size(), cache.order_size(order));
        assert_eq!(header.order(), order);
        // Ordered slabs are aligned to their size.
        assert_eq!(slab.as_ptr() as usize % header.size(), 0);
        slabs.push(slab);
    }
    assert!(cache.used() > 0);
    for slab in slabs {
        unsafe { cache.put_with_order(slab) };
    }
    assert_eq!(cache.used(), 0);
}

// Freeing both buddies of a split must coalesce them back, so a
// full-size slab is available again without growing the cache.
#[test]
fn buddies_coalesce() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    let a = cache.get_with_order(0).unwrap();
    let b = cache.get_with_order(0).unwrap();
    // Splitting one arena slab produced both order-0 slabs.
    assert_eq!(cache.total(), arena.slab_size());
    assert_eq!(
        (a.as_ptr() as usize) ^ cache.order0_size(),
        b.as_ptr() as usize,
        "siblings of one split are buddies"
    );

    unsafe {
        cache.put_with_order(a);
        cache.put_with_order(b);
    }
    // Everything merged: a top-order request is served from the same
    // arena slab instead of mapping a second one.
    let top = cache.get_with_order(cache.order_max()).unwrap();
    assert_eq!(cache.total(), arena.slab_size());
    assert_eq!(top.as_ptr() as usize, a.as_ptr() as usize & !(arena.slab_size() - 1));
    unsafe { cache.put_with_order(top) };
}

#[test]
fn slab_get_dispatches_on_size() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    // Fits in an ordered slab.
    let small = cache.slab_get(1000).unwrap();
    assert_eq!(unsafe { small.as_ref() }.size(), cache.order0_size());
    assert!(unsafe { small.as_ref() }.capacity() >= 1000);

    // Larger than the arena slab: an exact-size large slab.
    let big_payload = 3 * ARENA_SLAB;
    let big = cache.slab_get(big_payload).unwrap();
    let header = unsafe { big.as_ref() };
    assert_eq!(header.capacity(), big_payload);
    assert_eq!(header.size(), big_payload + slab_header_size());
    assert_eq!(header.order(), cache.order_max() + 1);

    let used_before = quota.used();
    unsafe {
        cache.slab_put(big);
    }
    assert!(quota.used() < used_before, "large slabs release quota");
    unsafe { cache.slab_put(small) };
    assert_eq!(cache.used(), 0);
}

#[test]
fn payload_roundtrip() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    let slab = cache.slab_get(4096).unwrap();
    let data = unsafe { slab.as_ref() }.data();
    unsafe {
        data.write_bytes(0xfe, 4096);
        // The header survives payload writes and is recoverable.
        let back = libslab::Slab::from_data(data);
        assert_eq!(back, slab);
        cache.slab_put(slab);
    }
}

// Many allocations of mixed orders, then free everything: the cache
// must end balanced (used == 0) and keep at most one top-order slab
// per arena slab mapped.
#[test]
fn mixed_order_stress() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, ARENA_SLAB, ArenaFlags::PRIVATE).unwrap();
    let cache = SlabCache::new(&arena);

    let mut slabs = Vec::new();
    for round in 0..64usize {
        let order = (round % (cache.order_max() as usize + 1)) as u8;
        slabs.push(cache.get_with_order(order).expect("within quota"));
        if round % 3 == 0 {
            let victim = slabs.swap_remove(round % slabs.len());
            unsafe { cache.put_with_order(victim) };
        }
    }
    for slab in slabs.drain(..) {
        unsafe { cache.put_with_order(slab) };
    }
    assert_eq!(cache.used(), 0);
}
