// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Log-structured region tests: generation-ordered allocation, gc by
// minimal id, the single-slot slab cache and oversized allocations.

use libslab::{ArenaFlags, LsRegion, Quota, SlabArena};

fn quota() -> Quota {
    Quota::new(256 << 20)
}

#[test]
fn basic_alloc_and_gc() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    assert_eq!(ls.used(), 0);
    assert_eq!(ls.total(), 0);

    let data = ls.alloc(100, 10).expect("within quota");
    unsafe { data.as_ptr().write_bytes(0xaa, 100) };
    assert_eq!(ls.used(), 100);
    assert_eq!(ls.total(), arena.slab_size());

    // A gc below the id of the only allocation frees nothing.
    ls.gc(5);
    assert_eq!(ls.used(), 100);
    assert_eq!(ls.total(), arena.slab_size());

    // At the id everything goes, and the slab parks in the cache.
    ls.gc(10);
    assert_eq!(ls.used(), 0);
    assert_eq!(ls.total(), arena.slab_size(), "emptied slab is cached");
}

// Objects sharing a slab pin each other: nothing is freed until the
// newest id of the slab is reached.
#[test]
fn gc_is_slab_granular() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 4096, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    let a = ls.alloc(1000, 1).unwrap();
    let b = ls.alloc(1000, 1).unwrap();
    let c = ls.alloc(1000, 5).unwrap();
    unsafe {
        a.as_ptr().write_bytes(1, 1000);
        b.as_ptr().write_bytes(2, 1000);
        c.as_ptr().write_bytes(3, 1000);
    }
    assert_eq!(ls.used(), 3000);

    // Both id=1 objects share the slab with id=5, so nothing dies yet.
    ls.gc(3);
    assert_eq!(ls.used(), 3000);
    unsafe {
        assert_eq!(*a.as_ptr(), 1);
        assert_eq!(*b.as_ptr(), 2);
    }

    // Now the whole slab is collectable; one empty slab stays cached.
    ls.gc(5);
    assert_eq!(ls.used(), 0);
    assert_eq!(ls.total(), arena.slab_size());
}

#[test]
fn gc_keeps_only_newer_ids() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    // One nearly-full slab per id so gc can work slab by slab.
    let payload = arena.slab_size() - 1024;
    for id in 1..=5i64 {
        ls.alloc(payload, id).expect("one slab per id");
    }
    let used_all = ls.used();
    assert_eq!(used_all, 5 * payload);

    ls.gc(2);
    assert_eq!(ls.used(), 3 * payload, "ids 1 and 2 are gone");
    ls.gc(4);
    assert_eq!(ls.used(), payload, "only id 5 survives");
    ls.gc(5);
    assert_eq!(ls.used(), 0);
}

#[test]
fn cached_slab_is_reused() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    ls.alloc(100, 1).unwrap();
    ls.gc(1);
    let total_cached = ls.total();
    let arena_used = arena.used();

    // The next allocation must come out of the cached slab, not the
    // arena.
    ls.alloc(100, 2).unwrap();
    assert_eq!(ls.total(), total_cached);
    assert_eq!(arena.used(), arena_used);
    ls.gc(2);
}

#[test]
fn reserve_commits_nothing() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    let reserved = ls.reserve(500).expect("within quota");
    assert_eq!(ls.used(), 0);
    let allocated = ls.alloc(500, 7).unwrap();
    assert_eq!(reserved, allocated, "reserve pins the next address");
    assert_eq!(ls.used(), 500);
    ls.gc(7);
}

#[test]
fn aligned_alloc_pads_and_accounts() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    ls.alloc(3, 1).unwrap();
    let used = ls.used();
    let ptr = ls.aligned_alloc(64, 64, 2).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 64, 0);
    let padded = ls.used() - used;
    assert!(padded >= 64 && padded < 64 + 64, "padding is accounted");
    ls.gc(2);
}

// An allocation bigger than an arena slab gets its own quota-charged
// slab and is returned straight to the quota on gc.
#[test]
fn oversized_allocations() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    let big = 3 * arena.slab_size();
    let quota_before = quota.used();
    let ptr = ls.alloc(big, 1).expect("oversized slab");
    unsafe { ptr.as_ptr().write_bytes(0x42, big) };
    assert!(quota.used() >= quota_before + big);
    assert_eq!(ls.used(), big);

    ls.gc(1);
    assert_eq!(ls.used(), 0);
    assert_eq!(quota.used(), quota_before, "oversized slabs are never cached");
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "generation ids must not decrease")]
fn decreasing_ids_are_rejected() {
    let quota = quota();
    let arena = SlabArena::new(&quota, 0, 1 << 16, ArenaFlags::PRIVATE).unwrap();
    let mut ls = LsRegion::new(&arena);

    ls.alloc(10, 5).unwrap();
    ls.alloc(10, 4).unwrap();
}
