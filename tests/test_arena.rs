// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Slab arena tests: size rounding, alignment, recycling through the
// lock-free list, quota exhaustion, and concurrent map/unmap.

use libslab::{ArenaFlags, Quota, SlabArena, SLAB_MIN_SIZE};

#[test]
fn slab_size_is_rounded() {
    let quota = Quota::new(16 << 20);
    // Requests below the floor and non-power-of-two sizes are rounded.
    let arena = SlabArena::new(&quota, 0, 1024, ArenaFlags::PRIVATE).unwrap();
    assert_eq!(arena.slab_size(), SLAB_MIN_SIZE);
    drop(arena);
    let arena = SlabArena::new(&quota, 0, SLAB_MIN_SIZE + 1, ArenaFlags::PRIVATE).unwrap();
    assert_eq!(arena.slab_size(), 2 * SLAB_MIN_SIZE);
}

#[test]
fn map_is_aligned() {
    let quota = Quota::new(64 << 20);
    let arena = SlabArena::new(&quota, 0, 1 << 20, ArenaFlags::PRIVATE).unwrap();
    let mut slabs = Vec::new();
    for _ in 0..8 {
        let slab = arena.map().expect("within quota");
        assert_eq!(slab.as_ptr() as usize % arena.slab_size(), 0);
        slabs.push(slab);
    }
    for slab in slabs {
        unsafe { arena.unmap(slab) };
    }
}

#[test]
fn prealloc_slices_are_contiguous() {
    let quota = Quota::new(64 << 20);
    let arena = SlabArena::new(&quota, 4 * SLAB_MIN_SIZE, SLAB_MIN_SIZE, ArenaFlags::PRIVATE)
        .unwrap();
    assert_eq!(arena.prealloc(), 4 * SLAB_MIN_SIZE);
    let a = arena.map().unwrap();
    let b = arena.map().unwrap();
    assert_eq!(
        b.as_ptr() as usize - a.as_ptr() as usize,
        arena.slab_size(),
        "prealloc slabs are sliced in order"
    );
    unsafe {
        arena.unmap(b);
        arena.unmap(a);
    }
}

// Unmapped slabs are recycled address-for-address and stay charged to
// the quota.
#[test]
fn recycling() {
    let quota = Quota::new(2 * SLAB_MIN_SIZE);
    let arena = SlabArena::new(&quota, 0, SLAB_MIN_SIZE, ArenaFlags::PRIVATE).unwrap();

    let a = arena.map().expect("first slab");
    let b = arena.map().expect("second slab");
    assert_eq!(quota.used(), 2 * SLAB_MIN_SIZE);

    unsafe { arena.unmap(a) };
    let c = arena.map().expect("recycled slab");
    assert_eq!(c, a, "the recycle list must return the freed slab");
    assert_eq!(quota.used(), 2 * SLAB_MIN_SIZE);

    // The quota is exhausted, so a fresh slab is refused.
    assert!(arena.map().is_none());

    unsafe {
        arena.unmap(b);
        arena.unmap(c);
    }
}

#[test]
fn dontdump_arena_works() {
    let quota = Quota::new(16 << 20);
    let arena = SlabArena::new(
        &quota,
        0,
        SLAB_MIN_SIZE,
        ArenaFlags::PRIVATE | ArenaFlags::DONTDUMP,
    )
    .unwrap();
    let slab = arena.map().expect("advice failures must not fail map");
    unsafe { arena.unmap(slab) };
}

#[test]
fn concurrent_map_unmap() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    let quota = Quota::new(2 * THREADS * SLAB_MIN_SIZE);
    let arena = SlabArena::new(&quota, 0, SLAB_MIN_SIZE, ArenaFlags::PRIVATE).unwrap();

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for _ in 0..ROUNDS {
                    let a = arena.map().expect("quota fits one slab per thread");
                    let b = arena.map().expect("quota fits two slabs per thread");
                    assert_ne!(a, b);
                    assert_eq!(a.as_ptr() as usize % arena.slab_size(), 0);
                    assert_eq!(b.as_ptr() as usize % arena.slab_size(), 0);
                    // Touch both slabs to catch overlapping handouts.
                    unsafe {
                        a.as_ptr().write_bytes(0xa5, 64);
                        b.as_ptr().write_bytes(0x5a, 64);
                        arena.unmap(a);
                        arena.unmap(b);
                    }
                }
            });
        }
    });
    assert!(quota.used() <= quota.total());
}
