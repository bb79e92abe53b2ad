// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// small_alloc: a size-classed allocator multiplexing up to 1024
// mempools. The classifier maps a request to its pool in O(1); sizes
// beyond the largest class fall through to large slabs. A delayed-free
// mode parks freed objects on per-pool LIFO lists (the dead objects
// themselves hold the links) until the owner leaves the mode, after
// which allocations drain the backlog in bounded batches.

use std::ptr::NonNull;

use crate::lifo::Lifo;
use crate::mempool::{mslab_header_size, Mempool, MempoolStats};
use crate::slab_cache::{Slab, SlabCache, SmallStats};
use crate::small_class::SmallClass;
use crate::util::align_up;

/// Upper bound on the number of size classes.
pub const SMALL_MEMPOOL_MAX: usize = 1024;

/// Items released per allocation while collecting a delayed-free
/// backlog.
const COLLECT_BATCH: usize = 100;

/// What `free_delayed` does with an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FreeMode {
    /// Free immediately.
    Free,
    /// Free immediately and drain the delayed backlog along the way.
    CollectGarbage,
    /// Queue on the delayed lists.
    DelayedFree,
}

/// A size class: one pool plus its routing bounds.
struct SmallMempool<'a> {
    pool: Mempool<'a>,
    /// Smallest size routed to this pool; the largest is
    /// `pool.objsize()`.
    objsize_min: u32,
}

/// The largest object size a pool over `slab_size`-byte slabs should
/// serve; anything bigger is cheaper as a large slab.
fn mempool_objsize_max(slab_size: usize) -> u32 {
    (((slab_size - mslab_header_size()) / 16) & !(std::mem::size_of::<usize>() - 1)) as u32
}

/// A slab allocator for a wide range of object sizes.
pub struct SmallAlloc<'a> {
    cache: &'a SlabCache<'a>,
    /// One pool per size class, classifier order.
    pools: Vec<SmallMempool<'a>>,
    class: SmallClass,
    objsize_max: u32,
    /// Classes with a non-empty delayed list.
    delayed_pools: Vec<u32>,
    /// Delayed large objects (payload pointers).
    delayed_large: Lifo,
    free_mode: FreeMode,
}

impl<'a> SmallAlloc<'a> {
    /// Create an allocator.
    ///
    /// `objsize_min` is the class-0 object size (aligned up to
    /// `granularity`); `alloc_factor` is the desired growth factor in
    /// (1, 2]. Returns the allocator and the factor actually realized
    /// by the classifier.
    pub fn new(
        cache: &'a SlabCache<'a>,
        objsize_min: u32,
        granularity: u32,
        alloc_factor: f32,
    ) -> (Self, f32) {
        let objsize_min = align_up(objsize_min as usize, granularity as usize) as u32;
        let top_slab = cache.order_size(cache.order_max());
        let objsize_max =
            align_up(mempool_objsize_max(top_slab) as usize, granularity as usize) as u32;
        let class = SmallClass::new(granularity, alloc_factor, objsize_min);

        let mut alloc = SmallAlloc {
            cache,
            pools: Vec::new(),
            class,
            objsize_max,
            delayed_pools: Vec::new(),
            delayed_large: Lifo::new(),
            free_mode: FreeMode::Free,
        };

        let mut objsize = 0u32;
        while objsize < alloc.objsize_max && alloc.pools.len() < SMALL_MEMPOOL_MAX {
            let prev = objsize;
            objsize = class.size(alloc.pools.len() as u32).min(alloc.objsize_max);
            alloc.pools.push(SmallMempool {
                pool: Mempool::new(cache, objsize),
                objsize_min: prev + 1,
            });
        }
        // The classifier may overshoot the theoretical maximum; trim
        // the routing bound to the last class actually built.
        alloc.objsize_max = objsize;

        let actual_factor = class.actual_factor();
        (alloc, actual_factor)
    }

    /// The largest size served from a pool.
    pub fn objsize_max(&self) -> u32 {
        self.objsize_max
    }

    /// Number of size classes.
    pub fn class_count(&self) -> usize {
        self.pools.len()
    }

    /// The classifier used for routing.
    pub fn size_class(&self) -> &SmallClass {
        &self.class
    }

    fn pool_index(&self, size: usize) -> Option<usize> {
        if size > self.objsize_max as usize {
            return None;
        }
        let cls = self.class.offset(size as u32) as usize;
        debug_assert!(cls < self.pools.len());
        Some(cls)
    }

    /// Allocate `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.collect_garbage();
        match self.pool_index(size) {
            None => {
                // Too big for any pool: take a dedicated large slab.
                let slab = self.cache.get_large(size)?;
                Some(unsafe { NonNull::new_unchecked(slab.as_ref().data()) })
            }
            Some(cls) => {
                let pool = &mut self.pools[cls];
                debug_assert!(size <= pool.pool.objsize() as usize);
                debug_assert!(size >= pool.objsize_min as usize || cls == 0);
                pool.pool.alloc()
            }
        }
    }

    /// Free an object of a known size.
    ///
    /// The size selects the pool exactly like in `alloc`, so it must
    /// be the size the object was allocated with.
    ///
    /// # Safety
    /// `ptr` must come from `alloc(size)` on this allocator and must
    /// not be used afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        match self.pool_index(size) {
            None => {
                let slab = unsafe { Slab::from_data(ptr.as_ptr()) };
                unsafe { self.cache.put_large(slab) };
            }
            Some(cls) => unsafe { self.pools[cls].pool.free(ptr) },
        }
    }

    /// Free an object, honoring the delayed-free mode: in delayed mode
    /// the object is queued and released later in collection batches.
    ///
    /// # Safety
    /// Same contract as [`free`](SmallAlloc::free).
    pub unsafe fn free_delayed(&mut self, ptr: NonNull<u8>, size: usize) {
        if self.free_mode != FreeMode::DelayedFree {
            return unsafe { self.free(ptr, size) };
        }
        match self.pool_index(size) {
            None => unsafe { self.delayed_large.push(ptr) },
            Some(cls) => {
                let pool = &mut self.pools[cls];
                if pool.pool.delayed.is_empty() {
                    self.delayed_pools.push(cls as u32);
                }
                unsafe { pool.pool.delayed.push(ptr) };
            }
        }
    }

    /// Switch delayed-free mode on or off. Leaving the mode starts a
    /// garbage-collection phase that drains the queues piecewise from
    /// `alloc`.
    pub fn set_delayed_free_mode(&mut self, enable: bool) {
        self.free_mode = if enable {
            FreeMode::DelayedFree
        } else {
            FreeMode::CollectGarbage
        };
    }

    fn collect_garbage(&mut self) {
        if self.free_mode != FreeMode::CollectGarbage {
            return;
        }
        if !self.delayed_large.is_empty() {
            for _ in 0..COLLECT_BATCH {
                let Some(item) = self.delayed_large.pop() else {
                    break;
                };
                let slab = unsafe { Slab::from_data(item.as_ptr()) };
                unsafe { self.cache.put_large(slab) };
            }
        } else if !self.delayed_pools.is_empty() {
            let mut budget = COLLECT_BATCH;
            while budget > 0 {
                let Some(&cls) = self.delayed_pools.last() else {
                    break;
                };
                let pool = &mut self.pools[cls as usize].pool;
                match pool.delayed.pop() {
                    Some(item) => {
                        unsafe { pool.free(item) };
                        budget -= 1;
                    }
                    None => {
                        self.delayed_pools.pop();
                    }
                }
            }
        } else {
            // Backlog drained; back to immediate frees.
            self.free_mode = FreeMode::Free;
        }
    }

    /// Walk per-class statistics. `cb` returning `true` stops the
    /// walk. Returns the used/total aggregate over the visited pools.
    pub fn stats<F>(&self, mut cb: F) -> SmallStats
    where
        F: FnMut(&MempoolStats) -> bool,
    {
        let mut totals = SmallStats::default();
        for pool in &self.pools {
            let stats = pool.pool.stats();
            totals.used += stats.totals.used;
            totals.total += stats.totals.total;
            if cb(&stats) {
                break;
            }
        }
        totals
    }

    /// The used/total aggregate over all pools.
    pub fn totals(&self) -> SmallStats {
        self.stats(|_| false)
    }
}

impl Drop for SmallAlloc<'_> {
    fn drop(&mut self) {
        // Delayed pool objects die with their slabs; delayed large
        // slabs must be released explicitly.
        while let Some(item) = self.delayed_large.pop() {
            let slab = unsafe { Slab::from_data(item.as_ptr()) };
            unsafe { self.cache.put_large(slab) };
        }
    }
}
