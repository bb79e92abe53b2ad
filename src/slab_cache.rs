// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// slab_cache: a buddy-system cache carving arena slabs into power-of-two
// "ordered" slabs. A slab of order k has size order0_size << k; splitting
// an order k+1 slab yields two order-k buddies whose addresses differ in
// exactly the order-k bit, so the buddy of any slab is found by XOR-ing
// its size into its address. Requests larger than an arena slab bypass
// the buddy tree entirely ("large" slabs).
//
// Single-threaded by contract: each cache is owned by one worker. Debug
// builds record the owning thread and assert identity on every call.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
#[cfg(debug_assertions)]
use std::thread::ThreadId;

use static_assertions::const_assert;

use crate::arena::SlabArena;
use crate::platform;
use crate::quota::Quota;
use crate::util::{align_up, log2_floor, round_up_pow2};

/// Sanity sentinel stored in every slab header.
const SLAB_MAGIC: u32 = 0x51ab_aced;

/// Largest supported distance, in binary orders, between the smallest
/// and the largest ordered slab.
pub const ORDER_MAX: u8 = 16;

/// Header index sentinel: not a member of any list.
const INVALID_IDX: u32 = u32::MAX;

/// Aggregate used/total counters, bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SmallStats {
    pub used: usize,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Slab header
// ---------------------------------------------------------------------------

/// Header at the start of every cached slab.
///
/// Headers of split slabs stay valid at the lower-half address, which
/// is what makes the buddy probe in `put_with_order` safe: the buddy
/// address of a free slab always holds a live header.
#[repr(C)]
pub struct Slab {
    /// Allocated size, header included. Differs from
    /// `order0_size << order` only for large slabs.
    size: usize,
    magic: u32,
    /// Position in the per-order free list while free, else invalid.
    free_idx: Cell<u32>,
    /// Position in the cache's allocated list. Only meaningful for
    /// arena-level and large slabs; invalid for split children.
    allocated_idx: Cell<u32>,
    /// Buddy order for ordered slabs, `order_max + 1` for large ones.
    order: u8,
    /// 0 when free, `order + 1` when handed out.
    in_use: u8,
}

const_assert!(std::mem::align_of::<Slab>() <= 16);

/// Aligned size of the slab header; slab payload starts at this offset.
#[inline]
pub fn slab_header_size() -> usize {
    align_up(std::mem::size_of::<Slab>(), std::mem::size_of::<usize>())
}

impl Slab {
    /// The usable size of this slab.
    pub fn capacity(&self) -> usize {
        self.size - slab_header_size()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    /// Pointer to the payload.
    pub fn data(&self) -> *mut u8 {
        unsafe { (self as *const Slab as *mut u8).add(slab_header_size()) }
    }

    /// Recover the header from a payload pointer returned by
    /// [`Slab::data`].
    ///
    /// # Safety
    /// `data` must be the payload pointer of a live slab.
    pub unsafe fn from_data(data: *mut u8) -> NonNull<Slab> {
        let slab = unsafe { data.sub(slab_header_size()) } as *mut Slab;
        debug_assert_eq!(unsafe { (*slab).magic }, SLAB_MAGIC);
        unsafe { NonNull::new_unchecked(slab) }
    }

    /// Recover the owning slab of an interior pointer by masking the
    /// address. Valid for ordered slabs only, whose addresses are
    /// aligned to their size.
    ///
    /// # Safety
    /// `ptr` must point into the payload of a live ordered slab whose
    /// size matches `!mask + 1`.
    pub unsafe fn from_ptr(ptr: *mut u8, mask: usize) -> NonNull<Slab> {
        let slab = (ptr as usize & mask) as *mut Slab;
        debug_assert_eq!(unsafe { (*slab).magic }, SLAB_MAGIC, "corrupted slab");
        unsafe { NonNull::new_unchecked(slab) }
    }

    fn init(ptr: *mut u8, size: usize, order: u8) -> NonNull<Slab> {
        let slab = ptr as *mut Slab;
        unsafe {
            slab.write(Slab {
                size,
                magic: SLAB_MAGIC,
                free_idx: Cell::new(INVALID_IDX),
                allocated_idx: Cell::new(INVALID_IDX),
                order,
                in_use: 0,
            });
            NonNull::new_unchecked(slab)
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

struct Lists {
    /// Free slabs per order; each header stores its own index.
    orders: Vec<Vec<NonNull<Slab>>>,
    /// Arena-level and large slabs, for stats and teardown.
    allocated: Vec<NonNull<Slab>>,
    stats: SmallStats,
}

/// A buddy-system slab cache over one arena.
pub struct SlabCache<'a> {
    arena: &'a SlabArena<'a>,
    order0_size: usize,
    order0_size_lb: u32,
    order_max: u8,
    lists: RefCell<Lists>,
    #[cfg(debug_assertions)]
    owner: Cell<Option<ThreadId>>,
}

impl<'a> SlabCache<'a> {
    pub fn new(arena: &'a SlabArena<'a>) -> Self {
        let mut order0_size = round_up_pow2(platform::page_size()).min(arena.slab_size());
        let mut order_max = log2_floor(arena.slab_size()) - log2_floor(order0_size);
        // Shrink the order range rather than track a huge ladder of
        // mostly-empty free lists.
        if order_max > ORDER_MAX as u32 {
            order0_size <<= order_max - ORDER_MAX as u32;
            order_max = ORDER_MAX as u32;
        }
        SlabCache {
            arena,
            order0_size,
            order0_size_lb: log2_floor(order0_size),
            order_max: order_max as u8,
            lists: RefCell::new(Lists {
                orders: vec![Vec::new(); order_max as usize + 1],
                allocated: Vec::new(),
                stats: SmallStats::default(),
            }),
            #[cfg(debug_assertions)]
            owner: Cell::new(None),
        }
    }

    /// Debug-only check that the cache never migrates between threads.
    #[inline]
    fn check_thread(&self) {
        #[cfg(debug_assertions)]
        {
            let current = std::thread::current().id();
            match self.owner.get() {
                None => self.owner.set(Some(current)),
                Some(owner) => assert_eq!(owner, current, "slab cache used from a foreign thread"),
            }
        }
    }

    pub fn arena(&self) -> &'a SlabArena<'a> {
        self.arena
    }

    fn quota(&self) -> &Quota {
        self.arena.quota()
    }

    pub fn order0_size(&self) -> usize {
        self.order0_size
    }

    pub fn order_max(&self) -> u8 {
        self.order_max
    }

    /// The order of the smallest ordered slab that fits `size` bytes
    /// (header included), or `order_max + 1` when only a large slab
    /// can.
    pub fn order(&self, size: usize) -> u8 {
        if size <= self.order0_size {
            return 0;
        }
        if size > self.arena.slab_size() {
            return self.order_max + 1;
        }
        (usize::BITS - (size - 1).leading_zeros() - self.order0_size_lb) as u8
    }

    /// The byte size of an ordered slab of the given order.
    pub fn order_size(&self, order: u8) -> usize {
        debug_assert!(order <= self.order_max);
        self.order0_size << order
    }

    /// The real size of the slab `slab_get` would return for a payload
    /// of `size` bytes.
    pub fn real_size(&self, size: usize) -> usize {
        let total = size + slab_header_size();
        let order = self.order(total);
        if order <= self.order_max {
            self.order_size(order)
        } else {
            total
        }
    }

    /// Bytes currently handed out to callers.
    pub fn used(&self) -> usize {
        self.lists.borrow().stats.used
    }

    /// Bytes held by the cache, free slabs included.
    pub fn total(&self) -> usize {
        self.lists.borrow().stats.total
    }

    // -- free-list bookkeeping ------------------------------------------------

    fn push_free(lists: &mut Lists, slab: NonNull<Slab>) {
        let header = unsafe { slab.as_ref() };
        let list = &mut lists.orders[header.order as usize];
        header.free_idx.set(list.len() as u32);
        list.push(slab);
    }

    fn remove_free(lists: &mut Lists, slab: NonNull<Slab>) {
        let header = unsafe { slab.as_ref() };
        let idx = header.free_idx.get() as usize;
        header.free_idx.set(INVALID_IDX);
        let list = &mut lists.orders[header.order as usize];
        debug_assert_eq!(list[idx], slab);
        list.swap_remove(idx);
        if let Some(moved) = list.get(idx) {
            unsafe { moved.as_ref() }.free_idx.set(idx as u32);
        }
    }

    fn push_allocated(lists: &mut Lists, slab: NonNull<Slab>) {
        let header = unsafe { slab.as_ref() };
        header.allocated_idx.set(lists.allocated.len() as u32);
        lists.allocated.push(slab);
    }

    fn remove_allocated(lists: &mut Lists, slab: NonNull<Slab>) {
        let header = unsafe { slab.as_ref() };
        let idx = header.allocated_idx.get() as usize;
        header.allocated_idx.set(INVALID_IDX);
        debug_assert_eq!(lists.allocated[idx], slab);
        lists.allocated.swap_remove(idx);
        if let Some(moved) = lists.allocated.get(idx) {
            unsafe { moved.as_ref() }.allocated_idx.set(idx as u32);
        }
    }

    // -- ordered slabs --------------------------------------------------------

    /// Get a slab of exactly `order0_size << order` bytes.
    pub fn get_with_order(&self, order: u8) -> Option<NonNull<Slab>> {
        self.check_thread();
        assert!(order <= self.order_max);
        let mut lists = self.lists.borrow_mut();

        // Take the smallest cached slab of a sufficient order, or map
        // a fresh arena slab at the top order.
        let mut slab = None;
        for o in order..=self.order_max {
            if let Some(&found) = lists.orders[o as usize].last() {
                Self::remove_free(&mut lists, found);
                slab = Some(found);
                break;
            }
        }
        let mut slab = match slab {
            Some(slab) => slab,
            None => {
                let ptr = self.arena.map()?;
                let slab = Slab::init(ptr.as_ptr(), self.arena.slab_size(), self.order_max);
                Self::push_allocated(&mut lists, slab);
                lists.stats.total += self.arena.slab_size();
                slab
            }
        };

        // Split down to the requested order, caching the upper buddy
        // of every split.
        while unsafe { slab.as_ref() }.order > order {
            let header = unsafe { slab.as_mut() };
            header.order -= 1;
            header.size >>= 1;
            let buddy_ptr = unsafe { (slab.as_ptr() as *mut u8).add(header.size) };
            let buddy = Slab::init(buddy_ptr, header.size, header.order);
            Self::push_free(&mut lists, buddy);
        }

        let header = unsafe { slab.as_mut() };
        debug_assert_eq!(header.size, self.order_size(order));
        header.in_use = header.order + 1;
        lists.stats.used += header.size;
        Some(slab)
    }

    /// Return an ordered slab, coalescing free buddies as far as they
    /// go.
    ///
    /// # Safety
    /// `slab` must come from `get_with_order` (or `slab_get`) on this
    /// cache and must not be used afterwards.
    pub unsafe fn put_with_order(&self, mut slab: NonNull<Slab>) {
        self.check_thread();
        let mut lists = self.lists.borrow_mut();
        {
            let header = unsafe { slab.as_ref() };
            debug_assert_eq!(header.magic, SLAB_MAGIC);
            debug_assert_ne!(header.in_use, 0, "double free of a slab");
            debug_assert!(header.order <= self.order_max);
            lists.stats.used -= header.size;
        }
        unsafe { slab.as_mut() }.in_use = 0;

        loop {
            let header = unsafe { slab.as_ref() };
            if header.order == self.order_max {
                break;
            }
            // A buddy address always holds a live header: either the
            // buddy itself or the first child it was split into.
            let buddy =
                unsafe { NonNull::new_unchecked((slab.as_ptr() as usize ^ header.size) as *mut Slab) };
            let buddy_header = unsafe { buddy.as_ref() };
            debug_assert_eq!(buddy_header.magic, SLAB_MAGIC);
            if buddy_header.order != header.order || buddy_header.in_use != 0 {
                break;
            }
            Self::remove_free(&mut lists, buddy);
            // The merged slab keeps the lower header, which preserves
            // the allocated-list index of the arena-level base.
            let mut merged = slab.min(buddy);
            let header = unsafe { merged.as_mut() };
            header.order += 1;
            header.size <<= 1;
            slab = merged;
        }

        let header = unsafe { slab.as_ref() };
        if header.order == self.order_max
            && !lists.orders[self.order_max as usize].is_empty()
        {
            // One top-order slab is enough of a buffer against
            // oscillation; hand the rest back to the arena.
            debug_assert_eq!(header.size, self.arena.slab_size());
            Self::remove_allocated(&mut lists, slab);
            lists.stats.total -= header.size;
            unsafe { self.arena.unmap(NonNull::new_unchecked(slab.as_ptr() as *mut u8)) };
        } else {
            Self::push_free(&mut lists, slab);
        }
    }

    // -- large slabs ----------------------------------------------------------

    /// Allocate a slab with at least `size` bytes of payload outside
    /// the buddy tree. For use when `size` exceeds the capacity of the
    /// largest ordered slab.
    pub fn get_large(&self, size: usize) -> Option<NonNull<Slab>> {
        self.check_thread();
        let total = size + slab_header_size();
        self.quota().try_use(total)?;
        let layout = large_layout(total);
        let ptr = unsafe { std::alloc::alloc(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.quota().release(total);
            return None;
        };
        let mut slab = Slab::init(ptr.as_ptr(), total, self.order_max + 1);
        unsafe { slab.as_mut() }.in_use = self.order_max + 2;
        let mut lists = self.lists.borrow_mut();
        Self::push_allocated(&mut lists, slab);
        lists.stats.total += total;
        lists.stats.used += total;
        Some(slab)
    }

    /// Free a large slab.
    ///
    /// # Safety
    /// `slab` must come from `get_large` on this cache.
    pub unsafe fn put_large(&self, slab: NonNull<Slab>) {
        self.check_thread();
        let (size, layout) = {
            let header = unsafe { slab.as_ref() };
            debug_assert_eq!(header.magic, SLAB_MAGIC);
            debug_assert_eq!(header.order, self.order_max + 1);
            (header.size, large_layout(header.size))
        };
        {
            let mut lists = self.lists.borrow_mut();
            Self::remove_allocated(&mut lists, slab);
            lists.stats.total -= size;
            lists.stats.used -= size;
        }
        unsafe { std::alloc::dealloc(slab.as_ptr() as *mut u8, layout) };
        self.quota().release(size);
    }

    // -- dispatchers ----------------------------------------------------------

    /// Get a slab with at least `size` bytes of payload, ordered when
    /// possible, large otherwise.
    pub fn slab_get(&self, size: usize) -> Option<NonNull<Slab>> {
        let total = size + slab_header_size();
        let order = self.order(total);
        if order <= self.order_max {
            self.get_with_order(order)
        } else {
            self.get_large(size)
        }
    }

    /// Return a slab obtained from [`slab_get`](SlabCache::slab_get).
    ///
    /// # Safety
    /// Same contract as `put_with_order` / `put_large`.
    pub unsafe fn slab_put(&self, slab: NonNull<Slab>) {
        if unsafe { slab.as_ref() }.order <= self.order_max {
            unsafe { self.put_with_order(slab) };
        } else {
            unsafe { self.put_large(slab) };
        }
    }
}

fn large_layout(total: usize) -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(total, 16).expect("slab size overflow")
}

impl Drop for SlabCache<'_> {
    fn drop(&mut self) {
        let mut lists = self.lists.borrow_mut();
        debug_assert_eq!(lists.stats.used, 0, "slab leak in cache");
        for slab in lists.allocated.drain(..) {
            let header = unsafe { slab.as_ref() };
            if header.order <= self.order_max {
                unsafe {
                    self.arena
                        .unmap(NonNull::new_unchecked(slab.as_ptr() as *mut u8))
                };
            } else {
                let layout = large_layout(header.size);
                self.quota().release(header.size);
                unsafe { std::alloc::dealloc(slab.as_ptr() as *mut u8, layout) };
            }
        }
    }
}
