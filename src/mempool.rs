// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// mempool: a pool of equally sized objects carved out of ordered slabs.
//
// Objects of one slab are tracked with an intrusive free list threaded
// through the dead slots plus a bump offset over the never-touched
// tail, so a slab costs one header and nothing per object. Partially
// free slabs ("hot") sit in an address-ordered set and allocation
// always takes the lowest address, which concentrates load at low
// addresses and lets high slabs drain empty. Slabs with almost no free
// slots rest in a "cold" list until an eighth of their slots return.
// One fully empty slab is retained as a spare to keep a free/alloc
// oscillation from hammering the slab cache.

use std::collections::BTreeSet;
use std::ptr::NonNull;

use crate::lifo::Lifo;
use crate::slab_cache::{Slab, SlabCache, SmallStats};
use crate::util::align_up;

/// Fragmentation target: slabs are sized so the header overhead stays
/// around one percent.
const OVERHEAD_RATIO: usize = 100;

/// Cold slabs go hot again when this fraction (1/8) of their slots is
/// free.
const COLD_FRACTION_LB: u32 = 3;

const INVALID_IDX: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// MSlab: per-slab header
// ---------------------------------------------------------------------------

/// An ordered slab formatted to store objects of one size.
#[repr(C)]
pub struct MSlab {
    slab: Slab,
    /// Intrusive list of freed slots.
    free_list: *mut u8,
    /// Offset of the first never-allocated byte, from the slab start.
    free_offset: u32,
    /// Free slots, both listed and untouched.
    nfree: u32,
    /// Position in the pool's cold list, or invalid.
    cold_idx: u32,
    /// Position in the pool's all-slabs list.
    slabs_idx: u32,
    in_hot: bool,
    /// Owning pool, for identity checks on free.
    pool: *const u8,
}

/// Aligned size of the mslab header.
#[inline]
pub fn mslab_header_size() -> usize {
    align_up(std::mem::size_of::<MSlab>(), std::mem::size_of::<usize>())
}

impl MSlab {
    fn base(&self) -> *mut u8 {
        self as *const MSlab as *mut u8
    }

    /// The slab-cache view of this slab.
    pub fn slab(&self) -> &Slab {
        &self.slab
    }

    pub fn nfree(&self) -> u32 {
        self.nfree
    }

    /// The pool this slab belongs to, as an opaque address.
    pub fn pool_addr(&self) -> *const u8 {
        self.pool
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// A per-pool statistics record.
#[derive(Clone, Copy, Debug, Default)]
pub struct MempoolStats {
    /// Object size.
    pub objsize: u32,
    /// Objects currently allocated.
    pub objcount: u32,
    /// Size of one slab.
    pub slabsize: u32,
    /// Number of slabs held.
    pub slabcount: u32,
    /// Used and usable byte totals.
    pub totals: SmallStats,
}

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

/// A fixed-size object pool over one slab order.
pub struct Mempool<'a> {
    cache: &'a SlabCache<'a>,
    /// used counts object bytes, total counts slab bytes.
    stats: SmallStats,
    /// Every slab of the pool, for teardown and the slab count.
    slabs: Vec<NonNull<MSlab>>,
    /// Addresses of hot slabs, ordered.
    hot: BTreeSet<usize>,
    /// Cached leftmost of `hot`.
    first_hot: Option<NonNull<MSlab>>,
    /// Almost-full slabs waiting for a free burst.
    cold: Vec<NonNull<MSlab>>,
    /// At most one retained fully empty slab.
    spare: Option<NonNull<MSlab>>,
    /// Objects queued by a delayed-free owner (see small_alloc).
    pub(crate) delayed: Lifo,
    objsize: u32,
    objcount: u32,
    /// First-object offset from the slab start.
    offset: u32,
    slab_order: u8,
    /// Masking an object address with this yields its mslab.
    slab_ptr_mask: usize,
}

impl<'a> Mempool<'a> {
    /// Create a pool of `objsize`-byte objects, picking the slab order
    /// by the fragmentation target.
    pub fn new(cache: &'a SlabCache<'a>, objsize: u32) -> Self {
        let overhead = (objsize as usize).max(mslab_header_size());
        let slab_size = (overhead * OVERHEAD_RATIO).min(cache.arena().slab_size());
        let order = cache.order(slab_size);
        debug_assert!(order <= cache.order_max());
        Self::with_order(cache, objsize, order)
    }

    /// Create a pool with an explicit slab order.
    pub fn with_order(cache: &'a SlabCache<'a>, objsize: u32, order: u8) -> Self {
        assert!(order <= cache.order_max());
        assert!(objsize as usize >= std::mem::size_of::<*mut u8>());
        let slab_size = cache.order_size(order);
        let objcount = ((slab_size - mslab_header_size()) / objsize as usize) as u32;
        assert!(objcount > 0, "object does not fit in a slab");
        // Lay objects out from the end of the slab, which both aligns
        // the first object and keeps the tail flush with the slab end.
        let offset = (slab_size - objcount as usize * objsize as usize) as u32;
        Mempool {
            cache,
            stats: SmallStats::default(),
            slabs: Vec::new(),
            hot: BTreeSet::new(),
            first_hot: None,
            cold: Vec::new(),
            spare: None,
            delayed: Lifo::new(),
            objsize,
            objcount,
            offset,
            slab_order: order,
            slab_ptr_mask: !(slab_size - 1),
        }
    }

    pub fn objsize(&self) -> u32 {
        self.objsize
    }

    pub fn objcount_per_slab(&self) -> u32 {
        self.objcount
    }

    pub fn slab_order(&self) -> u8 {
        self.slab_order
    }

    pub fn slab_ptr_mask(&self) -> usize {
        self.slab_ptr_mask
    }

    /// Bytes of live objects.
    pub fn used(&self) -> usize {
        self.stats.used
    }

    /// Bytes of slabs held by the pool.
    pub fn total(&self) -> usize {
        self.stats.total
    }

    /// Number of live objects.
    pub fn count(&self) -> usize {
        self.stats.used / self.objsize as usize
    }

    pub fn stats(&self) -> MempoolStats {
        let slabsize = self.cache.order_size(self.slab_order) as u32;
        let slabcount = (self.stats.total / slabsize as usize) as u32;
        MempoolStats {
            objsize: self.objsize,
            objcount: self.count() as u32,
            slabsize,
            slabcount,
            totals: SmallStats {
                used: self.stats.used,
                total: self.stats.total - mslab_header_size() * slabcount as usize,
            },
        }
    }

    /// Recover the owning mslab of an object allocated in this pool.
    ///
    /// # Safety
    /// `ptr` must point into an object obtained from this pool's
    /// [`alloc`](Mempool::alloc) that has not been freed.
    pub unsafe fn owning_slab(&self, ptr: NonNull<u8>) -> NonNull<MSlab> {
        let slab = unsafe { Slab::from_ptr(ptr.as_ptr(), self.slab_ptr_mask) };
        let mslab = slab.cast::<MSlab>();
        debug_assert_eq!(
            unsafe { mslab.as_ref() }.pool,
            self as *const Mempool as *const u8,
            "object freed into a foreign pool"
        );
        mslab
    }

    // -- hot set maintenance --------------------------------------------------

    fn hot_insert(&mut self, slab: NonNull<MSlab>) {
        let addr = slab.as_ptr() as usize;
        self.hot.insert(addr);
        unsafe { (*slab.as_ptr()).in_hot = true };
        match self.first_hot {
            Some(first) if (first.as_ptr() as usize) < addr => {}
            _ => self.first_hot = Some(slab),
        }
    }

    fn hot_remove(&mut self, slab: NonNull<MSlab>) {
        let addr = slab.as_ptr() as usize;
        self.hot.remove(&addr);
        unsafe { (*slab.as_ptr()).in_hot = false };
        if self.first_hot == Some(slab) {
            self.first_hot = self
                .hot
                .iter()
                .next()
                .map(|&a| unsafe { NonNull::new_unchecked(a as *mut MSlab) });
        }
    }

    fn cold_push(&mut self, slab: NonNull<MSlab>) {
        unsafe { (*slab.as_ptr()).cold_idx = self.cold.len() as u32 };
        self.cold.push(slab);
    }

    fn cold_remove(&mut self, slab: NonNull<MSlab>) {
        let idx = unsafe { slab.as_ref() }.cold_idx as usize;
        unsafe { (*slab.as_ptr()).cold_idx = INVALID_IDX };
        debug_assert_eq!(self.cold[idx], slab);
        self.cold.swap_remove(idx);
        if let Some(moved) = self.cold.get(idx) {
            unsafe { (*moved.as_ptr()).cold_idx = idx as u32 };
        }
    }

    // -- slab lifecycle -------------------------------------------------------

    fn format_slab(&mut self, slab: NonNull<Slab>) -> NonNull<MSlab> {
        let mslab = slab.cast::<MSlab>();
        // Field writes through the raw pointer: everything past the
        // slab header is uninitialized until here.
        unsafe {
            let header = mslab.as_ptr();
            (*header).free_list = std::ptr::null_mut();
            (*header).free_offset = self.offset;
            (*header).nfree = self.objcount;
            (*header).cold_idx = INVALID_IDX;
            (*header).in_hot = false;
            (*header).pool = self as *const Mempool as *const u8;
            (*header).slabs_idx = self.slabs.len() as u32;
        }
        self.slabs.push(mslab);
        self.stats.total += self.cache.order_size(self.slab_order);
        mslab
    }

    fn release_slab(&mut self, slab: NonNull<MSlab>) {
        let idx = unsafe { slab.as_ref() }.slabs_idx as usize;
        debug_assert_eq!(self.slabs[idx], slab);
        self.slabs.swap_remove(idx);
        if let Some(moved) = self.slabs.get(idx) {
            unsafe { (*moved.as_ptr()).slabs_idx = idx as u32 };
        }
        self.stats.total -= self.cache.order_size(self.slab_order);
        unsafe { self.cache.put_with_order(slab.cast::<Slab>()) };
    }

    // -- alloc / free ---------------------------------------------------------

    /// Allocate one object. Returns `None` when the quota or the
    /// address space is exhausted.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let slab = match self.first_hot {
            Some(slab) => slab,
            None => {
                let slab = if let Some(spare) = self.spare.take() {
                    spare
                } else if let Some(&cold) = self.cold.last() {
                    self.cold_remove(cold);
                    cold
                } else {
                    let raw = self.cache.get_with_order(self.slab_order)?;
                    self.format_slab(raw)
                };
                debug_assert!(!unsafe { slab.as_ref() }.in_hot);
                self.hot_insert(slab);
                slab
            }
        };
        self.stats.used += self.objsize as usize;
        Some(self.mslab_alloc(slab))
    }

    fn mslab_alloc(&mut self, mut slab: NonNull<MSlab>) -> NonNull<u8> {
        let header = unsafe { slab.as_mut() };
        debug_assert!(header.nfree > 0);
        let result = if !header.free_list.is_null() {
            // Recycle a slot. The link is copied bytewise: an object
            // size that is not pointer-aligned leaves slots misaligned
            // for a plain pointer load.
            let result = header.free_list;
            let mut next: *mut u8 = std::ptr::null_mut();
            unsafe {
                std::ptr::copy_nonoverlapping(
                    result as *const u8,
                    &mut next as *mut *mut u8 as *mut u8,
                    std::mem::size_of::<*mut u8>(),
                );
            }
            header.free_list = next;
            result
        } else {
            // Bump into the untouched tail.
            let result = unsafe { header.base().add(header.free_offset as usize) };
            header.free_offset += self.objsize;
            result
        };
        header.nfree -= 1;
        if header.nfree == 0 {
            self.hot_remove(slab);
        }
        unsafe { NonNull::new_unchecked(result) }
    }

    /// Free an object back to the pool.
    ///
    /// # Safety
    /// `ptr` must come from this pool's `alloc` and must not be used
    /// afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let slab = unsafe { self.owning_slab(ptr) };
        debug_assert_eq!(unsafe { slab.as_ref() }.slab.order(), self.slab_order);
        self.stats.used -= self.objsize as usize;
        unsafe { self.mslab_free(slab, ptr) };
    }

    unsafe fn mslab_free(&mut self, mut slab: NonNull<MSlab>, ptr: NonNull<u8>) {
        let (nfree, in_hot, in_cold) = {
            let header = unsafe { slab.as_mut() };
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &header.free_list as *const *mut u8 as *const u8,
                    ptr.as_ptr(),
                    std::mem::size_of::<*mut u8>(),
                );
            }
            header.free_list = ptr.as_ptr();
            header.nfree += 1;
            (header.nfree, header.in_hot, header.cold_idx != INVALID_IDX)
        };

        if !in_hot && nfree >= self.objcount >> COLD_FRACTION_LB {
            // Fragmented enough to serve allocations again.
            if in_cold {
                self.cold_remove(slab);
            }
            self.hot_insert(slab);
        } else if nfree == 1 {
            self.cold_push(slab);
        } else if nfree == self.objcount {
            self.hot_remove(slab);
            // Keep a single empty slab, preferring the lower address.
            match self.spare {
                None => self.spare = Some(slab),
                Some(spare) if spare > slab => {
                    self.release_slab(spare);
                    self.spare = Some(slab);
                }
                Some(_) => self.release_slab(slab),
            }
        }
    }
}

impl Drop for Mempool<'_> {
    fn drop(&mut self) {
        for slab in std::mem::take(&mut self.slabs) {
            unsafe { self.cache.put_with_order(slab.cast::<Slab>()) };
        }
    }
}
