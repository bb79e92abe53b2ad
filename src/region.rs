// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// region: a bump allocator over a stack of cache slabs. Good for many
// allocations of mixed sizes that die together: there is no per-object
// free, only rollback to a savepoint (`truncate`), rewind (`reset`) or
// full release (`free`). Observer callbacks let an owner meter its
// consumers' allocation traffic.

use std::ptr::NonNull;

use crate::slab_cache::{Slab, SlabCache};
use crate::util::align_up;

/// One block of a region: a cache slab plus the bump offset into its
/// payload.
struct RSlab {
    slab: NonNull<Slab>,
    used: usize,
}

impl RSlab {
    fn data(&self) -> *mut u8 {
        unsafe { self.slab.as_ref() }.data()
    }

    fn data_end(&self) -> *mut u8 {
        unsafe { self.data().add(self.used) }
    }

    fn unused(&self) -> usize {
        unsafe { self.slab.as_ref() }.capacity() - self.used
    }
}

/// A stack-discipline bump allocator.
pub struct Region<'a> {
    cache: &'a SlabCache<'a>,
    /// Blocks, newest last.
    slabs: Vec<RSlab>,
    used: usize,
    total: usize,
    on_alloc: Option<Box<dyn FnMut(usize) + 'a>>,
    on_truncate: Option<Box<dyn FnMut(usize) + 'a>>,
    /// Guards against two reserves without an alloc in between, which
    /// would silently move the first reservation.
    #[cfg(debug_assertions)]
    reserved: bool,
}

impl<'a> Region<'a> {
    pub fn new(cache: &'a SlabCache<'a>) -> Self {
        Region {
            cache,
            slabs: Vec::new(),
            used: 0,
            total: 0,
            on_alloc: None,
            on_truncate: None,
            #[cfg(debug_assertions)]
            reserved: false,
        }
    }

    /// Install observer callbacks. `on_alloc` receives the effective
    /// size of every allocation (alignment padding included);
    /// `on_truncate` receives the usage after every truncation.
    pub fn set_callbacks(
        &mut self,
        on_alloc: Option<Box<dyn FnMut(usize) + 'a>>,
        on_truncate: Option<Box<dyn FnMut(usize) + 'a>>,
    ) {
        self.on_alloc = on_alloc;
        self.on_truncate = on_truncate;
    }

    /// Bytes allocated. The value doubles as a savepoint for
    /// [`truncate`](Region::truncate).
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes held, including unused slab tails.
    pub fn total(&self) -> usize {
        self.total
    }

    #[inline]
    fn note_reserve(&mut self) {
        #[cfg(debug_assertions)]
        {
            assert!(!self.reserved, "two reserves without an alloc");
            self.reserved = true;
        }
    }

    #[inline]
    fn note_alloc(&mut self) {
        #[cfg(debug_assertions)]
        {
            self.reserved = false;
        }
    }

    /// Ensure `size` contiguous bytes at the tail without committing
    /// them. The returned pointer stays valid until the next reserve
    /// or alloc.
    pub fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.note_reserve();
        if let Some(last) = self.slabs.last() {
            if size <= last.unused() {
                return Some(unsafe { NonNull::new_unchecked(last.data_end()) });
            }
        }
        self.reserve_slow(size)
    }

    #[cold]
    fn reserve_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        let slab = self.cache.slab_get(size)?;
        self.total += unsafe { slab.as_ref() }.size();
        self.slabs.push(RSlab { slab, used: 0 });
        Some(unsafe { NonNull::new_unchecked(self.slabs.last().unwrap().data()) })
    }

    fn commit(&mut self, size: usize) {
        let last = self.slabs.last_mut().expect("commit without reserve");
        debug_assert!(size <= last.unused());
        last.used += size;
        self.used += size;
        if let Some(cb) = self.on_alloc.as_mut() {
            cb(size);
        }
    }

    /// Allocate `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.note_alloc();
        let ptr = self.reserve(size)?;
        self.note_alloc();
        self.commit(size);
        Some(ptr)
    }

    /// Reserve `size` bytes whose address is aligned to `alignment`.
    pub fn aligned_reserve(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        // Over-reserve so the aligned cut still fits.
        let ptr = self.reserve(size + alignment - 1)?;
        let aligned = align_up(ptr.as_ptr() as usize, alignment) as *mut u8;
        Some(unsafe { NonNull::new_unchecked(aligned) })
    }

    /// Allocate `size` bytes aligned to `alignment`. The padding in
    /// front of the returned block is committed together with it.
    pub fn aligned_alloc(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.note_alloc();
        let ptr = self.aligned_reserve(size, alignment)?;
        self.note_alloc();
        let tail = self.slabs.last().unwrap().data_end();
        let effective = ptr.as_ptr() as usize - tail as usize + size;
        self.commit(effective);
        Some(ptr)
    }

    /// Roll back to a savepoint previously obtained from
    /// [`used`](Region::used): newer blocks are released, the block
    /// holding the mark is rewound.
    pub fn truncate(&mut self, used: usize) {
        assert!(used <= self.used);
        let mut cut = self.used - used;
        while cut > 0 {
            let last = self.slabs.last_mut().expect("truncate bookkeeping broke");
            if last.used > cut {
                last.used -= cut;
                break;
            }
            cut -= last.used;
            let rslab = self.slabs.pop().unwrap();
            self.total -= unsafe { rslab.slab.as_ref() }.size();
            unsafe { self.cache.slab_put(rslab.slab) };
        }
        self.used = used;
        self.note_alloc();
        if let Some(cb) = self.on_truncate.as_mut() {
            cb(used);
        }
    }

    /// Forget every allocation but keep the blocks for reuse.
    pub fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.used = 0;
        }
        self.used = 0;
        self.note_alloc();
        if let Some(cb) = self.on_truncate.as_mut() {
            cb(0);
        }
    }

    /// Forget every allocation and release the blocks.
    pub fn free(&mut self) {
        for rslab in self.slabs.drain(..) {
            unsafe { self.cache.slab_put(rslab.slab) };
        }
        self.used = 0;
        self.total = 0;
        self.note_alloc();
        if let Some(cb) = self.on_truncate.as_mut() {
            cb(0);
        }
    }

    /// Return the last `size` allocated bytes as one contiguous chunk.
    ///
    /// When they already live in a single block the existing bytes are
    /// returned in place; otherwise fresh space is allocated and the
    /// pieces are copied over in order.
    pub fn join(&mut self, size: usize) -> Option<NonNull<u8>> {
        assert!(size <= self.used);
        let newest = self.slabs.last().expect("join on an empty region");
        if newest.used >= size {
            return Some(unsafe { NonNull::new_unchecked(newest.data_end().sub(size)) });
        }

        // The bytes straddle blocks: allocate a contiguous copy. The
        // source layout is untouched by the allocation, only the tail
        // grows.
        let pre_idx = self.slabs.len() - 1;
        let pre_used = newest.used;
        let ptr = self.alloc(size)?;

        let mut remaining = size;
        let mut idx = pre_idx;
        let mut src_used = pre_used;
        while remaining > 0 {
            let rslab = &self.slabs[idx];
            let copy = remaining.min(src_used);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    rslab.data().add(src_used - copy),
                    ptr.as_ptr().add(remaining - copy),
                    copy,
                );
            }
            remaining -= copy;
            if remaining == 0 {
                break;
            }
            idx = idx.checked_sub(1).expect("joined bytes were not allocated");
            src_used = self.slabs[idx].used;
        }
        Some(ptr)
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.free();
    }
}
