// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// lsregion: a log-structured region. Memory is treated as a
// sequentially written log: each allocation carries a caller-supplied
// 64-bit generation id, ids never decrease, and there is no individual
// free. Instead gc(min_id) drops whole slabs from the front of the log
// once every object they hold is older than min_id. Slabs come
// straight from an arena; one emptied slab is cached to absorb
// oscillation, and allocations larger than an arena slab get a
// dedicated heap-backed slab charged to the quota.

use std::collections::VecDeque;
use std::ptr::NonNull;

use crate::arena::SlabArena;
use crate::util::align_up;

/// max_id of a slab no allocation was tagged into yet. Sorts below
/// every real id, so empty tail slabs are always collectable.
pub const LSLAB_NOT_USED_ID: i64 = -1;

/// Header at the start of every log slab.
#[repr(C)]
struct LSlab {
    /// Allocated slab size; differs from the arena slab size only for
    /// oversized slabs.
    slab_size: usize,
    /// Used bytes, the aligned header included.
    slab_used: usize,
    /// The largest id allocated from this slab.
    max_id: i64,
}

#[inline]
fn lslab_header_size() -> usize {
    align_up(std::mem::size_of::<LSlab>(), std::mem::size_of::<usize>())
}

impl LSlab {
    unsafe fn init(ptr: *mut u8, size: usize) -> NonNull<LSlab> {
        let slab = ptr as *mut LSlab;
        unsafe {
            slab.write(LSlab {
                slab_size: size,
                slab_used: lslab_header_size(),
                max_id: LSLAB_NOT_USED_ID,
            });
            NonNull::new_unchecked(slab)
        }
    }

    fn base(&self) -> *mut u8 {
        self as *const LSlab as *mut u8
    }

    /// First unused byte.
    fn pos(&self) -> *mut u8 {
        unsafe { self.base().add(self.slab_used) }
    }

    fn end(&self) -> *mut u8 {
        unsafe { self.base().add(self.slab_size) }
    }
}

/// A generation-keyed log of allocations.
pub struct LsRegion<'a> {
    arena: &'a SlabArena<'a>,
    /// Log slabs, oldest in front.
    slabs: VecDeque<NonNull<LSlab>>,
    /// One retained empty slab.
    cached: Option<NonNull<LSlab>>,
    /// Allocated bytes (headers excluded).
    used: usize,
    /// Held bytes, the cached slab included.
    total: usize,
}

impl<'a> LsRegion<'a> {
    pub fn new(arena: &'a SlabArena<'a>) -> Self {
        assert!(arena.slab_size() > lslab_header_size());
        LsRegion {
            arena,
            slabs: VecDeque::new(),
            cached: None,
            used: 0,
            total: 0,
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn newest(&self) -> Option<&LSlab> {
        self.slabs.back().map(|slab| unsafe { slab.as_ref() })
    }

    /// Reserve `size` bytes aligned to `alignment` at the tail of the
    /// log. The next `aligned_alloc` with the same arguments is
    /// guaranteed to succeed and return the same address.
    pub fn aligned_reserve(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        if let Some(slab) = self.newest() {
            let pos = align_up(slab.pos() as usize, alignment);
            if pos + size <= slab.end() as usize {
                return Some(unsafe { NonNull::new_unchecked(pos as *mut u8) });
            }
        }
        self.reserve_slow(size, alignment)
    }

    /// Reserve `size` unaligned bytes.
    pub fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.aligned_reserve(size, 1)
    }

    #[cold]
    fn reserve_slow(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        let arena_slab_size = self.arena.slab_size();
        let worst_case = size + lslab_header_size() + alignment - 1;
        let slab = if worst_case > arena_slab_size {
            // Too big for the arena: a dedicated heap slab, charged to
            // the same quota.
            let quota = self.arena.quota();
            quota.try_use(worst_case)?;
            let layout = oversized_layout(worst_case);
            let ptr = unsafe { std::alloc::alloc(layout) };
            let Some(ptr) = NonNull::new(ptr) else {
                quota.release(worst_case);
                return None;
            };
            let slab = unsafe { LSlab::init(ptr.as_ptr(), worst_case) };
            self.total += worst_case;
            slab
        } else if let Some(cached) = self.cached.take() {
            // Already counted in total.
            cached
        } else {
            let ptr = self.arena.map()?;
            let slab = unsafe { LSlab::init(ptr.as_ptr(), arena_slab_size) };
            self.total += arena_slab_size;
            slab
        };
        self.slabs.push_back(slab);

        let header = unsafe { slab.as_ref() };
        let pos = align_up(header.pos() as usize, alignment);
        debug_assert!(pos + size <= header.end() as usize);
        Some(unsafe { NonNull::new_unchecked(pos as *mut u8) })
    }

    /// Allocate `size` bytes aligned to `alignment` and tag them with
    /// `id`. Ids must never decrease.
    pub fn aligned_alloc(
        &mut self,
        size: usize,
        alignment: usize,
        id: i64,
    ) -> Option<NonNull<u8>> {
        let ptr = self.aligned_reserve(size, alignment)?;
        let mut slab = *self.slabs.back().unwrap();
        let header = unsafe { slab.as_mut() };
        // The alignment padding is accounted as used.
        let effective = ptr.as_ptr() as usize - header.pos() as usize + size;
        debug_assert!(header.max_id <= id, "generation ids must not decrease");
        header.slab_used += effective;
        header.max_id = id;
        self.used += effective;
        Some(ptr)
    }

    /// Allocate `size` bytes tagged with `id`.
    pub fn alloc(&mut self, size: usize, id: i64) -> Option<NonNull<u8>> {
        self.aligned_alloc(size, 1, id)
    }

    /// Free every slab whose newest allocation is tagged `min_id` or
    /// older. Survivors only hold allocations with ids above `min_id`.
    pub fn gc(&mut self, min_id: i64) {
        while let Some(&front) = self.slabs.front() {
            let header = unsafe { front.as_ref() };
            if header.max_id > min_id {
                break;
            }
            self.slabs.pop_front();
            self.used -= header.slab_used - lslab_header_size();
            let slab_size = header.slab_size;
            if slab_size > self.arena.slab_size() {
                // Oversized slabs are never cached.
                self.total -= slab_size;
                unsafe { std::alloc::dealloc(front.as_ptr() as *mut u8, oversized_layout(slab_size)) };
                self.arena.quota().release(slab_size);
            } else if self.cached.is_some() {
                self.total -= slab_size;
                unsafe { self.arena.unmap(NonNull::new_unchecked(front.as_ptr() as *mut u8)) };
            } else {
                // Reset the header and keep the slab for the next
                // allocation burst; it stays counted in total.
                unsafe { LSlab::init(front.as_ptr() as *mut u8, slab_size) };
                self.cached = Some(front);
            }
        }
    }
}

fn oversized_layout(size: usize) -> std::alloc::Layout {
    std::alloc::Layout::from_size_align(size, 16).expect("lslab size overflow")
}

impl Drop for LsRegion<'_> {
    fn drop(&mut self) {
        self.gc(i64::MAX);
        if let Some(cached) = self.cached.take() {
            self.total -= unsafe { cached.as_ref() }.slab_size;
            unsafe { self.arena.unmap(NonNull::new_unchecked(cached.as_ptr() as *mut u8)) };
        }
        debug_assert_eq!(self.used, 0);
        debug_assert_eq!(self.total, 0);
    }
}
