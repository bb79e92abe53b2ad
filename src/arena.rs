// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// slab_arena: a thread-safe source of large, uniformly sized,
// size-aligned byte blocks ("raw slabs"). Slabs come from an optional
// preallocated region or fresh anonymous mappings, every byte charged
// against a shared quota. Freed slabs are recycled through a lock-free
// LIFO and never returned to the operating system before the arena is
// dropped.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::lifo::LfLifo;
use crate::platform;
use crate::quota::Quota;

/// Smallest possible slab size. The two low bytes of a slab address
/// are reused as the ABA counter of the recycle list, so slabs must be
/// aligned to at least 64 KiB.
pub const SLAB_MIN_SIZE: usize = 1 << 16;

/// Mapping behavior of an arena. Exactly one of `PRIVATE` and `SHARED`
/// must be set; `DONTDUMP` may be OR-ed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaFlags(u32);

impl ArenaFlags {
    /// MAP_PRIVATE mappings (the default for a single process).
    pub const PRIVATE: ArenaFlags = ArenaFlags(1 << 0);
    /// MAP_SHARED mappings, for memory inherited across fork().
    pub const SHARED: ArenaFlags = ArenaFlags(1 << 1);
    /// Advise the kernel to keep slabs out of core dumps.
    pub const DONTDUMP: ArenaFlags = ArenaFlags(1 << 2);

    pub const fn contains(self, other: ArenaFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ArenaFlags {
    type Output = ArenaFlags;

    fn bitor(self, rhs: ArenaFlags) -> ArenaFlags {
        ArenaFlags(self.0 | rhs.0)
    }
}

/// An arena of raw slabs.
///
/// `map` and `unmap` are safe to call from any number of threads; the
/// quota and the recycle list are the only synchronization points.
pub struct SlabArena<'q> {
    /// Recycled slabs. Memory in the list stays charged to the quota.
    cache: LfLifo,
    /// Preallocated contiguous region, or null.
    arena: *mut u8,
    /// Size of the preallocated region, whole slabs.
    prealloc: usize,
    /// Bytes handed out so far; the part below `prealloc` doubles as
    /// the slicing watermark into the preallocated region.
    used: AtomicUsize,
    quota: &'q Quota,
    slab_size: usize,
    flags: ArenaFlags,
    /// DONTDUMP was requested and the probe confirmed the kernel
    /// honors it.
    dontdump: bool,
}

impl<'q> SlabArena<'q> {
    /// Create an arena.
    ///
    /// `slab_size` is rounded up to a power of two with a floor of
    /// [`SLAB_MIN_SIZE`]; `prealloc` is rounded up to whole slabs and
    /// clamped to the quota. A zero `prealloc` arena maps every slab
    /// on demand.
    pub fn new(
        quota: &'q Quota,
        prealloc: usize,
        slab_size: usize,
        flags: ArenaFlags,
    ) -> io::Result<Self> {
        assert!(
            flags.contains(ArenaFlags::PRIVATE) ^ flags.contains(ArenaFlags::SHARED),
            "exactly one of PRIVATE and SHARED must be set"
        );
        let slab_size = crate::util::round_up_pow2(slab_size.max(SLAB_MIN_SIZE));
        // Prealloc cannot exceed the quota, and extreme sizes cannot
        // be aligned.
        let prealloc = prealloc.min(quota.total()).min(usize::MAX - slab_size);
        let prealloc = crate::util::align_up(prealloc, slab_size);

        let dontdump = flags.contains(ArenaFlags::DONTDUMP) && platform::dontdump_supported();
        if flags.contains(ArenaFlags::DONTDUMP) && !dontdump {
            log::warn!("MADV_DONTDUMP requested but not supported; slabs will be dumped");
        }

        let arena = if prealloc != 0 {
            let ptr =
                platform::mmap_aligned(prealloc, slab_size, flags.contains(ArenaFlags::SHARED))?;
            if dontdump {
                platform::madvise_dontdump(ptr.as_ptr(), prealloc);
            }
            ptr.as_ptr()
        } else {
            std::ptr::null_mut()
        };

        Ok(SlabArena {
            cache: LfLifo::new(),
            arena,
            prealloc,
            used: AtomicUsize::new(0),
            quota,
            slab_size,
            flags,
            dontdump,
        })
    }

    /// The size of every slab handed out by this arena.
    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Bytes of the preallocated region.
    pub fn prealloc(&self) -> usize {
        self.prealloc
    }

    /// Bytes sliced from the preallocated region or mapped on demand
    /// (recycled slabs stay counted).
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// The quota backing this arena.
    pub fn quota(&self) -> &'q Quota {
        self.quota
    }

    /// Get a slab, aligned to the slab size.
    ///
    /// Recycled slabs are preferred and cost no quota traffic. A fresh
    /// slab is admitted against the quota first, then sliced from the
    /// preallocated region or mapped from the OS. Returns `None` when
    /// the quota is exhausted or the mapping fails.
    pub fn map(&self) -> Option<NonNull<u8>> {
        if let Some(ptr) = self.cache.pop() {
            return Some(ptr);
        }

        self.quota.try_use(self.slab_size)?;

        let used = self.used.fetch_add(self.slab_size, Ordering::Relaxed) + self.slab_size;
        if used <= self.prealloc {
            let ptr = unsafe { self.arena.add(used - self.slab_size) };
            return Some(unsafe { NonNull::new_unchecked(ptr) });
        }

        match platform::mmap_aligned(
            self.slab_size,
            self.slab_size,
            self.flags.contains(ArenaFlags::SHARED),
        ) {
            Ok(ptr) => {
                if self.dontdump {
                    platform::madvise_dontdump(ptr.as_ptr(), self.slab_size);
                }
                Some(ptr)
            }
            Err(err) => {
                log::warn!("arena slab mapping failed: {err}");
                self.used.fetch_sub(self.slab_size, Ordering::Relaxed);
                self.quota.release(self.slab_size);
                None
            }
        }
    }

    /// Return a slab to the recycle list. The quota stays charged; the
    /// memory is reused by a later [`map`](SlabArena::map).
    ///
    /// # Safety
    /// `ptr` must have been returned by `map` on this arena and must
    /// not be used after the call.
    pub unsafe fn unmap(&self, ptr: NonNull<u8>) {
        debug_assert_eq!(ptr.as_ptr() as usize & (self.slab_size - 1), 0);
        unsafe { self.cache.push(ptr) };
    }

    fn in_prealloc(&self, ptr: *mut u8) -> bool {
        !self.arena.is_null()
            && ptr >= self.arena
            && (ptr as usize) < self.arena as usize + self.prealloc
    }
}

impl Drop for SlabArena<'_> {
    fn drop(&mut self) {
        // Every slab must be back in the recycle list by now; unmap
        // the ones that did not come from the preallocated region.
        let mut total = 0;
        while let Some(ptr) = self.cache.pop() {
            if !self.in_prealloc(ptr.as_ptr()) {
                platform::munmap_checked(ptr.as_ptr(), self.slab_size);
            }
            total += self.slab_size;
        }
        if !self.arena.is_null() {
            platform::munmap_checked(self.arena, self.prealloc);
        }
        debug_assert_eq!(total, self.used.load(Ordering::Relaxed), "slabs leaked");
    }
}

// Safety: all mutable state is behind atomics or the lock-free list.
unsafe impl Send for SlabArena<'_> {}
unsafe impl Sync for SlabArena<'_> {}
