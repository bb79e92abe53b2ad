// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// obuf: a scatter-gather output buffer, a vector of iovec entries
// ready for writev(). Every entry is its own slab; declared capacities
// double from start_capacity, so the hard limit of 31 entries is
// practically unreachable. Written bytes never move: growing opens a
// new entry instead of relocating, which keeps pointers handed out by
// reserve/alloc stable until rollback or reset.

use std::ptr::NonNull;

use crate::slab_cache::{Slab, SlabCache};

/// Hard limit on the number of iovec entries.
pub const SMALL_OBUF_IOV_MAX: usize = 31;

/// A savepoint of an output buffer: position triple restored by
/// [`Obuf::rollback_to_svp`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObufSvp {
    pub pos: usize,
    pub iov_len: usize,
    pub used: usize,
}

/// Producer/consumer hand-off savepoints, cache-line aligned so two
/// threads ping-ponging over them do not false-share the iov array.
#[derive(Clone, Copy, Debug, Default)]
#[repr(align(64))]
struct WriteSvps {
    wpos: ObufSvp,
    wend: ObufSvp,
}

const ZERO_IOV: libc::iovec = libc::iovec {
    iov_base: std::ptr::null_mut(),
    iov_len: 0,
};

/// An output buffer for vectored writes.
pub struct Obuf<'a> {
    cache: &'a SlabCache<'a>,
    /// Index of the current entry.
    pos: usize,
    /// Number of allocated entries.
    n_iov: usize,
    /// Payload bytes in the buffer.
    used: usize,
    /// Capacity of entry 0; later entries double it.
    start_capacity: usize,
    /// Declared capacity per entry (the backing slab may be bigger).
    capacity: [usize; SMALL_OBUF_IOV_MAX + 1],
    /// The entry after the last allocated one stays zeroed as a
    /// terminator.
    iov: [libc::iovec; SMALL_OBUF_IOV_MAX + 1],
    svps: WriteSvps,
    /// Guards against two reserves without an alloc in between.
    #[cfg(debug_assertions)]
    reserved: bool,
}

impl<'a> Obuf<'a> {
    pub fn new(cache: &'a SlabCache<'a>, start_capacity: usize) -> Self {
        assert!(start_capacity > 0);
        Obuf {
            cache,
            pos: 0,
            n_iov: 0,
            used: 0,
            start_capacity,
            capacity: [0; SMALL_OBUF_IOV_MAX + 1],
            iov: [ZERO_IOV; SMALL_OBUF_IOV_MAX + 1],
            svps: WriteSvps::default(),
            #[cfg(debug_assertions)]
            reserved: false,
        }
    }

    /// Payload bytes written so far.
    pub fn size(&self) -> usize {
        self.used
    }

    /// Number of entries writev() should be given.
    pub fn iovcnt(&self) -> usize {
        if self.iov[self.pos].iov_len > 0 {
            self.pos + 1
        } else {
            self.pos
        }
    }

    /// The entries holding written payload.
    pub fn iovecs(&self) -> &[libc::iovec] {
        &self.iov[..self.iovcnt()]
    }

    /// Index of the current entry.
    pub fn pos(&self) -> usize {
        self.pos
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

    fn tail(&self) -> *mut u8 {
        let iov = &self.iov[self.pos];
        unsafe { (iov.iov_base as *mut u8).add(iov.iov_len) }
    }

    /// Ensure `size` contiguous bytes are writable and return their
    /// address. The reservation may open a fresh entry but never moves
    /// bytes written before it.
    pub fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.note_reserve();
        let ptr = if self.iov[self.pos].iov_len + size <= self.capacity[self.pos] {
            self.tail()
        } else {
            match self.reserve_slow(size) {
                Some(ptr) => ptr.as_ptr(),
                None => {
                    self.note_alloc();
                    return None;
                }
            }
        };
        NonNull::new(ptr)
    }

    #[cold]
    fn reserve_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.iov[self.pos].iov_len > 0 {
            // The current entry is in use and too small; move on.
            self.pos += 1;
            if self.pos >= SMALL_OBUF_IOV_MAX {
                self.pos -= 1;
                log::warn!("obuf overflow: more than {SMALL_OBUF_IOV_MAX} iovec entries needed");
                return None;
            }
        }
        let capacity = self.capacity[self.pos];
        if capacity < size {
            let new_capacity = if self.pos == 0 {
                size.max(self.start_capacity)
            } else {
                size.max(self.capacity[self.pos - 1] * 2)
            };
            let slab = self.cache.slab_get(new_capacity)?;
            if capacity != 0 {
                // A leftover entry from a rollback is too small for
                // this reservation; trade it for a bigger slab. It is
                // empty, so nothing needs copying.
                debug_assert_eq!(self.iov[self.pos].iov_len, 0);
                unsafe {
                    self.cache
                        .slab_put(Slab::from_data(self.iov[self.pos].iov_base as *mut u8))
                };
                self.n_iov -= 1;
            }
            self.iov[self.pos].iov_base = unsafe { slab.as_ref() }.data() as *mut libc::c_void;
            self.capacity[self.pos] = new_capacity;
            self.n_iov += 1;
        }
        NonNull::new(self.tail())
    }

    /// Reserve and commit `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.note_alloc();
        let ptr = if self.iov[self.pos].iov_len + size <= self.capacity[self.pos] {
            self.tail()
        } else {
            self.reserve_slow(size)?.as_ptr()
        };
        self.iov[self.pos].iov_len += size;
        self.used += size;
        NonNull::new(ptr)
    }

    /// Append a copy of `data`, splitting it over entries as needed.
    /// Returns the number of bytes actually copied, which is less than
    /// `data.len()` only when memory runs out.
    pub fn dup(&mut self, data: &[u8]) -> usize {
        self.note_alloc();
        let mut copied = 0;
        while copied < data.len() {
            let room = self.capacity[self.pos] - self.iov[self.pos].iov_len;
            if room == 0 {
                if self.reserve_slow(data.len() - copied).is_none() {
                    break;
                }
                continue;
            }
            let copy = room.min(data.len() - copied);
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr().add(copied), self.tail(), copy);
            }
            self.iov[self.pos].iov_len += copy;
            self.used += copy;
            copied += copy;
        }
        copied
    }

    /// Capture the current buffer state.
    pub fn create_svp(&self) -> ObufSvp {
        ObufSvp {
            pos: self.pos,
            iov_len: self.iov[self.pos].iov_len,
            used: self.used,
        }
    }

    /// Forget everything written after `svp` was taken, returning the
    /// entries opened since then to the slab cache.
    pub fn rollback_to_svp(&mut self, svp: &ObufSvp) {
        self.note_alloc();
        for i in svp.pos + 1..self.n_iov {
            unsafe {
                self.cache
                    .slab_put(Slab::from_data(self.iov[i].iov_base as *mut u8))
            };
            self.iov[i] = ZERO_IOV;
            self.capacity[i] = 0;
        }
        self.pos = svp.pos;
        self.iov[self.pos].iov_len = svp.iov_len;
        self.used = svp.used;
        self.n_iov = self.pos + usize::from(!self.iov[self.pos].iov_base.is_null());
    }

    /// The buffer address a savepoint refers to.
    pub fn svp_to_ptr(&self, svp: &ObufSvp) -> *mut u8 {
        unsafe { (self.iov[svp.pos].iov_base as *mut u8).add(svp.iov_len) }
    }

    /// Forget all payload but keep the entries allocated.
    pub fn reset(&mut self) {
        self.note_alloc();
        for iov in self.iov.iter_mut().take(self.n_iov) {
            iov.iov_len = 0;
        }
        self.pos = 0;
        self.used = 0;
    }

    /// The producer-side hand-off savepoint.
    pub fn wpos(&self) -> ObufSvp {
        self.svps.wpos
    }

    pub fn set_wpos(&mut self, svp: ObufSvp) {
        self.svps.wpos = svp;
    }

    /// The consumer-side hand-off savepoint.
    pub fn wend(&self) -> ObufSvp {
        self.svps.wend
    }

    pub fn set_wend(&mut self, svp: ObufSvp) {
        self.svps.wend = svp;
    }
}

impl Drop for Obuf<'_> {
    fn drop(&mut self) {
        for i in 0..self.n_iov {
            if !self.iov[i].iov_base.is_null() {
                unsafe {
                    self.cache
                        .slab_put(Slab::from_data(self.iov[i].iov_base as *mut u8))
                };
            }
        }
    }
}
