// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// ibuf: an append-only input buffer backed by a single slab. Three
// cursors partition it, buf <= rpos <= wpos <= end: a reader consumes
// at rpos, a writer appends at wpos. Growth doubles the capacity,
// first reusing already consumed space at the front, then relocating
// to a bigger slab (ordered while one fits, large beyond that).
//
// Typical use: read a request into the buffer, process it at rpos,
// consume it, repeat. A savepoint is the used() value; truncate()
// rewinds the write end to it and survives relocations in between.

use std::ptr::NonNull;

use crate::slab_cache::{Slab, SlabCache};

/// A contiguous input buffer.
pub struct Ibuf<'a> {
    cache: &'a SlabCache<'a>,
    buf: *mut u8,
    /// Start of unconsumed input.
    rpos: *mut u8,
    /// End of useful input.
    wpos: *mut u8,
    /// End of the buffer.
    end: *mut u8,
    start_capacity: usize,
}

impl<'a> Ibuf<'a> {
    pub fn new(cache: &'a SlabCache<'a>, start_capacity: usize) -> Self {
        Ibuf {
            cache,
            buf: std::ptr::null_mut(),
            rpos: std::ptr::null_mut(),
            wpos: std::ptr::null_mut(),
            end: std::ptr::null_mut(),
            start_capacity,
        }
    }

    /// Bytes written and not yet consumed.
    pub fn used(&self) -> usize {
        self.wpos as usize - self.rpos as usize
    }

    /// Bytes that fit beyond wpos without growing.
    pub fn unused(&self) -> usize {
        self.end as usize - self.wpos as usize
    }

    /// Allocated bytes.
    pub fn capacity(&self) -> usize {
        self.end as usize - self.buf as usize
    }

    /// Offset of the read position; stable across relocations.
    pub fn pos(&self) -> usize {
        self.rpos as usize - self.buf as usize
    }

    /// The read cursor.
    pub fn rpos(&self) -> *mut u8 {
        self.rpos
    }

    /// The write cursor.
    pub fn wpos(&self) -> *mut u8 {
        self.wpos
    }

    /// Forget all input, keeping the buffer.
    pub fn reset(&mut self) {
        self.rpos = self.buf;
        self.wpos = self.buf;
    }

    /// Guarantee room for `size` more bytes at wpos and return wpos.
    pub fn reserve(&mut self, size: usize) -> Option<NonNull<u8>> {
        if self.unused() >= size {
            return NonNull::new(self.wpos);
        }
        self.reserve_slow(size)
    }

    #[cold]
    fn reserve_slow(&mut self, size: usize) -> Option<NonNull<u8>> {
        let used = self.used();
        let capacity = self.capacity();
        if used + size <= capacity && self.rpos > self.buf {
            // Enough room overall, it is just fragmented by consumed
            // bytes at the front; slide the payload left.
            unsafe { std::ptr::copy(self.rpos, self.buf, used) };
            self.wpos = unsafe { self.buf.add(used) };
            self.rpos = self.buf;
            return NonNull::new(self.wpos);
        }

        let mut new_capacity = (capacity * 2).max(self.start_capacity).max(1);
        while new_capacity < used + size {
            new_capacity *= 2;
        }
        let slab = self.cache.slab_get(new_capacity)?;
        self.relocate(slab, used);
        NonNull::new(self.wpos)
    }

    fn relocate(&mut self, slab: NonNull<Slab>, used: usize) {
        let data = unsafe { slab.as_ref() }.data();
        if !self.buf.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(self.rpos, data, used);
                self.cache.slab_put(Slab::from_data(self.buf));
            }
        }
        self.buf = data;
        self.rpos = data;
        self.wpos = unsafe { data.add(used) };
        self.end = unsafe { data.add(slab.as_ref().capacity()) };
    }

    /// Reserve and commit `size` bytes; returns their start.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.reserve(size)?;
        self.wpos = unsafe { self.wpos.add(size) };
        Some(ptr)
    }

    /// Consume `size` bytes at the read end.
    pub fn consume(&mut self, size: usize) {
        debug_assert!(size <= self.used());
        self.rpos = unsafe { self.rpos.add(size) };
    }

    /// Drop `size` bytes from the write end.
    pub fn discard(&mut self, size: usize) {
        debug_assert!(size <= self.used());
        self.wpos = unsafe { self.wpos.sub(size) };
    }

    /// Rewind the write end so used() becomes `used`. The mark is a
    /// previously observed used() value and stays valid across
    /// relocations as long as the read position is left alone.
    pub fn truncate(&mut self, used: usize) {
        debug_assert!(used <= self.used());
        self.discard(self.used() - used);
    }

    /// Reallocate down to the smallest slab that fits the unconsumed
    /// payload, but not below the start capacity. Never grows. An
    /// empty buffer gives its slab back entirely.
    pub fn shrink(&mut self) {
        if self.buf.is_null() {
            return;
        }
        let used = self.used();
        if used == 0 {
            unsafe { self.cache.slab_put(Slab::from_data(self.buf)) };
            self.buf = std::ptr::null_mut();
            self.rpos = std::ptr::null_mut();
            self.wpos = std::ptr::null_mut();
            self.end = std::ptr::null_mut();
            return;
        }
        let want = used.max(self.start_capacity);
        let current = unsafe { Slab::from_data(self.buf).as_ref().size() };
        let target = self.cache.real_size(want);
        if target >= current {
            // Same slab or bigger: relocation would buy nothing.
            return;
        }
        let Some(slab) = self.cache.slab_get(want) else {
            return;
        };
        self.relocate(slab, used);
    }
}

impl Drop for Ibuf<'_> {
    fn drop(&mut self) {
        if !self.buf.is_null() {
            unsafe { self.cache.slab_put(Slab::from_data(self.buf)) };
        }
    }
}
