// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Two free-list primitives that thread their links through the stored
// blocks themselves:
//
//   LfLifo: a lock-free Treiber stack of slab-aligned blocks with a
//           16-bit ABA counter packed into the pointer's low bits.
//   Lifo:   a single-threaded intrusive stack used for delayed frees.
//
// Neither owns the memory it links; both require every element to stay
// mapped for the lifetime of the list.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Low bits of the head word reserved for the ABA counter. Elements
/// must be aligned to at least `1 << ABA_BITS` bytes, which every
/// arena slab satisfies (the minimum slab size is 64 KiB).
const ABA_BITS: u32 = 16;
const ABA_MASK: usize = (1 << ABA_BITS) - 1;

#[inline]
fn ptr_bits(word: usize) -> usize {
    word & !ABA_MASK
}

/// A lock-free LIFO of recycled slabs.
///
/// Each element's first `usize` is overwritten with the previous head
/// word while it sits in the list. The ABA counter is incremented on
/// every push, so a pop that raced with a pop+push of the same block
/// fails its compare-and-swap and retries.
pub struct LfLifo {
    head: AtomicUsize,
}

impl LfLifo {
    pub const fn new() -> Self {
        LfLifo {
            head: AtomicUsize::new(0),
        }
    }

    /// Push a block. `elem` must be aligned to `1 << 16` bytes and
    /// must stay mapped while the list is alive.
    ///
    /// # Safety
    /// The caller transfers ownership of the block; its first word is
    /// clobbered.
    pub unsafe fn push(&self, elem: NonNull<u8>) {
        let elem = elem.as_ptr();
        debug_assert_eq!(elem as usize & ABA_MASK, 0, "unaligned lifo element");
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // The link slot keeps the full old head word; pop masks it.
            unsafe { *(elem as *mut usize) = head };
            let next = elem as usize | (head.wrapping_add(1) & ABA_MASK);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(cur) => head = cur,
            }
        }
    }

    /// Pop the most recently pushed block, if any.
    pub fn pop(&self) -> Option<NonNull<u8>> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let elem = ptr_bits(head);
            if elem == 0 {
                return None;
            }
            // Reading the link of a block that a concurrent pop already
            // took may yield garbage; the CAS below rejects it because
            // the head word (and its counter) moved on.
            let link = unsafe { *(elem as *const usize) };
            let next = ptr_bits(link) | (head & ABA_MASK);
            match self.head.compare_exchange_weak(
                head,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(elem as *mut u8) }),
                Err(cur) => head = cur,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        ptr_bits(self.head.load(Ordering::Acquire)) == 0
    }
}

// Safety: the list is designed for concurrent push/pop; all shared
// state is the atomic head and the links inside blocks it owns.
unsafe impl Send for LfLifo {}
unsafe impl Sync for LfLifo {}

/// A single-threaded intrusive LIFO.
///
/// Links live in the first pointer-sized word of each element, which
/// therefore must be at least `size_of::<*mut u8>()` bytes and may be
/// arbitrarily aligned: links are copied bytewise.
pub struct Lifo {
    head: *mut u8,
}

impl Lifo {
    pub const fn new() -> Self {
        Lifo {
            head: std::ptr::null_mut(),
        }
    }

    /// # Safety
    /// `elem` must point to at least `size_of::<*mut u8>()` writable
    /// bytes that stay valid until popped.
    pub unsafe fn push(&mut self, elem: NonNull<u8>) {
        let elem = elem.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(
                &self.head as *const *mut u8 as *const u8,
                elem,
                std::mem::size_of::<*mut u8>(),
            );
        }
        self.head = elem;
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        let elem = NonNull::new(self.head)?;
        let mut next: *mut u8 = std::ptr::null_mut();
        unsafe {
            std::ptr::copy_nonoverlapping(
                elem.as_ptr() as *const u8,
                &mut next as *mut *mut u8 as *mut u8,
                std::mem::size_of::<*mut u8>(),
            );
        }
        self.head = next;
        Some(elem)
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}
