// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// A process-wide byte quota shared by every arena of a worker pool.
// One 64-bit atomic packs {total, used}, both counted in 1 KiB units,
// so admission is a single compare-and-swap and stays linearizable
// under any number of concurrent callers.

use std::sync::atomic::{AtomicU64, Ordering};

/// Granularity of quota accounting, bytes.
pub const QUOTA_UNIT_SIZE: usize = 1024;

const UNIT_LB: u32 = 10;

/// The largest byte total a quota can represent (u32::MAX units).
pub const QUOTA_MAX: usize = (u32::MAX as usize) << UNIT_LB;

/// A shared memory quota with atomic reservation and release.
///
/// `total` and `used` live in the high and low halves of a single
/// `AtomicU64`, so a reservation observes a consistent pair and either
/// commits it whole or retries.
pub struct Quota {
    /// Packed value: total units in bits 63..32, used units in bits 31..0.
    value: AtomicU64,
}

#[inline]
const fn pack(total_units: u32, used_units: u32) -> u64 {
    ((total_units as u64) << 32) | used_units as u64
}

#[inline]
const fn total_units(value: u64) -> u32 {
    (value >> 32) as u32
}

#[inline]
const fn used_units(value: u64) -> u32 {
    value as u32
}

#[inline]
fn to_units(size: usize) -> u32 {
    debug_assert!(size <= QUOTA_MAX);
    ((size + QUOTA_UNIT_SIZE - 1) >> UNIT_LB) as u32
}

impl Quota {
    /// Create a quota with the given byte limit, rounded up to a whole
    /// number of units and capped at [`QUOTA_MAX`].
    pub fn new(total: usize) -> Self {
        let total = total.min(QUOTA_MAX);
        Quota {
            value: AtomicU64::new(pack(to_units(total), 0)),
        }
    }

    /// The configured limit, bytes.
    pub fn total(&self) -> usize {
        (total_units(self.value.load(Ordering::Relaxed)) as usize) << UNIT_LB
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        (used_units(self.value.load(Ordering::Relaxed)) as usize) << UNIT_LB
    }

    /// Change the limit. The new total may be below the current usage;
    /// the quota then refuses further reservations until enough is
    /// released.
    pub fn set_total(&self, total: usize) {
        let total = to_units(total.min(QUOTA_MAX));
        let mut value = self.value.load(Ordering::Relaxed);
        loop {
            let next = pack(total, used_units(value));
            match self.value.compare_exchange_weak(
                value,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(cur) => value = cur,
            }
        }
    }

    /// Reserve `size` bytes, rounded up to a whole number of units.
    ///
    /// Returns the number of bytes actually reserved, or `None` when
    /// the reservation would exceed the limit. Admission and commit
    /// happen in one compare-and-swap.
    pub fn try_use(&self, size: usize) -> Option<usize> {
        let need = to_units(size);
        let mut value = self.value.load(Ordering::Relaxed);
        loop {
            let used = used_units(value);
            let total = total_units(value);
            let next_used = used.checked_add(need)?;
            if next_used > total {
                return None;
            }
            match self.value.compare_exchange_weak(
                value,
                pack(total, next_used),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((need as usize) << UNIT_LB),
                Err(cur) => value = cur,
            }
        }
    }

    /// Return `size` bytes to the quota, with the same rounding as
    /// [`try_use`](Quota::try_use). The caller must not release more
    /// than it reserved.
    pub fn release(&self, size: usize) -> usize {
        let need = to_units(size);
        let mut value = self.value.load(Ordering::Relaxed);
        loop {
            let used = used_units(value);
            debug_assert!(used >= need, "quota release exceeds usage");
            let next = pack(total_units(value), used.wrapping_sub(need));
            match self.value.compare_exchange_weak(
                value,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return (need as usize) << UNIT_LB,
                Err(cur) => value = cur,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let q = Quota::new(4096);
        assert_eq!(q.total(), 4096);
        assert_eq!(q.try_use(1), Some(1024));
        assert_eq!(q.used(), 1024);
        assert_eq!(q.release(1), 1024);
        assert_eq!(q.used(), 0);
    }

    #[test]
    fn over_limit_total() {
        let q = Quota::new(2048);
        assert_eq!(q.try_use(2048), Some(2048));
        q.set_total(1024);
        assert!(q.try_use(1).is_none());
        q.release(1024);
        assert_eq!(q.used(), 1024);
        assert_eq!(q.try_use(1024), None);
        q.release(1024);
        assert_eq!(q.try_use(1024), Some(1024));
    }
}
