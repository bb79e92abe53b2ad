// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Size classifier for the small-object allocator.
//
// The allocator keeps one pool per "size class" and must map a request
// size to a class index in constant time. Class sizes grow linearly in
// steps of `granularity` up to `granularity << effective_bits`, then
// approximately exponentially: taking the position of the most
// significant bit of the size plus the next `effective_bits` bits below
// it approximates a logarithm with base 2^(1 / 2^effective_bits), so
// every 2^effective_bits consecutive classes double the class size.
// `effective_bits` is chosen so the realized growth factor lands as
// close as possible to the requested one.
//
// Both directions run on bit scans only; no loops, no floats after
// construction.

/// A two-way map between allocation sizes and size-class indices.
#[derive(Clone, Copy, Debug)]
pub struct SmallClass {
    /// Every class size is a multiple of this power of two.
    granularity: u32,
    /// log2(granularity): low bits of a size that never matter.
    ignore_bits_count: u32,
    /// Bits after the most significant one taking part in class
    /// evaluation.
    effective_bits: u32,
    /// 1 << effective_bits.
    effective_size: u32,
    /// effective_size - 1.
    effective_mask: u32,
    /// min_alloc - granularity: shifts every class size so class 0
    /// allocates min_alloc bytes.
    size_shift: u32,
    /// size_shift + 1, precomputed for the hot path.
    size_shift_plus_1: u32,
    /// The growth factor actually realized, within sqrt(requested) of
    /// the requested one.
    actual_factor: f32,
}

impl SmallClass {
    /// Build a classifier.
    ///
    /// `granularity` must be a power of two; `desired_factor` must lie
    /// in (1, 2]; `min_alloc` (the class-0 size) must be at least
    /// `granularity`.
    pub fn new(granularity: u32, desired_factor: f32, min_alloc: u32) -> Self {
        assert!(granularity.is_power_of_two());
        assert!(desired_factor > 1.0 && desired_factor <= 2.0);
        assert!(min_alloc >= granularity);

        let ln2 = std::f32::consts::LN_2;
        let effective_bits = ((ln2 / desired_factor.ln()).ln() / ln2 + 0.5) as u32;
        let effective_size = 1u32 << effective_bits;
        SmallClass {
            granularity,
            ignore_bits_count: granularity.trailing_zeros(),
            effective_bits,
            effective_size,
            effective_mask: effective_size - 1,
            size_shift: min_alloc - granularity,
            size_shift_plus_1: min_alloc - granularity + 1,
            actual_factor: 2f32.powf(1.0 / effective_size as f32),
        }
    }

    /// The realized growth factor.
    pub fn actual_factor(&self) -> f32 {
        self.actual_factor
    }

    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    /// Position of the most significant bit. Zero input is undefined.
    #[inline]
    fn fls(value: u32) -> u32 {
        u32::BITS - 1 - value.leading_zeros()
    }

    /// The class that serves allocations of `size` bytes.
    #[inline]
    pub fn offset(&self, size: u32) -> u32 {
        // Decrement to make the map zero-based and round sizes up to
        // class sizes; the shift folds min_alloc in. Sizes at or below
        // min_alloc saturate to class 0.
        let size = size.saturating_sub(self.size_shift_plus_1);
        // Drop the never-significant granularity bits.
        let size = size >> self.ignore_bits_count;
        if size < self.effective_size {
            return size; // linear part
        }
        // Big steps: integral log2 with the effective bits omitted.
        let log2 = Self::fls(size >> self.effective_bits);
        // Small steps: the effective bits (and the leading one).
        let linear_part = size >> log2;
        linear_part + (log2 << self.effective_bits)
    }

    /// The allocation size of class `cls`; the inverse upper bound of
    /// [`offset`](SmallClass::offset).
    #[inline]
    pub fn size(&self, cls: u32) -> u32 {
        let cls = cls + 1;
        let mut linear_part = cls & self.effective_mask;
        let mut log2 = cls >> self.effective_bits;
        if log2 != 0 {
            // Move the leading one of the size from the log2 part back
            // into the linear part.
            log2 -= 1;
            linear_part |= self.effective_size;
        }
        self.size_shift + ((linear_part << log2) << self.ignore_bits_count)
    }
}
