// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

#[cfg(unix)]
pub mod posix;

// Re-export the platform-specific page source under a uniform name.

#[cfg(unix)]
pub use posix::{dontdump_supported, madvise_dontdump, mmap_aligned, munmap_checked, page_size};
