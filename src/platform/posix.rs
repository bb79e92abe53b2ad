// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX page source: anonymous, size-aligned mappings for the slab
// arena, plus the advisory "keep out of core dumps" hint.

use std::io;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

/// Size of a memory page in bytes.
pub fn page_size() -> usize {
    // sysconf() returns -1 on error, or page_size >= 1 otherwise.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz < 1 {
        return 4096;
    }
    sz as usize
}

/// Unmap a range obtained from [`mmap_aligned`]. A failing munmap means
/// the address bookkeeping is corrupt, which is not recoverable.
pub fn munmap_checked(addr: *mut u8, size: usize) {
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, size) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        log::error!("munmap({addr:p}, {size}) failed: {err}");
        debug_assert!(false, "munmap failed");
    }
}

fn mmap_raw(size: usize, shared: bool) -> io::Result<*mut u8> {
    let vis = if shared {
        libc::MAP_SHARED
    } else {
        libc::MAP_PRIVATE
    };
    let map = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            vis | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if map == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(map as *mut u8)
}

/// Map `size` anonymous bytes aligned to `align`.
///
/// `align` must be a power of two and `size` a multiple of it. The
/// first attempt maps exactly `size` bytes and keeps the mapping when
/// the kernel happens to hand back an aligned address; otherwise a
/// `size + align` mapping is trimmed at both ends.
pub fn mmap_aligned(size: usize, align: usize, shared: bool) -> io::Result<NonNull<u8>> {
    assert!(align.is_power_of_two());
    assert_eq!(size & (align - 1), 0);

    // Most mappings after the first are aligned already, so try the
    // exact size first.
    let map = mmap_raw(size, shared)?;
    if map as usize & (align - 1) == 0 {
        return Ok(unsafe { NonNull::new_unchecked(map) });
    }
    munmap_checked(map, size);

    // Over-map and trim the unaligned prefix and postfix. This can
    // fragment the address space depending on the kernel's placement
    // strategy, but it is the only portable way to get the alignment.
    let map = mmap_raw(size + align, shared)?;
    let offset = map as usize & (align - 1);
    let aligned = if offset != 0 {
        munmap_checked(map, align - offset);
        let aligned = unsafe { map.add(align - offset) };
        munmap_checked(unsafe { aligned.add(size) }, offset);
        aligned
    } else {
        munmap_checked(unsafe { map.add(size) }, align);
        map
    };
    Ok(unsafe { NonNull::new_unchecked(aligned) })
}

/// Advise the kernel to exclude `[addr, addr + size)` from core dumps.
/// The hint is best effort: a failure is logged and ignored.
pub fn madvise_dontdump(addr: *mut u8, size: usize) {
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::madvise(addr as *mut libc::c_void, size, libc::MADV_DONTDUMP) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            log::warn!("madvise({addr:p}, {size}, MADV_DONTDUMP) failed: {err}");
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (addr, size);
    }
}

/// Whether `MADV_DONTDUMP` works on this system. Probed once with a
/// scratch page; the verdict is cached for the process lifetime.
pub fn dontdump_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        #[cfg(target_os = "linux")]
        {
            let size = page_size();
            let Ok(map) = mmap_raw(size, false) else {
                return false;
            };
            let rc =
                unsafe { libc::madvise(map as *mut libc::c_void, size, libc::MADV_DONTDUMP) };
            munmap_checked(map, size);
            log::debug!("MADV_DONTDUMP supported: {}", rc == 0);
            rc == 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    })
}
