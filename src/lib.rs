// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pure Rust family of cooperating allocators for an in-memory
// database: a byte quota, a slab arena, a buddy slab cache, fixed-size
// pools, a size-classed small-object allocator, bump and
// log-structured regions, and two streaming I/O buffers, all drawing
// on one process-wide memory budget.
//
// The quota and the arena are thread-safe; every other component is
// single-owner (one instance per worker thread).

pub mod util;

mod quota;
pub use quota::{Quota, QUOTA_MAX, QUOTA_UNIT_SIZE};

pub mod lifo;
pub use lifo::LfLifo;

mod platform;

mod arena;
pub use arena::{ArenaFlags, SlabArena, SLAB_MIN_SIZE};

mod slab_cache;
pub use slab_cache::{slab_header_size, Slab, SlabCache, SmallStats, ORDER_MAX};

mod small_class;
pub use small_class::SmallClass;

mod mempool;
pub use mempool::{mslab_header_size, MSlab, Mempool, MempoolStats};

mod small_alloc;
pub use small_alloc::{SmallAlloc, SMALL_MEMPOOL_MAX};

mod region;
pub use region::Region;

mod lsregion;
pub use lsregion::{LsRegion, LSLAB_NOT_USED_ID};

mod ibuf;
pub use ibuf::Ibuf;

mod obuf;
pub use obuf::{Obuf, ObufSvp, SMALL_OBUF_IOV_MAX};
