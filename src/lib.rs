#![no_std]

//! percpu-pool: a CPU-local storage (CLS) memory pool allocator.
//!
//! Complements thread-local storage with objects addressable per logical
//! CPU: one allocation reserves the same slot in every CPU's slice of a
//! pool, and the returned [`Handle`] plus a CPU index resolve to that CPU's
//! copy with pure address arithmetic — cheap enough for the inside of a
//! restartable critical section.
//!
//! Three layers:
//! - [`pool::Pool`] — one size class over one contiguous mapping
//!   (free list + bump cursor, optional robust double-free/leak checking)
//! - [`poolset::PoolSet`] — power-of-two size classes with fallback to
//!   larger classes on exhaustion
//! - `rseq` — the sequence-facility boundary supplying [`current_cpu`]
//!
//! # Usage
//!
//! ```ignore
//! let mut attr = PoolAttr::new();
//! attr.percpu(0, 0); // default stride, detected CPU count
//! let pool = Pool::create("counters", size_of::<u64>(), &attr)?;
//!
//! let h = pool.zmalloc()?;
//! let cpu = percpu_pool::current_cpu() as usize;
//! let counter = pool.ptr_for_cpu(h, cpu) as *mut u64;
//! ```
//!
//! Handles are opaque machine words (pool index in the high bits, slice
//! offset in the low bits), never dereferenceable pointers. A pool created
//! through [`PoolAttr::global`] has a single slice and behaves as a plain
//! slab allocator.

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod attr;
mod bitmap;
mod directory;
pub mod error;
pub mod handle;
pub mod mapping;
pub mod numa;
pub mod platform;
pub mod pool;
pub mod poolset;

/// Per-CPU slice size used when an attr leaves the stride at 0.
pub const DEFAULT_STRIDE: usize = 1 << 16;

pub use attr::{AttrFlags, InitFn, PoolAttr};
pub use error::{Errno, Error};
pub use handle::{Handle, MAX_STRIDE, OFFSET_BITS, POOL_INDEX_BITS};
pub use mapping::{MapFn, MapOps, UnmapFn};
pub use pool::{Pool, global_ptr, percpu_free, percpu_ptr};
pub use poolset::{MIN_ORDER, PoolSet};

/// Current-CPU oracle from the sequence facility. Falls back to a scheduler
/// query when no per-thread control block is registered; either way the
/// result may be stale the instant it is read.
pub use rseq::current_cpu;
