//! Process-wide pool directory.
//!
//! A fixed table of pool slots indexed `1..MAX_NR_POOLS`; slot 0 is reserved
//! so that a zero handle never names a pool. The single directory mutex
//! serialises slot claim and release (pool create/destroy); once claimed, a
//! slot's configuration stays put until the pool is destroyed, so handle
//! users read it without any lock.

use core::cell::UnsafeCell;

use spin::{Mutex, MutexGuard};

use crate::handle::POOL_INDEX_BITS;
use crate::pool::{PoolConfig, PoolInner};

/// Directory capacity, including the reserved slot 0.
#[cfg(target_pointer_width = "64")]
pub(crate) const MAX_NR_POOLS: usize = 512;
#[cfg(target_pointer_width = "32")]
pub(crate) const MAX_NR_POOLS: usize = 256;

// Every directory index must be encodable in a handle.
const _: () = assert!(MAX_NR_POOLS <= 1 << POOL_INDEX_BITS);

pub(crate) struct Slot {
    /// Written only under the directory lock; read lock-free by handle users
    /// for as long as the pool is live.
    cfg: UnsafeCell<PoolConfig>,
    /// Free-list / bump-cursor / bitmap state, serialised per pool.
    pub inner: Mutex<PoolInner>,
}

// SAFETY: `cfg` is mutated only under the directory lock and read by handle
// users only while the pool is live (their documented contract); `inner` is
// mutex-guarded. Mapping callbacks are required to be callable from any
// thread.
unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Self {
            cfg: UnsafeCell::new(PoolConfig::empty()),
            inner: Mutex::new(PoolInner::new()),
        }
    }

    /// Shared view of the configuration.
    ///
    /// # Safety
    ///
    /// The pool must be live, or the caller must hold the directory lock.
    pub unsafe fn cfg(&self) -> &PoolConfig {
        unsafe { &*self.cfg.get() }
    }

    /// Raw configuration pointer.
    ///
    /// # Safety
    ///
    /// Writes require the directory lock and no concurrent handle users.
    pub unsafe fn cfg_mut(&self) -> *mut PoolConfig {
        self.cfg.get()
    }
}

struct Directory {
    lock: Mutex<()>,
    slots: [Slot; MAX_NR_POOLS],
}

static DIRECTORY: Directory = Directory {
    lock: Mutex::new(()),
    slots: [const { Slot::new() }; MAX_NR_POOLS],
};

/// The slot for a directory index. Panics on an out-of-range index.
pub(crate) fn slot(index: usize) -> &'static Slot {
    &DIRECTORY.slots[index]
}

/// Take the directory mutex (create/destroy only).
pub(crate) fn lock() -> MutexGuard<'static, ()> {
    DIRECTORY.lock.lock()
}

/// First unclaimed index, scanning `1..MAX_NR_POOLS`.
///
/// # Safety
///
/// Caller must hold the directory lock.
pub(crate) unsafe fn find_free_slot() -> Option<usize> {
    (1..MAX_NR_POOLS).find(|&index| unsafe { DIRECTORY.slots[index].cfg().base.is_null() })
}
