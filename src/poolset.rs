//! Pool set: variable-length allocation over power-of-two size classes.
//!
//! A set holds at most one pool per size-class order. Requests round up to
//! the smallest occupied order that fits; when that pool's slab is full the
//! request falls through to the next larger order instead of failing.

use spin::Mutex;

use crate::error::Error;
use crate::handle::{Handle, OFFSET_BITS};
use crate::pool::{self, Pool};

/// Smallest usable order: every item must hold a free-list link.
pub const MIN_ORDER: usize = size_of::<usize>().trailing_zeros() as usize;

/// One entry per possible item order; orders above the stride limit stay
/// empty forever but keep indexing trivial.
const NR_ORDERS: usize = OFFSET_BITS as usize + 1;

/// Collection of pools indexed by size-class order.
pub struct PoolSet {
    entries: Mutex<[Option<Pool>; NR_ORDERS]>,
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSet {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new([const { None }; NR_ORDERS]),
        }
    }

    /// Move `pool` into the entry for its item order.
    ///
    /// An occupied order rejects the pool and hands it back, so the caller
    /// never loses the only token that can destroy it.
    pub fn add_pool(&self, pool: Pool) -> Result<(), (Error, Pool)> {
        let order = pool.item_order() as usize;
        let mut entries = self.entries.lock();
        if entries[order].is_some() {
            return Err((Error::OrderBusy(order), pool));
        }
        log::debug!("pool set: order {order} <- pool '{}'", pool.name());
        entries[order] = Some(pool);
        Ok(())
    }

    /// Reserve a slot of at least `len` bytes from the smallest fitting
    /// pool, falling back to larger classes when a slab is full.
    ///
    /// `len == 0` is treated as the minimum size class.
    pub fn malloc(&self, len: usize) -> Result<Handle, Error> {
        self.malloc_inner(len, false)
    }

    /// [`malloc`] plus zeroing of the slot in every CPU slice.
    ///
    /// [`malloc`]: PoolSet::malloc
    pub fn zmalloc(&self, len: usize) -> Result<Handle, Error> {
        self.malloc_inner(len, true)
    }

    fn malloc_inner(&self, len: usize, zeroed: bool) -> Result<Handle, Error> {
        let mut order = order_of(len);
        loop {
            // Pick the smallest occupied order >= `order` under the set
            // lock, then drop it before entering the pool.
            let found = {
                let entries = self.entries.lock();
                let mut found = None;
                for o in order..NR_ORDERS {
                    if let Some(pool) = &entries[o] {
                        found = Some((o, pool.index()));
                        break;
                    }
                }
                found
            };
            let Some((o, index)) = found else {
                return Err(Error::Exhausted("no pool can satisfy the request"));
            };
            match pool::malloc_index(index, zeroed) {
                Ok(handle) => return Ok(handle),
                Err(Error::Exhausted(_)) => order = o + 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Destroy every pool in the set, smallest order first.
    ///
    /// Stops at the first error; pools not yet reached are leaked with the
    /// set, and using handles from any of them afterwards is undefined.
    pub fn destroy(self) -> Result<(), Error> {
        for entry in self.entries.into_inner() {
            if let Some(pool) = entry {
                pool.destroy()?;
            }
        }
        Ok(())
    }
}

/// Size-class order for a request: ceil(log2(len)), clamped to the minimum
/// class. Zero-length requests use the minimum class.
fn order_of(len: usize) -> usize {
    if len <= 1 << MIN_ORDER {
        return MIN_ORDER;
    }
    (usize::BITS - (len - 1).leading_zeros()) as usize
}
