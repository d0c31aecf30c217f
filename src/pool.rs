//! Per-CPU memory pool: one size class over one contiguous mapping.
//!
//! A pool reserves `stride` virtual bytes per CPU inside a single mapping of
//! `stride * max_cpus` bytes. One allocation claims the same item offset in
//! every CPU's slice; the returned [`Handle`] encodes `(directory index,
//! offset)` and resolves to a concrete slice address by pure arithmetic.
//!
//! Placement is free-list first, then bump cursor. The free list is
//! intrusive: link nodes are written at each item's address within CPU 0's
//! slice. That centralises allocator writes, at the cost of possible false
//! sharing with a real CPU-0 workload touching neighbouring items.

use core::ptr::{self, NonNull};

use crate::DEFAULT_STRIDE;
use crate::attr::{AttrFlags, PoolAttr, PoolKind};
use crate::bitmap::FreeBitmap;
use crate::directory;
use crate::error::{Errno, Error};
use crate::handle::{Handle, MAX_STRIDE};
use crate::mapping::MapOps;
use crate::numa;
use crate::platform;

/// Intrusive free-list link, living in the freed item's bytes (CPU 0 slice).
#[repr(transparent)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Slab configuration; immutable while the pool is live.
pub(crate) struct PoolConfig {
    /// Mapping base. Null marks the directory slot free.
    pub base: *mut u8,
    /// Virtual bytes reserved per CPU; page-aligned.
    pub stride: usize,
    /// Item size in bytes; a power of two that fits a free-list link.
    pub item_len: usize,
    /// log2(item_len).
    pub item_order: u32,
    /// Number of CPU slices in the mapping.
    pub max_cpus: usize,
    pub robust: bool,
    pub mapping: MapOps,
    pub name: &'static str,
}

impl PoolConfig {
    pub(crate) const fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            stride: 0,
            item_len: 0,
            item_order: 0,
            max_cpus: 0,
            robust: false,
            mapping: MapOps::default_backend(),
            name: "",
        }
    }
}

/// Allocation state, guarded by the slot mutex.
pub(crate) struct PoolInner {
    free_head: *mut FreeNode,
    /// Bump cursor: offsets below it have been handed out at least once.
    next_unused: usize,
    /// Robust-mode slot states; disabled otherwise.
    bitmap: FreeBitmap,
}

// SAFETY: the raw pointers refer to process-wide mappings; every access is
// serialised by the enclosing mutex.
unsafe impl Send for PoolInner {}

impl PoolInner {
    pub(crate) const fn new() -> Self {
        Self {
            free_head: ptr::null_mut(),
            next_unused: 0,
            bitmap: FreeBitmap::empty(),
        }
    }
}

/// Owning token for a live pool.
///
/// Move-only: [`destroy`] consumes it. Dropping a `Pool` without destroying
/// it leaks the mapping and its directory slot, like forgetting a file
/// descriptor.
///
/// [`destroy`]: Pool::destroy
#[derive(Debug)]
pub struct Pool {
    index: usize,
}

impl Pool {
    /// Create a pool of `item_len`-byte slots configured by `attr`.
    ///
    /// `name` is informational: it shows up in logs and robust-mode
    /// diagnostics. `item_len` is raised to the word size and rounded to the
    /// next power of two. MT-safe.
    pub fn create(name: &'static str, item_len: usize, attr: &PoolAttr) -> Result<Pool, Error> {
        if attr.flags & !AttrFlags::all().bits() != 0 {
            return Err(Error::InvalidConfig("unknown attribute flag bits"));
        }
        let robust = attr.is_robust();

        // Every item must be able to hold a free-list link.
        let item_len = item_len.max(size_of::<usize>()).next_power_of_two();
        let item_order = item_len.trailing_zeros();

        let (stride, max_cpus) = match attr.kind {
            PoolKind::PerCpu { stride, max_cpus } => {
                let max_cpus = if max_cpus == 0 {
                    platform::num_possible_cpus()
                } else {
                    max_cpus
                };
                (stride, max_cpus)
            }
            PoolKind::Global { stride } => (stride, 1),
        };
        let stride = if stride == 0 { DEFAULT_STRIDE } else { stride };
        let stride = stride
            .checked_next_multiple_of(platform::page_size())
            .ok_or(Error::InvalidConfig("stride overflows a page multiple"))?;
        if item_len > stride {
            return Err(Error::InvalidConfig("item_len exceeds stride"));
        }
        if stride > MAX_STRIDE {
            return Err(Error::InvalidConfig("stride exceeds the handle offset range"));
        }
        let slab_len = stride
            .checked_mul(max_cpus)
            .ok_or(Error::InvalidConfig("stride * max_cpus overflows"))?;

        let mapping = attr.mmap.unwrap_or(MapOps::default_backend());

        // The lock is held across map() so the claimed slot stays reserved;
        // creation is not a hot path.
        let _guard = directory::lock();
        let Some(index) = (unsafe { directory::find_free_slot() }) else {
            return Err(Error::Exhausted("pool directory is full"));
        };

        let base = unsafe { mapping.map(slab_len) }?;

        let nbits = stride >> item_order;
        let bitmap = if robust {
            match unsafe { mapping.map(FreeBitmap::byte_len(nbits)) } {
                Ok(words) => unsafe { FreeBitmap::from_raw(words.as_ptr().cast(), nbits) },
                Err(e) => {
                    let _ = unsafe { mapping.unmap(base, slab_len) };
                    return Err(Error::Backend(e));
                }
            }
        } else {
            FreeBitmap::empty()
        };

        let slot = directory::slot(index);
        unsafe {
            *slot.cfg_mut() = PoolConfig {
                base: base.as_ptr(),
                stride,
                item_len,
                item_order,
                max_cpus,
                robust,
                mapping,
                name,
            };
        }
        {
            let mut inner = slot.inner.lock();
            inner.free_head = ptr::null_mut();
            inner.next_unused = 0;
            inner.bitmap = bitmap;
        }

        // Init callbacks see freshly mapped, zero-filled slices exactly once.
        if let Some(init) = attr.init {
            for cpu in 0..max_cpus {
                let slice = unsafe { base.as_ptr().add(stride * cpu) };
                if let Err(e) = unsafe { (init.f)(init.data, slice, stride, cpu) } {
                    unsafe { release_slot(index) };
                    return Err(Error::Backend(e));
                }
            }
        }

        log::debug!(
            "pool '{name}': created at index {index} \
             (item_len={item_len}, stride={stride}, max_cpus={max_cpus}, robust={robust})"
        );
        Ok(Pool { index })
    }

    /// Tear the pool down: leak-check (robust), unmap, release the slot.
    ///
    /// In robust mode a non-empty slot bitmap is a leak and aborts the
    /// process. Backend unmap errors are propagated after the slot has been
    /// released.
    pub fn destroy(self) -> Result<(), Error> {
        let index = self.index;
        let _guard = directory::lock();
        let slot = directory::slot(index);
        let (base, slab_len, mapping, robust, item_order, name) = {
            let cfg = unsafe { slot.cfg() };
            if cfg.base.is_null() {
                return Err(Error::NotRegistered);
            }
            (
                cfg.base,
                cfg.stride * cfg.max_cpus,
                cfg.mapping,
                cfg.robust,
                cfg.item_order,
                cfg.name,
            )
        };

        let mut first_err: Option<Errno> = None;
        {
            let mut inner = slot.inner.lock();
            if robust {
                let live = inner.bitmap.count_ones();
                if live != 0 {
                    if let Some(bit) = inner.bitmap.first_set() {
                        log::error!(
                            "pool '{name}': destroyed with {live} live allocation(s), \
                             first at item offset {}",
                            bit << item_order
                        );
                    }
                    panic!("pool '{name}': destroyed with {live} live allocation(s)");
                }
                let (words, nbits) = inner.bitmap.take_raw();
                if !words.is_null() {
                    let res = unsafe {
                        mapping.unmap(
                            NonNull::new_unchecked(words.cast()),
                            FreeBitmap::byte_len(nbits),
                        )
                    };
                    if let Err(e) = res {
                        first_err.get_or_insert(e);
                    }
                }
            }
            inner.free_head = ptr::null_mut();
            inner.next_unused = 0;
        }

        // SAFETY: base came from this mapping with exactly slab_len bytes.
        let res = unsafe { mapping.unmap(NonNull::new_unchecked(base), slab_len) };
        if let Err(e) = res {
            first_err.get_or_insert(e);
        }
        unsafe {
            *slot.cfg_mut() = PoolConfig::empty();
        }

        log::debug!("pool '{name}': destroyed");
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Reserve one slot across every CPU slice.
    ///
    /// Slice contents are whatever the slot last held; use [`zmalloc`] for
    /// zeroed memory.
    ///
    /// [`zmalloc`]: Pool::zmalloc
    pub fn malloc(&self) -> Result<Handle, Error> {
        malloc_index(self.index, false)
    }

    /// [`malloc`] plus zeroing of the slot in every CPU slice.
    ///
    /// [`malloc`]: Pool::malloc
    pub fn zmalloc(&self) -> Result<Handle, Error> {
        malloc_index(self.index, true)
    }

    /// Address of `handle`'s slot within `cpu`'s slice.
    ///
    /// The fast path: no directory traffic, pure arithmetic on this pool's
    /// base and stride. Panics if `handle` belongs to another pool or `cpu`
    /// is out of range. The returned pointer always lies inside the pool's
    /// mapping; dereferencing it is the caller's unsafe act, subject to the
    /// one-CPU-at-a-time discipline handles are designed for.
    pub fn ptr_for_cpu(&self, handle: Handle, cpu: usize) -> *mut u8 {
        let cfg = self.cfg();
        assert_eq!(handle.pool_index(), self.index, "handle from another pool");
        assert!(cpu < cfg.max_cpus, "cpu {cpu} out of range");
        unsafe { cfg.base.add(cfg.stride * cpu + handle.item_offset()) }
    }

    /// Move every page of each CPU's slice to that CPU's NUMA node.
    ///
    /// `flags` goes to move_pages(2) verbatim (callers usually pass
    /// `MPOL_MF_MOVE`). A system without NUMA topology makes this a no-op.
    pub fn init_numa(&self, flags: i32) -> Result<(), Error> {
        let cfg = self.cfg();
        for cpu in 0..cfg.max_cpus {
            // SAFETY: the slice lies inside this live pool's mapping.
            unsafe {
                numa::range_init_numa(cfg.base.add(cfg.stride * cpu), cfg.stride, cpu, flags)
            }?;
        }
        Ok(())
    }

    /// Directory index of this pool; equals [`Handle::pool_index`] of every
    /// handle it produces.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'static str {
        self.cfg().name
    }

    /// Item size after rounding (power of two, >= word size).
    pub fn item_len(&self) -> usize {
        self.cfg().item_len
    }

    pub(crate) fn item_order(&self) -> u32 {
        self.cfg().item_order
    }

    /// Virtual bytes reserved per CPU slice (page-aligned).
    pub fn stride(&self) -> usize {
        self.cfg().stride
    }

    pub fn max_cpus(&self) -> usize {
        self.cfg().max_cpus
    }

    fn cfg(&self) -> &PoolConfig {
        // SAFETY: `self` is the live-pool token for this index.
        unsafe { directory::slot(self.index).cfg() }
    }
}

/// Release a claimed slot during a failed creation. Directory lock held.
unsafe fn release_slot(index: usize) {
    let slot = directory::slot(index);
    let (base, slab_len, mapping) = {
        let cfg = unsafe { slot.cfg() };
        (cfg.base, cfg.stride * cfg.max_cpus, cfg.mapping)
    };
    {
        let mut inner = slot.inner.lock();
        if inner.bitmap.is_enabled() {
            let (words, nbits) = inner.bitmap.take_raw();
            let _ = unsafe {
                mapping.unmap(
                    NonNull::new_unchecked(words.cast()),
                    FreeBitmap::byte_len(nbits),
                )
            };
        }
        inner.free_head = ptr::null_mut();
        inner.next_unused = 0;
    }
    let _ = unsafe { mapping.unmap(NonNull::new_unchecked(base), slab_len) };
    unsafe {
        *slot.cfg_mut() = PoolConfig::empty();
    }
}

/// Allocation shared by pools and pool sets. The caller vouches that
/// `index` names a live pool (it holds the `Pool` token or the set entry).
pub(crate) fn malloc_index(index: usize, zeroed: bool) -> Result<Handle, Error> {
    let slot = directory::slot(index);
    // SAFETY: live pool per the caller's token.
    let cfg = unsafe { slot.cfg() };

    let item_offset;
    {
        let mut inner = slot.inner.lock();
        if !inner.free_head.is_null() {
            // Reuse the most recently freed slot (LIFO). Links live in CPU
            // 0's slice, so the node address is directly base + offset.
            let node = inner.free_head;
            item_offset = node as usize - cfg.base as usize;
            inner.free_head = unsafe { (*node).next };
        } else if inner.next_unused + cfg.item_len <= cfg.stride {
            item_offset = inner.next_unused;
            inner.next_unused += cfg.item_len;
        } else {
            return Err(Error::Exhausted("pool slab is full"));
        }
        if cfg.robust {
            let bit = item_offset >> cfg.item_order;
            if inner.bitmap.set(bit) {
                log::error!(
                    "pool '{}': slot at item offset {item_offset} handed out twice",
                    cfg.name
                );
                panic!(
                    "pool '{}': corrupted free list (offset {item_offset} already allocated)",
                    cfg.name
                );
            }
        }
    }

    // Zeroing happens outside the pool lock; the slot is not yet published,
    // so nobody else can observe the intermediate state.
    if zeroed {
        for cpu in 0..cfg.max_cpus {
            unsafe {
                cfg.base
                    .add(cfg.stride * cpu + item_offset)
                    .write_bytes(0, cfg.item_len);
            }
        }
    }

    Ok(Handle::encode(index, item_offset))
}

/// Return `handle`'s slot to its pool's free list.
///
/// In robust mode a double free or corrupt handle aborts the process.
///
/// # Safety
///
/// `handle` must come from a live pool's malloc/zmalloc and must not have
/// been freed since. Freeing into a destroyed pool is undefined.
pub unsafe fn percpu_free(handle: Handle) {
    let index = handle.pool_index();
    let item_offset = handle.item_offset();
    let slot = directory::slot(index);
    // SAFETY: live pool per this function's contract.
    let cfg = unsafe { slot.cfg() };

    let mut inner = slot.inner.lock();
    if cfg.robust {
        if item_offset >= cfg.stride || item_offset & (cfg.item_len - 1) != 0 {
            log::error!(
                "pool '{}': free of corrupt handle (item offset {item_offset})",
                cfg.name
            );
            panic!("pool '{}': free of corrupt handle", cfg.name);
        }
        let bit = item_offset >> cfg.item_order;
        if !inner.bitmap.clear(bit) {
            log::error!(
                "pool '{}': double free at item offset {item_offset}",
                cfg.name
            );
            panic!("pool '{}': double free", cfg.name);
        }
    }

    let node = unsafe { cfg.base.add(item_offset) } as *mut FreeNode;
    unsafe { (*node).next = inner.free_head };
    inner.free_head = node;
}

/// Address of `handle`'s slot within `cpu`'s slice, resolved through the
/// directory. Takes no lock.
///
/// # Safety
///
/// The handle's pool must be live and `cpu < max_cpus` of that pool.
#[inline]
pub unsafe fn percpu_ptr(handle: Handle, cpu: usize) -> *mut u8 {
    let slot = directory::slot(handle.pool_index());
    let cfg = unsafe { slot.cfg() };
    unsafe { cfg.base.add(cfg.stride * cpu + handle.item_offset()) }
}

/// The single address behind a handle from a global (`max_cpus == 1`) pool.
///
/// # Safety
///
/// Same contract as [`percpu_ptr`] with `cpu = 0`.
#[inline]
pub unsafe fn global_ptr(handle: Handle) -> *mut u8 {
    unsafe { percpu_ptr(handle, 0) }
}
