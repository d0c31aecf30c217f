//! Pool configuration captured before creation.
//!
//! An attr is plain data: [`crate::pool::Pool::create`] borrows it, copies
//! what it needs, and the caller may reuse or drop it immediately.

use bitflags::bitflags;

use crate::error::Errno;
use crate::mapping::{MapFn, MapOps, UnmapFn};

bitflags! {
    /// Known attribute flag bits. Creation rejects anything else.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct AttrFlags: u32 {
        /// Maintain the per-slot bitmap: double frees and destroy-time
        /// leaks abort the process.
        const ROBUST = 1 << 0;
    }
}

/// Per-CPU-slice init callback, run once per slice on the freshly mapped,
/// zero-filled pages before creation returns. An error aborts creation and
/// releases the mappings.
pub type InitFn =
    unsafe fn(data: *mut (), addr: *mut u8, len: usize, cpu: usize) -> Result<(), Errno>;

#[derive(Clone, Copy)]
pub(crate) struct InitOps {
    pub f: InitFn,
    pub data: *mut (),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum PoolKind {
    /// One slice per CPU.
    PerCpu { stride: usize, max_cpus: usize },
    /// Single slice: a plain slab allocator.
    Global { stride: usize },
}

/// Pool creation attributes.
///
/// Defaults to a per-CPU pool with the default stride and a detected CPU
/// count; setters chain.
pub struct PoolAttr {
    pub(crate) kind: PoolKind,
    /// Raw flag word; unknown bits are rejected at create.
    pub(crate) flags: u32,
    pub(crate) mmap: Option<MapOps>,
    pub(crate) init: Option<InitOps>,
}

impl Default for PoolAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolAttr {
    pub fn new() -> Self {
        Self {
            kind: PoolKind::PerCpu {
                stride: 0,
                max_cpus: 0,
            },
            flags: 0,
            mmap: None,
            init: None,
        }
    }

    /// Use a custom mapping backend instead of anonymous mmap.
    pub fn mmap(&mut self, map: MapFn, unmap: UnmapFn, data: *mut ()) -> &mut Self {
        self.mmap = Some(MapOps::new(map, unmap, data));
        self
    }

    /// Run `f` over every CPU slice before creation returns.
    pub fn init(&mut self, f: InitFn, data: *mut ()) -> &mut Self {
        self.init = Some(InitOps { f, data });
        self
    }

    /// Enable robust mode.
    pub fn robust(&mut self) -> &mut Self {
        self.flags |= AttrFlags::ROBUST.bits();
        self
    }

    /// Replace the raw flag word. Unknown bits make creation fail.
    pub fn flags(&mut self, bits: u32) -> &mut Self {
        self.flags = bits;
        self
    }

    /// One slice per CPU. `stride == 0` picks [`crate::DEFAULT_STRIDE`];
    /// `max_cpus == 0` uses the detected processor count.
    pub fn percpu(&mut self, stride: usize, max_cpus: usize) -> &mut Self {
        self.kind = PoolKind::PerCpu { stride, max_cpus };
        self
    }

    /// Single-slice pool (`max_cpus == 1`). Handles from it resolve to one
    /// plain address via CPU 0.
    pub fn global(&mut self, stride: usize) -> &mut Self {
        self.kind = PoolKind::Global { stride };
        self
    }

    pub(crate) fn is_robust(&self) -> bool {
        self.flags & AttrFlags::ROBUST.bits() != 0
    }
}
