//! Pluggable mapping backend: a map/unmap function pair plus a private cookie.
//!
//! Pools cache their backend at creation, so a custom backend outlives the
//! attr that configured it. The default backend hands out anonymous private
//! read-write mappings from the OS.

use core::ptr::{self, NonNull};

use crate::error::Errno;
use crate::platform;

/// Map `len` bytes of anonymous read-write memory.
///
/// Must return zero-filled, page-aligned memory or the OS errno. Called
/// with the directory lock held, possibly from any thread.
pub type MapFn = unsafe fn(data: *mut (), len: usize) -> Result<NonNull<u8>, Errno>;

/// Release a region previously produced by the paired [`MapFn`].
pub type UnmapFn = unsafe fn(data: *mut (), ptr: NonNull<u8>, len: usize) -> Result<(), Errno>;

/// Mapping callbacks cached inside each pool.
#[derive(Clone, Copy)]
pub struct MapOps {
    map: MapFn,
    unmap: UnmapFn,
    data: *mut (),
}

impl MapOps {
    /// Bundle a custom backend. `data` is passed to every callback verbatim;
    /// the callbacks must tolerate being invoked from any thread.
    pub const fn new(map: MapFn, unmap: UnmapFn, data: *mut ()) -> Self {
        Self { map, unmap, data }
    }

    /// The OS-backed default: anonymous private mmap.
    pub(crate) const fn default_backend() -> Self {
        Self {
            map: default_map,
            unmap: default_unmap,
            data: ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// Backend contract: see [`MapFn`].
    pub(crate) unsafe fn map(&self, len: usize) -> Result<NonNull<u8>, Errno> {
        unsafe { (self.map)(self.data, len) }
    }

    /// # Safety
    ///
    /// `ptr`/`len` must describe a region produced by this backend's map.
    pub(crate) unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        unsafe { (self.unmap)(self.data, ptr, len) }
    }
}

unsafe fn default_map(_data: *mut (), len: usize) -> Result<NonNull<u8>, Errno> {
    unsafe { platform::map_anonymous(len) }
}

unsafe fn default_unmap(_data: *mut (), ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
    unsafe { platform::unmap(ptr, len) }
}
