//! Linux implementation over libc: mmap/munmap plus sysconf queries.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Errno;

/// The system page size, cached after the first sysconf call.
pub fn page_size() -> usize {
    static CACHED: AtomicUsize = AtomicUsize::new(0);
    let cached = CACHED.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 { raw as usize } else { 4096 };
    CACHED.store(size, Ordering::Relaxed);
    size
}

/// Number of processors configured on this system (not all need be online).
pub fn num_possible_cpus() -> usize {
    let raw = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if raw > 0 { raw as usize } else { 1 }
}

/// Map `len` bytes of anonymous private read-write memory.
///
/// The kernel zero-fills anonymous mappings and never hands out page zero.
///
/// # Safety
///
/// Caller must eventually pass the returned region to [`unmap`] with the
/// same `len`.
pub unsafe fn map_anonymous(len: usize) -> Result<NonNull<u8>, Errno> {
    let raw = unsafe {
        libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    Ok(unsafe { NonNull::new_unchecked(raw.cast()) })
}

/// Release a mapping produced by [`map_anonymous`].
///
/// # Safety
///
/// `ptr`/`len` must match a live `map_anonymous` result exactly.
pub unsafe fn unmap(ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
    if unsafe { libc::munmap(ptr.as_ptr().cast(), len) } != 0 {
        return Err(Errno::last());
    }
    Ok(())
}
