//! Error types shared across the allocator.
//!
//! Backend failures carry the OS errno verbatim; everything else is a
//! configuration or capacity problem described at the call site. Robust-mode
//! consistency violations are not errors — they are bugs, and they abort.

use thiserror::Error;

/// Raw OS errno captured from a mapping backend or kernel call.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
#[error("errno {0}")]
pub struct Errno(pub i32);

#[cfg(target_os = "linux")]
impl Errno {
    /// Capture the calling thread's current errno.
    #[inline]
    pub fn last() -> Self {
        Self(unsafe { *libc::__errno_location() })
    }
}

/// Failures reported by pool and pool-set operations.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum Error {
    /// Configuration rejected before any resource was acquired.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// A fixed-capacity resource ran out.
    #[error("out of memory: {0}")]
    Exhausted(&'static str),

    /// The pool set already holds a pool for this size-class order.
    #[error("size-class order {0} already occupied")]
    OrderBusy(usize),

    /// The pool is not present in the directory.
    #[error("pool not registered")]
    NotRegistered,

    /// A mapping backend or kernel call failed; errno preserved verbatim.
    #[error("backend failure: {0}")]
    Backend(#[from] Errno),
}
