//! Per-thread registration and the current-CPU oracle.
//!
//! Registration is reference-counted per thread: every user in the process
//! calls [`register_current_thread`] / [`unregister_current_thread`] and the
//! kernel sees a single registration. Three outcomes are possible:
//!
//! **glibc-managed (glibc >= 2.35):** glibc registered rseq at thread start.
//! Detected via the `__rseq_offset` / `__rseq_size` weak symbols; we share
//! its area and never issue the syscall ourselves.
//!
//! **self-managed:** we own a `#[thread_local]` `Rseq` and register it via
//! the raw syscall. Requires the `nightly` feature.
//!
//! **unavailable:** kernel too old, registration denied, or built without
//! `nightly`. [`current_cpu`] then falls back to getcpu(2).

use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "nightly")]
use crate::abi::{RSEQ_CPU_ID_REGISTRATION_FAILED, RSEQ_CPU_ID_UNINITIALIZED, Rseq};
use crate::syscall;

/// Global flag: has the kernel rejected rseq? (ENOSYS → kernel too old.)
static RSEQ_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

// ── glibc weak symbols ──────────────────────────────────────────────────────

// Exported by glibc >= 2.35 when it auto-registers rseq. Declared weak so
// linking succeeds without glibc (musl, static builds).
#[cfg(feature = "nightly")]
unsafe extern "C" {
    #[linkage = "extern_weak"]
    static __rseq_offset: *const isize;
    #[linkage = "extern_weak"]
    static __rseq_size: *const u32;
}

/// Check whether glibc has already registered rseq for this process.
/// Always false on architectures where we cannot read the thread pointer.
#[cfg(feature = "nightly")]
fn glibc_managed() -> bool {
    if !cfg!(any(target_arch = "x86_64", target_arch = "aarch64")) {
        return false;
    }
    unsafe {
        let size_ptr: *const *const u32 = &raw const __rseq_size;
        if (*size_ptr).is_null() {
            return false;
        }
        *(*size_ptr) > 0
    }
}

/// The glibc-registered rseq area, computed from the thread pointer.
///
/// # Safety
///
/// Only call after [`glibc_managed`] returned true.
#[cfg(feature = "nightly")]
unsafe fn glibc_rseq_ptr() -> *mut Rseq {
    use core::arch::asm;

    let offset: isize;
    unsafe {
        let offset_ptr: *const *const isize = &raw const __rseq_offset;
        offset = **offset_ptr;
    }

    let tp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        asm!(
            "mov {tp}, fs:0",
            tp = out(reg) tp,
            options(nostack, preserves_flags, readonly, pure)
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!(
            "mrs {tp}, tpidr_el0",
            tp = out(reg) tp,
            options(nostack, preserves_flags)
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        tp = 0;
    }

    (tp as isize + offset) as *mut Rseq
}

// ── Self-managed rseq area ───────────────────────────────────────────────────

#[cfg(feature = "nightly")]
#[thread_local]
static mut LOCAL_RSEQ: Rseq = Rseq::new();

/// Users of the registration on this thread. The registration syscall is
/// issued on the 0→1 transition and undone on 1→0 (self-managed mode only).
#[cfg(feature = "nightly")]
#[thread_local]
static mut RSEQ_REFCOUNT: u32 = 0;

/// Whether this thread's registration is ours (vs. glibc's).
#[cfg(feature = "nightly")]
#[thread_local]
static mut RSEQ_OWNED: bool = false;

// ── Registration ─────────────────────────────────────────────────────────────

/// Register the calling thread with the sequence facility.
///
/// Reference-counted: every successful call must be paired with
/// [`unregister_current_thread`]. When glibc already registered the thread,
/// its registration is shared and no syscall is issued.
///
/// On failure the thread is left unregistered; [`current_cpu`] still works
/// through the scheduler fallback.
#[cfg(feature = "nightly")]
pub fn register_current_thread() -> Result<(), i32> {
    unsafe {
        if RSEQ_REFCOUNT > 0 {
            RSEQ_REFCOUNT += 1;
            return Ok(());
        }
        if RSEQ_UNAVAILABLE.load(Ordering::Relaxed) {
            return Err(syscall::ENOSYS);
        }
        if glibc_managed() {
            RSEQ_REFCOUNT = 1;
            RSEQ_OWNED = false;
            return Ok(());
        }
        let ptr = &raw mut LOCAL_RSEQ;
        match syscall::rseq_register(ptr) {
            Ok(()) => {
                RSEQ_REFCOUNT = 1;
                RSEQ_OWNED = true;
                Ok(())
            }
            Err(e) => {
                if e == syscall::ENOSYS {
                    RSEQ_UNAVAILABLE.store(true, Ordering::Relaxed);
                }
                (*ptr).cpu_id = RSEQ_CPU_ID_REGISTRATION_FAILED;
                Err(e)
            }
        }
    }
}

#[cfg(not(feature = "nightly"))]
pub fn register_current_thread() -> Result<(), i32> {
    // No #[thread_local] area to register on stable; callers fall back to
    // the scheduler lookup.
    Err(syscall::ENOSYS)
}

/// Drop one reference to the calling thread's registration, unregistering
/// from the kernel when the last user is gone (self-managed mode only).
#[cfg(feature = "nightly")]
pub fn unregister_current_thread() -> Result<(), i32> {
    unsafe {
        if RSEQ_REFCOUNT == 0 {
            return Err(syscall::EINVAL);
        }
        RSEQ_REFCOUNT -= 1;
        if RSEQ_REFCOUNT > 0 || !RSEQ_OWNED {
            return Ok(());
        }
        syscall::rseq_unregister(&raw mut LOCAL_RSEQ)
    }
}

#[cfg(not(feature = "nightly"))]
pub fn unregister_current_thread() -> Result<(), i32> {
    Err(syscall::EINVAL)
}

/// Returns `true` if rseq is believed available on this system.
///
/// After the first registration attempt on any thread, reflects whether the
/// kernel accepted it. Before that, optimistically `true`.
pub fn rseq_available() -> bool {
    !RSEQ_UNAVAILABLE.load(Ordering::Relaxed)
}

// ── Current-CPU oracle ───────────────────────────────────────────────────────

/// CPU index from this thread's registered rseq area, if any.
#[cfg(feature = "nightly")]
fn registered_cpu() -> Option<u32> {
    unsafe {
        if RSEQ_REFCOUNT == 0 {
            return None;
        }
        let ptr = if RSEQ_OWNED {
            &raw mut LOCAL_RSEQ
        } else {
            glibc_rseq_ptr()
        };
        let cpu = core::ptr::read_volatile(&(*ptr).cpu_id);
        if cpu == RSEQ_CPU_ID_UNINITIALIZED || cpu == RSEQ_CPU_ID_REGISTRATION_FAILED {
            None
        } else {
            Some(cpu)
        }
    }
}

#[cfg(not(feature = "nightly"))]
fn registered_cpu() -> Option<u32> {
    None
}

/// The CPU the calling thread last ran on.
///
/// Fast path: one volatile read of the registered rseq area. Fallback:
/// getcpu(2). The value may be stale the instant it is returned; callers
/// inside restartable sequences re-check it, everyone else treats it as a
/// hint. Returns 0 when no lookup works at all.
#[inline]
pub fn current_cpu() -> u32 {
    if let Some(cpu) = registered_cpu() {
        return cpu;
    }
    syscall::getcpu().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_cpu_is_sane() {
        let cpu = current_cpu();
        assert!(cpu < 4096, "implausible CPU index {cpu}");
    }

    #[test]
    fn registration_refcount_balances() {
        match register_current_thread() {
            Ok(()) => {
                // Nested registration shares the first.
                register_current_thread().unwrap();
                unregister_current_thread().unwrap();
                unregister_current_thread().unwrap();
            }
            Err(_) => {
                // Facility unavailable: unregister must refuse.
                assert!(unregister_current_thread().is_err());
            }
        }
    }

    #[test]
    fn availability_is_reported() {
        // Whatever the kernel says, the flag must be readable and stable.
        let a = rseq_available();
        assert_eq!(a, rseq_available());
    }
}
