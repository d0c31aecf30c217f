//! Linux rseq kernel ABI types and constants.
//!
//! The per-thread control block shared between userspace and the kernel.
//! Layout must match the kernel's exactly.

// ── Registration flags (passed to syscall `flags` parameter) ─────────────────

/// Unregister the current thread's rseq area.
pub const RSEQ_FLAG_UNREGISTER: i32 = 1 << 0;

// ── Signature ────────────────────────────────────────────────────────────────

/// Abort signature registered with the kernel. Must appear as the 4 bytes
/// immediately before every abort handler IP of a critical section; a
/// mismatch kills the thread with SIGSEGV, providing control-flow integrity.
#[cfg(target_arch = "x86_64")]
pub const RSEQ_SIG: u32 = 0x53053053; // ud1 %edi, %eax — guaranteed illegal

/// Abort signature on aarch64: a trapping `brk` encoding.
#[cfg(target_arch = "aarch64")]
pub const RSEQ_SIG: u32 = 0xd428bc00;

/// Placeholder signature on architectures without rseq support here.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const RSEQ_SIG: u32 = 0x53053053;

// ── CPU ID sentinel values ───────────────────────────────────────────────────

/// cpu_id value before the kernel first schedules the thread.
pub const RSEQ_CPU_ID_UNINITIALIZED: u32 = u32::MAX; // -1 as u32

/// cpu_id value if registration failed.
pub const RSEQ_CPU_ID_REGISTRATION_FAILED: u32 = u32::MAX - 1; // -2 as u32

// ── struct rseq ──────────────────────────────────────────────────────────────

/// Per-thread rseq area shared with the kernel.
///
/// Must be 32-byte aligned. The kernel reads and writes `cpu_id`,
/// `cpu_id_start`, `node_id`, and `mm_cid` on context switches; userspace
/// writes `rseq_cs` to arm a critical section.
#[repr(C, align(32))]
pub struct Rseq {
    /// CPU number at the start of the current critical section.
    /// Always reflects a valid CPU number even outside a critical section.
    pub cpu_id_start: u32,

    /// Current CPU number. Set to `RSEQ_CPU_ID_UNINITIALIZED` before
    /// the first schedule, or `RSEQ_CPU_ID_REGISTRATION_FAILED` if
    /// registration failed.
    pub cpu_id: u32,

    /// Pointer to the active critical-section descriptor, or 0 when none
    /// is armed. The kernel clears it on abort.
    pub rseq_cs: u64,

    /// Flags controlling restart behavior.
    pub flags: u32,

    /// NUMA node ID (kernel >= 5.17).
    pub node_id: u32,

    /// Memory-map concurrency ID (kernel >= 5.17).
    pub mm_cid: u32,

    /// NUMA-aware memory-map concurrency ID.
    pub mm_numa_cid: u32,
}

/// Minimum size to pass to the rseq syscall for the original ABI (v0).
pub const RSEQ_MIN_SIZE: u32 = 32;

impl Rseq {
    /// Create a zeroed, unregistered rseq area.
    pub const fn new() -> Self {
        Self {
            cpu_id_start: 0,
            cpu_id: RSEQ_CPU_ID_UNINITIALIZED,
            rseq_cs: 0,
            flags: 0,
            node_id: 0,
            mm_cid: 0,
            mm_numa_cid: 0,
        }
    }
}

impl Default for Rseq {
    fn default() -> Self {
        Self::new()
    }
}
