//! `rseq` — Linux restartable-sequence facility boundary.
//!
//! Zero-dependency, `no_std` wrapper around the Linux rseq(2) syscall.
//! Manages the per-thread control block that the kernel updates on every
//! context switch, and exposes a current-CPU oracle with a scheduler
//! fallback. Consumers that emit restartable critical sections bring their
//! own architecture-specific assembly; this crate only provides the control
//! block such sequences read.
//!
//! # Features
//!
//! - `nightly` — enables `#[thread_local]` for the self-managed rseq area
//!   and weak-symbol glibc detection. Without this feature, registration
//!   reports the facility unavailable and [`current_cpu`] uses the
//!   getcpu(2) fallback only.
//!
//! # Architecture support
//!
//! x86_64 and aarch64. Other architectures compile but report the facility
//! unavailable.

#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local, linkage))]

pub mod abi;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use abi::{RSEQ_SIG, Rseq};
pub use thread::{
    current_cpu, register_current_thread, rseq_available, unregister_current_thread,
};
