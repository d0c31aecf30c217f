//! OS platform layer: anonymous virtual memory, page geometry, CPU counts.
//!
//! The default mapping backend and the NUMA placer sit on top of this.
//! Only Linux is supported — the allocator leans on Linux-only interfaces
//! (move_pages, sysfs topology, the rseq facility).

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::{map_anonymous, num_possible_cpus, page_size, unmap};
    } else {
        compile_error!("percpu-pool targets Linux");
    }
}
