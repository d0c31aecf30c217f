//! Pool-level scenarios: slice isolation, LIFO reuse, exhaustion, zeroing,
//! custom mapping backends, init callbacks and concurrent traffic.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use percpu_pool::{Errno, Error, Handle, Pool, PoolAttr, global_ptr, percpu_free, percpu_ptr};

// Not exposed by the `libc` crate; value from linux/mempolicy.h.
const MPOL_MF_MOVE: i32 = 1 << 1;

fn percpu_attr(stride: usize, max_cpus: usize) -> PoolAttr {
    let mut attr = PoolAttr::new();
    attr.percpu(stride, max_cpus);
    attr
}

#[test]
fn slices_are_isolated() {
    let pool = Pool::create("isolation", 32, &percpu_attr(65536, 4)).unwrap();
    let h = pool.malloc().unwrap();
    let item = pool.item_len();

    for cpu in 0..4 {
        unsafe { pool.ptr_for_cpu(h, cpu).write_bytes(cpu as u8 + 1, item) };
    }
    for cpu in 0..4 {
        let p = pool.ptr_for_cpu(h, cpu);
        for i in 0..item {
            assert_eq!(unsafe { *p.add(i) }, cpu as u8 + 1, "bleed into cpu {cpu}");
        }
    }

    unsafe { percpu_free(h) };
    pool.destroy().unwrap();
}

#[test]
fn slice_addresses_are_stride_apart() {
    let pool = Pool::create("geometry", 64, &percpu_attr(65536, 4)).unwrap();
    let h = pool.malloc().unwrap();

    for cpu in 1..4 {
        let prev = pool.ptr_for_cpu(h, cpu - 1) as usize;
        let cur = pool.ptr_for_cpu(h, cpu) as usize;
        assert_eq!(cur - prev, pool.stride());
    }
    // The directory-resolved form agrees with the pool's own arithmetic.
    for cpu in 0..4 {
        assert_eq!(unsafe { percpu_ptr(h, cpu) }, pool.ptr_for_cpu(h, cpu));
    }

    unsafe { percpu_free(h) };
    pool.destroy().unwrap();
}

#[test]
fn handles_obey_the_codec_invariants() {
    let pool = Pool::create("codec", 48, &percpu_attr(65536, 2)).unwrap();
    let mut handles = Vec::new();
    for _ in 0..32 {
        let h = pool.malloc().unwrap();
        assert_ne!(h.as_raw(), 0);
        assert!(h.pool_index() >= 1);
        assert_eq!(h.pool_index(), pool.index());
        assert_eq!(h.item_offset() % pool.item_len(), 0);
        assert!(h.item_offset() < pool.stride());
        handles.push(h);
    }
    // All outstanding handles are distinct.
    for (i, a) in handles.iter().enumerate() {
        for b in &handles[i + 1..] {
            assert_ne!(a, b);
        }
    }
    for h in handles {
        unsafe { percpu_free(h) };
    }
    pool.destroy().unwrap();
}

#[test]
fn free_list_is_lifo() {
    let pool = Pool::create("lifo", 64, &percpu_attr(65536, 2)).unwrap();

    let h1 = pool.malloc().unwrap();
    let h2 = pool.malloc().unwrap();
    unsafe {
        percpu_free(h1);
        percpu_free(h2);
    }
    let h3 = pool.malloc().unwrap();
    let h4 = pool.malloc().unwrap();
    assert_eq!(h3, h2);
    assert_eq!(h4, h1);

    unsafe {
        percpu_free(h3);
        percpu_free(h4);
    }
    pool.destroy().unwrap();
}

#[test]
fn exhaustion_then_refill() {
    let pool = Pool::create("full", 512, &percpu_attr(4096, 2)).unwrap();
    let slots = pool.stride() / pool.item_len();

    let mut handles: Vec<Handle> = (0..slots).map(|_| pool.malloc().unwrap()).collect();
    assert!(matches!(pool.malloc(), Err(Error::Exhausted(_))));

    // One free makes allocation succeed again, returning the same slot.
    let h = handles.pop().unwrap();
    unsafe { percpu_free(h) };
    let again = pool.malloc().unwrap();
    assert_eq!(again, h);

    handles.push(again);
    for h in handles {
        unsafe { percpu_free(h) };
    }
    pool.destroy().unwrap();
}

#[test]
fn zmalloc_zeroes_every_slice_on_reuse() {
    let pool = Pool::create("zeroing", 64, &percpu_attr(8192, 2)).unwrap();
    let item = pool.item_len();

    // Dirty every slice of a slot, free it, and take it back zeroed.
    let h = pool.malloc().unwrap();
    for cpu in 0..2 {
        unsafe { pool.ptr_for_cpu(h, cpu).write_bytes(0xFF, item) };
    }
    unsafe { percpu_free(h) };

    let hz = pool.zmalloc().unwrap();
    assert_eq!(hz, h, "LIFO reuse expected");
    for cpu in 0..2 {
        let p = pool.ptr_for_cpu(hz, cpu);
        for i in 0..item {
            assert_eq!(unsafe { *p.add(i) }, 0, "stale byte on cpu {cpu}");
        }
    }

    unsafe { percpu_free(hz) };
    pool.destroy().unwrap();
}

#[test]
fn global_pool_is_a_plain_slab() {
    let mut attr = PoolAttr::new();
    attr.global(0);
    let pool = Pool::create("global", 128, &attr).unwrap();
    assert_eq!(pool.max_cpus(), 1);

    let h = pool.malloc().unwrap();
    let p = unsafe { global_ptr(h) };
    assert_eq!(p, pool.ptr_for_cpu(h, 0));
    unsafe {
        p.write_bytes(0x5A, pool.item_len());
        assert_eq!(*p, 0x5A);
    }

    unsafe { percpu_free(h) };
    pool.destroy().unwrap();
}

// ── Custom mapping backend ───────────────────────────────────────────────────

static MAPS: AtomicUsize = AtomicUsize::new(0);
static UNMAPS: AtomicUsize = AtomicUsize::new(0);

unsafe fn counting_map(_data: *mut (), len: usize) -> Result<NonNull<u8>, Errno> {
    MAPS.fetch_add(1, Ordering::SeqCst);
    unsafe { percpu_pool::platform::map_anonymous(len) }
}

unsafe fn counting_unmap(_data: *mut (), ptr: NonNull<u8>, len: usize) -> Result<(), Errno> {
    UNMAPS.fetch_add(1, Ordering::SeqCst);
    unsafe { percpu_pool::platform::unmap(ptr, len) }
}

#[test]
fn custom_backend_sees_all_traffic() {
    let maps_before = MAPS.load(Ordering::SeqCst);
    let unmaps_before = UNMAPS.load(Ordering::SeqCst);

    let mut attr = PoolAttr::new();
    attr.percpu(8192, 2)
        .mmap(counting_map, counting_unmap, core::ptr::null_mut());
    let pool = Pool::create("counted", 64, &attr).unwrap();
    assert_eq!(MAPS.load(Ordering::SeqCst) - maps_before, 1);

    let h = pool.zmalloc().unwrap();
    unsafe { percpu_free(h) };
    pool.destroy().unwrap();
    assert_eq!(UNMAPS.load(Ordering::SeqCst) - unmaps_before, 1);
}

// ── Init callback ────────────────────────────────────────────────────────────

static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
static INIT_CPU_MASK: AtomicUsize = AtomicUsize::new(0);

unsafe fn recording_init(
    _data: *mut (),
    addr: *mut u8,
    len: usize,
    cpu: usize,
) -> Result<(), Errno> {
    assert!(!addr.is_null());
    assert!(len >= 8192);
    // The slice is freshly mapped and zero-filled.
    assert_eq!(unsafe { *addr }, 0);
    INIT_CALLS.fetch_add(1, Ordering::SeqCst);
    INIT_CPU_MASK.fetch_or(1 << cpu, Ordering::SeqCst);
    Ok(())
}

unsafe fn failing_init(
    _data: *mut (),
    _addr: *mut u8,
    _len: usize,
    _cpu: usize,
) -> Result<(), Errno> {
    Err(Errno(libc::EIO))
}

#[test]
fn init_callback_runs_once_per_slice() {
    let mut attr = PoolAttr::new();
    attr.percpu(8192, 3)
        .init(recording_init, core::ptr::null_mut());
    let pool = Pool::create("initialised", 64, &attr).unwrap();

    assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 3);
    assert_eq!(INIT_CPU_MASK.load(Ordering::SeqCst), 0b111);
    pool.destroy().unwrap();
}

#[test]
fn init_callback_failure_fails_creation() {
    let mut attr = PoolAttr::new();
    attr.percpu(8192, 2).init(failing_init, core::ptr::null_mut());
    match Pool::create("doomed", 64, &attr) {
        Err(Error::Backend(Errno(e))) => assert_eq!(e, libc::EIO),
        other => panic!("expected backend error, got {other:?}"),
    }
}

// ── NUMA smoke ───────────────────────────────────────────────────────────────

#[test]
fn numa_placement_keeps_the_pool_usable() {
    let pool = Pool::create("numa", 64, &percpu_attr(4096, 2)).unwrap();
    // Placement is best-effort: single-node systems and restricted sandboxes
    // are both fine, the pool just has to keep working.
    let _ = pool.init_numa(MPOL_MF_MOVE);

    let h = pool.zmalloc().unwrap();
    for cpu in 0..2 {
        unsafe {
            pool.ptr_for_cpu(h, cpu).write_bytes(0x42, pool.item_len());
            assert_eq!(*pool.ptr_for_cpu(h, cpu), 0x42);
        }
    }
    unsafe { percpu_free(h) };
    pool.destroy().unwrap();
}

// ── Oracle ───────────────────────────────────────────────────────────────────

#[test]
fn current_cpu_oracle_is_in_range() {
    let cpus = percpu_pool::platform::num_possible_cpus();
    let cpu = percpu_pool::current_cpu() as usize;
    assert!(cpu < cpus, "cpu {cpu} out of {cpus}");
}

// ── Concurrency ──────────────────────────────────────────────────────────────

/// Deterministic fill pattern derived from the handle word.
fn fill_pattern(pool: &Pool, h: Handle) {
    let p = pool.ptr_for_cpu(h, 0);
    let seed = h.as_raw();
    for i in 0..pool.item_len() {
        unsafe { *p.add(i) = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8 };
    }
}

fn check_pattern(pool: &Pool, h: Handle) {
    let p = pool.ptr_for_cpu(h, 0);
    let seed = h.as_raw();
    for i in 0..pool.item_len() {
        let expected = ((seed.wrapping_add(i).wrapping_mul(0x9E37_79B9)) & 0xFF) as u8;
        assert_eq!(unsafe { *p.add(i) }, expected, "corruption in {h:?}");
    }
}

#[test]
fn concurrent_malloc_free_keeps_slots_intact() {
    let pool = Pool::create("contended", 64, &percpu_attr(65536, 1)).unwrap();

    std::thread::scope(|s| {
        for t in 0..8usize {
            let pool = &pool;
            s.spawn(move || {
                let mut live: Vec<Handle> = Vec::new();
                for round in 0..200usize {
                    if live.len() < 16 {
                        let h = pool.malloc().expect("slab sized for all threads");
                        fill_pattern(pool, h);
                        live.push(h);
                    }
                    for &h in &live {
                        check_pattern(pool, h);
                    }
                    if round % 3 == t % 3 && !live.is_empty() {
                        let h = live.swap_remove(round % live.len());
                        check_pattern(pool, h);
                        unsafe { percpu_free(h) };
                    }
                }
                for h in live {
                    check_pattern(pool, h);
                    unsafe { percpu_free(h) };
                }
            });
        }
    });

    pool.destroy().unwrap();
}
