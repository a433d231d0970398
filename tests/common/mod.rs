#![allow(dead_code)] // each test binary uses its own subset

//! Shared harness for the integration tests.
//!
//! Builds fully-grown slab sets and pins threads to a CPU where a test
//! needs deterministic single-CPU behavior (an unpinned thread may be
//! migrated mid-test, which moves its pushes to another CPU's LIFO).

use percpu_slab::layout::slabs_alloc_size;
use percpu_slab::{PerCpuSlab, Shift};
use rseq::Rseq;
use rseq::syscall::{CpuMask, sched_getaffinity, sched_setaffinity};

pub const NUM_CLASSES: usize = 4;

/// Build a slab set with every CPU initialized and every class grown to
/// `cap`. The slab and its region are leaked; tests run one scenario
/// per process-lifetime object.
pub fn new_slab(shift: u8, cap: usize) -> &'static PerCpuSlab<NUM_CLASSES> {
    let shift = Shift::new(shift);
    let region_size = slabs_alloc_size(shift, percpu_slab::platform::num_cpus());
    let region = unsafe { percpu_slab::platform::page_alloc(region_size) };
    assert!(!region.is_null(), "mmap failed");

    let slab = Box::leak(Box::new(PerCpuSlab::<NUM_CLASSES>::empty()));
    unsafe {
        slab.init(
            |bytes, align| unsafe {
                std::alloc::alloc_zeroed(std::alloc::Layout::from_size_align(bytes, align).unwrap())
            },
            region,
            |_| cap,
            shift,
            false,
        );
    }
    for cpu in 0..slab.num_cpus() {
        slab.init_cpu(cpu, |_| cap);
        grow_all(slab, cpu, cap);
    }
    slab
}

/// Grant `cap` capacity to every class on `cpu`.
pub fn grow_all(slab: &PerCpuSlab<NUM_CLASSES>, cpu: usize, cap: usize) {
    slab.stop_cpu(cpu);
    for size_class in 1..NUM_CLASSES {
        assert_eq!(
            slab.grow_other_cache(cpu, size_class, cap, |_| cap),
            cap,
            "grow cpu {cpu} class {size_class}"
        );
    }
    slab.start_cpu(cpu);
}

/// This thread's rseq area, or `None` (test should skip) when the
/// kernel/libc combination does not provide one.
pub fn rseq_or_skip() -> Option<*mut Rseq> {
    let rseq = unsafe { rseq::current_rseq() };
    if rseq.is_none() {
        eprintln!("rseq unavailable, skipping");
    }
    rseq
}

/// Pin the calling thread to `cpu`, returning the previous mask.
pub fn pin_to_cpu(cpu: usize) -> CpuMask {
    let mut saved = CpuMask::empty();
    sched_getaffinity(&mut saved).expect("getaffinity");
    sched_setaffinity(&CpuMask::single(cpu)).expect("setaffinity");
    saved
}

/// Undo [`pin_to_cpu`].
pub fn unpin(saved: &CpuMask) {
    sched_setaffinity(saved).expect("restore affinity");
}

/// Deterministic pseudo-random sequence for interleaving decisions.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}
