//! Fast-path benchmarks: single push/pop cycles and batch transfers.
//!
//! The benchmark thread is pinned to CPU 0 so that every iteration hits
//! the same slab and the cached slab word never goes cold from
//! migration.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use percpu_slab::layout::slabs_alloc_size;
use percpu_slab::{PerCpuSlab, Shift};
use rseq::syscall::{CpuMask, sched_setaffinity};

const NUM_CLASSES: usize = 4;
const CAP: usize = 1024;

fn build_slab() -> &'static PerCpuSlab<NUM_CLASSES> {
    let shift = Shift::new(18);
    let region = unsafe {
        percpu_slab::platform::page_alloc(slabs_alloc_size(
            shift,
            percpu_slab::platform::num_cpus(),
        ))
    };
    assert!(!region.is_null());

    let slab = Box::leak(Box::new(PerCpuSlab::<NUM_CLASSES>::empty()));
    unsafe {
        slab.init(
            |bytes, align| unsafe {
                std::alloc::alloc_zeroed(std::alloc::Layout::from_size_align(bytes, align).unwrap())
            },
            region,
            |_| CAP,
            shift,
            false,
        );
    }
    for cpu in 0..slab.num_cpus() {
        slab.init_cpu(cpu, |_| CAP);
        slab.stop_cpu(cpu);
        for size_class in 1..NUM_CLASSES {
            slab.grow_other_cache(cpu, size_class, CAP, |_| CAP);
        }
        slab.start_cpu(cpu);
    }
    slab
}

fn bench_fast_paths(c: &mut Criterion) {
    let Some(rseq) = (unsafe { rseq::current_rseq() }) else {
        eprintln!("rseq unavailable, skipping benchmarks");
        return;
    };
    sched_setaffinity(&CpuMask::single(0)).expect("pin to CPU 0");
    let slab = build_slab();

    let mut group = c.benchmark_group("fast_path");

    group.throughput(Throughput::Elements(1));
    group.bench_function("push_pop", |b| {
        b.iter(|| unsafe {
            assert!(slab.push(rseq, 1, black_box(0x100 as *mut u8)));
            black_box(slab.pop(rseq, 1)).unwrap();
        })
    });

    for batch_size in [8usize, 32, 128] {
        let items: Vec<*mut u8> = (1..=batch_size).map(|i| (i * 0x40) as *mut u8).collect();
        let mut out = vec![std::ptr::null_mut(); batch_size];

        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_function(format!("push_pop_batch/{batch_size}"), |b| {
            b.iter(|| unsafe {
                assert_eq!(slab.push_batch(rseq, 2, black_box(&items)), batch_size);
                assert_eq!(slab.pop_batch(rseq, 2, black_box(&mut out)), batch_size);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fast_paths);
criterion_main!(benches);
