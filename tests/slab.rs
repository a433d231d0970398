//! Single-CPU fast-path behavior: LIFO order, full/empty results, and
//! batch transfers.

mod common;

use common::{Lcg, NUM_CLASSES, grow_all, new_slab, pin_to_cpu, rseq_or_skip, unpin};
use percpu_slab::header::load_header;
use percpu_slab::layout::header_ptr;

#[test]
fn init_push_pop() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(18, 32);
    let saved = pin_to_cpu(0);

    unsafe {
        assert!(slab.push(rseq, 2, 0x10 as *mut u8));
        assert!(slab.push(rseq, 2, 0x20 as *mut u8));
        assert!(slab.push(rseq, 2, 0x30 as *mut u8));
        assert_eq!(slab.length(0, 2), 3);

        assert_eq!(slab.pop(rseq, 2), Some(0x30 as *mut u8));
        assert_eq!(slab.pop(rseq, 2), Some(0x20 as *mut u8));
        assert_eq!(slab.pop(rseq, 2), Some(0x10 as *mut u8));
        assert_eq!(slab.pop(rseq, 2), None);
    }

    unpin(&saved);
}

#[test]
fn fill_then_push_overflow() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(18, 8);
    let saved = pin_to_cpu(0);

    unsafe {
        for i in 0..8usize {
            assert!(slab.push(rseq, 1, (0x100 + i * 8) as *mut u8), "push {i}");
        }
        // Ninth push finds current == end.
        assert!(!slab.push(rseq, 1, 0x999 as *mut u8));
    }
    assert_eq!(slab.length(0, 1), slab.capacity(0, 1));

    unpin(&saved);
}

#[test]
fn pop_before_any_grow_is_empty() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(18, 8);
    let saved = pin_to_cpu(0);

    // Class 3 drained to zero capacity: both paths miss.
    slab.drain(0, |_, _, _, _| {});
    unsafe {
        assert_eq!(slab.pop(rseq, 3), None);
        assert!(!slab.push(rseq, 3, 0x40 as *mut u8));
    }

    // Re-granting capacity revives the class.
    grow_all(slab, 0, 8);
    unsafe {
        assert!(slab.push(rseq, 3, 0x40 as *mut u8));
        assert_eq!(slab.pop(rseq, 3), Some(0x40 as *mut u8));
    }

    unpin(&saved);
}

#[test]
fn batch_transfers_stop_at_capacity() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(18, 8);
    let saved = pin_to_cpu(0);

    let items: Vec<*mut u8> = (1..=12usize).map(|i| (i * 0x40) as *mut u8).collect();
    unsafe {
        // Only 8 fit.
        assert_eq!(slab.push_batch(rseq, 1, &items), 8);
        assert_eq!(slab.length(0, 1), 8);

        // Top of the LIFO comes out first.
        let mut out = [std::ptr::null_mut(); 12];
        assert_eq!(slab.pop_batch(rseq, 1, &mut out), 8);
        for (i, got) in out[..8].iter().enumerate() {
            assert_eq!(*got, items[7 - i]);
        }
        assert_eq!(slab.pop(rseq, 1), None);

        // Partial batch from a partially filled class.
        assert_eq!(slab.push_batch(rseq, 1, &items[..3]), 3);
        let mut out = [std::ptr::null_mut(); 8];
        assert_eq!(slab.pop_batch(rseq, 1, &mut out[..2]), 2);
        assert_eq!(out[0], items[2]);
        assert_eq!(out[1], items[1]);
        assert_eq!(slab.pop(rseq, 1), Some(items[0]));
    }

    unpin(&saved);
}

#[test]
fn lifo_order_matches_model_under_random_interleaving() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(16, 64);
    let saved = pin_to_cpu(0);

    let mut model: Vec<*mut u8> = Vec::new();
    let mut rng = Lcg(0x5EED);
    let mut next_tag = 0x1000usize;

    for _ in 0..10_000 {
        if rng.next() % 2 == 0 {
            let item = next_tag as *mut u8;
            next_tag += 8;
            let pushed = unsafe { slab.push(rseq, 2, item) };
            assert_eq!(pushed, model.len() < 64);
            if pushed {
                model.push(item);
            }
        } else {
            let got = unsafe { slab.pop(rseq, 2) };
            assert_eq!(got, model.pop());
        }
    }

    // Drain the survivors; they come back bottom-up per slot order.
    let mut drained: Vec<*mut u8> = Vec::new();
    slab.drain(0, |_, size_class, batch, _| {
        if size_class == 2 {
            drained.extend_from_slice(batch);
        }
    });
    assert_eq!(drained, model);

    unpin(&saved);
}

#[test]
fn headers_stay_ordered_and_disjoint() {
    let Some(rseq) = rseq_or_skip() else { return };
    let slab = new_slab(16, 32);
    let saved = pin_to_cpu(0);

    let mut rng = Lcg(42);
    for round in 0..2_000 {
        let size_class = 1 + (rng.next() as usize) % (NUM_CLASSES - 1);
        unsafe {
            if rng.next() % 2 == 0 {
                slab.push(rseq, size_class, ((round + 1) * 16) as *mut u8);
            } else {
                slab.pop(rseq, size_class);
            }
        }

        let (slabs, shift) = slab.slabs_and_shift();
        let mut prev_end = 0u16;
        for c in 1..NUM_CLASSES {
            let hdr = unsafe { load_header(header_ptr(slabs, shift, 0, c)) };
            assert!(hdr.begin <= hdr.current, "class {c}: begin > current");
            assert!(hdr.current <= hdr.end, "class {c}: current > end");
            assert!(hdr.capacity() <= 32, "class {c}: over max capacity");
            // Ranges are disjoint and ascending within the slab.
            assert!(hdr.begin > prev_end, "class {c}: overlaps previous");
            prev_end = hdr.end;
            assert!(((hdr.end as usize) * 8) <= shift.bytes());
        }
    }

    unpin(&saved);
}
