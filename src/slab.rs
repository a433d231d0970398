//! Per-CPU slab engine: tcmalloc-style per-CPU LIFO caches via rseq.
//!
//! A single contiguous memory region is divided among CPUs. Each CPU
//! gets `2^shift` bytes containing:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header[0]  (8 bytes: begin u16 | current u16 | end u16) │
//! │ Header[1]                                               │
//! │ ...                                                     │
//! │ Header[NUM_CLASSES-1]                                   │
//! │ sentinel slot for class 1 (points to itself)            │
//! │ slot array for class 1: [*mut u8; capacity(1)]          │
//! │ sentinel slot for class 2                               │
//! │ slot array for class 2: [*mut u8; capacity(2)]          │
//! │ ...                                                     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Push and pop are lock-free rseq critical sections whose only commit
//! is a single 16-bit store to `current`. Control operations (init,
//! drain, grow, shrink, resize) exclude the fast paths by setting a
//! per-CPU stop flag and issuing an rseq fence; every fast path entered
//! after the fence finds its cached slab word invalidated and re-checks
//! the flag before caching again.
//!
//! # The cached slab word
//!
//! Each thread caches `(cpu << shift) | CACHED_SLAB_MASK` in the
//! `cpu_id_start` slot of its rseq area. The kernel rewrites that slot
//! with the raw CPU number every time the thread resumes, which clears
//! the tag bit: any reschedule — including the fence IPI — uncaches the
//! word. A critical section that finds the tag set therefore knows the
//! thread has not been rescheduled since the word was committed, i.e.
//! it is still on that CPU and no stop/resize fence has intervened.

use core::arch::asm;
use core::sync::atomic::{AtomicU64, Ordering, compiler_fence, fence};

use rseq::Rseq;
use rseq::abi::{RSEQ_OFF_CPU_ID, RSEQ_OFF_MM_CID, RSEQ_OFF_RSEQ_CS};

use crate::header::{HEADER_SIZE, Header, load_header, store_header};
use crate::layout::{Shift, SlabsAndShift, cpu_memory_start, header_ptr, slabs_alloc_size};
use crate::residence::{PerCpuMetadataState, residence};
use crate::stop::StopFlag;
use crate::{check, crash, debug_check, platform};

// ── Cached slab word encoding ────────────────────────────────────────────────

/// Tag bit marking the per-thread slab word as valid. Kernel-written CPU
/// numbers can never set it, so a reschedule always reads as "uncached".
pub const CACHED_SLAB_BIT: u32 = 31;

/// Mask form of [`CACHED_SLAB_BIT`].
pub const CACHED_SLAB_MASK: u32 = 1 << CACHED_SLAB_BIT;

/// Slot size: element slots hold pointers, and header offsets count in
/// these units.
const SLOT_SIZE: usize = core::mem::size_of::<*mut u8>();

// ── Fast-path commit statuses (shared with the asm blocks) ───────────────────

/// Critical section restarted by the kernel; retry.
const COMMIT_ABORTED: u32 = 0;
/// No cached slab word; run the caching slow path, then retry.
const COMMIT_UNCACHED: u32 = 1;
/// Committed nothing: LIFO full (push) or empty (pop).
const COMMIT_MISS: u32 = 2;
/// Committed.
const COMMIT_OK: u32 = 3;

/// Outcome of the slab-caching slow path.
enum CacheSlab {
    /// The word is cached; fast paths may proceed.
    Cached,
    /// The CPU is stopped; the word was left uncached.
    Stopped,
}

/// What `resize_slabs` hands back: the retired slab set.
#[derive(Debug)]
pub struct ResizeSlabsInfo {
    pub old_slabs: *mut u8,
    pub old_slabs_size: usize,
}

// ── PerCpuSlab ───────────────────────────────────────────────────────────────

/// Per-CPU slab cache with one bounded LIFO per size class per CPU.
///
/// `NUM_CLASSES` is the total number of size classes; class 0 is unused
/// by convention. The slab does **not** own its backing memory — the
/// host allocates the region (page-aligned, `num_cpus << shift` bytes)
/// and frees it after [`destroy`](PerCpuSlab::destroy).
///
/// Per-CPU headers become valid only after that CPU's
/// [`init_cpu`](PerCpuSlab::init_cpu), which may run lazily.
pub struct PerCpuSlab<const NUM_CLASSES: usize> {
    /// Current `(base, shift)` pair, swapped atomically by resize.
    slabs_and_shift: SlabsAndShift,
    /// One cache-padded stop flag per CPU, allocated at init.
    stopped: *mut StopFlag,
    /// CPUs provisioned at init; also the stop-flag array length.
    num_cpus: usize,
    /// Byte offset of the CPU identity field in the rseq area:
    /// `cpu_id` (raw mode) or `mm_cid` (virtual mode).
    virtual_cpu_id_offset: u32,
}

// Safety: shared across threads by design. Fast paths only touch the
// current CPU's region under rseq commit; control threads take a stop
// flag first. `stopped` is written once at init.
unsafe impl<const N: usize> Sync for PerCpuSlab<N> {}
unsafe impl<const N: usize> Send for PerCpuSlab<N> {}

impl<const NUM_CLASSES: usize> PerCpuSlab<NUM_CLASSES> {
    /// Create an uninitialized engine. Must call [`init`](Self::init)
    /// before use.
    pub const fn empty() -> Self {
        Self {
            slabs_and_shift: SlabsAndShift::new(),
            stopped: core::ptr::null_mut(),
            num_cpus: 0,
            virtual_cpu_id_offset: RSEQ_OFF_CPU_ID,
        }
    }

    /// Whether [`init`](Self::init) has completed.
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.num_cpus != 0
    }

    /// CPUs provisioned at init.
    #[inline(always)]
    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    /// Current `(base, shift)` pair.
    #[inline(always)]
    pub fn slabs_and_shift(&self) -> (*mut u8, Shift) {
        self.slabs_and_shift.load()
    }

    #[inline(always)]
    fn stop_flag(&self, cpu: usize) -> &StopFlag {
        debug_check!(cpu < self.num_cpus);
        unsafe { &*self.stopped.add(cpu) }
    }

    // ── Init ─────────────────────────────────────────────────────────

    /// Install the slab set. One-shot: a second call is fatal.
    ///
    /// `alloc(bytes, align)` provides the stop-flag array. `slabs` is
    /// the host-allocated region of `num_cpus() << shift` bytes,
    /// page-aligned and zeroed. `capacity(size_class)` declares each
    /// class's eventual capacity; init validates that the per-CPU
    /// layout (headers plus `capacity + 1` slots per non-empty class)
    /// fits in `2^shift` bytes. `virtual_cpus` selects the virtual-CPU
    /// identity mapping (`mm_cid`) over raw CPU numbers.
    ///
    /// # Safety
    ///
    /// `slabs` must point to valid, zeroed memory of at least
    /// `platform::num_cpus() << shift` bytes, alive until `destroy`.
    pub unsafe fn init(
        &mut self,
        mut alloc: impl FnMut(usize, usize) -> *mut u8,
        slabs: *mut u8,
        capacity: impl Fn(usize) -> usize,
        shift: Shift,
        virtual_cpus: bool,
    ) {
        check!(!self.is_initialized(), "double slab init");
        check!(NUM_CLASSES >= 2, "need at least one usable size class");
        check!(!slabs.is_null(), "null slab region");

        let num_cpus = platform::num_cpus();
        // The cached slab word carries `cpu << shift` beside the tag bit.
        check!(
            slabs_alloc_size(shift, num_cpus) < CACHED_SLAB_MASK as usize,
            "slab set too large: {} CPUs << {} overflows the cached offset",
            num_cpus,
            shift.get()
        );

        if virtual_cpus {
            check!(
                rseq::virtual_cpu_supported(),
                "virtual-CPU mode requested but the kernel does not maintain mm_cid"
            );
            self.virtual_cpu_id_offset = RSEQ_OFF_MM_CID;
        }

        // Best effort; fences fall back to affinity pinning without it.
        rseq::ensure_membarrier();

        let stopped_bytes = num_cpus * core::mem::size_of::<StopFlag>();
        let stopped = alloc(stopped_bytes, core::mem::align_of::<StopFlag>()) as *mut StopFlag;
        check!(!stopped.is_null(), "stop-flag allocation failed");
        for cpu in 0..num_cpus {
            unsafe { stopped.add(cpu).write(StopFlag::new()) };
        }
        self.stopped = stopped;

        // A slab destroyed and re-created in the same process could
        // otherwise leave this thread holding a cached offset into the
        // old region.
        if let Some(rseq) = unsafe { rseq::current_rseq() } {
            unsafe { (rseq as *mut u32).write_volatile(0) };
        }

        self.slabs_and_shift.store(slabs, shift);

        // Validate the declared layout before any CPU is populated.
        let mut consumed_bytes = NUM_CLASSES * HEADER_SIZE;
        for size_class in 1..NUM_CLASSES {
            let cap = capacity(size_class);
            check!(
                cap <= u16::MAX as usize,
                "size_class {} capacity {} does not fit in 16 bits",
                size_class,
                cap
            );
            if cap == 0 {
                continue;
            }

            // One extra slot for the pop-prefetch sentinel.
            consumed_bytes += (cap + 1) * SLOT_SIZE;
            check!(
                consumed_bytes <= shift.bytes(),
                "per-CPU memory exceeded, have {} need {} size_class {}",
                shift.bytes(),
                consumed_bytes,
                size_class
            );
        }

        self.num_cpus = num_cpus;
        log::debug!(
            "per-cpu slab initialized: {} CPUs, shift {}, {} classes{}",
            num_cpus,
            shift.get(),
            NUM_CLASSES,
            if virtual_cpus { ", virtual CPU ids" } else { "" }
        );
    }

    /// Lay out and publish one CPU's headers. Stops the CPU around the
    /// writes; callable lazily, once per CPU per slab set.
    pub fn init_cpu(&self, cpu: usize, capacity: impl Fn(usize) -> usize) {
        let _stop = ScopedCpuStop::new(self, cpu);
        let (slabs, shift) = self.slabs_and_shift.load();
        self.init_cpu_impl(slabs, shift, cpu, &capacity);
    }

    fn init_cpu_impl(
        &self,
        slabs: *mut u8,
        shift: Shift,
        cpu: usize,
        capacity: &dyn Fn(usize) -> usize,
    ) {
        check!(self.stop_flag(cpu).is_set(), "init_cpu on a running CPU");

        // Write the prefetch sentinels and compute each class's slot
        // range, packed contiguously after the headers.
        let curr_slab = cpu_memory_start(slabs, shift, cpu);
        let mut elems = unsafe { curr_slab.add(NUM_CLASSES * HEADER_SIZE) } as *mut *mut u8;
        for size_class in 1..NUM_CLASSES {
            let cap = capacity(size_class);
            check!(
                cap <= u16::MAX as usize,
                "size_class {} capacity {} does not fit in 16 bits",
                size_class,
                cap
            );

            if cap != 0 {
                // In pop we prefetch the item a subsequent pop would
                // return; a garbage address there is slow. The slot
                // before `begin` points at itself so the prefetch of a
                // just-emptied class stays on a mapped line.
                unsafe {
                    *elems = elems as *mut u8;
                    elems = elems.add(1);
                }
            }

            let begin = (elems as usize - curr_slab as usize) / SLOT_SIZE;
            let hdr = Header {
                begin: begin as u16,
                current: begin as u16,
                end: begin as u16,
            };
            unsafe { store_header(header_ptr(slabs, shift, cpu, size_class), hdr) };

            elems = unsafe { elems.add(cap) };
            let bytes_used = elems as usize - curr_slab as usize;
            check!(
                bytes_used <= shift.bytes(),
                "per-CPU memory exceeded, have {} need {}",
                shift.bytes(),
                bytes_used
            );
        }
    }

    // ── Stop protocol ────────────────────────────────────────────────

    /// Stop `cpu`: after this returns, no rseq commit can touch the
    /// CPU's pre-stop header state, and new fast-path entries wait in
    /// the caching slow path until [`start_cpu`](Self::start_cpu).
    pub fn stop_cpu(&self, cpu: usize) {
        check!(cpu < self.num_cpus, "stop of CPU {} out of range", cpu);
        check!(
            !self.stop_flag(cpu).is_set(),
            "stop of already-stopped CPU {}",
            cpu
        );
        self.stop_flag(cpu).set();
        self.fence_cpu(cpu);
    }

    /// Release a stopped CPU, publishing all header writes made while
    /// it was stopped.
    pub fn start_cpu(&self, cpu: usize) {
        check!(cpu < self.num_cpus, "start of CPU {} out of range", cpu);
        check!(
            self.stop_flag(cpu).is_set(),
            "start of CPU {} that is not stopped",
            cpu
        );
        self.stop_flag(cpu).clear();
    }

    fn fence_cpu(&self, cpu: usize) {
        // A virtual CPU id cannot be targeted by the membarrier CPU
        // flag; fence the world instead.
        let result = if self.virtual_cpu_id_offset == RSEQ_OFF_MM_CID {
            rseq::fence_all_cpus(self.num_cpus)
        } else {
            rseq::fence_cpu(cpu)
        };
        if let Err(errno) = result {
            crash!("rseq fence of CPU {} failed: errno {}", cpu, -errno);
        }
    }

    fn fence_all_cpus(&self) {
        if let Err(errno) = rseq::fence_all_cpus(self.num_cpus) {
            crash!("rseq fence of all CPUs failed: errno {}", -errno);
        }
    }

    // ── Header queries ───────────────────────────────────────────────

    /// Live elements of `size_class` on `cpu` (relaxed snapshot).
    pub fn length(&self, cpu: usize, size_class: usize) -> usize {
        let (slabs, shift) = self.slabs_and_shift.load();
        unsafe { load_header(header_ptr(slabs, shift, cpu, size_class)) }.length() as usize
    }

    /// Granted capacity of `size_class` on `cpu` (relaxed snapshot).
    pub fn capacity(&self, cpu: usize, size_class: usize) -> usize {
        let (slabs, shift) = self.slabs_and_shift.load();
        unsafe { load_header(header_ptr(slabs, shift, cpu, size_class)) }.capacity() as usize
    }

    // ── Control operations ───────────────────────────────────────────

    /// Hand every class's live elements on `cpu` to `drain_handler` and
    /// reset the class to empty with zero capacity.
    ///
    /// The handler receives `(cpu, size_class, batch, capacity)` and
    /// must take ownership of the batch contents before returning; the
    /// slots are reused immediately afterwards.
    pub fn drain(&self, cpu: usize, mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], usize)) {
        let _stop = ScopedCpuStop::new(self, cpu);
        let (slabs, shift) = self.slabs_and_shift.load();
        self.drain_cpu_impl(slabs, shift, cpu, &mut drain_handler);
    }

    fn drain_cpu_impl(
        &self,
        slabs: *mut u8,
        shift: Shift,
        cpu: usize,
        drain_handler: &mut dyn FnMut(usize, usize, &mut [*mut u8], usize),
    ) {
        check!(self.stop_flag(cpu).is_set(), "drain of a running CPU");
        for size_class in 1..NUM_CLASSES {
            let hdrp = header_ptr(slabs, shift, cpu, size_class);
            let mut hdr = unsafe { load_header(hdrp) };
            let size = hdr.length() as usize;
            let cap = hdr.capacity() as usize;
            let batch = unsafe {
                let first = (cpu_memory_start(slabs, shift, cpu) as *mut *mut u8)
                    .add(hdr.begin as usize);
                core::slice::from_raw_parts_mut(first, size)
            };
            acquire_batch(batch);
            drain_handler(cpu, size_class, batch, cap);
            hdr.current = hdr.begin;
            hdr.end = hdr.begin;
            unsafe { store_header(hdrp, hdr) };
        }
    }

    /// Raise `size_class`'s capacity on `cpu` by up to `len`, bounded
    /// by `max_capacity(shift)`. Returns the amount grown. No elements
    /// move. The caller must already hold the CPU stopped.
    pub fn grow_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: usize,
        max_capacity: impl Fn(u8) -> usize,
    ) -> usize {
        check!(self.stop_flag(cpu).is_set(), "grow of a running CPU");
        let (slabs, shift) = self.slabs_and_shift.load();
        let max_cap = max_capacity(shift.get());
        let hdrp = header_ptr(slabs, shift, cpu, size_class);
        let mut hdr = unsafe { load_header(hdrp) };
        debug_check!(hdr.capacity() as usize <= max_cap);
        let to_grow = len.min(max_cap - hdr.capacity() as usize) as u16;
        hdr.end += to_grow;
        unsafe { store_header(hdrp, hdr) };
        to_grow as usize
    }

    /// Lower `size_class`'s capacity on `cpu` by up to `len`. When the
    /// free capacity is short, live elements are popped to make room
    /// and handed to `shrink_handler` as `(size_class, batch)`.
    /// Returns the amount shrunk. The caller must already hold the CPU
    /// stopped.
    pub fn shrink_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: usize,
        mut shrink_handler: impl FnMut(usize, &mut [*mut u8]),
    ) -> usize {
        check!(self.stop_flag(cpu).is_set(), "shrink of a running CPU");
        let (slabs, shift) = self.slabs_and_shift.load();
        let hdrp = header_ptr(slabs, shift, cpu, size_class);
        let mut hdr = unsafe { load_header(hdrp) };

        // Not enough unused capacity: pop live elements into the
        // handler until `len` can be met (or the class runs dry).
        let unused = (hdr.end - hdr.current) as usize;
        if unused < len && hdr.current != hdr.begin {
            let pop = (len - unused).min(hdr.length() as usize) as u16;
            let batch = unsafe {
                let first = (cpu_memory_start(slabs, shift, cpu) as *mut *mut u8)
                    .add((hdr.current - pop) as usize);
                core::slice::from_raw_parts_mut(first, pop as usize)
            };
            acquire_batch(batch);
            shrink_handler(size_class, batch);
            hdr.current -= pop;
        }

        let to_shrink = len.min((hdr.end - hdr.current) as usize) as u16;
        hdr.end -= to_shrink;
        unsafe { store_header(hdrp, hdr) };
        to_shrink as usize
    }

    /// Swap the slab set for a new region with a different shift.
    ///
    /// `populated(cpu)` says which CPUs have live headers to migrate.
    /// Live elements never move between regions: each populated CPU is
    /// re-initialized empty in the new slab and its old contents are
    /// delivered through `drain_handler`. Returns the retired region
    /// for the host to unmap.
    pub fn resize_slabs(
        &self,
        new_shift: Shift,
        new_slabs: *mut u8,
        capacity: impl Fn(usize) -> usize,
        mut populated: impl FnMut(usize) -> bool,
        mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], usize),
    ) -> ResizeSlabsInfo {
        let (old_slabs, old_shift) = self.slabs_and_shift.load();
        check!(new_shift != old_shift, "resize to the current shift");
        check!(!new_slabs.is_null(), "null new slab region");
        check!(
            slabs_alloc_size(new_shift, self.num_cpus) < CACHED_SLAB_MASK as usize,
            "slab set too large: {} CPUs << {} overflows the cached offset",
            self.num_cpus,
            new_shift.get()
        );
        log::debug!(
            "resizing slabs: shift {} -> {}",
            old_shift.get(),
            new_shift.get()
        );

        // Phase 1: stop the world.
        for cpu in 0..self.num_cpus {
            check!(
                !self.stop_flag(cpu).is_set(),
                "resize while CPU {} is stopped",
                cpu
            );
            self.stop_flag(cpu).set();
        }

        // Phase 2: lay out every populated CPU in the new region while
        // fast paths are fenced off.
        let mut migrated = 0usize;
        for cpu in 0..self.num_cpus {
            if populated(cpu) {
                self.init_cpu_impl(new_slabs, new_shift, cpu, &capacity);
                migrated += 1;
            }
        }

        // Phase 3: drain in-flight critical sections. From here no
        // thread holds a cached word for the old region.
        self.fence_all_cpus();

        // Phase 4: publish the new pair.
        self.slabs_and_shift.store(new_slabs, new_shift);

        // Phase 5: hand the old region's contents back, then restart.
        for cpu in 0..self.num_cpus {
            if populated(cpu) {
                self.drain_cpu_impl(old_slabs, old_shift, cpu, &mut drain_handler);
            }
        }
        for cpu in 0..self.num_cpus {
            self.stop_flag(cpu).clear();
        }

        log::debug!("resize complete: {migrated} CPUs migrated");
        ResizeSlabsInfo {
            old_slabs,
            old_slabs_size: slabs_alloc_size(old_shift, self.num_cpus),
        }
    }

    /// Release the slab region through `free(ptr, bytes, align)` and
    /// null the base. The caller is expected to have drained first;
    /// remaining contents are dropped on the floor.
    ///
    /// # Safety
    ///
    /// No thread may touch the fast paths between the preceding drain
    /// and this call; the region is gone once `free` runs.
    pub unsafe fn destroy(&self, free: impl FnOnce(*mut u8, usize, usize)) -> *mut u8 {
        let (slabs, shift) = self.slabs_and_shift.load();
        check!(!slabs.is_null(), "destroy without a live slab set");
        free(
            slabs,
            slabs_alloc_size(shift, self.num_cpus),
            platform::page_size(),
        );
        self.slabs_and_shift.store(core::ptr::null_mut(), shift);
        log::debug!("slab set destroyed");
        slabs
    }

    /// Virtual and resident footprint of the engine's metadata.
    pub fn metadata_memory_usage(&self) -> PerCpuMetadataState {
        let (slabs, shift) = self.slabs_and_shift.load();
        let slabs_size = slabs_alloc_size(shift, self.num_cpus);
        let stopped_size = self.num_cpus * core::mem::size_of::<StopFlag>();
        PerCpuMetadataState {
            virtual_size: stopped_size + slabs_size,
            resident_size: residence(slabs, slabs_size),
        }
    }

    // ── Fast paths ───────────────────────────────────────────────────

    /// Push `item` onto `size_class`'s LIFO on the current CPU.
    ///
    /// Returns `false` when the class is full. Retries internally on
    /// rseq aborts, and waits out a concurrent stop of the CPU.
    ///
    /// # Safety
    ///
    /// - `rseq` must be the calling thread's registered rseq area.
    /// - `size_class` must be in `1..NUM_CLASSES` and the current CPU
    ///   must have been initialized via [`init_cpu`](Self::init_cpu).
    #[inline]
    pub unsafe fn push(&self, rseq: *mut Rseq, size_class: usize, item: *mut u8) -> bool {
        debug_check!(size_class >= 1 && size_class < NUM_CLASSES);
        debug_check!(!item.is_null());
        let hdr_off = (size_class * HEADER_SIZE) as u64;
        loop {
            let status = unsafe {
                push_commit(rseq, self.slabs_and_shift.word_ptr(), hdr_off, item)
            };
            match status {
                COMMIT_OK => return true,
                COMMIT_MISS => return false,
                COMMIT_UNCACHED => self.wait_cached(rseq),
                _ => {
                    debug_check!(status == COMMIT_ABORTED);
                }
            }
        }
    }

    /// Pop the top of `size_class`'s LIFO on the current CPU.
    ///
    /// Returns `None` when the class is empty. Retries internally on
    /// rseq aborts, and waits out a concurrent stop of the CPU.
    ///
    /// # Safety
    ///
    /// Same requirements as [`push`](Self::push).
    #[inline]
    pub unsafe fn pop(&self, rseq: *mut Rseq, size_class: usize) -> Option<*mut u8> {
        debug_check!(size_class >= 1 && size_class < NUM_CLASSES);
        let hdr_off = (size_class * HEADER_SIZE) as u64;
        loop {
            let (status, item) =
                unsafe { pop_commit(rseq, self.slabs_and_shift.word_ptr(), hdr_off) };
            match status {
                COMMIT_OK => return Some(item),
                COMMIT_MISS => return None,
                COMMIT_UNCACHED => self.wait_cached(rseq),
                _ => {
                    debug_check!(status == COMMIT_ABORTED);
                }
            }
        }
    }

    /// Push up to `batch.len()` items in one critical section, stopping
    /// early at capacity. Returns the number transferred (prefix of
    /// `batch`).
    ///
    /// # Safety
    ///
    /// Same requirements as [`push`](Self::push).
    pub unsafe fn push_batch(&self, rseq: *mut Rseq, size_class: usize, batch: &[*mut u8]) -> usize {
        debug_check!(size_class >= 1 && size_class < NUM_CLASSES);
        if batch.is_empty() {
            return 0;
        }
        let hdr_off = (size_class * HEADER_SIZE) as u64;
        loop {
            let (status, count) = unsafe {
                push_batch_commit(
                    rseq,
                    self.slabs_and_shift.word_ptr(),
                    hdr_off,
                    batch.as_ptr(),
                    batch.len() as u64,
                )
            };
            match status {
                COMMIT_OK => return count as usize,
                COMMIT_UNCACHED => self.wait_cached(rseq),
                _ => {
                    debug_check!(status == COMMIT_ABORTED);
                }
            }
        }
    }

    /// Pop up to `batch.len()` items in one critical section, stopping
    /// early when the class runs dry. Returns the number transferred
    /// (written to the prefix of `batch`, top of the LIFO first).
    ///
    /// # Safety
    ///
    /// Same requirements as [`push`](Self::push).
    pub unsafe fn pop_batch(
        &self,
        rseq: *mut Rseq,
        size_class: usize,
        batch: &mut [*mut u8],
    ) -> usize {
        debug_check!(size_class >= 1 && size_class < NUM_CLASSES);
        if batch.is_empty() {
            return 0;
        }
        let hdr_off = (size_class * HEADER_SIZE) as u64;
        loop {
            let (status, count) = unsafe {
                pop_batch_commit(
                    rseq,
                    self.slabs_and_shift.word_ptr(),
                    hdr_off,
                    batch.as_mut_ptr(),
                    batch.len() as u64,
                )
            };
            match status {
                COMMIT_OK => return count as usize,
                COMMIT_UNCACHED => self.wait_cached(rseq),
                _ => {
                    debug_check!(status == COMMIT_ABORTED);
                }
            }
        }
    }

    /// Run the caching slow path, spinning while the current CPU is
    /// stopped. On return the word is either cached or the thread has
    /// migrated and the next fast-path attempt re-enters here.
    #[cold]
    fn wait_cached(&self, rseq: *mut Rseq) {
        loop {
            match self.cache_cpu_slab(rseq) {
                CacheSlab::Cached => return,
                CacheSlab::Stopped => core::hint::spin_loop(),
            }
        }
    }

    /// Resolve the current CPU and commit its slab offset into the
    /// per-thread word, then confirm the stop flag and the slab pair.
    ///
    /// The confirmation order closes the resize race: a commit that
    /// lands after a resize fence either observes `stopped` (and backs
    /// off), or — having observed the release of `stopped` — also
    /// observes the new `(base, shift)` and detects the change.
    fn cache_cpu_slab(&self, rseq: *mut Rseq) -> CacheSlab {
        let word = rseq as *mut u32;
        loop {
            // Uncache first so a signal handler interleaving here can
            // never run on a half-built word.
            unsafe { word.write_volatile(0) };
            compiler_fence(Ordering::SeqCst);

            let cpu = unsafe { rseq::read_cpu(rseq, self.virtual_cpu_id_offset) } as usize;
            debug_check!(cpu < self.num_cpus);
            let raw = self.slabs_and_shift.load_raw();
            let (slabs, shift) = SlabsAndShift::decode(raw);
            check!(!slabs.is_null(), "fast path on an uninitialized slab set");

            let cached = (cpu << shift.get()) as u32 | CACHED_SLAB_MASK;
            if !unsafe {
                rseq::store_if_on_cpu(rseq, self.virtual_cpu_id_offset, cpu as u32, word, cached)
            } {
                continue;
            }
            compiler_fence(Ordering::SeqCst);

            if self.stop_flag(cpu).is_set_acquire() {
                unsafe { word.write_volatile(0) };
                return CacheSlab::Stopped;
            }
            // The pair may have been swapped between our read and the
            // commit; the fence in resize means a changed pair is
            // always visible here. Retry with the fresh value.
            if raw != self.slabs_and_shift.load_raw() {
                continue;
            }
            return CacheSlab::Cached;
        }
    }
}

/// RAII single-CPU stop: stops on construction, restarts on every exit
/// path.
struct ScopedCpuStop<'a, const N: usize> {
    slab: &'a PerCpuSlab<N>,
    cpu: usize,
}

impl<'a, const N: usize> ScopedCpuStop<'a, N> {
    fn new(slab: &'a PerCpuSlab<N>, cpu: usize) -> Self {
        slab.stop_cpu(cpu);
        Self { slab, cpu }
    }
}

impl<const N: usize> Drop for ScopedCpuStop<'_, N> {
    fn drop(&mut self) {
        self.slab.start_cpu(self.cpu);
    }
}

/// Acquire the fast-path commits that filled `batch` before a handler
/// reads through the pointers. Free on x86_64; it also marks the
/// hand-off for thread sanitizers.
#[inline(always)]
fn acquire_batch(batch: &[*mut u8]) {
    if !batch.is_empty() {
        fence(Ordering::Acquire);
    }
}

// ── rseq critical sections (x86_64) ──────────────────────────────────────────
//
// Layout contract shared by all four sections:
//   [{rseq}]                the 32-bit cached slab word (cpu_id_start)
//   [{sas}]                 the packed (base | shift) atomic
//   {hdr}                   size_class * 8, the header's byte offset
//   header fields           begin @ +0, current @ +2, end @ +4
// The commit instruction is always the 16-bit store to `current`.

/// One push: store `item` at slot `current`, bump `current`.
#[inline(never)]
unsafe fn push_commit(rseq: *mut Rseq, sas: *const AtomicU64, hdr_off: u64, item: *mut u8) -> u32 {
    let status: u32;
    unsafe {
        asm!(
            // rseq_cs descriptor in a relocatable data section.
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",                     // version
            ".long 0",                     // flags
            ".quad 3f",                    // start_ip
            ".quad (4f - 3f)",             // post_commit_offset
            ".quad 6f",                    // abort_ip
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            // ── start of critical section ────────────────────────
            "3:",

            // Cached slab word: offset of this CPU's slab, tag bit 31.
            "mov {off:e}, dword ptr [{rseq}]",
            "btr {off:e}, {cached_bit}",
            "jnc 8f",

            // base = (slabs_and_shift & ~0x3f) + offset
            "mov {base}, qword ptr [{sas}]",
            "and {base}, -64",
            "add {base}, {off}",

            // Full check: current == end
            "movzx {cur:e}, word ptr [{base} + {hdr} + 2]",
            "movzx {lim:e}, word ptr [{base} + {hdr} + 4]",
            "cmp {cur:e}, {lim:e}",
            "je 7f",

            // Store the item, then COMMIT the new current.
            "mov qword ptr [{base} + {cur} * 8], {item}",
            "inc {cur:e}",
            "mov word ptr [{base} + {hdr} + 2], {cur:x}",
            "4:",

            // ── post-commit cleanup ──────────────────────────────
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {ok}",
            "jmp 5f",

            // ── full ─────────────────────────────────────────────
            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {miss}",
            "jmp 5f",

            // ── no cached slab word ──────────────────────────────
            "8:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {uncached}",
            "jmp 5f",

            // ── abort handler ────────────────────────────────────
            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {st:e}, {st:e}",

            "5:",

            rseq = in(reg) rseq,
            sas = in(reg) sas,
            hdr = in(reg) hdr_off,
            item = in(reg) item,
            base = out(reg) _,
            off = out(reg) _,
            cur = out(reg) _,
            lim = out(reg) _,
            tmp = out(reg) _,
            st = out(reg) status,
            rseq_cs_off = const RSEQ_OFF_RSEQ_CS,
            cached_bit = const CACHED_SLAB_BIT,
            ok = const COMMIT_OK,
            miss = const COMMIT_MISS,
            uncached = const COMMIT_UNCACHED,
            options(nostack),
        );
    }
    status
}

/// One pop: read the top slot, prefetch the next, lower `current`.
#[inline(never)]
unsafe fn pop_commit(rseq: *mut Rseq, sas: *const AtomicU64, hdr_off: u64) -> (u32, *mut u8) {
    let status: u32;
    let item: u64;
    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {off:e}, dword ptr [{rseq}]",
            "btr {off:e}, {cached_bit}",
            "jnc 8f",

            "mov {base}, qword ptr [{sas}]",
            "and {base}, -64",
            "add {base}, {off}",

            // Empty check: current == begin
            "movzx {cur:e}, word ptr [{base} + {hdr} + 2]",
            "movzx {beg:e}, word ptr [{base} + {hdr}]",
            "cmp {cur:e}, {beg:e}",
            "je 7f",

            // Read the top item and warm the line a subsequent pop
            // would return (the sentinel keeps slot begin-1 mapped).
            "dec {cur:e}",
            "mov {res}, qword ptr [{base} + {cur} * 8]",
            "mov {pf}, qword ptr [{base} + {cur} * 8 - 8]",
            "prefetcht0 byte ptr [{pf}]",

            // COMMIT: the lowered current.
            "mov word ptr [{base} + {hdr} + 2], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {ok}",
            "jmp 5f",

            // ── empty ────────────────────────────────────────────
            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {miss}",
            "jmp 5f",

            // ── no cached slab word ──────────────────────────────
            "8:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {uncached}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {st:e}, {st:e}",

            "5:",

            rseq = in(reg) rseq,
            sas = in(reg) sas,
            hdr = in(reg) hdr_off,
            base = out(reg) _,
            off = out(reg) _,
            cur = out(reg) _,
            beg = out(reg) _,
            res = out(reg) item,
            pf = out(reg) _,
            tmp = out(reg) _,
            st = out(reg) status,
            rseq_cs_off = const RSEQ_OFF_RSEQ_CS,
            cached_bit = const CACHED_SLAB_BIT,
            ok = const COMMIT_OK,
            miss = const COMMIT_MISS,
            uncached = const COMMIT_UNCACHED,
            options(nostack),
        );
    }
    (status, item as *mut u8)
}

/// Batch push: copy slots until the class is full or the batch is
/// consumed, then commit the new `current` once.
#[inline(never)]
unsafe fn push_batch_commit(
    rseq: *mut Rseq,
    sas: *const AtomicU64,
    hdr_off: u64,
    batch: *const *mut u8,
    len: u64,
) -> (u32, u64) {
    let status: u32;
    let count: u64;
    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {off:e}, dword ptr [{rseq}]",
            "btr {off:e}, {cached_bit}",
            "jnc 8f",

            "mov {base}, qword ptr [{sas}]",
            "and {base}, -64",
            "add {base}, {off}",

            "movzx {cur:e}, word ptr [{base} + {hdr} + 2]",
            "movzx {lim:e}, word ptr [{base} + {hdr} + 4]",
            "xor {i:e}, {i:e}",

            // Copy loop; all slot stores land below the committed
            // current, so they are invisible until the final store.
            "9:",
            "cmp {cur:e}, {lim:e}",
            "je 20f",
            "cmp {i}, {len}",
            "je 20f",
            "mov {tmp}, qword ptr [{batch} + {i} * 8]",
            "mov qword ptr [{base} + {cur} * 8], {tmp}",
            "inc {cur:e}",
            "inc {i}",
            "jmp 9b",

            // COMMIT: one 16-bit store covering the whole batch.
            "20:",
            "mov word ptr [{base} + {hdr} + 2], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {ok}",
            "jmp 5f",

            "8:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {uncached}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {st:e}, {st:e}",

            "5:",

            rseq = in(reg) rseq,
            sas = in(reg) sas,
            hdr = in(reg) hdr_off,
            batch = in(reg) batch,
            len = in(reg) len,
            base = out(reg) _,
            off = out(reg) _,
            cur = out(reg) _,
            lim = out(reg) _,
            i = out(reg) count,
            tmp = out(reg) _,
            st = out(reg) status,
            rseq_cs_off = const RSEQ_OFF_RSEQ_CS,
            cached_bit = const CACHED_SLAB_BIT,
            ok = const COMMIT_OK,
            uncached = const COMMIT_UNCACHED,
            options(nostack),
        );
    }
    (status, count)
}

/// Batch pop: copy slots out until the class is empty or the batch is
/// full, then commit the new `current` once.
#[inline(never)]
unsafe fn pop_batch_commit(
    rseq: *mut Rseq,
    sas: *const AtomicU64,
    hdr_off: u64,
    batch: *mut *mut u8,
    len: u64,
) -> (u32, u64) {
    let status: u32;
    let count: u64;
    unsafe {
        asm!(
            ".pushsection __rseq_cs, \"aw\"",
            ".balign 32",
            "77:",
            ".long 0",
            ".long 0",
            ".quad 3f",
            ".quad (4f - 3f)",
            ".quad 6f",
            ".popsection",

            "lea {tmp}, [rip + 77b]",
            "mov qword ptr [{rseq} + {rseq_cs_off}], {tmp}",

            "3:",
            "mov {off:e}, dword ptr [{rseq}]",
            "btr {off:e}, {cached_bit}",
            "jnc 8f",

            "mov {base}, qword ptr [{sas}]",
            "and {base}, -64",
            "add {base}, {off}",

            "movzx {cur:e}, word ptr [{base} + {hdr} + 2]",
            "movzx {beg:e}, word ptr [{base} + {hdr}]",
            "xor {i:e}, {i:e}",

            "9:",
            "cmp {cur:e}, {beg:e}",
            "je 20f",
            "cmp {i}, {len}",
            "je 20f",
            "dec {cur:e}",
            "mov {tmp}, qword ptr [{base} + {cur} * 8]",
            "mov qword ptr [{batch} + {i} * 8], {tmp}",
            "inc {i}",
            "jmp 9b",

            "20:",
            "mov word ptr [{base} + {hdr} + 2], {cur:x}",
            "4:",

            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {ok}",
            "jmp 5f",

            "8:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {st:e}, {uncached}",
            "jmp 5f",

            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {st:e}, {st:e}",

            "5:",

            rseq = in(reg) rseq,
            sas = in(reg) sas,
            hdr = in(reg) hdr_off,
            batch = in(reg) batch,
            len = in(reg) len,
            base = out(reg) _,
            off = out(reg) _,
            cur = out(reg) _,
            beg = out(reg) _,
            i = out(reg) count,
            tmp = out(reg) _,
            st = out(reg) status,
            rseq_cs_off = const RSEQ_OFF_RSEQ_CS,
            cached_bit = const CACHED_SLAB_BIT,
            ok = const COMMIT_OK,
            uncached = const COMMIT_UNCACHED,
            options(nostack),
        );
    }
    (status, count)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::layout::Shift;

    const NUM_CLASSES: usize = 4;

    fn new_slab(shift: u8, cap: usize) -> (&'static PerCpuSlab<NUM_CLASSES>, *mut u8) {
        let shift = Shift::new(shift);
        let region_size = slabs_alloc_size(shift, platform::num_cpus());
        let region = unsafe { platform::page_alloc(region_size) };
        assert!(!region.is_null());

        let slab = Box::leak(Box::new(PerCpuSlab::<NUM_CLASSES>::empty()));
        unsafe {
            slab.init(
                |bytes, align| unsafe {
                    std::alloc::alloc_zeroed(
                        std::alloc::Layout::from_size_align(bytes, align).unwrap(),
                    )
                },
                region,
                |_| cap,
                shift,
                false,
            );
        }
        (slab, region)
    }

    #[test]
    fn init_cpu_layout_is_disjoint_with_sentinels() {
        let (slab, _region) = new_slab(13, 32);
        slab.init_cpu(0, |_| 32);

        let (slabs, shift) = slab.slabs_and_shift();
        let mut prev_end = NUM_CLASSES as u16; // headers occupy the first slots
        for size_class in 1..NUM_CLASSES {
            let hdr = unsafe { load_header(header_ptr(slabs, shift, 0, size_class)) };
            assert_eq!(hdr.current, hdr.begin);
            assert_eq!(hdr.end, hdr.begin);
            // One sentinel slot between the previous region and begin.
            assert_eq!(hdr.begin, prev_end + 1);
            // Sentinel points at itself.
            let sentinel = unsafe {
                (cpu_memory_start(slabs, shift, 0) as *mut *mut u8).add(hdr.begin as usize - 1)
            };
            assert_eq!(unsafe { *sentinel }, sentinel as *mut u8);
            prev_end = hdr.begin + 32;
        }
    }

    #[test]
    fn grow_is_bounded_by_max_capacity() {
        let (slab, _region) = new_slab(13, 16);
        slab.init_cpu(0, |_| 16);

        slab.stop_cpu(0);
        assert_eq!(slab.grow_other_cache(0, 3, 10, |_| 16), 10);
        assert_eq!(slab.capacity(0, 3), 10);
        // Only 6 left under the bound.
        assert_eq!(slab.grow_other_cache(0, 3, 10, |_| 16), 6);
        assert_eq!(slab.capacity(0, 3), 16);
        assert_eq!(slab.grow_other_cache(0, 3, 1, |_| 16), 0);
        slab.start_cpu(0);

        assert_eq!(slab.length(0, 3), 0);
    }

    #[test]
    fn shrink_pops_overflow_through_handler() {
        let (slab, _region) = new_slab(13, 16);
        slab.init_cpu(0, |_| 16);

        // Header 100,108,110 in spirit: capacity 10, 8 live elements.
        slab.stop_cpu(0);
        assert_eq!(slab.grow_other_cache(0, 3, 10, |_| 16), 10);
        let (slabs, shift) = slab.slabs_and_shift();
        let hdrp = header_ptr(slabs, shift, 0, 3);
        let mut hdr = unsafe { load_header(hdrp) };
        let slots = cpu_memory_start(slabs, shift, 0) as *mut *mut u8;
        for i in 0..8u16 {
            unsafe { *slots.add((hdr.begin + i) as usize) = (0x1000 + i as usize) as *mut u8 };
        }
        hdr.current = hdr.begin + 8;
        unsafe { store_header(hdrp, hdr) };

        let mut popped: Vec<usize> = Vec::new();
        let shrunk = slab.shrink_other_cache(0, 3, 5, |size_class, batch| {
            assert_eq!(size_class, 3);
            popped.extend(batch.iter().map(|p| *p as usize));
        });
        slab.start_cpu(0);

        // unused = 2, so 3 elements pop (slots 5..8), then end drops by 5.
        assert_eq!(shrunk, 5);
        assert_eq!(popped, vec![0x1005, 0x1006, 0x1007]);
        assert_eq!(slab.length(0, 3), 5);
        assert_eq!(slab.capacity(0, 3), 5);
    }

    #[test]
    fn empty_drain_delivers_empty_batches_and_keeps_headers() {
        let (slab, _region) = new_slab(13, 8);
        slab.init_cpu(0, |_| 8);

        let (slabs, shift) = slab.slabs_and_shift();
        let before: Vec<Header> = (1..NUM_CLASSES)
            .map(|c| unsafe { load_header(header_ptr(slabs, shift, 0, c)) })
            .collect();

        let mut calls = 0;
        slab.drain(0, |cpu, _size_class, batch, _cap| {
            assert_eq!(cpu, 0);
            assert!(batch.is_empty());
            calls += 1;
        });
        assert_eq!(calls, NUM_CLASSES - 1);

        let after: Vec<Header> = (1..NUM_CLASSES)
            .map(|c| unsafe { load_header(header_ptr(slabs, shift, 0, c)) })
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn metadata_reports_stop_flags_plus_slab() {
        let (slab, _region) = new_slab(13, 8);
        let usage = slab.metadata_memory_usage();
        let slab_bytes = slabs_alloc_size(Shift::new(13), slab.num_cpus());
        assert_eq!(
            usage.virtual_size,
            slab.num_cpus() * core::mem::size_of::<StopFlag>() + slab_bytes
        );
        assert!(usage.resident_size <= slab_bytes);
    }
}
