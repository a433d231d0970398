//! Per-thread rseq area management and CPU identity.
//!
//! Two ways of obtaining the area, tried in order:
//!
//! **Mode A — glibc-managed (glibc >= 2.35):**
//! glibc registers rseq for every thread at start-up and exports
//! `__rseq_offset` / `__rseq_size`; the area lives at a fixed offset from
//! the thread pointer (the `fs` segment base on x86_64).
//!
//! **Mode B — self-managed (feature `std`):**
//! A `std::thread_local!` `Rseq` area registered through the raw syscall
//! and unregistered when the thread-local is dropped. Used on targets
//! without glibc's auto-registration.
//!
//! CPU identity is a field read at a caller-chosen byte offset into the
//! area: `RSEQ_OFF_CPU_ID` for the raw CPU number or `RSEQ_OFF_MM_CID`
//! for the virtual-CPU (concurrency ID) mapping.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::abi::{
    RSEQ_CPU_ID_REGISTRATION_FAILED, RSEQ_CPU_ID_UNINITIALIZED, RSEQ_OFF_CPU_ID, RSEQ_OFF_MM_CID,
    Rseq,
};

/// Global flag: has the kernel rejected rseq? (ENOSYS → kernel too old.)
static RSEQ_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

// ── Mode A: glibc-managed area ───────────────────────────────────────────────

#[cfg(target_env = "gnu")]
mod glibc {
    use core::arch::asm;

    use super::Rseq;

    // Exported by glibc >= 2.35. `__rseq_size` is 0 when glibc could not
    // (or was told not to) register the area with the kernel.
    unsafe extern "C" {
        static __rseq_offset: isize;
        static __rseq_size: u32;
    }

    pub fn registered() -> bool {
        unsafe { __rseq_size > 0 }
    }

    /// Area address for the current thread: thread pointer + `__rseq_offset`.
    ///
    /// # Safety
    ///
    /// Only meaningful when [`registered`] returns true. The returned
    /// pointer is valid on the calling thread only.
    pub unsafe fn rseq_ptr() -> *mut Rseq {
        // Thread pointer from the fs segment base (x86_64 Linux ABI).
        let tp: u64;
        unsafe {
            asm!(
                "mov {tp}, fs:0",
                tp = out(reg) tp,
                options(nostack, preserves_flags, readonly, pure)
            );
        }
        (tp as i64 + unsafe { __rseq_offset } as i64) as *mut Rseq
    }
}

// ── Mode B: self-managed area ────────────────────────────────────────────────

#[cfg(feature = "std")]
mod owned {
    extern crate std;

    use core::cell::{Cell, UnsafeCell};

    use super::RSEQ_UNAVAILABLE;
    use crate::abi::Rseq;
    use crate::syscall::{self, ENOSYS};

    /// A registered rseq area pinned in thread-local storage.
    ///
    /// The kernel writes into the area until unregistration, so it must
    /// not move and must be unregistered before the storage is reclaimed.
    struct RegisteredArea {
        area: UnsafeCell<Rseq>,
        registered: Cell<bool>,
    }

    impl RegisteredArea {
        fn register(&self) -> bool {
            if RSEQ_UNAVAILABLE.load(core::sync::atomic::Ordering::Relaxed) {
                return false;
            }
            match unsafe { syscall::rseq_register(self.area.get()) } {
                Ok(()) => {
                    self.registered.set(true);
                    true
                }
                Err(e) => {
                    if e == ENOSYS {
                        RSEQ_UNAVAILABLE.store(true, core::sync::atomic::Ordering::Relaxed);
                    }
                    false
                }
            }
        }
    }

    impl Drop for RegisteredArea {
        fn drop(&mut self) {
            if self.registered.get() {
                let _ = unsafe { syscall::rseq_unregister(self.area.get()) };
            }
        }
    }

    std::thread_local! {
        static AREA: RegisteredArea = {
            let a = RegisteredArea {
                area: UnsafeCell::new(Rseq::new()),
                registered: Cell::new(false),
            };
            a.register();
            a
        };
    }

    pub fn rseq_ptr() -> Option<*mut Rseq> {
        AREA.with(|a| if a.registered.get() { Some(a.area.get()) } else { None })
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Returns `true` unless rseq registration has been observed to fail with
/// ENOSYS (kernel without rseq support).
pub fn rseq_available() -> bool {
    !RSEQ_UNAVAILABLE.load(Ordering::Relaxed)
}

/// Get a pointer to the current thread's rseq area.
///
/// Returns `None` if no area is registered (kernel too old, glibc opted
/// out and the `std` fallback is disabled, or registration failed).
///
/// # Safety
///
/// The returned pointer is only valid on the calling thread and must not
/// be sent to other threads.
pub unsafe fn current_rseq() -> Option<*mut Rseq> {
    #[cfg(target_env = "gnu")]
    {
        if glibc::registered() {
            return Some(unsafe { glibc::rseq_ptr() });
        }
    }
    #[cfg(feature = "std")]
    {
        if let Some(p) = owned::rseq_ptr() {
            return Some(p);
        }
    }
    None
}

/// Read the CPU identity field at `offset` bytes into the rseq area.
///
/// `offset` is `RSEQ_OFF_CPU_ID` for the raw CPU number or
/// `RSEQ_OFF_MM_CID` for the virtual-CPU mapping. The value may be stale
/// by the time the caller uses it; rseq commits must revalidate.
///
/// # Safety
///
/// `rseq` must be the calling thread's registered area and `offset` one
/// of the two identity offsets above.
#[inline(always)]
pub unsafe fn read_cpu(rseq: *const Rseq, offset: u32) -> u32 {
    unsafe { ((rseq as *const u8).add(offset as usize) as *const u32).read_volatile() }
}

/// Read the current raw CPU number from this thread's rseq area.
///
/// Returns `None` if rseq is unavailable.
pub fn current_cpu() -> Option<u32> {
    unsafe {
        let rseq = current_rseq()?;
        let cpu = read_cpu(rseq, RSEQ_OFF_CPU_ID);
        if cpu == RSEQ_CPU_ID_UNINITIALIZED || cpu == RSEQ_CPU_ID_REGISTRATION_FAILED {
            None
        } else {
            Some(cpu)
        }
    }
}

// ── Virtual-CPU (mm_cid) support detection ───────────────────────────────────

/// `AT_RSEQ_FEATURE_SIZE` auxv entry: kernel-supported rseq feature size.
const AT_RSEQ_FEATURE_SIZE: u64 = 27;

unsafe extern "C" {
    fn getauxval(kind: u64) -> u64;
}

/// Whether the kernel maintains the `mm_cid` field backing virtual-CPU
/// mode. True when the rseq feature size covers the field.
pub fn virtual_cpu_supported() -> bool {
    let feature_size = unsafe { getauxval(AT_RSEQ_FEATURE_SIZE) } as u32;
    feature_size >= RSEQ_OFF_MM_CID + 4
}

// ── RseqLocal — thread_local!-compatible handle ──────────────────────────────

/// Per-thread rseq handle with a cached area pointer.
///
/// Designed to be used as a thread-local static; the pointer is resolved
/// on first access and cached (single null check afterwards).
///
/// ```ignore
/// std::thread_local! {
///     static RSEQ: rseq::RseqLocal = rseq::RseqLocal::new();
/// }
/// RSEQ.with(|r| r.cpu_id());
/// ```
pub struct RseqLocal {
    /// Cached rseq pointer. Null means not yet resolved.
    ptr: core::cell::Cell<*mut Rseq>,
}

impl Default for RseqLocal {
    fn default() -> Self {
        Self::new()
    }
}

impl RseqLocal {
    /// Create an unresolved handle. Cheap — no syscalls until first use.
    pub const fn new() -> Self {
        Self {
            ptr: core::cell::Cell::new(core::ptr::null_mut()),
        }
    }

    #[inline(always)]
    fn get_ptr(&self) -> Option<*mut Rseq> {
        let p = self.ptr.get();
        if !p.is_null() {
            return Some(p);
        }
        self.resolve_slow()
    }

    #[cold]
    fn resolve_slow(&self) -> Option<*mut Rseq> {
        let p = unsafe { current_rseq()? };
        self.ptr.set(p);
        Some(p)
    }

    /// Get a raw pointer to this thread's rseq area.
    ///
    /// Returns `None` if rseq is unavailable.
    #[inline(always)]
    pub fn rseq_ptr(&self) -> Option<*mut Rseq> {
        self.get_ptr()
    }

    /// Read the current raw CPU number.
    ///
    /// Returns `None` if rseq is unavailable.
    #[inline(always)]
    pub fn cpu_id(&self) -> Option<u32> {
        let p = self.get_ptr()?;
        let cpu = unsafe { read_cpu(p, RSEQ_OFF_CPU_ID) };
        if cpu == RSEQ_CPU_ID_UNINITIALIZED || cpu == RSEQ_CPU_ID_REGISTRATION_FAILED {
            None
        } else {
            Some(cpu)
        }
    }

    /// Read the virtual-CPU (concurrency) ID. Requires kernel >= 6.3.
    #[inline(always)]
    pub fn virtual_cpu_id(&self) -> Option<u32> {
        let p = self.get_ptr()?;
        Some(unsafe { read_cpu(p, RSEQ_OFF_MM_CID) })
    }
}
