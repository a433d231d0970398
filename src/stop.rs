//! Per-CPU stop flags.
//!
//! One flag per CPU, each on its own cache line. While a flag is set,
//! exactly one control thread owns that CPU's slab; fast-path users that
//! observe the flag (through the cache-handle check) back off and wait.
//! The coupling that makes this exclusion real is the rseq fence issued
//! right after setting the flag: it drains in-flight critical sections
//! and invalidates every thread's cached slab word on that CPU, so the
//! next fast-path entry must go through the slow path and see the flag.
//!
//! Orderings: set is relaxed (the fence provides visibility), check on
//! the fast path is acquire, clear is release — a fast path that sees
//! the flag cleared also sees every slab write the control thread made.

use core::sync::atomic::{AtomicBool, Ordering};

use static_assertions::const_assert_eq;

/// Cache-line-padded stop flag for one CPU.
#[repr(C, align(64))]
pub struct StopFlag {
    flag: AtomicBool,
}

const_assert_eq!(core::mem::size_of::<StopFlag>(), 64);

impl StopFlag {
    pub const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    /// Mark the CPU stopped. Visibility to fast paths comes from the
    /// fence that follows, not from this store.
    #[inline]
    pub fn set(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Release the CPU, publishing all header writes made while stopped.
    #[inline]
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Fast-path check, paired with [`clear`].
    #[inline]
    pub fn is_set_acquire(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Precondition check for control operations.
    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}
