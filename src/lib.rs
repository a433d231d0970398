#![no_std]

//! percpu-slab: a lock-free per-CPU slab cache for allocator front-ends.
//!
//! Each logical CPU holds a bounded LIFO of free object pointers per
//! size class inside one contiguous, page-aligned region. Hot-path push
//! and pop are Linux restartable-sequence (rseq) critical sections: a
//! handful of loads, one slot store, and a single 16-bit commit — no
//! locks, no atomic read-modify-writes, no cross-CPU traffic. Control
//! operations (drain, grow/shrink, resize) exclude the fast paths with
//! a per-CPU stop flag plus an rseq fence.
//!
//! The crate is the cache engine only. The central free list it drains
//! into, the size-class table, and the policies deciding when to grow
//! or shrink are host concerns, reached through callbacks.
//!
//! # Usage
//!
//! ```ignore
//! static SLAB: SlabCell = SlabCell::new(); // your Sync wrapper
//!
//! std::thread_local! {
//!     static RSEQ: rseq::RseqLocal = rseq::RseqLocal::new();
//! }
//!
//! let rseq = RSEQ.with(|r| r.rseq_ptr()).expect("rseq available");
//! if let Some(obj) = unsafe { SLAB.get().pop(rseq, size_class) } {
//!     return obj; // cache hit, no locks taken
//! }
//! ```
//!
//! Linux x86_64 only.

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod header;
pub mod layout;
pub mod logging;
pub mod platform;
pub mod residence;
pub mod slab;
pub mod stop;

// Re-export the engine's surface at crate root for convenience.
pub use header::Header;
pub use layout::{MAX_SHIFT, MIN_SHIFT, Shift};
pub use residence::PerCpuMetadataState;
pub use slab::{CACHED_SLAB_BIT, CACHED_SLAB_MASK, PerCpuSlab, ResizeSlabsInfo};
