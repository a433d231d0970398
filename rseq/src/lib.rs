//! `rseq` — Linux restartable sequences for Rust.
//!
//! Zero-dependency, `no_std` wrapper around the Linux rseq(2) syscall,
//! plus the pieces a per-CPU data structure needs around it: CPU identity
//! (raw or virtual), an rseq-conditional store primitive, and per-CPU /
//! all-CPU fences via membarrier(2).
//!
//! # Features
//!
//! - `std` — self-managed rseq registration through `std` thread-locals
//!   for targets where glibc (>= 2.35) does not register the area.
//!
//! # Architecture support
//!
//! Linux x86_64 only.

#![no_std]

pub mod abi;
pub mod fence;
pub mod ops;
pub mod syscall;
pub mod thread;

// Re-export key types at crate root.
pub use abi::{RSEQ_SIG, Rseq, RseqCs};
pub use fence::{ensure_membarrier, fence_all_cpus, fence_cpu};
pub use ops::store_if_on_cpu;
pub use thread::{RseqLocal, current_cpu, current_rseq, read_cpu, rseq_available,
    virtual_cpu_supported};
