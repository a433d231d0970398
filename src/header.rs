//! Per-class header codec.
//!
//! Each size class on each CPU is described by three 16-bit offsets,
//! measured in pointer-sized slots from the start of that CPU's slab:
//!
//! - `begin` — first slot of the class's element region,
//! - `current` — one past the top of the LIFO (`current == begin` is
//!   empty, `current == end` is full),
//! - `end` — one past the last usable slot (capacity limit).
//!
//! The triple is packed into a single 64-bit word (upper 16 bits zero)
//! so that loads and stores are indivisible; relaxed ordering suffices
//! because the stop protocol orders all cross-thread header access.
//! The fast-path commit is a single 16-bit store to the `current` field.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

/// One class's LIFO bounds on one CPU.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Header {
    pub begin: u16,
    pub current: u16,
    pub end: u16,
}

/// Byte offset of `current` within the packed word (used by the asm
/// fast paths for the 16-bit commit store).
pub const HDR_OFF_CURRENT: usize = 2;

/// Byte offset of `end` within the packed word.
pub const HDR_OFF_END: usize = 4;

/// Packed header size. The element slots are pointer-sized, so one
/// header occupies exactly one slot.
pub const HEADER_SIZE: usize = core::mem::size_of::<u64>();

const_assert_eq!(HEADER_SIZE, core::mem::size_of::<*mut u8>());

impl Header {
    /// Number of live elements.
    #[inline(always)]
    pub fn length(&self) -> u16 {
        self.current - self.begin
    }

    /// Granted capacity.
    #[inline(always)]
    pub fn capacity(&self) -> u16 {
        self.end - self.begin
    }

    /// Pack into the little-endian word layout: `begin` in bits 0..16,
    /// `current` in 16..32, `end` in 32..48.
    #[inline(always)]
    pub fn pack(self) -> u64 {
        self.begin as u64 | (self.current as u64) << 16 | (self.end as u64) << 32
    }

    /// Inverse of [`pack`]. The reserved upper bits are ignored.
    #[inline(always)]
    pub fn unpack(word: u64) -> Self {
        Self {
            begin: word as u16,
            current: (word >> 16) as u16,
            end: (word >> 32) as u16,
        }
    }
}

/// Load a header with a single relaxed word read.
///
/// # Safety
///
/// `p` must point to a live header word inside an initialized slab.
#[inline(always)]
pub unsafe fn load_header(p: *const AtomicU64) -> Header {
    Header::unpack(unsafe { (*p).load(Ordering::Relaxed) })
}

/// Store a header with a single relaxed word write.
///
/// # Safety
///
/// `p` must point to a live header word, and the caller must hold the
/// CPU stopped (or be the initializing thread) so no fast path can
/// commit concurrently.
#[inline(always)]
pub unsafe fn store_header(p: *const AtomicU64, hdr: Header) {
    unsafe { (*p).store(hdr.pack(), Ordering::Relaxed) }
}
