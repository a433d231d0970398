//! OS services: virtual memory for slab regions and CPU topology.
//!
//! rseq is Linux-only, so this is plain mmap/munmap and sysconf via
//! direct libc externs.

use core::ffi::c_void;

const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;

/// `_SC_NPROCESSORS_CONF` on Linux.
const _SC_NPROCESSORS_CONF: i32 = 83;

/// `_SC_PAGESIZE` on Linux.
const _SC_PAGESIZE: i32 = 30;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;

    fn munmap(addr: *mut c_void, length: usize) -> i32;

    fn sysconf(name: i32) -> isize;
}

/// Number of configured logical CPUs. At least 1.
pub fn num_cpus() -> usize {
    let n = unsafe { sysconf(_SC_NPROCESSORS_CONF) };
    if n <= 0 { 1 } else { n as usize }
}

/// System page size in bytes.
pub fn page_size() -> usize {
    let sz = unsafe { sysconf(_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

/// Allocate `size` bytes of zeroed, page-aligned virtual memory.
/// Returns null on failure.
///
/// # Safety
///
/// Caller must eventually call [`page_dealloc`] with the returned
/// pointer and the same `size`.
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    let ptr = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        core::ptr::null_mut()
    } else {
        ptr as *mut u8
    }
}

/// Free virtual memory previously allocated by [`page_alloc`].
///
/// # Safety
///
/// `ptr` must have been returned by `page_alloc` and `size` must match
/// the original allocation size.
pub unsafe fn page_dealloc(ptr: *mut u8, size: usize) {
    unsafe { munmap(ptr as *mut c_void, size) };
}
