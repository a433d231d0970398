//! Per-CPU commit primitives built on rseq critical sections (x86_64).
//!
//! The kernel monitors the thread's instruction pointer and redirects to
//! the abort handler if a preemption, signal, or CPU migration occurs
//! within the section — no hardware atomics on the success path.
//!
//! # Abort handler contract
//!
//! Every abort label must be preceded by the 4-byte `RSEQ_SIG` signature
//! (`0x53053053`). On x86_64 this encodes as `ud1 %edi, %eax`, a
//! guaranteed-illegal instruction that provides control-flow integrity.

use core::arch::asm;

use crate::abi::{RSEQ_OFF_RSEQ_CS, Rseq};

/// Store a `u32` to `addr`, committed only while the thread remains on
/// `cpu`.
///
/// The critical section re-reads the CPU identity field at `cpu_offset`
/// bytes into the rseq area and bails out on mismatch, so a reschedule
/// between the caller's identity read and this call cannot smuggle a
/// stale value onto another CPU. Returns `false` on mismatch or abort;
/// the caller re-reads its CPU and retries.
///
/// # Safety
///
/// - `rseq` must be the calling thread's registered rseq area.
/// - `cpu_offset` must be one of the CPU identity field offsets.
/// - `addr` must be valid for a 4-byte write.
#[inline(never)]
pub unsafe fn store_if_on_cpu(
    rseq: *mut Rseq,
    cpu_offset: u32,
    cpu: u32,
    addr: *mut u32,
    value: u32,
) -> bool {
    let success: u64;

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

            // Bail out if the thread is no longer on the expected CPU.
            "mov {tmp:e}, dword ptr [{rseq} + {cpu_off}]",
            "cmp {tmp:e}, {cpu:e}",
            "jne 7f",

            // COMMIT: the store itself.
            "mov dword ptr [{addr}], {val:e}",
            "4:",

            // ── post-commit cleanup ──────────────────────────────
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "mov {succ:e}, 1",
            "jmp 5f",

            // ── CPU mismatch ─────────────────────────────────────
            "7:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",
            "jmp 5f",

            // ── abort handler ────────────────────────────────────
            ".long 0x53053053",
            "6:",
            "mov qword ptr [{rseq} + {rseq_cs_off}], 0",
            "xor {succ:e}, {succ:e}",

            "5:",

            rseq = in(reg) rseq,
            cpu_off = in(reg) cpu_offset as u64,
            cpu = in(reg) cpu as u64,
            addr = in(reg) addr,
            val = in(reg) value as u64,
            tmp = out(reg) _,
            succ = out(reg) success,
            rseq_cs_off = const RSEQ_OFF_RSEQ_CS,
            options(nostack),
        );
    }

    success != 0
}
