//! rseq fences: force in-flight critical sections to a commit-or-abort
//! point before returning.
//!
//! The fast mechanism is `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ)`
//! (kernel >= 5.10), which IPIs the CPUs running this process's threads,
//! restarting any section in flight there. The IPI also makes the target
//! threads' rseq fields be rewritten before they next run user code,
//! which is what invalidates per-thread state aliased over those fields.
//!
//! On kernels without the command, the fallback briefly pins the calling
//! thread to the target CPU: running there preempts whatever thread
//! occupied the CPU, aborting its section.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::abi::{
    MEMBARRIER_CMD_FLAG_CPU, MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, MEMBARRIER_CMD_QUERY,
    MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ,
};
use crate::syscall::{self, CpuMask, EINVAL};

// ── membarrier registration ──────────────────────────────────────────────────

const MEMBARRIER_UNKNOWN: u8 = 0;
const MEMBARRIER_READY: u8 = 1;
const MEMBARRIER_UNSUPPORTED: u8 = 2;

/// Process-wide registration state for the expedited rseq command.
static MEMBARRIER_STATE: AtomicU8 = AtomicU8::new(MEMBARRIER_UNKNOWN);

/// Register for `MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ` once per process.
///
/// Returns `true` when the expedited command is usable. Idempotent and
/// safe to race: registration is a kernel-side no-op when repeated.
pub fn ensure_membarrier() -> bool {
    match MEMBARRIER_STATE.load(Ordering::Acquire) {
        MEMBARRIER_READY => return true,
        MEMBARRIER_UNSUPPORTED => return false,
        _ => {}
    }

    let supported = match syscall::membarrier(MEMBARRIER_CMD_QUERY, 0, 0) {
        Ok(cmds) => {
            (cmds & MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ as i64) != 0
                && syscall::membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ, 0, 0)
                    .is_ok()
        }
        Err(_) => false,
    };

    MEMBARRIER_STATE.store(
        if supported { MEMBARRIER_READY } else { MEMBARRIER_UNSUPPORTED },
        Ordering::Release,
    );
    supported
}

// ── Fences ───────────────────────────────────────────────────────────────────

/// Fence the given CPU: when this returns, every rseq critical section
/// that was in flight there has committed or aborted, and the memory
/// effects of the caller before the fence are visible to that CPU.
pub fn fence_cpu(cpu: usize) -> Result<(), i32> {
    if ensure_membarrier() {
        syscall::membarrier(
            MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
            MEMBARRIER_CMD_FLAG_CPU,
            cpu as i32,
        )
        .map(|_| ())
    } else {
        pin_fence(cpu)
    }
}

/// Fence every CPU running a thread of this process.
pub fn fence_all_cpus(num_cpus: usize) -> Result<(), i32> {
    if ensure_membarrier() {
        syscall::membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, 0, 0).map(|_| ())
    } else {
        for cpu in 0..num_cpus {
            pin_fence(cpu)?;
        }
        Ok(())
    }
}

// ── Fallback: fence by occupying the target CPU ──────────────────────────────

fn pin_fence(cpu: usize) -> Result<(), i32> {
    let mut saved = CpuMask::empty();
    syscall::sched_getaffinity(&mut saved)?;

    match syscall::sched_setaffinity(&CpuMask::single(cpu)) {
        // Scheduling onto the CPU preempted any section running there.
        Ok(()) => syscall::sched_setaffinity(&saved),
        // No online CPU in the mask: nothing can be running there.
        Err(EINVAL) => Ok(()),
        Err(e) => {
            let _ = syscall::sched_setaffinity(&saved);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn fence_single_cpu() {
        fence_cpu(0).expect("fence cpu 0");
    }

    #[test]
    fn fence_all() {
        fence_all_cpus(std::thread::available_parallelism().map_or(1, |n| n.get()))
            .expect("fence all");
    }

    #[test]
    fn pin_fence_restores_affinity() {
        let mut before = CpuMask::empty();
        syscall::sched_getaffinity(&mut before).unwrap();
        pin_fence(0).expect("pin fence");
        let mut after = CpuMask::empty();
        syscall::sched_getaffinity(&mut after).unwrap();
        assert_eq!(before.0, after.0);
    }
}
