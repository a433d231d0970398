//! Linux rseq kernel ABI types and constants.
//!
//! Defines the structures shared between userspace and the kernel for
//! restartable sequences (rseq). These must match the kernel's layout exactly.

// ── Syscall numbers (x86_64) ─────────────────────────────────────────────────

/// rseq syscall number on x86_64.
pub const SYS_RSEQ: u64 = 334;

/// membarrier syscall number on x86_64.
pub const SYS_MEMBARRIER: u64 = 324;

/// sched_setaffinity syscall number on x86_64.
pub const SYS_SCHED_SETAFFINITY: u64 = 203;

/// sched_getaffinity syscall number on x86_64.
pub const SYS_SCHED_GETAFFINITY: u64 = 204;

// ── Registration flags (passed to syscall `flags` parameter) ─────────────────

/// Unregister the current thread's rseq area.
pub const RSEQ_FLAG_UNREGISTER: i32 = 1 << 0;

// ── Signature ────────────────────────────────────────────────────────────────

/// x86_64 rseq abort signature. Must appear as the 4 bytes immediately
/// before every abort handler IP. Encodes as `ud1 %edi, %eax` which is
/// a guaranteed-illegal instruction, providing control-flow integrity.
pub const RSEQ_SIG: u32 = 0x53053053;

// ── CPU ID sentinel values ───────────────────────────────────────────────────

/// cpu_id value before the kernel first schedules the thread.
pub const RSEQ_CPU_ID_UNINITIALIZED: u32 = u32::MAX; // -1 as u32

/// cpu_id value if registration failed.
pub const RSEQ_CPU_ID_REGISTRATION_FAILED: u32 = u32::MAX - 1; // -2 as u32

// ── Struct offsets (for use in inline asm and field selection) ───────────────

/// Byte offset of `cpu_id_start` within `struct rseq`.
pub const RSEQ_OFF_CPU_ID_START: u32 = 0;

/// Byte offset of `cpu_id` within `struct rseq`.
pub const RSEQ_OFF_CPU_ID: u32 = 4;

/// Byte offset of `rseq_cs` pointer within `struct rseq`.
pub const RSEQ_OFF_RSEQ_CS: u32 = 8;

/// Byte offset of `node_id` within `struct rseq`.
pub const RSEQ_OFF_NODE_ID: u32 = 20;

/// Byte offset of `mm_cid` within `struct rseq`.
///
/// `mm_cid` is the memory-map concurrency ID (kernel >= 6.3): a compact
/// per-process CPU-like index in `[0, min(nr_threads, nr_cpus))`. It is
/// the field backing virtual-CPU mode.
pub const RSEQ_OFF_MM_CID: u32 = 24;

// ── membarrier commands ──────────────────────────────────────────────────────

/// Query supported membarrier commands.
pub const MEMBARRIER_CMD_QUERY: i32 = 0;

/// Restart in-flight rseq critical sections on CPUs running this process.
pub const MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ: i32 = 1 << 7;

/// One-time registration required before the command above may be used.
pub const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ: i32 = 1 << 8;

/// Restrict the command to the CPU given in the syscall's `cpu_id` argument.
pub const MEMBARRIER_CMD_FLAG_CPU: u32 = 1 << 0;

// ── struct rseq ──────────────────────────────────────────────────────────────

/// Per-thread rseq area shared with the kernel.
///
/// Must be 32-byte aligned. The kernel rewrites `cpu_id_start`, `cpu_id`,
/// `node_id`, and `mm_cid` every time the thread resumes on a CPU.
/// Userspace writes `rseq_cs` to arm a critical section.
///
/// The engine layered on top additionally treats the `cpu_id_start` slot
/// as scratch (a per-thread cache word): the field has no other consumer
/// here, and the kernel's rewrite-on-resume is exactly the invalidation
/// that cache needs.
#[repr(C, align(32))]
pub struct Rseq {
    /// CPU number, updated by the kernel on every resume. Reads outside a
    /// critical section may be stale by the time they are used.
    pub cpu_id_start: u32,

    /// Current CPU number. Set to `RSEQ_CPU_ID_UNINITIALIZED` before
    /// the first schedule, or `RSEQ_CPU_ID_REGISTRATION_FAILED` if
    /// registration failed.
    pub cpu_id: u32,

    /// Pointer to the active `RseqCs` descriptor, or 0 if no critical
    /// section is armed. The kernel clears it on abort.
    pub rseq_cs: u64,

    /// Flags controlling restart behavior. Deprecated by the kernel; 0.
    pub flags: u32,

    /// NUMA node ID (kernel >= 5.17).
    pub node_id: u32,

    /// Memory-map concurrency ID (kernel >= 6.3).
    pub mm_cid: u32,

    /// Tail padding up to the 32-byte registration size.
    pub padding: u32,
}

/// Size to pass to the rseq syscall for the original ABI (v0).
pub const RSEQ_MIN_SIZE: u32 = 32;

impl Rseq {
    /// Create a zeroed, unregistered rseq area.
    pub const fn new() -> Self {
        Self {
            cpu_id_start: 0,
            cpu_id: RSEQ_CPU_ID_UNINITIALIZED,
            rseq_cs: 0,
            flags: 0,
            node_id: 0,
            mm_cid: 0,
            padding: 0,
        }
    }
}

impl Default for Rseq {
    fn default() -> Self {
        Self::new()
    }
}

// ── struct rseq_cs ───────────────────────────────────────────────────────────

/// Critical section descriptor.
///
/// Describes the boundaries of a restartable sequence. Must be 32-byte
/// aligned. On preemption the kernel checks whether the thread's
/// instruction pointer falls within `[start_ip, start_ip +
/// post_commit_offset)`; if so, it redirects execution to `abort_ip`.
#[repr(C, align(32))]
pub struct RseqCs {
    /// Structure version. Must be 0.
    pub version: u32,

    /// Flags controlling restart behavior for this critical section.
    pub flags: u32,

    /// Address of the first instruction in the critical section.
    pub start_ip: u64,

    /// Byte offset from `start_ip` to the first instruction *after*
    /// the commit point.
    pub post_commit_offset: u64,

    /// Address of the abort handler. The 4 bytes immediately before
    /// this address must contain `RSEQ_SIG`.
    pub abort_ip: u64,
}
