//! Structured fatal-error reporting.
//!
//! The engine sits inside a memory allocator, so the reporting path must
//! not allocate: messages are formatted into a fixed stack buffer and
//! handed to a replaceable writer (by default raw `write(2)` to stderr).
//! All invariant violations are fatal — the report names the source site
//! and the offending values, then the process is aborted. There is
//! nothing to recover: a slab whose invariants no longer hold cannot be
//! continued past.
//!
//! Messages are formatted as `file:line] text`.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Receives one finished crash/log message.
pub type MessageWriter = fn(&str);

/// Active writer as a fn-pointer word; 0 selects [`stderr_writer`].
static WRITER: AtomicUsize = AtomicUsize::new(0);

/// Replace the message writer. Intended for tests that want to capture
/// the report instead of having it hit stderr.
pub fn set_message_writer(writer: MessageWriter) {
    WRITER.store(writer as usize, Ordering::Release);
}

fn current_writer() -> MessageWriter {
    let w = WRITER.load(Ordering::Acquire);
    if w == 0 {
        stderr_writer
    } else {
        // A non-zero word only ever comes from `set_message_writer`.
        unsafe { core::mem::transmute::<usize, MessageWriter>(w) }
    }
}

// ── Default writer: fd 2 ─────────────────────────────────────────────────────

unsafe extern "C" {
    fn write(fd: i32, buf: *const u8, count: usize) -> isize;
    fn abort() -> !;
}

/// Write the message and a trailing newline to stderr.
pub fn stderr_writer(msg: &str) {
    unsafe {
        let _ = write(2, msg.as_ptr(), msg.len());
        let _ = write(2, b"\n".as_ptr(), 1);
    }
}

// ── Fixed-buffer printer ─────────────────────────────────────────────────────

/// Maximum length of one formatted report.
const MSG_CAPACITY: usize = 512;

/// `core::fmt::Write` sink over a fixed buffer. Output past the capacity
/// is dropped rather than reallocated.
pub struct Printer {
    buf: [u8; MSG_CAPACITY],
    len: usize,
}

impl Printer {
    pub const fn new() -> Self {
        Self {
            buf: [0; MSG_CAPACITY],
            len: 0,
        }
    }

    pub fn as_str(&self) -> &str {
        // Only `write_str` appends, and it copies whole str bytes up to
        // a char boundary check below.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("<non-utf8>")
    }
}

impl Default for Printer {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = MSG_CAPACITY - self.len;
        let mut take = s.len().min(room);
        // Don't split a multi-byte char at the truncation point.
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

// ── Crash entry point ────────────────────────────────────────────────────────

/// Format `file:line] args`, emit it through the active writer, and
/// abort the process. Never returns.
#[cold]
#[inline(never)]
pub fn crash(file: &str, line: u32, args: fmt::Arguments<'_>) -> ! {
    let mut p = Printer::new();
    let _ = write!(p, "{file}:{line}] ");
    let _ = p.write_fmt(args);
    current_writer()(p.as_str());
    unsafe { abort() }
}

// ── Macros ───────────────────────────────────────────────────────────────────

/// Report a fatal condition with the current source location and abort.
#[macro_export]
macro_rules! crash {
    ($($arg:tt)*) => {
        $crate::logging::crash(file!(), line!(), format_args!($($arg)*))
    };
}

/// Fatal invariant check. Always compiled in.
#[macro_export]
macro_rules! check {
    ($cond:expr) => {
        if !$cond {
            $crate::crash!("CHECK failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::logging::crash(
                file!(),
                line!(),
                format_args!("CHECK failed: {}: {}", stringify!($cond), format_args!($($arg)*)),
            );
        }
    };
}

/// Invariant check compiled only with debug assertions.
#[macro_export]
macro_rules! debug_check {
    ($($arg:tt)*) => {
        #[cfg(debug_assertions)]
        {
            $crate::check!($($arg)*);
        }
    };
}
