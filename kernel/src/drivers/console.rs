//! Console: thread-serialized output
//!
//! Raw serial writes from preemptible threads interleave mid-line, so the
//! console wraps the port in the kernel's recursive lock. The logger and
//! `sys_write` both come through here; only the panic path goes straight
//! to the port, since it can never afford to wait for the lock.

use crate::drivers::serial;
use crate::sync::Lock;
use crate::IrqCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

static CONSOLE_LOCK: IrqCell<Lock> = IrqCell::new(Lock::new());

/// Set once the lock is stitched; before that, output during early boot
/// falls back to the raw port (nothing to contend with yet).
static READY: AtomicBool = AtomicBool::new(false);

/// Stitch the console lock. Must run after the thread core is up.
pub fn init() {
    unsafe { (*CONSOLE_LOCK.get()).init() };
    READY.store(true, Ordering::Release);
}

/// Write formatted output atomically with respect to other threads.
pub fn write_fmt(args: fmt::Arguments) {
    if !READY.load(Ordering::Acquire) {
        serial::print(args);
        return;
    }
    let lock = unsafe { &mut *CONSOLE_LOCK.get() };
    lock.acquire();
    serial::print(args);
    lock.release();
}

/// Write raw bytes atomically with respect to other threads.
pub fn write_bytes(bytes: &[u8]) {
    if !READY.load(Ordering::Acquire) {
        print_bytes(bytes);
        return;
    }
    let lock = unsafe { &mut *CONSOLE_LOCK.get() };
    lock.acquire();
    print_bytes(bytes);
    lock.release();
}

fn print_bytes(bytes: &[u8]) {
    for chunk in bytes.utf8_chunks() {
        serial::print(format_args!("{}", chunk.valid()));
    }
}
