//! Device drivers
//!
//! Minimal drivers for kernel operation:
//! - Interrupts (IDT, cascaded 8259A PICs)
//! - Timer (PIT channel 0, the scheduler's clock)
//! - Serial (UART 16550) for log output
//! - Console (lock-serialized writer over serial)
//! - Keyboard (scan-code decode into the shared I/O queue)

pub mod interrupts;
pub mod keyboard;
pub mod timer;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod console;
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod serial;
