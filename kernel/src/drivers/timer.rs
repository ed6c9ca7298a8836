//! Timer driver (PIT 8253, channel 0)
//!
//! Mode 2 rate generator at 100 Hz drives IRQ0; every tick charges the
//! running task and rotates it when its slice is spent.

use crate::sys::scheduler;
use core::sync::atomic::{AtomicU32, Ordering};

/// PIT input clock (Hz)
pub const INPUT_FREQUENCY: u32 = 1_193_180;

/// System tick rate (Hz)
pub const TICK_RATE: u32 = 100;

/// Counter 0 reload value for TICK_RATE
pub const COUNTER0_VALUE: u16 = (INPUT_FREQUENCY / TICK_RATE) as u16;

/// Counter 0 data port
pub const COUNTER0_PORT: u16 = 0x40;
/// Mode/command port
pub const PIT_CONTROL_PORT: u16 = 0x43;

/// Counter number in the control word
pub const COUNTER0_NO: u8 = 0;
/// Read/write low byte then high byte
pub const READ_WRITE_LATCH: u8 = 3;
/// Mode 2: rate generator
pub const COUNTER_MODE: u8 = 2;

/// Ticks since boot
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Ticks elapsed since boot.
pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Uptime in milliseconds.
pub fn uptime_ms() -> u64 {
    ticks() as u64 * 1000 / TICK_RATE as u64
}

/// IRQ0 handler: count the tick and charge the running task. Entered
/// through an interrupt gate, so IF is already clear.
pub extern "C" fn intr_timer_handler(_vec: u32) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    scheduler::on_tick();
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::drivers::interrupts::{register_handler, vectors};
    use crate::io::outb;

    fn frequency_set(
        counter_port: u16,
        counter_no: u8,
        rwl: u8,
        counter_mode: u8,
        counter_value: u16,
    ) {
        unsafe {
            outb(
                PIT_CONTROL_PORT,
                (counter_no << 6) | (rwl << 4) | (counter_mode << 1),
            );
            outb(counter_port, counter_value as u8);
            outb(counter_port, (counter_value >> 8) as u8);
        }
    }

    /// Program channel 0 and take over IRQ0.
    pub fn init() {
        frequency_set(
            COUNTER0_PORT,
            COUNTER0_NO,
            READ_WRITE_LATCH,
            COUNTER_MODE,
            COUNTER0_VALUE,
        );
        register_handler(vectors::PIC_TIMER, intr_timer_handler);
        log::debug!("pit: {} Hz, reload {}", TICK_RATE, COUNTER0_VALUE);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::init;
