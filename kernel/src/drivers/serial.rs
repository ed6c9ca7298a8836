//! Serial port driver (UART 16550)
//!
//! Debug and log output via COM1.

use crate::io::{inb, outb};
use core::fmt::{self, Write};
use spin::Mutex;

/// COM1 port address
const COM1: u16 = 0x3F8;

/// Serial port
pub struct SerialPort {
    port: u16,
}

impl SerialPort {
    pub const fn new(port: u16) -> Self {
        Self { port }
    }

    /// Initialize: 115200 baud, 8N1, FIFOs on, loopback self-test.
    pub fn init(&mut self) {
        unsafe {
            // Disable UART interrupts
            outb(self.port + 1, 0x00);

            // DLAB on, divisor 1 = 115200 baud
            outb(self.port + 3, 0x80);
            outb(self.port, 0x01);
            outb(self.port + 1, 0x00);

            // 8 bits, no parity, one stop bit
            outb(self.port + 3, 0x03);

            // FIFO on, cleared, 14-byte threshold
            outb(self.port + 2, 0xC7);

            // RTS/DSR set
            outb(self.port + 4, 0x0B);

            // Loopback self-test
            outb(self.port + 4, 0x1E);
            outb(self.port, 0xAE);
            if inb(self.port) != 0xAE {
                return;
            }

            // Normal operation
            outb(self.port + 4, 0x0F);
        }
    }

    fn is_transmit_empty(&self) -> bool {
        unsafe { inb(self.port + 5) & 0x20 != 0 }
    }

    pub fn write_byte(&mut self, byte: u8) {
        while !self.is_transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe { outb(self.port, byte) };
    }

    pub fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
    }
}

impl Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        SerialPort::write_str(self, s);
        Ok(())
    }
}

/// Global serial port
static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));

/// Initialize COM1.
pub fn init() {
    SERIAL.lock().init();
}

/// Print directly to the port, bypassing the console lock. The console
/// builds on this; the panic path uses it because the lock may be held
/// by whoever panicked.
pub fn print(args: fmt::Arguments) {
    let _ = SERIAL.lock().write_fmt(args);
}

/// Logger implementation for the log crate. Records go through the
/// console so log lines from concurrent threads never interleave.
struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            crate::drivers::console::write_fmt(format_args!(
                "[{:5}] {}: {}\n",
                record.level(),
                record.target(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the serial logger.
pub fn init_logger() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}
