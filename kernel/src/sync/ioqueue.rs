//! Blocking single-producer / single-consumer ring buffer
//!
//! A fixed 64-byte ring with one slot kept empty to tell "full" from
//! "empty", so the usable capacity is 63. At most one producer and one
//! consumer may be blocked on it at a time; each has its own waiter slot.
//! The ring indices are guarded by disabled interrupts; the waiter
//! handoff is additionally serialized by the embedded lock.

use crate::drivers::interrupts::{intr_get_status, IntrStatus};
use crate::sync::Lock;
use crate::sys::thread::{running_thread, thread_block, thread_unblock, TaskStatus, Tcb};
use core::ptr;

/// Ring storage size; capacity is one less.
pub const BUF_SIZE: usize = 64;

/// Circular byte queue with blocking get/put.
pub struct IoQueue {
    pub lock: Lock,
    /// Blocked producer, if any
    pub producer: *mut Tcb,
    /// Blocked consumer, if any
    pub consumer: *mut Tcb,
    buf: [u8; BUF_SIZE],
    /// Next write position
    head: usize,
    /// Next read position
    tail: usize,
}

// Safety: queues are kernel globals; indices and waiter slots are only
// touched with interrupts disabled
unsafe impl Send for IoQueue {}

impl IoQueue {
    pub const fn new() -> Self {
        Self {
            lock: Lock::new(),
            producer: ptr::null_mut(),
            consumer: ptr::null_mut(),
            buf: [0; BUF_SIZE],
            head: 0,
            tail: 0,
        }
    }

    /// Stitch the embedded lock and clear the ring, in place.
    pub fn init(&mut self) {
        self.lock.init();
        self.producer = ptr::null_mut();
        self.consumer = ptr::null_mut();
        self.head = 0;
        self.tail = 0;
    }

    fn next_pos(pos: usize) -> usize {
        (pos + 1) % BUF_SIZE
    }

    /// Whether the ring is full. Requires interrupts disabled.
    pub fn is_full(&self) -> bool {
        assert_eq!(intr_get_status(), IntrStatus::Off);
        Self::next_pos(self.head) == self.tail
    }

    /// Whether the ring is empty. Requires interrupts disabled.
    pub fn is_empty(&self) -> bool {
        assert_eq!(intr_get_status(), IntrStatus::Off);
        self.head == self.tail
    }

    /// Record the current task in `waiter` and block. The slot must be
    /// free: two producers or two consumers on one queue is a bug.
    fn wait(waiter: &mut *mut Tcb) {
        assert!(
            waiter.is_null(),
            "ioqueue: waiter slot already occupied"
        );
        *waiter = running_thread();
        thread_block(TaskStatus::Blocked);
    }

    /// Wake and clear the task parked in `waiter`.
    fn wakeup(waiter: &mut *mut Tcb) {
        assert!(!waiter.is_null());
        thread_unblock(*waiter);
        *waiter = ptr::null_mut();
    }

    /// Read one byte, blocking while the ring is empty.
    pub fn getc(&mut self) -> u8 {
        assert_eq!(intr_get_status(), IntrStatus::Off);

        while self.is_empty() {
            self.lock.acquire();
            Self::wait(&mut self.consumer);
            self.lock.release();
        }

        let byte = self.buf[self.tail];
        self.tail = Self::next_pos(self.tail);

        if !self.producer.is_null() {
            Self::wakeup(&mut self.producer);
        }

        byte
    }

    /// Write one byte, blocking while the ring is full.
    pub fn putc(&mut self, byte: u8) {
        assert_eq!(intr_get_status(), IntrStatus::Off);

        while self.is_full() {
            self.lock.acquire();
            Self::wait(&mut self.producer);
            self.lock.release();
        }

        self.buf[self.head] = byte;
        self.head = Self::next_pos(self.head);

        if !self.consumer.is_null() {
            Self::wakeup(&mut self.consumer);
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        (self.head + BUF_SIZE - self.tail) % BUF_SIZE
    }

    pub fn capacity(&self) -> usize {
        BUF_SIZE - 1
    }
}

impl Default for IoQueue {
    fn default() -> Self {
        Self::new()
    }
}
