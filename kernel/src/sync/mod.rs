//! Blocking synchronization primitives
//!
//! Built directly on the scheduler: a task that cannot make progress
//! appends itself to a FIFO waiter list and calls `thread_block`; the
//! releasing side pops the head and calls `thread_unblock`. All state
//! transitions run with interrupts disabled.

pub mod ioqueue;

pub use ioqueue::IoQueue;

use crate::drivers::interrupts::{intr_disable, intr_set_status};
use crate::list::List;
use crate::sys::thread::{self, running_thread, thread_block, thread_unblock, TaskStatus, Tcb};
use core::ptr;

/// Counting semaphore with FIFO waiters. In this kernel it is only ever
/// used as a binary semaphore, and the up/down paths assert that.
pub struct Semaphore {
    pub value: u8,
    pub waiters: List,
}

impl Semaphore {
    pub const fn new() -> Self {
        Self {
            value: 0,
            waiters: List::new(),
        }
    }

    /// Set the initial value and stitch the waiter list, in place.
    pub fn init(&mut self, value: u8) {
        self.value = value;
        self.waiters.init();
    }

    /// Decrement the semaphore, blocking while it is zero.
    pub fn down(&mut self) {
        let old = intr_disable();

        while self.value == 0 {
            let cur = running_thread();
            unsafe {
                assert!(
                    !self.waiters.contains(ptr::addr_of!((*cur).general_tag)),
                    "sema_down: blocked thread already in waiters list"
                );
                self.waiters.append(ptr::addr_of_mut!((*cur).general_tag));
            }
            thread_block(TaskStatus::Blocked);
        }

        self.value -= 1;
        assert_eq!(self.value, 0);

        intr_set_status(old);
    }

    /// Increment the semaphore, waking the first waiter if any.
    pub fn up(&mut self) {
        let old = intr_disable();
        assert_eq!(self.value, 0);

        if !self.waiters.is_empty() {
            let tag = self.waiters.pop();
            let blocked = unsafe { thread::tcb_from_general_tag(tag) };
            thread_unblock(blocked);
        }

        self.value += 1;
        assert_eq!(self.value, 1);

        intr_set_status(old);
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive lock: a binary semaphore plus an owner and a re-entry count.
pub struct Lock {
    pub holder: *mut Tcb,
    pub holder_repeat_nr: u32,
    pub sema: Semaphore,
}

// Safety: locks are kernel globals; the holder pointer is only touched by
// the owning task or under IF-masked handoff
unsafe impl Send for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Self {
            holder: ptr::null_mut(),
            holder_repeat_nr: 0,
            sema: Semaphore::new(),
        }
    }

    /// Stitch the lock in place with no holder and a free semaphore.
    pub fn init(&mut self) {
        self.holder = ptr::null_mut();
        self.holder_repeat_nr = 0;
        self.sema.init(1);
    }

    /// Acquire the lock, blocking if another task holds it. Re-entry by
    /// the holder only bumps the count.
    pub fn acquire(&mut self) {
        if self.holder != running_thread() {
            self.sema.down();
            self.holder = running_thread();
            assert_eq!(self.holder_repeat_nr, 0);
            self.holder_repeat_nr = 1;
        } else {
            self.holder_repeat_nr += 1;
        }
    }

    /// Release the lock; only the outermost release frees it.
    pub fn release(&mut self) {
        assert_eq!(
            self.holder,
            running_thread(),
            "lock_release: not the holder"
        );
        if self.holder_repeat_nr > 1 {
            self.holder_repeat_nr -= 1;
            return;
        }
        assert_eq!(self.holder_repeat_nr, 1);

        self.holder = ptr::null_mut();
        self.holder_repeat_nr = 0;
        self.sema.up();
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
