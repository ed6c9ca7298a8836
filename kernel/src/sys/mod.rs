//! Core kernel services
//!
//! - Thread core (TCB, context switch, block/unblock)
//! - Scheduler (ready queue, tick policy)
//! - User processes (page directory, Ring-3 entry)
//! - TSS/GDT plumbing for privilege transitions
//! - System calls

pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod thread;
pub mod tss;

pub use scheduler::Scheduler;
pub use thread::{TaskStatus, Tcb};
