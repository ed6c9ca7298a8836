//! Round-robin scheduler with priority-proportional time slices
//!
//! Every runnable task sits in one FIFO ready queue; a task's priority is
//! the number of ticks it runs before rotating to the back, so equal
//! priorities round-robin and higher priorities get proportionally more
//! CPU. The scheduler's `current` pointer is the source of truth for
//! `running_thread()`; the stack-alignment identity is only asserted.

use crate::drivers::interrupts::{intr_get_status, IntrStatus};
use crate::list::List;
use crate::sys::thread::{self, TaskStatus, Tcb, STACK_MAGIC};
use crate::IrqCell;
use core::ptr::{self, addr_of, addr_of_mut};

/// Scheduler state: the run queues and the owning-task pointer.
pub struct Scheduler {
    ready: List,
    all: List,
    current: *mut Tcb,
}

// Safety: the global instance is mutated only with interrupts disabled
unsafe impl Send for Scheduler {}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: List::new(),
            all: List::new(),
            current: ptr::null_mut(),
        }
    }

    /// Stitch the queues, in place.
    pub fn init(&mut self) {
        self.ready.init();
        self.all.init();
        self.current = ptr::null_mut();
    }

    /// Adopt an already-running TCB (the boot thread) as current. It
    /// joins only the all-tasks list: a RUNNING task is never queued.
    ///
    /// # Safety
    ///
    /// `main` must be a live, initialized TCB.
    pub unsafe fn attach_main(&mut self, main: *mut Tcb) {
        unsafe {
            (*main).status = TaskStatus::Running;
            assert!(!self.all.contains(addr_of!((*main).all_list_tag)));
            self.all.append(addr_of_mut!((*main).all_list_tag));
        }
        self.current = main;
    }

    /// The task owning the CPU.
    pub fn current(&self) -> *mut Tcb {
        assert!(!self.current.is_null(), "scheduler not initialized");
        self.current
    }

    /// Number of tasks waiting to run.
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Whether `tcb` is linked into the ready queue.
    pub fn ready_contains(&self, tcb: *const Tcb) -> bool {
        self.ready
            .contains(unsafe { addr_of!((*tcb).general_tag) })
    }

    /// Whether `tcb` is on the all-tasks list.
    pub fn all_contains(&self, tcb: *const Tcb) -> bool {
        self.all.contains(unsafe { addr_of!((*tcb).all_list_tag) })
    }

    /// Number of live tasks, runnable or not.
    pub fn task_count(&self) -> usize {
        self.all.len()
    }

    /// Enqueue a newly created task on both lists.
    ///
    /// # Safety
    ///
    /// `tcb` must be a live, initialized TCB linked into neither list.
    pub unsafe fn enqueue_new(&mut self, tcb: *mut Tcb) {
        unsafe {
            assert!(!self.ready.contains(addr_of!((*tcb).general_tag)));
            self.ready.append(addr_of_mut!((*tcb).general_tag));
            assert!(!self.all.contains(addr_of!((*tcb).all_list_tag)));
            self.all.append(addr_of_mut!((*tcb).all_list_tag));
        }
    }

    /// Put an unblocked task at the head of the ready queue so it runs
    /// at the next scheduling point.
    ///
    /// # Safety
    ///
    /// `tcb` must be live and not already on the ready queue.
    pub unsafe fn requeue_front(&mut self, tcb: *mut Tcb) {
        unsafe { self.ready.push(addr_of_mut!((*tcb).general_tag)) };
    }

    /// Put a yielding task at the tail of the ready queue.
    ///
    /// # Safety
    ///
    /// `tcb` must be live and not already on the ready queue.
    pub unsafe fn requeue_back(&mut self, tcb: *mut Tcb) {
        unsafe { self.ready.append(addr_of_mut!((*tcb).general_tag)) };
    }

    /// Hand the CPU to the head of the ready queue. Must be entered with
    /// interrupts disabled.
    ///
    /// A caller that is still RUNNING is rotated to the back with a
    /// fresh slice; a caller that blocked stays off the queue.
    ///
    /// # Safety
    ///
    /// All queued TCBs must be live.
    pub unsafe fn schedule(&mut self) {
        assert_eq!(
            intr_get_status(),
            IntrStatus::Off,
            "schedule: interrupts enabled"
        );

        let cur = self.current;
        assert!(!cur.is_null());
        unsafe {
            if (*cur).status == TaskStatus::Running {
                assert!(!self.ready.contains(addr_of!((*cur).general_tag)));
                self.ready.append(addr_of_mut!((*cur).general_tag));
                (*cur).ticks = (*cur).priority;
                (*cur).status = TaskStatus::Ready;
            }

            assert!(!self.ready.is_empty(), "schedule: no runnable task");
            let tag = self.ready.pop();
            let next = thread::tcb_from_general_tag(tag);
            (*next).status = TaskStatus::Running;
            self.current = next;

            #[cfg(all(target_arch = "x86", target_os = "none"))]
            {
                crate::sys::process::process_activate(next);
                thread::switch_to(cur, next);
            }
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            let _ = cur;
        }
    }

    /// Clock-tick accounting for the running task: verify the stack
    /// canary, charge the tick, and rotate when the slice is spent.
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled; all queued TCBs must be live.
    pub unsafe fn tick(&mut self) {
        let cur = self.current;
        assert!(!cur.is_null());
        unsafe {
            assert_eq!(
                (*cur).stack_magic,
                STACK_MAGIC,
                "tick: kernel stack overflow on {}",
                (*cur).name_str()
            );
            (*cur).elapsed_ticks += 1;

            if (*cur).ticks == 0 {
                self.schedule();
            } else {
                (*cur).ticks -= 1;
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// The boot scheduler instance
// ============================================================================

static SCHED: IrqCell<Scheduler> = IrqCell::new(Scheduler::new());

/// Initialize the thread core: stitch the queues and adopt the boot
/// stack's page as the main thread.
pub fn init() {
    unsafe {
        (*SCHED.get()).init();
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        // The bootloader's ESP lives in the page below MAIN_STACK_TOP;
        // that page becomes the main TCB
        let main =
            (crate::boot::MAIN_STACK_TOP as usize - crate::PAGE_SIZE) as *mut Tcb;
        unsafe {
            thread::init_thread(&mut *main, "main", 31);
            (*SCHED.get()).attach_main(main);
        }
        log::debug!("main thread adopted at {:p}", main);
    }
}

/// Adopt `main` as the running task on the global scheduler.
///
/// # Safety
///
/// `main` must be a live, initialized TCB; see [`Scheduler::attach_main`].
pub unsafe fn attach_main(main: *mut Tcb) {
    unsafe { (*SCHED.get()).attach_main(main) }
}

/// The running task's TCB.
pub fn current() -> *mut Tcb {
    unsafe { (*SCHED.get()).current() }
}

/// Run the global scheduler; interrupts must be disabled.
pub fn schedule() {
    unsafe { (*SCHED.get()).schedule() }
}

/// Tick the global scheduler; interrupts must be disabled.
pub fn on_tick() {
    unsafe { (*SCHED.get()).tick() }
}

/// Whether `tcb` waits on the global ready queue.
pub fn ready_contains(tcb: *const Tcb) -> bool {
    unsafe { (*SCHED.get()).ready_contains(tcb) }
}

/// Whether `tcb` is on the global all-tasks list.
pub fn all_contains(tcb: *const Tcb) -> bool {
    unsafe { (*SCHED.get()).all_contains(tcb) }
}

/// Live tasks on the global scheduler.
pub fn task_count() -> usize {
    unsafe { (*SCHED.get()).task_count() }
}

/// Tasks waiting on the global ready queue.
pub fn ready_len() -> usize {
    unsafe { (*SCHED.get()).ready_len() }
}

/// Enqueue a new task globally.
///
/// # Safety
///
/// See [`Scheduler::enqueue_new`].
pub unsafe fn enqueue_new(tcb: *mut Tcb) {
    unsafe { (*SCHED.get()).enqueue_new(tcb) }
}

/// Front-queue an unblocked task globally.
///
/// # Safety
///
/// See [`Scheduler::requeue_front`].
pub unsafe fn requeue_front(tcb: *mut Tcb) {
    unsafe { (*SCHED.get()).requeue_front(tcb) }
}

/// Back-queue a yielding task globally.
///
/// # Safety
///
/// See [`Scheduler::requeue_back`].
pub unsafe fn requeue_back(tcb: *mut Tcb) {
    unsafe { (*SCHED.get()).requeue_back(tcb) }
}
