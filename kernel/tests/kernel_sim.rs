//! Hosted scenario tests
//!
//! These drive the real scheduler, synchronization and pool code paths
//! with the hardware commit points compiled out. They share the global
//! kernel state, so every test serializes on one mutex and re-initializes
//! the scheduler before touching it.

use osmium_kernel::boot::KERNEL_HEAP_START;
use osmium_kernel::drivers::interrupts::intr_disable;
use osmium_kernel::mm;
use osmium_kernel::sync::{IoQueue, Lock, Semaphore};
use osmium_kernel::sys::scheduler;
use osmium_kernel::sys::thread::{init_thread, thread_block, thread_unblock, thread_yield, TaskStatus, Tcb};
use osmium_kernel::sys::tss;
use osmium_kernel::PAGE_SIZE;
use std::collections::HashSet;
use std::ptr::addr_of_mut;
use std::sync::{Mutex, MutexGuard};

static KERNEL_STATE: Mutex<()> = Mutex::new(());

/// Serialize tests that touch process-wide kernel state; a panic in one
/// test (several assert deliberately) must not wedge the rest.
fn kernel_guard() -> MutexGuard<'static, ()> {
    KERNEL_STATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn task(name: &str, prio: u8) -> Box<Tcb> {
    let mut tcb = Box::new(Tcb::zeroed());
    init_thread(&mut tcb, name, prio);
    tcb
}

/// Reset the global scheduler and adopt a fresh main thread.
fn boot_main() -> Box<Tcb> {
    scheduler::init();
    let mut main = task("main", 31);
    unsafe { scheduler::attach_main(&mut *main) };
    main
}

mod semaphore_tests {
    use super::*;

    #[test]
    fn test_waiters_wake_in_fifo_order() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut sem = Box::new(Semaphore::new());
        sem.init(0);

        let mut a = task("wait_a", 1);
        let mut b = task("wait_b", 1);
        a.status = TaskStatus::Blocked;
        b.status = TaskStatus::Blocked;
        unsafe {
            // queue the blocked tasks the way sema_down would
            sem.waiters.append(addr_of_mut!(a.general_tag));
            sem.waiters.append(addr_of_mut!(b.general_tag));
        }

        sem.up();
        assert_eq!(a.status, TaskStatus::Ready, "head waiter wakes first");
        assert_eq!(b.status, TaskStatus::Blocked);
        assert_eq!(sem.value, 1);

        sem.down(); // value 1 -> 0 without blocking
        assert_eq!(sem.value, 0);

        sem.up();
        assert_eq!(b.status, TaskStatus::Ready);
        assert!(sem.waiters.is_empty());
    }

    #[test]
    fn test_down_on_positive_value_does_not_block() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut sem = Box::new(Semaphore::new());
        sem.init(1);
        sem.down();
        assert_eq!(sem.value, 0);
        assert!(sem.waiters.is_empty());
    }
}

mod lock_tests {
    use super::*;

    #[test]
    fn test_recursive_acquire_release_balances() {
        let _g = kernel_guard();
        intr_disable();
        let main = boot_main();

        let mut lock = Box::new(Lock::new());
        lock.init();

        for _ in 0..4 {
            lock.acquire();
        }
        assert_eq!(lock.holder, &*main as *const Tcb as *mut Tcb);
        assert_eq!(lock.holder_repeat_nr, 4);
        assert_eq!(lock.sema.value, 0);

        for _ in 0..4 {
            lock.release();
        }
        assert!(lock.holder.is_null());
        assert_eq!(lock.holder_repeat_nr, 0);
        assert_eq!(lock.sema.value, 1);

        // free for the next taker on the first try
        lock.acquire();
        assert_eq!(lock.holder_repeat_nr, 1);
        lock.release();
    }

    #[test]
    fn test_release_by_non_holder_panics() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut lock = Box::new(Lock::new());
        lock.init();
        lock.acquire();

        let mut intruder = task("intruder", 1);
        lock.holder = &mut *intruder;

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| lock.release()));
        assert!(r.is_err(), "release by a non-holder must panic");
    }
}

mod ioqueue_tests {
    use super::*;

    #[test]
    fn test_fifo_through_full_capacity() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut q = Box::new(IoQueue::new());
        q.init();
        assert_eq!(q.capacity(), 63);

        for byte in 0..63u8 {
            assert!(!q.is_full());
            q.putc(byte);
        }
        assert!(q.is_full());
        assert_eq!(q.len(), 63);

        for expected in 0..63u8 {
            assert!(!q.is_empty());
            assert_eq!(q.getc(), expected);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut q = Box::new(IoQueue::new());
        q.init();

        // force the indices around the seam a few times
        let mut expected = Vec::new();
        let mut got = Vec::new();
        let mut next: u8 = 0;
        for _ in 0..10 {
            for _ in 0..40 {
                q.putc(next);
                expected.push(next);
                next = next.wrapping_add(1);
            }
            for _ in 0..40 {
                got.push(q.getc());
            }
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_second_concurrent_consumer_is_rejected() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut q = Box::new(IoQueue::new());
        q.init();

        // one consumer is already parked; a second reader arriving at an
        // empty queue would need the same waiter slot
        let mut parked = task("reader_1", 1);
        parked.status = TaskStatus::Blocked;
        q.consumer = &mut *parked;

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = q.getc();
        }));
        assert!(r.is_err(), "a second concurrent consumer must panic");
    }

    #[test]
    fn test_consumer_and_producer_wakeups() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut q = Box::new(IoQueue::new());
        q.init();

        // a parked consumer is woken by the next put
        let mut consumer = task("consumer", 1);
        consumer.status = TaskStatus::Blocked;
        q.consumer = &mut *consumer;
        q.putc(7);
        assert!(q.consumer.is_null());
        assert_eq!(consumer.status, TaskStatus::Ready);

        // a parked producer is woken by the next get
        let mut producer = task("producer", 1);
        producer.status = TaskStatus::Blocked;
        q.producer = &mut *producer;
        assert_eq!(q.getc(), 7);
        assert!(q.producer.is_null());
        assert_eq!(producer.status, TaskStatus::Ready);
    }
}

mod scheduler_tests {
    use super::*;

    #[test]
    fn test_block_unblock_roundtrip() {
        let _g = kernel_guard();
        intr_disable();
        let mut main = boot_main();

        let mut other = task("other", 31);
        unsafe { scheduler::enqueue_new(&mut *other) };

        let main_ptr: *mut Tcb = &mut *main;
        thread_block(TaskStatus::Blocked);

        // the blocked task gave up the CPU and is on no run queue, but
        // stays on the all-tasks list
        assert_eq!(main.status, TaskStatus::Blocked);
        assert_eq!(scheduler::current(), &mut *other as *mut Tcb);
        assert!(!scheduler::ready_contains(main_ptr));
        assert!(scheduler::all_contains(main_ptr));
        assert_eq!(scheduler::task_count(), 2);

        thread_unblock(main_ptr);
        assert_eq!(main.status, TaskStatus::Ready);
        assert!(scheduler::ready_contains(main_ptr));

        // waking an already-ready task is a logic bug and must panic
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            thread_unblock(main_ptr)
        }));
        assert!(r.is_err());
    }

    #[test]
    fn test_yield_rotates_to_back() {
        let _g = kernel_guard();
        intr_disable();
        let mut main = boot_main();

        let mut other = task("other", 31);
        unsafe { scheduler::enqueue_new(&mut *other) };

        thread_yield();
        assert_eq!(scheduler::current(), &mut *other as *mut Tcb);
        assert_eq!(main.status, TaskStatus::Ready);
        assert!(scheduler::ready_contains(&mut *main));
    }
}

mod memory_tests {
    use super::*;

    const TOTAL_MEM: u32 = 32 * 1024 * 1024;

    /// 32 MiB: 0x200000 used, 7680 free pages, 3840 per pool, 480-byte
    /// bitmaps.
    fn boot_pools() {
        let bitmaps: &'static mut [u8] = Box::leak(vec![0u8; PAGE_SIZE].into_boxed_slice());
        unsafe { mm::mem_pool_init(TOTAL_MEM, bitmaps.as_mut_ptr()) };
    }

    #[test]
    fn test_partition_sizes() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();
        boot_pools();

        let pools = unsafe { mm::pools() };
        assert_eq!(pools.kernel.phy_addr_start.as_u32(), 0x20_0000);
        assert_eq!(pools.kernel.pool_size, 3840 * PAGE_SIZE as u32);
        assert_eq!(
            pools.user.phy_addr_start.as_u32(),
            0x20_0000 + 3840 * PAGE_SIZE as u32
        );
        assert_eq!(pools.user.pool_size, 3840 * PAGE_SIZE as u32);
        assert_eq!(pools.kernel.total_pages(), 3840);
        assert_eq!(pools.kernel_vaddr.vaddr_start.as_u32(), KERNEL_HEAP_START);
    }

    #[test]
    fn test_kernel_pages_unique_until_exhaustion() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();
        boot_pools();

        let mut starts = HashSet::new();
        let mut allocated = 0usize;
        loop {
            match mm::get_kernel_pages(2) {
                Ok(vaddr) => {
                    let v = vaddr.as_u32();
                    assert!(v >= KERNEL_HEAP_START);
                    assert_eq!((v - KERNEL_HEAP_START) as usize % PAGE_SIZE, 0);
                    // no region may overlap a previous one
                    assert!(starts.insert(v));
                    assert!(starts.insert(v + PAGE_SIZE as u32));
                    allocated += 2;
                }
                Err(_) => break,
            }
        }
        assert_eq!(allocated, 3840);

        // occupancy equals successful allocations exactly
        let pools = unsafe { mm::pools() };
        assert_eq!(pools.kernel.used_pages(), allocated);
        assert_eq!(pools.kernel_vaddr.bitmap.count_set(), allocated);
    }

    #[test]
    fn test_get_a_page_maps_requested_address() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();
        boot_pools();

        let vaddr = KERNEL_HEAP_START + 5 * PAGE_SIZE as u32;
        let got = mm::get_a_page(mm::PoolFlag::Kernel, vaddr).unwrap();
        assert_eq!(got.as_u32(), vaddr);

        let pools = unsafe { mm::pools() };
        assert!(pools.kernel_vaddr.bitmap.test(5));
        assert_eq!(pools.kernel.used_pages(), 1);
    }

    #[test]
    fn test_get_a_page_rejects_inconsistent_flag() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();
        boot_pools();

        // a pure kernel thread asking for a user mapping is a logic bug
        let r = std::panic::catch_unwind(|| {
            let _ = mm::get_a_page(mm::PoolFlag::User, 0x0804_9000);
        });
        assert!(r.is_err());
    }
}

mod tss_tests {
    use super::*;

    #[test]
    fn test_esp0_tracks_task_stack_top() {
        let _g = kernel_guard();
        intr_disable();
        let _main = boot_main();

        let mut proc_task = task("u_prog", 31);
        let tcb_ptr: *mut Tcb = &mut *proc_task;
        tss::update_esp(tcb_ptr);
        assert_eq!(
            tss::esp0(),
            (tcb_ptr as usize as u32).wrapping_add(PAGE_SIZE as u32)
        );
    }
}

mod syscall_tests {
    use super::*;
    use osmium_kernel::sys::syscall::{syscall_dispatch, Syscall};

    #[test]
    fn test_getpid_reports_running_task() {
        let _g = kernel_guard();
        intr_disable();
        let main = boot_main();

        let pid = syscall_dispatch(Syscall::GetPid as u32, 0, 0, 0);
        assert_eq!(pid, main.pid as u32);

        // after a switch the syscall answers for the new task
        let mut other = task("other", 31);
        unsafe { scheduler::enqueue_new(&mut *other) };
        thread_block(TaskStatus::Blocked);
        let pid = syscall_dispatch(Syscall::GetPid as u32, 0, 0, 0);
        assert_eq!(pid, other.pid as u32);
    }
}
