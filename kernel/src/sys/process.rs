//! User processes
//!
//! A user process is a thread plus a private address space: its own
//! virtual pool, its own page directory (kernel half mirrored in), and a
//! Ring-3 register frame. Entry to Ring 3 happens exactly once, by
//! `iret`ing from a synthetic interrupt frame through `intr_exit`.

use crate::boot::KERNEL_SPACE_BASE;
use crate::mm::VirtAddr;
use crate::sys::thread::Tcb;
use crate::{KernelResult, PAGE_SIZE};

/// Conventional load base of user programs; the process virtual pool
/// starts here.
pub const USER_VADDR_START: u32 = 0x0804_8000;

/// The user stack occupies the highest user page.
pub const USER_STACK3_VADDR: u32 = KERNEL_SPACE_BASE - PAGE_SIZE as u32;

/// Give `tcb` its own user virtual pool: kernel pages sized to cover
/// `[USER_VADDR_START, 0xC0000000)` one bit per page.
pub fn create_user_vaddr_bitmap(tcb: &mut Tcb) -> KernelResult<()> {
    let bitmap_len = ((KERNEL_SPACE_BASE - USER_VADDR_START) as usize / PAGE_SIZE) / 8;
    let pg_cnt = bitmap_len.div_ceil(PAGE_SIZE);
    let pages = crate::mm::get_kernel_pages(pg_cnt)?;
    unsafe {
        tcb.userprog_vaddr
            .init(VirtAddr::new(USER_VADDR_START), pages.as_mut_ptr(), bitmap_len)
    };
    Ok(())
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::boot::{KERNEL_PAGE_DIR_PHYS, SELECTOR_U_CODE, SELECTOR_U_DATA};
    use crate::drivers::interrupts::{intr_disable, intr_set_status, EFlags};
    use crate::mm::{self, page::PageFlags, PoolFlag};
    use crate::sys::thread::{self, IntrStack, ThreadStack, DEFAULT_PRIO};
    use crate::sys::{scheduler, tss};

    extern "C" {
        fn intr_exit();
    }

    /// Build this process's Ring-3 context and drop into it.
    ///
    /// Runs as the thread function the first time the new task is
    /// scheduled: manufacture the `IntrStack` the interrupt-return path
    /// expects, with user selectors, EIP at the program entry, IF=1 and
    /// a fresh user stack page, then `jmp intr_exit`.
    fn start_process(entry: usize) {
        let cur = thread::running_thread();
        unsafe {
            // self_kstack still holds the creation-time position below
            // ThreadStack; the IntrStack sits just above it
            (*cur).self_kstack += core::mem::size_of::<ThreadStack>() as u32;
            let frame = (*cur).self_kstack as usize as *mut IntrStack;

            (*frame).vec_no = 0;
            (*frame).edi = 0;
            (*frame).esi = 0;
            (*frame).ebp = 0;
            (*frame).esp_dummy = 0;
            (*frame).ebx = 0;
            (*frame).edx = 0;
            (*frame).ecx = 0;
            (*frame).eax = 0;

            (*frame).gs = 0;
            (*frame).fs = SELECTOR_U_DATA as u32;
            (*frame).es = SELECTOR_U_DATA as u32;
            (*frame).ds = SELECTOR_U_DATA as u32;

            (*frame).error_code = 0;
            (*frame).eip = entry as u32;
            (*frame).cs = SELECTOR_U_CODE as u32;
            // IF=1 so the process is preemptible, IOPL=0 keeps port I/O
            // privileged
            (*frame).eflags = (EFlags::IF | EFlags::MBS).bits();

            let stack = mm::get_a_page(PoolFlag::User, USER_STACK3_VADDR)
                .expect("start_process: no user stack page");
            (*frame).esp = stack.as_u32() + PAGE_SIZE as u32;
            (*frame).ss = SELECTOR_U_DATA as u32;

            core::arch::asm!(
                "mov esp, {frame}",
                "jmp {exit}",
                frame = in(reg) frame,
                exit = sym intr_exit,
                options(noreturn),
            );
        }
    }

    /// A fresh page directory: kernel half copied from the live kernel
    /// directory, self-map installed at entry 1023.
    fn create_page_dir() -> KernelResult<VirtAddr> {
        let pd = mm::get_kernel_pages(1)?;
        unsafe {
            // PDE[768..1024): the kernel half mirrored into every space
            let src = (0xFFFF_F000u32 + 0x300 * 4) as usize as *const u8;
            let dst = (pd.as_u32() + 0x300 * 4) as usize as *mut u8;
            core::ptr::copy_nonoverlapping(src, dst, 1024);

            let pd_phys = mm::addr_v2p(pd.as_u32());
            let entries = pd.as_mut_ptr::<u32>();
            *entries.add(1023) = pd_phys | PageFlags::DEFAULT.bits();
        }
        Ok(pd)
    }

    /// Load CR3 for `tcb`: its own directory for a process, the boot
    /// kernel directory for a pure kernel thread.
    pub fn page_dir_activate(tcb: *mut Tcb) {
        let page_dir_phys = match unsafe { (*tcb).page_dir } {
            Some(pd) => mm::addr_v2p(pd.as_u32()),
            None => KERNEL_PAGE_DIR_PHYS,
        };
        mm::page::load_cr3(page_dir_phys);
    }

    /// Called from `schedule` on every switch: swap the address space,
    /// and for user processes point TSS.esp0 at the new task's kernel
    /// stack top.
    pub fn process_activate(tcb: *mut Tcb) {
        assert!(!tcb.is_null());
        page_dir_activate(tcb);
        if unsafe { (*tcb).page_dir.is_some() } {
            tss::update_esp(tcb);
        }
    }

    /// Create a user process around `entry` and make it runnable.
    /// Returns the assigned PID.
    pub fn process_execute(entry: usize, name: &str) -> KernelResult<u16> {
        let page = mm::get_kernel_pages(1)?;
        let tcb = page.as_mut_ptr::<Tcb>();
        unsafe {
            thread::init_thread(&mut *tcb, name, DEFAULT_PRIO);
            create_user_vaddr_bitmap(&mut *tcb)?;
            thread::thread_create(&mut *tcb, start_process, entry);
            (*tcb).page_dir = Some(create_page_dir()?);

            let old = intr_disable();
            scheduler::enqueue_new(tcb);
            intr_set_status(old);

            Ok((*tcb).pid)
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::{page_dir_activate, process_activate, process_execute};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_layout_constants() {
        assert_eq!(USER_VADDR_START, 0x0804_8000);
        assert_eq!(USER_STACK3_VADDR, 0xBFFF_F000);
        // pool covers user space in whole pages of bitmap
        let bitmap_len = ((KERNEL_SPACE_BASE - USER_VADDR_START) as usize / PAGE_SIZE) / 8;
        assert_eq!(bitmap_len.div_ceil(PAGE_SIZE), 23);
    }
}
