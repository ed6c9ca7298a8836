//! Thread core
//!
//! A task is a TCB at the base of its page-aligned 4 KiB kernel stack;
//! the stack grows down from the page's end toward the TCB, and a magic
//! word at the TCB's top edge catches overflow. A task not currently on
//! the CPU is exactly its saved callee-context on that stack, so the
//! context switch is four pushes, an ESP swap and four pops.

use crate::drivers::interrupts::{intr_disable, intr_set_status};
use crate::list::ListNode;
use crate::mm::{VirtAddr, VirtualPool};
use crate::sys::scheduler;
use crate::PAGE_SIZE;
use core::mem::offset_of;
use core::sync::atomic::{AtomicU16, Ordering};

/// Stack-overflow canary at the top of every TCB
pub const STACK_MAGIC: u32 = 0x2003_0807;

/// Fixed task-name length
pub const TASK_NAME_LEN: usize = 16;

/// Default priority for new user processes
pub const DEFAULT_PRIO: u8 = 31;

/// A thread entry function
pub type ThreadFn = fn(usize);

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    Waiting,
    Hanging,
    Died,
}

/// Register frame pushed by an interrupt entry: the stub's saves below
/// the CPU-pushed tail. For a user process this frame *is* the context;
/// a new process starts by `iret`ing from a synthetic one.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IntrStack {
    pub vec_no: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// popad ignores this slot
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,

    // CPU-pushed
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // only present on a privilege change
    pub esp: u32,
    pub ss: u32,
}

/// Initial kernel stack of a never-run thread: the callee-saved frame
/// `switch_to` pops, an EIP slot consumed by its `ret`, and the
/// trampoline's view of a caller frame (dead return address + args).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ThreadStack {
    pub ebp: u32,
    pub ebx: u32,
    pub edi: u32,
    pub esi: u32,
    /// Popped by `switch_to`'s ret: `kernel_thread` on first launch
    pub eip: u32,
    /// Never used; occupies the return-address slot `kernel_thread` sees
    pub unused_retaddr: u32,
    pub function: u32,
    pub func_arg: u32,
}

/// Task control block, resident at the base of the task's kernel stack.
#[repr(C)]
pub struct Tcb {
    /// Saved kernel stack pointer; `switch_to` reads and writes this
    /// through offset 0
    pub self_kstack: u32,
    pub pid: u16,
    pub status: TaskStatus,
    pub name: [u8; TASK_NAME_LEN],
    pub priority: u8,
    /// Remaining ticks in this slice
    pub ticks: u8,
    /// Lifetime ticks on the CPU
    pub elapsed_ticks: u32,
    /// Linkage in the ready queue or a waiter list
    pub general_tag: ListNode,
    /// Linkage in the all-tasks list
    pub all_list_tag: ListNode,
    /// Virtual address of this process's page directory; None for pure
    /// kernel threads
    pub page_dir: Option<VirtAddr>,
    /// Per-process user virtual pool; unbacked for kernel threads
    pub userprog_vaddr: VirtualPool,
    pub stack_magic: u32,
}

impl Tcb {
    /// An inert TCB; `init_thread` brings it to life.
    pub const fn zeroed() -> Self {
        Self {
            self_kstack: 0,
            pid: 0,
            status: TaskStatus::Died,
            name: [0; TASK_NAME_LEN],
            priority: 0,
            ticks: 0,
            elapsed_ticks: 0,
            general_tag: ListNode::new(),
            all_list_tag: ListNode::new(),
            page_dir: None,
            userprog_vaddr: VirtualPool::empty(),
            stack_magic: 0,
        }
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

/// Recover the TCB embedding a ready-queue/waiter node.
///
/// # Safety
///
/// `tag` must be the `general_tag` of a live TCB.
pub unsafe fn tcb_from_general_tag(tag: *mut ListNode) -> *mut Tcb {
    (tag as usize - offset_of!(Tcb, general_tag)) as *mut Tcb
}

static NEXT_PID: AtomicU16 = AtomicU16::new(1);

fn allocate_pid() -> u16 {
    NEXT_PID.fetch_add(1, Ordering::Relaxed)
}

/// The TCB of the task owning the CPU.
pub fn running_thread() -> *mut Tcb {
    let cur = scheduler::current();

    // The TCB sits at the base of the one-page kernel stack, so ESP
    // masked to its page must agree with the scheduler's notion
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        let esp: u32;
        unsafe {
            core::arch::asm!("mov {}, esp", out(reg) esp, options(nomem, nostack));
        }
        debug_assert_eq!(esp & !(PAGE_SIZE as u32 - 1), cur as u32);
    }

    cur
}

/// Fill in a fresh TCB. The page holding `tcb` is its kernel stack.
pub fn init_thread(tcb: &mut Tcb, name: &str, priority: u8) {
    assert!(priority > 0);

    let page_base = (tcb as *mut Tcb as usize) & !(PAGE_SIZE - 1);
    tcb.self_kstack = (page_base + PAGE_SIZE) as u32;

    tcb.pid = allocate_pid();
    tcb.status = TaskStatus::Ready;
    tcb.name = [0; TASK_NAME_LEN];
    let n = name.len().min(TASK_NAME_LEN - 1);
    tcb.name[..n].copy_from_slice(&name.as_bytes()[..n]);
    tcb.priority = priority;
    tcb.ticks = priority;
    tcb.elapsed_ticks = 0;
    tcb.general_tag = ListNode::new();
    tcb.all_list_tag = ListNode::new();
    tcb.page_dir = None;
    tcb.userprog_vaddr = VirtualPool::empty();
    tcb.stack_magic = STACK_MAGIC;
}

/// First code of every kernel thread, reached through `switch_to`'s ret.
/// The switch path runs with IF=0; re-enable before entering the thread.
#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" fn kernel_thread(function: usize, arg: usize) {
    crate::drivers::interrupts::intr_enable();
    // The slot was written from a ThreadFn in thread_create
    let function: ThreadFn = unsafe { core::mem::transmute(function) };
    function(arg);
    panic!("kernel thread returned");
}

/// Carve the initial `IntrStack` + `ThreadStack` frames into the TCB's
/// kernel stack so the first `switch_to` lands in `kernel_thread`.
///
/// # Safety
///
/// `tcb` must sit at the base of a real, writable kernel-stack page.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub unsafe fn thread_create(tcb: &mut Tcb, function: ThreadFn, arg: usize) {
    tcb.self_kstack -= core::mem::size_of::<IntrStack>() as u32;
    tcb.self_kstack -= core::mem::size_of::<ThreadStack>() as u32;

    let kstack = tcb.self_kstack as usize as *mut ThreadStack;
    unsafe {
        (*kstack).ebp = 0;
        (*kstack).ebx = 0;
        (*kstack).edi = 0;
        (*kstack).esi = 0;
        (*kstack).eip = kernel_thread as usize as u32;
        (*kstack).unused_retaddr = 0;
        (*kstack).function = function as usize as u32;
        (*kstack).func_arg = arg as u32;
    }
}

/// Create and enqueue a kernel thread.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn thread_start(
    name: &str,
    priority: u8,
    function: ThreadFn,
    arg: usize,
) -> crate::KernelResult<*mut Tcb> {
    let page = crate::mm::get_kernel_pages(1)?;
    let tcb = page.as_mut_ptr::<Tcb>();
    unsafe {
        init_thread(&mut *tcb, name, priority);
        thread_create(&mut *tcb, function, arg);
        scheduler::enqueue_new(tcb);
    }
    Ok(tcb)
}

/// Take the current task off the CPU with the given blocked state. Runs
/// the scheduler; resumes here only after `thread_unblock`.
pub fn thread_block(status: TaskStatus) {
    assert!(matches!(
        status,
        TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
    ));
    let old = intr_disable();
    let cur = running_thread();
    unsafe { (*cur).status = status };
    scheduler::schedule();
    intr_set_status(old);
}

/// Make a blocked task runnable again, at the front of the ready queue.
pub fn thread_unblock(tcb: *mut Tcb) {
    let old = intr_disable();
    unsafe {
        assert!(
            matches!(
                (*tcb).status,
                TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
            ),
            "thread_unblock: task {} is not blocked",
            (*tcb).name_str()
        );
        assert!(
            !scheduler::ready_contains(tcb),
            "thread_unblock: blocked task already on ready queue"
        );
        scheduler::requeue_front(tcb);
        (*tcb).status = TaskStatus::Ready;
    }
    intr_set_status(old);
}

/// Voluntarily give up the CPU, keeping the rest of this slice's ticks.
pub fn thread_yield() {
    let old = intr_disable();
    let cur = running_thread();
    unsafe {
        assert!(!scheduler::ready_contains(cur));
        (*cur).status = TaskStatus::Ready;
        scheduler::requeue_back(cur);
    }
    scheduler::schedule();
    intr_set_status(old);
}

// Context switch: push the old task's callee-saved registers, swap ESP
// through the TCBs' offset-0 slot, pop the new task's. The final ret
// consumes the EIP on the new stack: kernel_thread on first launch, the
// call site in schedule() afterwards.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text
    .global switch_to
switch_to:
    push esi
    push edi
    push ebx
    push ebp

    mov eax, [esp + 20]
    mov [eax], esp

    mov eax, [esp + 24]
    mov esp, [eax]

    pop ebp
    pop ebx
    pop edi
    pop esi
    ret
"#
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// See the assembly above. Entered and left with IF=0.
    pub fn switch_to(cur: *mut Tcb, next: *mut Tcb);
}
