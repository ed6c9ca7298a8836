//! Boot handoff ABI
//!
//! The bootloader leaves the CPU in 32-bit protected mode with a
//! provisional GDT at `0xC0000900`, paging enabled with the low 1 MiB and
//! the kernel image mapped into the `0xC0000000` window, the main kernel
//! stack at `0xC009F000`, interrupts disabled, and the probed physical
//! memory size written at physical `0xB00`. Everything the kernel assumes
//! about that environment is named here.

/// Physical address of the bootloader's memory-size probe word.
pub const MEM_PROBE_ADDR: u32 = 0xB00;

/// Physical address of the boot-time kernel page directory.
pub const KERNEL_PAGE_DIR_PHYS: u32 = 0x0010_0000;

/// Memory consumed before the pools begin: low 1 MiB plus 1 MiB of
/// boot-time page tables (1 PD + 255 PTs).
pub const BOOT_USED_BYTES: u32 = 0x0020_0000;

/// Virtual base of the pool occupancy bitmaps.
pub const MEM_BITMAP_BASE: u32 = 0xC009_A000;

/// Base of the kernel's virtual allocation pool: 3 GiB plus the low MiB
/// already occupied by the kernel image.
pub const KERNEL_HEAP_START: u32 = 0xC010_0000;

/// Start of the kernel's half of every address space.
pub const KERNEL_SPACE_BASE: u32 = 0xC000_0000;

/// Top of the boot (main thread) kernel stack; its TCB page sits below.
pub const MAIN_STACK_TOP: u32 = 0xC009_F000;

/// Virtual base of the GDT installed by the bootloader.
pub const GDT_BASE: u32 = 0xC000_0900;

// Segment selectors. Index order in the GDT: null, kernel code, kernel
// data (also stack), video, TSS, user code, user data.

/// Kernel code selector (ring 0)
pub const SELECTOR_K_CODE: u16 = 1 << 3;
/// Kernel data/stack selector (ring 0)
pub const SELECTOR_K_DATA: u16 = 2 << 3;
/// Kernel stack selector, aliased to the data segment
pub const SELECTOR_K_STACK: u16 = SELECTOR_K_DATA;
/// TSS selector, at GDT offset 0x20
pub const SELECTOR_TSS: u16 = 4 << 3;
/// User code selector (ring 3)
pub const SELECTOR_U_CODE: u16 = (5 << 3) | 3;
/// User data/stack selector (ring 3)
pub const SELECTOR_U_DATA: u16 = (6 << 3) | 3;

/// Read the bootloader's probed total physical memory, in bytes.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn total_memory() -> u32 {
    // The low 1 MiB is identity-mapped at boot, so the physical probe
    // address is also a valid virtual address.
    unsafe { core::ptr::read_volatile(MEM_PROBE_ADDR as *const u32) }
}
