//! Memory Management Subsystem
//!
//! Physical memory is split at boot into two bitmap-tracked frame pools
//! (kernel and user); virtual addresses come from bitmap-tracked virtual
//! pools (one shared kernel pool, one per user process). Page tables are
//! walked through the directory self-map, so the manager never tracks a
//! page table's physical address.
//!
//! # Address Space Layout
//!
//! ```text
//! 0xFFC00000 ┌──────────────────────┐
//!            │  page-table window   │  (PDE[1023] self-map)
//! 0xC0100000 ├──────────────────────┤
//!            │  kernel virtual pool │
//! 0xC0000000 ├──────────────────────┤  kernel half, mirrored into
//!            │  low 1 MiB + tables  │  every user page directory
//! 0xBFFFF000 ├──────────────────────┤
//!            │  user stack page     │
//! 0x08048000 ├──────────────────────┤
//!            │  user virtual pool   │
//! 0x00000000 └──────────────────────┘
//! ```

pub mod heap;
pub mod page;
pub mod pool;

pub use page::PageFlags;
pub use pool::{PhysPool, VirtualPool};

use crate::boot;
use crate::sys::thread;
use crate::{IrqCell, KernelError, KernelResult, PAGE_SIZE};

/// Physical address (newtype for type safety)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u32 - 1) == 0
    }
}

/// Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE as u32 - 1) == 0
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}

/// Which physical pool an allocation draws from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFlag {
    Kernel,
    User,
}

/// The boot-initialized pool set
pub struct MemPools {
    pub kernel: PhysPool,
    pub user: PhysPool,
    pub kernel_vaddr: VirtualPool,
}

static POOLS: IrqCell<MemPools> = IrqCell::new(MemPools {
    kernel: PhysPool::empty(),
    user: PhysPool::empty(),
    kernel_vaddr: VirtualPool::empty(),
});

/// Access the global pools.
///
/// # Safety
///
/// Caller must respect the pool locking discipline: physical bitmaps and
/// the kernel virtual bitmap only under the owning pool's lock.
pub unsafe fn pools() -> &'static mut MemPools {
    unsafe { &mut *POOLS.get() }
}

/// Initialize memory management from the bootloader's probe word.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn mem_init() {
    let total = boot::total_memory();
    log::debug!("probed physical memory: {} MiB", total / (1024 * 1024));
    unsafe { mem_pool_init(total, boot::MEM_BITMAP_BASE as usize as *mut u8) };
}

/// Partition physical memory into the kernel and user pools and lay their
/// bitmaps (kernel, user, kernel-virtual, in that order) at `bitmap_base`.
///
/// # Safety
///
/// `bitmap_base` must point at enough writable storage for all three
/// bitmaps, and this must run before any allocation.
pub unsafe fn mem_pool_init(all_mem: u32, bitmap_base: *mut u8) {
    let free_mem = all_mem - boot::BOOT_USED_BYTES;
    let all_free_pages = free_mem / PAGE_SIZE as u32;

    let kernel_free_pages = all_free_pages / 2;
    let user_free_pages = all_free_pages - kernel_free_pages;

    // One bit per frame; trailing pages short of a full byte are ignored
    let kernel_bitmap_len = (kernel_free_pages / 8) as usize;
    let user_bitmap_len = (user_free_pages / 8) as usize;

    let kernel_pool_start = boot::BOOT_USED_BYTES;
    let user_pool_start = kernel_pool_start + kernel_free_pages * PAGE_SIZE as u32;

    let pools = unsafe { pools() };
    unsafe {
        pools.kernel.init(
            PhysAddr::new(kernel_pool_start),
            kernel_free_pages * PAGE_SIZE as u32,
            bitmap_base,
            kernel_bitmap_len,
        );
        pools.user.init(
            PhysAddr::new(user_pool_start),
            user_free_pages * PAGE_SIZE as u32,
            bitmap_base.add(kernel_bitmap_len),
            user_bitmap_len,
        );
        pools.kernel_vaddr.init(
            VirtAddr::new(boot::KERNEL_HEAP_START),
            bitmap_base.add(kernel_bitmap_len + user_bitmap_len),
            kernel_bitmap_len,
        );
    }

    log::debug!(
        "pools: kernel {:#x}+{:#x}, user {:#x}+{:#x}",
        pools.kernel.phy_addr_start.as_u32(),
        pools.kernel.pool_size,
        pools.user.phy_addr_start.as_u32(),
        pools.user.pool_size,
    );
}

/// Reserve `pg_cnt` consecutive virtual pages from the pool selected by
/// `pf`: the shared kernel pool, or the current process's own pool.
fn vaddr_get(pf: PoolFlag, pg_cnt: usize) -> Option<VirtAddr> {
    match pf {
        PoolFlag::Kernel => unsafe { pools().kernel_vaddr.reserve(pg_cnt) },
        PoolFlag::User => {
            let cur = thread::running_thread();
            let vaddr = unsafe { (*cur).userprog_vaddr.reserve(pg_cnt) };
            if let Some(v) = vaddr {
                assert!(v.as_u32() < boot::KERNEL_SPACE_BASE - PAGE_SIZE as u32);
            }
            vaddr
        }
    }
}

fn install_mapping(vaddr: VirtAddr, paddr: PhysAddr) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        page::page_table_add(vaddr, paddr)
    };
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = (vaddr, paddr);
}

/// Allocate `pg_cnt` mapped pages from the `pf` pools.
///
/// Virtual exhaustion is an expected error. Physical exhaustion after the
/// virtual reservation would leak the pages already mapped, so it is
/// treated as fatal instead of returned.
pub fn malloc_page(pf: PoolFlag, pg_cnt: usize) -> KernelResult<VirtAddr> {
    assert!(pg_cnt > 0 && pg_cnt < 3840);

    let vaddr_start = vaddr_get(pf, pg_cnt).ok_or(KernelError::OutOfVirtualSpace)?;

    let pool = match pf {
        PoolFlag::Kernel => unsafe { &mut pools().kernel },
        PoolFlag::User => unsafe { &mut pools().user },
    };

    let mut vaddr = vaddr_start.as_u32();
    for _ in 0..pg_cnt {
        let frame = match pool.palloc() {
            Some(f) => f,
            None => panic!("malloc_page: physical pool exhausted"),
        };
        install_mapping(VirtAddr::new(vaddr), frame);
        vaddr += PAGE_SIZE as u32;
    }
    Ok(vaddr_start)
}

fn zero_pages(vaddr: VirtAddr, pg_cnt: usize) {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    unsafe {
        core::ptr::write_bytes(vaddr.as_mut_ptr::<u8>(), 0, pg_cnt * PAGE_SIZE)
    };
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    let _ = (vaddr, pg_cnt);
}

/// Allocate `pg_cnt` zeroed kernel pages.
pub fn get_kernel_pages(pg_cnt: usize) -> KernelResult<VirtAddr> {
    let pools = unsafe { pools() };
    pools.kernel.lock.acquire();
    let result = malloc_page(PoolFlag::Kernel, pg_cnt);
    if let Ok(vaddr) = result {
        zero_pages(vaddr, pg_cnt);
    }
    pools.kernel.lock.release();
    result
}

/// Allocate `pg_cnt` zeroed pages in the current process's user space.
pub fn get_user_page(pg_cnt: usize) -> KernelResult<VirtAddr> {
    let pools = unsafe { pools() };
    pools.user.lock.acquire();
    let result = malloc_page(PoolFlag::User, pg_cnt);
    if let Ok(vaddr) = result {
        zero_pages(vaddr, pg_cnt);
    }
    pools.user.lock.release();
    result
}

/// Map one frame at the specific virtual address `vaddr`.
///
/// Panics if `pf` is inconsistent with the caller: a user-pool request
/// from a task without a page directory, or a kernel-pool request from a
/// task that has one.
pub fn get_a_page(pf: PoolFlag, vaddr: u32) -> KernelResult<VirtAddr> {
    let pool = match pf {
        PoolFlag::Kernel => unsafe { &mut pools().kernel },
        PoolFlag::User => unsafe { &mut pools().user },
    };
    pool.lock.acquire();

    let cur = thread::running_thread();
    let has_page_dir = unsafe { (*cur).page_dir.is_some() };
    match (pf, has_page_dir) {
        (PoolFlag::User, true) => unsafe {
            (*cur).userprog_vaddr.mark_used(vaddr);
        },
        (PoolFlag::Kernel, false) => unsafe {
            pools().kernel_vaddr.mark_used(vaddr);
        },
        _ => panic!("get_a_page: pool flag inconsistent with page directory state"),
    }

    let result = match pool.palloc() {
        Some(frame) => {
            install_mapping(VirtAddr::new(vaddr), frame);
            Ok(VirtAddr::new(vaddr))
        }
        None => Err(KernelError::OutOfMemory),
    };

    pool.lock.release();
    result
}

/// Translate a mapped virtual address to its physical address.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn addr_v2p(vaddr: u32) -> u32 {
    unsafe { page::addr_v2p(vaddr) }
}
