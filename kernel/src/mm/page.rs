//! Two-level page tables and the directory self-map
//!
//! PDE[1023] points at the page directory itself, which pins every page
//! table into the top 4 MiB of the address space at a predictable
//! address: the PTE for virtual address `v` lives at
//! `0xFFC00000 | (pde_index << 12) | (pte_index << 2)` and the PDE at
//! `0xFFFFF000 | (pde_index << 2)`. The walkers below never need a page
//! table's physical address.

use bitflags::bitflags;

#[cfg(all(target_arch = "x86", target_os = "none"))]
use super::{PhysAddr, VirtAddr};

bitflags! {
    /// PDE/PTE flag bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Entry is present
        const PRESENT = 1 << 0;
        /// Writable
        const WRITABLE = 1 << 1;
        /// Accessible from ring 3
        const USER = 1 << 2;
    }
}

impl PageFlags {
    /// The uniform mapping attributes used for every installed page.
    /// Callers are responsible for never handing kernel addresses mapped
    /// this way to user space.
    pub const DEFAULT: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// Index into the page directory for `vaddr`.
pub const fn pde_index(vaddr: u32) -> usize {
    ((vaddr & 0xFFC0_0000) >> 22) as usize
}

/// Index into the page table for `vaddr`.
pub const fn pte_index(vaddr: u32) -> usize {
    ((vaddr & 0x003F_F000) >> 12) as usize
}

/// Virtual address of the PTE covering `vaddr`, via the self-map.
pub const fn pte_vaddr(vaddr: u32) -> u32 {
    0xFFC0_0000 | ((vaddr & 0xFFC0_0000) >> 10) | ((pte_index(vaddr) as u32) << 2)
}

/// Virtual address of the PDE covering `vaddr`, via the self-map.
pub const fn pde_vaddr(vaddr: u32) -> u32 {
    0xFFFF_F000 | ((pde_index(vaddr) as u32) << 2)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::{PAGE_SIZE, mm};

    /// A kernel frame to host a new page table. Takes the kernel pool
    /// lock itself; the lock is recursive, so this nests under
    /// `get_kernel_pages`.
    fn alloc_page_table_frame() -> PhysAddr {
        let pools = unsafe { mm::pools() };
        pools.kernel.lock.acquire();
        let frame = pools.kernel.palloc();
        pools.kernel.lock.release();
        match frame {
            Some(f) => f,
            None => panic!("page_table_add: no kernel frame for page table"),
        }
    }

    /// Install the mapping `vaddr -> paddr`.
    ///
    /// # Safety
    ///
    /// `paddr` must be an owned frame and `vaddr` must not already be
    /// mapped (an existing PTE is an invariant violation and panics).
    pub unsafe fn page_table_add(vaddr: VirtAddr, paddr: PhysAddr) {
        let flags = PageFlags::DEFAULT.bits();
        let pde = pde_vaddr(vaddr.as_u32()) as *mut u32;
        let pte = pte_vaddr(vaddr.as_u32()) as *mut u32;

        unsafe {
            if *pde & PageFlags::PRESENT.bits() != 0 {
                assert!(
                    *pte & PageFlags::PRESENT.bits() == 0,
                    "page_table_add: pte already present for {:#x}",
                    vaddr.as_u32()
                );
                *pte = paddr.as_u32() | flags;
            } else {
                let table_frame = alloc_page_table_frame();
                *pde = table_frame.as_u32() | flags;
                // Zero the fresh table through its self-map window before
                // the first PTE goes in
                core::ptr::write_bytes((pte as u32 & 0xFFFF_F000) as *mut u8, 0, PAGE_SIZE);
                assert!(*pte & PageFlags::PRESENT.bits() == 0);
                *pte = paddr.as_u32() | flags;
            }
        }
    }

    /// Translate a mapped virtual address to its physical address.
    ///
    /// # Safety
    ///
    /// `vaddr` must be mapped in the active address space.
    pub unsafe fn addr_v2p(vaddr: u32) -> u32 {
        let pte = pte_vaddr(vaddr) as *const u32;
        unsafe { (*pte & 0xFFFF_F000) + (vaddr & 0xFFF) }
    }

    /// Load CR3 with a page-directory physical address.
    pub fn load_cr3(page_dir_phys: u32) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) page_dir_phys, options(nostack));
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::{addr_v2p, load_cr3, page_table_add};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        let v = 0xC010_3123u32;
        assert_eq!(pde_index(v), 0x300);
        assert_eq!(pte_index(v), 0x103);
    }

    #[test]
    fn test_self_map_addresses() {
        // Every formula expands to the canonical self-map encoding
        let v = 0xC010_0000u32;
        assert_eq!(pde_vaddr(v), 0xFFFF_F000 | (0x300 << 2));
        assert_eq!(pte_vaddr(v), 0xFFC0_0000 | (0x300 << 12) | (0x100 << 2));

        // The page directory's own window
        assert_eq!(pde_vaddr(0), 0xFFFF_F000);
        assert_eq!(pte_vaddr(0), 0xFFC0_0000);
    }

    #[test]
    fn test_pte_vaddr_spreads_by_directory_entry() {
        // Each 4 MiB region gets its own 4 KiB table window
        let a = pte_vaddr(0x0000_0000);
        let b = pte_vaddr(0x0040_0000);
        assert_eq!(b - a, 0x1000);
    }

    #[test]
    fn test_default_flags() {
        assert_eq!(PageFlags::DEFAULT.bits(), 0b111);
    }
}
