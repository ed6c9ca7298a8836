//! Physical and virtual memory pools

use super::{PhysAddr, VirtAddr};
use crate::bitmap::Bitmap;
use crate::sync::Lock;
use crate::PAGE_SIZE;

/// A physical frame pool: one bit per 4 KiB frame, 1 = allocated.
pub struct PhysPool {
    pub bitmap: Bitmap,
    pub phy_addr_start: PhysAddr,
    pub pool_size: u32,
    pub lock: Lock,
}

impl PhysPool {
    pub const fn empty() -> Self {
        Self {
            bitmap: Bitmap::empty(),
            phy_addr_start: PhysAddr::new(0),
            pool_size: 0,
            lock: Lock::new(),
        }
    }

    /// Attach the pool's range and bitmap storage and clear the bitmap.
    ///
    /// # Safety
    ///
    /// `bits..bits+len` must be valid, exclusive storage for this pool.
    pub unsafe fn init(&mut self, start: PhysAddr, size: u32, bits: *mut u8, len: usize) {
        self.phy_addr_start = start;
        self.pool_size = size;
        unsafe { self.bitmap.reset(bits, len) };
        self.lock.init();
    }

    /// Allocate one frame; `None` when the pool is exhausted.
    ///
    /// Caller holds the pool lock.
    pub fn palloc(&mut self) -> Option<PhysAddr> {
        let bit_idx = self.bitmap.scan(1)?;
        self.bitmap.set(bit_idx, true);
        Some(PhysAddr::new(
            self.phy_addr_start.as_u32() + (bit_idx * PAGE_SIZE) as u32,
        ))
    }

    /// Number of frames currently allocated.
    pub fn used_pages(&self) -> usize {
        self.bitmap.count_set()
    }

    /// Number of frames the bitmap can hand out.
    pub fn total_pages(&self) -> usize {
        self.bitmap.bit_len()
    }
}

/// A virtual address pool: one bit per 4 KiB slot above `vaddr_start`.
pub struct VirtualPool {
    pub bitmap: Bitmap,
    pub vaddr_start: VirtAddr,
}

impl VirtualPool {
    pub const fn empty() -> Self {
        Self {
            bitmap: Bitmap::empty(),
            vaddr_start: VirtAddr::new(0),
        }
    }

    /// Attach the pool's base and bitmap storage and clear the bitmap.
    ///
    /// # Safety
    ///
    /// `bits..bits+len` must be valid, exclusive storage for this pool.
    pub unsafe fn init(&mut self, start: VirtAddr, bits: *mut u8, len: usize) {
        self.vaddr_start = start;
        unsafe { self.bitmap.reset(bits, len) };
    }

    /// Whether this pool has been given backing storage (a pure kernel
    /// thread's user pool never is).
    pub fn is_backed(&self) -> bool {
        self.bitmap.is_backed()
    }

    /// Reserve `pg_cnt` consecutive slots; `None` when no run is free.
    pub fn reserve(&mut self, pg_cnt: usize) -> Option<VirtAddr> {
        let bit_idx = self.bitmap.scan(pg_cnt)?;
        for i in bit_idx..bit_idx + pg_cnt {
            self.bitmap.set(i, true);
        }
        Some(VirtAddr::new(
            self.vaddr_start.as_u32() + (bit_idx * PAGE_SIZE) as u32,
        ))
    }

    /// Mark the slot holding the specific address `vaddr` as used.
    pub fn mark_used(&mut self, vaddr: u32) -> usize {
        let bit_idx = ((vaddr - self.vaddr_start.as_u32()) as usize) / PAGE_SIZE;
        assert!(bit_idx > 0);
        self.bitmap.set(bit_idx, true);
        bit_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phys_pool(frames: usize) -> (Vec<u8>, PhysPool) {
        let mut buf = vec![0u8; frames / 8];
        let mut pool = PhysPool::empty();
        unsafe {
            pool.init(
                PhysAddr::new(0x20_0000),
                (frames * PAGE_SIZE) as u32,
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
        (buf, pool)
    }

    #[test]
    fn test_palloc_sequential_frames() {
        let (_buf, mut pool) = phys_pool(16);
        let a = pool.palloc().unwrap();
        let b = pool.palloc().unwrap();
        assert_eq!(a.as_u32(), 0x20_0000);
        assert_eq!(b.as_u32(), 0x20_0000 + PAGE_SIZE as u32);
        assert!(a.is_page_aligned() && b.is_page_aligned());
        assert_eq!(pool.used_pages(), 2);
    }

    #[test]
    fn test_palloc_exhaustion_accounting() {
        let (_buf, mut pool) = phys_pool(16);
        let mut got = 0;
        while pool.palloc().is_some() {
            got += 1;
        }
        assert_eq!(got, 16);
        assert_eq!(pool.used_pages(), pool.total_pages());
        assert!(pool.palloc().is_none());
    }

    #[test]
    fn test_reserve_runs_do_not_overlap() {
        let mut buf = vec![0u8; 8];
        let mut pool = VirtualPool::empty();
        unsafe { pool.init(VirtAddr::new(0xC010_0000), buf.as_mut_ptr(), buf.len()) };

        let mut regions: Vec<(u32, u32)> = Vec::new();
        for n in [3usize, 1, 5, 2, 4] {
            let start = pool.reserve(n).unwrap().as_u32();
            let end = start + (n * PAGE_SIZE) as u32;
            for &(s, e) in &regions {
                assert!(end <= s || start >= e, "overlap: {start:#x}..{end:#x}");
            }
            regions.push((start, end));
        }
    }

    #[test]
    fn test_reserve_exhaustion() {
        let mut buf = vec![0u8; 2];
        let mut pool = VirtualPool::empty();
        unsafe { pool.init(VirtAddr::new(0xC010_0000), buf.as_mut_ptr(), buf.len()) };
        assert!(pool.reserve(16).is_some());
        assert!(pool.reserve(1).is_none());
    }

    #[test]
    fn test_mark_used_specific_slot() {
        let mut buf = vec![0u8; 8];
        let mut pool = VirtualPool::empty();
        unsafe { pool.init(VirtAddr::new(0xC010_0000), buf.as_mut_ptr(), buf.len()) };
        let idx = pool.mark_used(0xC010_3000);
        assert_eq!(idx, 3);
        assert!(pool.bitmap.test(3));
        // the reserved slot is skipped by later runs
        let run = pool.reserve(4).unwrap();
        assert_eq!(run.as_u32(), 0xC010_4000);
    }
}
