//! Task State Segment and the GDT entries behind Ring-3
//!
//! One static TSS serves the whole kernel. It exists for exactly one
//! hardware duty: on an interrupt out of Ring 3 the CPU loads SS0:ESP0
//! from it, so `esp0` must always point at the running process's kernel
//! stack top — `process_activate` rewrites it on every switch.

use crate::sys::thread::Tcb;
use crate::{IrqCell, PAGE_SIZE};

/// 32-bit TSS image.
#[repr(C)]
pub struct Tss {
    backlink: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    io_base: u32,
}

impl Tss {
    const fn zeroed() -> Self {
        // Safety: Tss is all plain u32 fields
        unsafe { core::mem::zeroed() }
    }
}

static TSS: IrqCell<Tss> = IrqCell::new(Tss::zeroed());

/// Point ESP0 at the top of `tcb`'s kernel-stack page.
pub fn update_esp(tcb: *mut Tcb) {
    unsafe {
        (*TSS.get()).esp0 = (tcb as usize as u32).wrapping_add(PAGE_SIZE as u32);
    }
}

/// The ESP0 currently published to the CPU.
pub fn esp0() -> u32 {
    unsafe { (*TSS.get()).esp0 }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::boot::{GDT_BASE, SELECTOR_K_STACK, SELECTOR_TSS};

    // Descriptor attribute bytes
    /// P=1, DPL=0, available 32-bit TSS
    const TSS_ATTR_LOW: u8 = 0x89;
    const TSS_ATTR_HIGH: u8 = 0x00;
    /// G=4K, D=32-bit
    const GDT_ATTR_HIGH: u8 = 0xC0;
    /// P=1, DPL=3, code, readable
    const GDT_CODE_ATTR_LOW_DPL3: u8 = 0xF8;
    /// P=1, DPL=3, data, writable
    const GDT_DATA_ATTR_LOW_DPL3: u8 = 0xF2;

    /// Number of descriptors once the TSS and DPL-3 segments are in.
    const GDT_DESC_COUNT: u16 = 7;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct GdtDesc {
        limit_low_word: u16,
        base_low_word: u16,
        base_mid_byte: u8,
        attr_low_byte: u8,
        limit_high_attr_high: u8,
        base_high_byte: u8,
    }

    fn make_gdt_desc(base: u32, limit: u32, attr_low: u8, attr_high: u8) -> GdtDesc {
        GdtDesc {
            limit_low_word: limit as u16,
            base_low_word: base as u16,
            base_mid_byte: (base >> 16) as u8,
            attr_low_byte: attr_low,
            limit_high_attr_high: ((limit >> 16) as u8 & 0x0F) + attr_high,
            base_high_byte: (base >> 24) as u8,
        }
    }

    /// Fill the TSS, forge its descriptor plus the DPL-3 code/data
    /// descriptors into the boot GDT, reload GDTR and load TR.
    pub fn init() {
        unsafe {
            let tss = &mut *TSS.get();
            *tss = Tss::zeroed();
            tss.ss0 = SELECTOR_K_STACK as u32;
            // no I/O permission bitmap: base beyond the segment limit
            tss.io_base = core::mem::size_of::<Tss>() as u32;

            let tss_base = TSS.get() as u32;
            let tss_limit = core::mem::size_of::<Tss>() as u32 - 1;

            // GDT slots: TSS at +0x20, user code +0x28, user data +0x30
            *((GDT_BASE + 0x20) as usize as *mut GdtDesc) =
                make_gdt_desc(tss_base, tss_limit, TSS_ATTR_LOW, TSS_ATTR_HIGH);
            *((GDT_BASE + 0x28) as usize as *mut GdtDesc) =
                make_gdt_desc(0, 0xFFFFF, GDT_CODE_ATTR_LOW_DPL3, GDT_ATTR_HIGH);
            *((GDT_BASE + 0x30) as usize as *mut GdtDesc) =
                make_gdt_desc(0, 0xFFFFF, GDT_DATA_ATTR_LOW_DPL3, GDT_ATTR_HIGH);

            #[repr(C, packed)]
            struct GdtPtr {
                limit: u16,
                base: u32,
            }
            let ptr = GdtPtr {
                limit: 8 * GDT_DESC_COUNT - 1,
                base: GDT_BASE,
            };
            core::arch::asm!(
                "lgdt [{}]",
                in(reg) core::ptr::addr_of!(ptr),
                options(readonly, nostack)
            );
            core::arch::asm!("ltr {0:x}", in(reg) SELECTOR_TSS, options(nomem, nostack));
        }
        log::debug!("tss loaded, selector {:#x}", SELECTOR_TSS);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::init;

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn test_tss_image_layout() {
        assert_eq!(size_of::<Tss>(), 104);
        assert_eq!(offset_of!(Tss, esp0), 4);
        assert_eq!(offset_of!(Tss, ss0), 8);
        assert_eq!(offset_of!(Tss, cr3), 28);
        assert_eq!(offset_of!(Tss, io_base), 100);
    }
}
