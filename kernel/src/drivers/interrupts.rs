//! Interrupt layer
//!
//! Builds the IDT, programs the cascaded 8259A PICs, and dispatches every
//! vector through a table of Rust handlers. The assembly entry stubs save
//! the full register frame (the `IntrStack` layout in `sys::thread`), send
//! EOI, and call `IDT_TABLE[vec]`; `intr_exit` unwinds that frame with
//! `iretd` and doubles as the launch path into Ring 3.

use crate::IrqCell;
use bitflags::bitflags;

/// Number of assembly entry stubs: CPU exceptions plus both PIC ranges.
pub const STUB_COUNT: usize = 0x30;

/// IDT length: the stub range plus the syscall gate at 0x80.
pub const IDT_GATE_COUNT: usize = 0x81;

/// Interrupt vector numbers
pub mod vectors {
    pub const DIVIDE_ERROR: u8 = 0;
    pub const DEBUG: u8 = 1;
    pub const NMI: u8 = 2;
    pub const BREAKPOINT: u8 = 3;
    pub const OVERFLOW: u8 = 4;
    pub const BOUND_RANGE: u8 = 5;
    pub const INVALID_OPCODE: u8 = 6;
    pub const DEVICE_NOT_AVAILABLE: u8 = 7;
    pub const DOUBLE_FAULT: u8 = 8;
    pub const INVALID_TSS: u8 = 10;
    pub const SEGMENT_NOT_PRESENT: u8 = 11;
    pub const STACK_SEGMENT: u8 = 12;
    pub const GENERAL_PROTECTION: u8 = 13;
    pub const PAGE_FAULT: u8 = 14;

    // Hardware interrupts after PIC remap
    pub const PIC_TIMER: u8 = 0x20;
    pub const PIC_KEYBOARD: u8 = 0x21;
    pub const PIC_SPURIOUS_MASTER: u8 = 0x27;
    pub const PIC_SPURIOUS_SLAVE: u8 = 0x2F;

    pub const SYSCALL: u8 = 0x80;
}

bitflags! {
    /// EFLAGS bits the kernel cares about. IOPL is always left at 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        /// Reserved bit 1, must be set in any EFLAGS image
        const MBS = 1 << 1;
        /// Interrupt enable
        const IF = 1 << 9;
    }
}

/// Interrupt flag state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrStatus {
    /// IF = 0
    Off,
    /// IF = 1
    On,
}

// ============================================================================
// Interrupt-flag API
// ============================================================================

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod flag {
    use super::{EFlags, IntrStatus};
    use core::arch::asm;

    /// Read IF from EFLAGS. Always reads the register, never a cached copy.
    pub fn intr_get_status() -> IntrStatus {
        let eflags: u32;
        unsafe {
            asm!("pushfd", "pop {}", out(reg) eflags, options(preserves_flags));
        }
        if EFlags::from_bits_truncate(eflags).contains(EFlags::IF) {
            IntrStatus::On
        } else {
            IntrStatus::Off
        }
    }

    /// Enable interrupts, returning the previous state.
    pub fn intr_enable() -> IntrStatus {
        let old = intr_get_status();
        if old == IntrStatus::Off {
            unsafe { asm!("sti", options(nomem, nostack)) };
        }
        old
    }

    /// Disable interrupts, returning the previous state.
    pub fn intr_disable() -> IntrStatus {
        let old = intr_get_status();
        if old == IntrStatus::On {
            unsafe { asm!("cli", options(nomem, nostack)) };
        }
        old
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod flag {
    //! Hosted builds model IF per test thread so the kernel's interrupt
    //! discipline (every "requires IF=0" assertion) stays observable in
    //! tests without cross-test interference.

    use super::IntrStatus;
    use core::cell::Cell;

    std::thread_local! {
        static SIM_IF: Cell<bool> = const { Cell::new(false) };
    }

    pub fn intr_get_status() -> IntrStatus {
        if SIM_IF.with(|f| f.get()) {
            IntrStatus::On
        } else {
            IntrStatus::Off
        }
    }

    pub fn intr_enable() -> IntrStatus {
        if SIM_IF.with(|f| f.replace(true)) {
            IntrStatus::On
        } else {
            IntrStatus::Off
        }
    }

    pub fn intr_disable() -> IntrStatus {
        if SIM_IF.with(|f| f.replace(false)) {
            IntrStatus::On
        } else {
            IntrStatus::Off
        }
    }
}

pub use flag::{intr_disable, intr_enable, intr_get_status};

/// Set the interrupt flag to `status`, returning the previous state.
pub fn intr_set_status(status: IntrStatus) -> IntrStatus {
    match status {
        IntrStatus::On => intr_enable(),
        IntrStatus::Off => intr_disable(),
    }
}

// ============================================================================
// Dispatch table
// ============================================================================

/// A vector handler, called by the entry stub with the vector number.
pub type IntrHandler = extern "C" fn(u32);

/// Rust-level handlers, indexed by vector; the stubs call through here.
static IDT_TABLE: IrqCell<[IntrHandler; STUB_COUNT]> =
    IrqCell::new([general_intr_handler; STUB_COUNT]);

/// Install `handler` for `vec`, replacing the generic handler.
pub fn register_handler(vec: u8, handler: IntrHandler) {
    assert!((vec as usize) < STUB_COUNT);
    let old = intr_disable();
    unsafe { (*IDT_TABLE.get())[vec as usize] = handler };
    intr_set_status(old);
}

/// Symbolic name for an exception vector.
pub fn exception_name(vec: u32) -> &'static str {
    const NAMES: [&str; 20] = [
        "#DE Divide Error",
        "#DB Debug",
        "NMI Interrupt",
        "#BP Breakpoint",
        "#OF Overflow",
        "#BR BOUND Range Exceeded",
        "#UD Invalid Opcode",
        "#NM Device Not Available",
        "#DF Double Fault",
        "Coprocessor Segment Overrun",
        "#TS Invalid TSS",
        "#NP Segment Not Present",
        "#SS Stack-Segment Fault",
        "#GP General Protection",
        "#PF Page Fault",
        "Reserved",
        "#MF x87 FPU Error",
        "#AC Alignment Check",
        "#MC Machine Check",
        "#XM SIMD Exception",
    ];
    match vec {
        0..=19 => NAMES[vec as usize],
        0x20..=0x2F => "external interrupt",
        _ => "unknown",
    }
}

/// Default handler for unregistered vectors.
extern "C" fn general_intr_handler(vec: u32) {
    // 8259A quirk: IRQ7/IRQ15 raise spurious vectors with nothing behind
    // them; drop silently.
    if vec == vectors::PIC_SPURIOUS_MASTER as u32 || vec == vectors::PIC_SPURIOUS_SLAVE as u32 {
        return;
    }
    log::error!("unhandled interrupt {:#04x}: {}", vec, exception_name(vec));
}

// ============================================================================
// IDT and PIC (bare metal)
// ============================================================================

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use super::*;
    use crate::boot::SELECTOR_K_CODE;
    use crate::io::outb;

    const PIC_M_CTRL: u16 = 0x20;
    const PIC_M_DATA: u16 = 0x21;
    const PIC_S_CTRL: u16 = 0xA0;
    const PIC_S_DATA: u16 = 0xA1;

    /// P=1, DPL=0, 32-bit interrupt gate
    const IDT_DESC_ATTR_DPL0: u8 = 0x8E;
    /// P=1, DPL=3, 32-bit interrupt gate (syscall)
    const IDT_DESC_ATTR_DPL3: u8 = 0xEE;

    /// Gate descriptor: low/high offset halves around selector, zero
    /// dcount and the attribute byte.
    #[repr(C, packed)]
    #[derive(Clone, Copy)]
    struct GateDesc {
        offset_low: u16,
        selector: u16,
        dcount: u8,
        attr: u8,
        offset_high: u16,
    }

    impl GateDesc {
        const fn missing() -> Self {
            Self {
                offset_low: 0,
                selector: 0,
                dcount: 0,
                attr: 0,
                offset_high: 0,
            }
        }

        fn new(handler: u32, attr: u8) -> Self {
            Self {
                offset_low: handler as u16,
                selector: SELECTOR_K_CODE,
                dcount: 0,
                attr,
                offset_high: (handler >> 16) as u16,
            }
        }
    }

    static IDT: IrqCell<[GateDesc; IDT_GATE_COUNT]> =
        IrqCell::new([GateDesc::missing(); IDT_GATE_COUNT]);

    extern "C" {
        /// Addresses of the entry stubs, built alongside them in assembly.
        static INTR_ENTRY_TABLE: [u32; STUB_COUNT];
        fn syscall_entry();
    }

    /// Remap the PICs and mask everything but the cascade line and IRQ0.
    fn pic_init() {
        unsafe {
            // Master ICW1: edge-triggered, cascaded, ICW4 follows
            outb(PIC_M_CTRL, 0x11);
            // Master ICW2: IR0..IR7 -> 0x20..0x27
            outb(PIC_M_DATA, 0x20);
            // Master ICW3: slave on IR2
            outb(PIC_M_DATA, 0x04);
            // Master ICW4: 8086 mode, manual EOI
            outb(PIC_M_DATA, 0x01);

            outb(PIC_S_CTRL, 0x11);
            // Slave ICW2: IR8..IR15 -> 0x28..0x2F
            outb(PIC_S_DATA, 0x28);
            // Slave ICW3: cascade identity 2
            outb(PIC_S_DATA, 0x02);
            outb(PIC_S_DATA, 0x01);

            // Only IRQ0 (timer) unmasked; drivers unmask their own lines
            outb(PIC_M_DATA, 0xFE);
            outb(PIC_S_DATA, 0xFF);
        }
        log::debug!("pic remapped to 0x20/0x28");
    }

    /// Clear the mask bit for one IRQ line.
    pub fn unmask_irq(irq: u8) {
        assert!(irq < 16);
        unsafe {
            if irq < 8 {
                let mask = crate::io::inb(PIC_M_DATA);
                outb(PIC_M_DATA, mask & !(1 << irq));
            } else {
                let mask = crate::io::inb(PIC_S_DATA);
                outb(PIC_S_DATA, mask & !(1 << (irq - 8)));
            }
        }
    }

    /// Build the gates, load IDTR, program the PICs.
    pub fn init() {
        unsafe {
            let idt = &mut *IDT.get();
            for (vec, gate) in idt.iter_mut().take(STUB_COUNT).enumerate() {
                *gate = GateDesc::new(INTR_ENTRY_TABLE[vec], IDT_DESC_ATTR_DPL0);
            }
            idt[vectors::SYSCALL as usize] =
                GateDesc::new(syscall_entry as usize as u32, IDT_DESC_ATTR_DPL3);

            #[repr(C, packed)]
            struct IdtPtr {
                limit: u16,
                base: u32,
            }
            let ptr = IdtPtr {
                limit: (core::mem::size_of::<GateDesc>() * IDT_GATE_COUNT - 1) as u16,
                base: IDT.get() as u32,
            };
            core::arch::asm!(
                "lidt [{}]",
                in(reg) core::ptr::addr_of!(ptr),
                options(readonly, nostack)
            );
        }

        pic_init();
        log::debug!("idt loaded: {} gates", IDT_GATE_COUNT);
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::{init, unmask_irq};

// Entry stubs. Each pushes a placeholder error code when the CPU did not,
// saves segment and general registers in the `IntrStack` layout, sends
// EOI to both PICs, and calls the Rust handler with the vector number.
// `intr_exit` is shared: it is also the iret springboard that first drops
// a new user process into Ring 3.
#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    r#"
.macro VECTOR vec, has_err
    .section .text
intr_entry_\vec:
    .if \has_err == 0
    push 0
    .endif
    push ds
    push es
    push fs
    push gs
    pushad

    mov al, 0x20
    out 0xa0, al
    out 0x20, al

    push \vec
    call dword ptr [{idt_table} + \vec * 4]
    jmp intr_exit

    .section .data
    .long intr_entry_\vec
.endm

    .section .data
    .align 4
    .global INTR_ENTRY_TABLE
INTR_ENTRY_TABLE:

    VECTOR 0, 0
    VECTOR 1, 0
    VECTOR 2, 0
    VECTOR 3, 0
    VECTOR 4, 0
    VECTOR 5, 0
    VECTOR 6, 0
    VECTOR 7, 0
    VECTOR 8, 1
    VECTOR 9, 0
    VECTOR 10, 1
    VECTOR 11, 1
    VECTOR 12, 1
    VECTOR 13, 1
    VECTOR 14, 1
    VECTOR 15, 0
    VECTOR 16, 0
    VECTOR 17, 1
    VECTOR 18, 0
    VECTOR 19, 0
    VECTOR 20, 0
    VECTOR 21, 0
    VECTOR 22, 0
    VECTOR 23, 0
    VECTOR 24, 0
    VECTOR 25, 0
    VECTOR 26, 0
    VECTOR 27, 0
    VECTOR 28, 0
    VECTOR 29, 0
    VECTOR 30, 0
    VECTOR 31, 0
    VECTOR 32, 0
    VECTOR 33, 0
    VECTOR 34, 0
    VECTOR 35, 0
    VECTOR 36, 0
    VECTOR 37, 0
    VECTOR 38, 0
    VECTOR 39, 0
    VECTOR 40, 0
    VECTOR 41, 0
    VECTOR 42, 0
    VECTOR 43, 0
    VECTOR 44, 0
    VECTOR 45, 0
    VECTOR 46, 0
    VECTOR 47, 0

    .section .text
    .global intr_exit
intr_exit:
    add esp, 4
    popad
    pop gs
    pop fs
    pop es
    pop ds
    add esp, 4
    iretd

    .global syscall_entry
syscall_entry:
    push 0
    push ds
    push es
    push fs
    push gs
    pushad
    push 0x80

    push edx
    push ecx
    push ebx
    push eax
    call {syscall_dispatch}
    add esp, 16

    mov [esp + 8*4], eax
    jmp intr_exit
"#,
    idt_table = sym IDT_TABLE,
    syscall_dispatch = sym crate::sys::syscall::syscall_dispatch,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_roundtrip() {
        intr_disable();
        assert_eq!(intr_get_status(), IntrStatus::Off);
        let prev = intr_enable();
        assert_eq!(prev, IntrStatus::Off);
        assert_eq!(intr_get_status(), IntrStatus::On);
        let prev = intr_set_status(IntrStatus::Off);
        assert_eq!(prev, IntrStatus::On);
        assert_eq!(intr_get_status(), IntrStatus::Off);
    }

    #[test]
    fn test_exception_names() {
        assert_eq!(exception_name(0), "#DE Divide Error");
        assert_eq!(exception_name(14), "#PF Page Fault");
        assert_eq!(exception_name(0x21), "external interrupt");
        assert_eq!(exception_name(0x99), "unknown");
    }
}
