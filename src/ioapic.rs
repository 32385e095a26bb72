//! The I/O APIC distributes device interrupts to local APICs. It sits
//! at a fixed physical address with an indirect register window: an
//! index register and a data register.

use volatile::Volatile;

use crate::trap::T_IRQ0;

const IOAPIC: usize = 0xFEC00000; // Default physical address of IO APIC

const REG_ID: u32 = 0x00; // Register index: ID
const REG_VER: u32 = 0x01; // Register index: version
const REG_TABLE: u32 = 0x10; // Redirection table base

// The redirection table starts at REG_TABLE and uses two registers to
// configure each interrupt. The first (low) register holds the
// vector and flags; the second (high) register holds a bitmask of
// permitted destination CPUs.
const INT_DISABLED: u32 = 0x00010000; // Interrupt disabled

/// I/O APIC id reported by the MP tables.
pub static mut IOAPICID: u8 = 0;

#[repr(C)]
struct IoapicMmio {
    reg: Volatile<u32>,
    pad: [u32; 3],
    data: Volatile<u32>,
}

unsafe fn ioapic() -> *mut IoapicMmio {
    IOAPIC as *mut IoapicMmio
}

unsafe fn ioapicread(reg: u32) -> u32 {
    (*ioapic()).reg.write(reg);
    (*ioapic()).data.read()
}

unsafe fn ioapicwrite(reg: u32, data: u32) {
    (*ioapic()).reg.write(reg);
    (*ioapic()).data.write(data);
}

pub unsafe fn ioapicinit() {
    let maxintr = (ioapicread(REG_VER) >> 16) & 0xFF;
    let id = (ioapicread(REG_ID) >> 24) as u8;
    if id != IOAPICID {
        log::warn!("ioapicinit: id isn't equal to ioapicid; not a MP");
    }

    // Mark all interrupts edge-triggered, active high, disabled, and
    // not routed to any CPU.
    for i in 0..=maxintr {
        ioapicwrite(REG_TABLE + 2 * i, INT_DISABLED | (T_IRQ0 + i));
        ioapicwrite(REG_TABLE + 2 * i + 1, 0);
    }
}

/// Route irq to the given CPU, edge-triggered and active high.
pub unsafe fn ioapicenable(irq: u32, cpunum: usize) {
    ioapicwrite(REG_TABLE + 2 * irq, T_IRQ0 + irq);
    ioapicwrite(REG_TABLE + 2 * irq + 1, (cpunum as u32) << 24);
}
