//! Intel 8250/16550 serial port (COM1), driven over port I/O.

use crate::console::consoleintr;
use crate::ioapic::ioapicenable;
use crate::lapic::microdelay;
use crate::picirq::picenable;
use crate::trap::IRQ_COM1;
use crate::x86::{inb, outb};

const COM1: u16 = 0x3f8;

static mut UART_PRESENT: bool = false;

pub unsafe fn uartinit() {
    // Turn off the FIFO.
    outb(COM1 + 2, 0);

    // 9600 baud, 8 data bits, 1 stop bit, parity off.
    outb(COM1 + 3, 0x80); // unlock divisor
    outb(COM1 + 0, (115200u32 / 9600) as u8);
    outb(COM1 + 1, 0);
    outb(COM1 + 3, 0x03); // lock divisor, 8 data bits
    outb(COM1 + 4, 0);
    outb(COM1 + 1, 0x01); // enable receive interrupts

    // If the status is 0xFF, no serial port.
    if inb(COM1 + 5) == 0xFF {
        return;
    }
    UART_PRESENT = true;

    // Acknowledge any pre-existing interrupt condition, then enable
    // the IRQ.
    inb(COM1 + 2);
    inb(COM1 + 0);
    picenable(IRQ_COM1);
    ioapicenable(IRQ_COM1, 0);
}

pub unsafe fn uartputc(c: u8) {
    if !UART_PRESENT {
        return;
    }
    // Wait for the transmit holding register to drain.
    for _ in 0..128 {
        if inb(COM1 + 5) & 0x20 != 0 {
            break;
        }
        microdelay(10);
    }
    outb(COM1 + 0, c);
}

unsafe fn uartgetc() -> i32 {
    if !UART_PRESENT {
        return -1;
    }
    if inb(COM1 + 5) & 0x01 == 0 {
        return -1;
    }
    inb(COM1 + 0) as i32
}

pub unsafe fn uartintr() {
    consoleintr(uartgetc);
}
