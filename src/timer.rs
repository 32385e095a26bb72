//! Intel 8253/8254 programmable interval timer, used for the clock
//! tick on a uniprocessor without a local APIC timer.

use crate::picirq::picenable;
use crate::trap::IRQ_TIMER;
use crate::x86::outb;

const IO_TIMER1: u16 = 0x040; // 8253 Timer #1

// The timer chip counts down at TIMER_FREQ Hz and interrupts at the
// end of every count; the divisor below yields roughly 100 ticks per
// second.
const TIMER_FREQ: u32 = 1193182;
const TICKS_PER_SEC: u32 = 100;
const TIMER_DIV: u32 = (TIMER_FREQ + TICKS_PER_SEC / 2) / TICKS_PER_SEC;

const TIMER_MODE: u16 = IO_TIMER1 + 3; // timer mode port
const TIMER_SEL0: u8 = 0x00; // select counter 0
const TIMER_RATEGEN: u8 = 0x04; // mode 2, rate generator
const TIMER_16BIT: u8 = 0x30; // r/w counter 16 bits, LSB first

pub unsafe fn timerinit() {
    // Interrupt 100 times/sec.
    outb(TIMER_MODE, TIMER_SEL0 | TIMER_RATEGEN | TIMER_16BIT);
    outb(IO_TIMER1, (TIMER_DIV % 256) as u8);
    outb(IO_TIMER1, (TIMER_DIV / 256) as u8);
    picenable(IRQ_TIMER);
}
