//! ferrox: a small teaching kernel for the 32-bit x86, built around
//! preemptive multi-process execution, two-level page tables, sleep
//! and spin locks, a blocking IDE driver, and a Unix v6-flavored
//! system call surface.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(crate::test::test_runner)]
#![reexport_test_harness_main = "test_main"]

mod bio;
mod buf;
mod console;
mod elf;
mod exec;
mod file;
mod fs;
mod ide;
mod ioapic;
mod kalloc;
mod kbd;
mod lapic;
mod log;
mod memlayout;
mod mmu;
mod mp;
mod param;
mod picirq;
mod pipe;
mod proc;
mod sleeplock;
mod spinlock;
mod start;
mod stat;
mod string;
mod syscall;
mod sysfile;
mod sysproc;
mod test;
mod timer;
mod trap;
mod uart;
mod vm;
mod x86;

use core::panic::PanicInfo;
use core::sync::atomic::Ordering;

use crate::bio::binit;
use crate::console::consoleinit;
use crate::file::fileinit;
use crate::ide::ideinit;
use crate::ioapic::ioapicinit;
use crate::kalloc::{kinit1, kinit2};
use crate::lapic::lapicinit;
use crate::memlayout::{p2v, PHYSTOP};
use crate::mp::{ismp, mpinit};
use crate::picirq::picinit;
use crate::proc::{cpuid, mycpu, pinit, scheduler, userinit};
use crate::timer::timerinit;
use crate::trap::{idtinit, tvinit};
use crate::uart::uartinit;
use crate::vm::{kvmalloc, seginit};

extern "C" {
    // First address after the kernel image, defined by kernel.ld.
    static end: [u8; 0];
}

/// Bootstrap processor starts running Rust code here, on the boot
/// stack, with the 4 MiB entry page directory installed.
#[no_mangle]
pub unsafe extern "C" fn main() -> ! {
    // The allocator can only hand out the memory the entry page
    // directory maps, and cannot use locks yet.
    kinit1(end.as_ptr() as usize, p2v(4 * 1024 * 1024)); // phys page allocator
    kvmalloc(); // kernel page table
    mpinit(); // detect other processors
    lapicinit(); // interrupt controller
    seginit(); // segment descriptors
    picinit(); // mask the 8259s
    ioapicinit(); // another interrupt controller
    consoleinit(); // console device and logger
    uartinit(); // serial port
    ::log::info!("cpu{}: starting ferrox", cpuid());
    pinit(); // process table
    tvinit(); // trap vectors
    binit(); // buffer cache
    fileinit(); // file table
    ideinit(); // disk
    if !ismp() {
        timerinit(); // uniprocessor timer
    }
    // Locking works from here on; hand over the remaining memory.
    kinit2(p2v(4 * 1024 * 1024), p2v(PHYSTOP));

    #[cfg(test)]
    test_main();

    userinit(); // first user process
    mpmain(); // finish this processor's setup
}

/// Common CPU setup, shared with any application processors that a
/// fuller boot path would start.
unsafe fn mpmain() -> ! {
    ::log::info!("cpu{}: starting", cpuid());
    idtinit(); // load idt register
    (*mycpu()).started.store(true, Ordering::SeqCst);
    scheduler(); // start running processes
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    unsafe {
        x86::cli();
    }
    console::panic_unlock();
    println!("panic: {}", info);
    console::set_panicked();
    loop {
        unsafe { x86::hlt() };
    }
}

#[cfg(test)]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    test::test_panic_handler(info)
}
