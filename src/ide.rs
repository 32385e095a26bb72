//! Simple PIO-based (non-DMA) IDE driver.
//!
//! The driver keeps a FIFO of pending buffers behind one lock. At
//! most one request is ever outstanding at the hardware; it is always
//! the head of the queue. Callers block in iderw until the interrupt
//! handler marks their buffer done and wakes them; the buffer address
//! is the sleep channel, so each completion wakes exactly the waiters
//! for that buffer.

use core::ptr;

use crate::buf::{Buf, BufFlags};
use crate::fs::BSIZE;
use crate::ioapic::ioapicenable;
use crate::mp::ncpu;
use crate::param::FSSIZE;
use crate::picirq::picenable;
use crate::proc::{sleep, wakeup};
use crate::spinlock::SpinLock;
use crate::trap::IRQ_IDE;
use crate::x86::{inb, insl, outb, outsl};

const SECTOR_SIZE: usize = 512;
const IDE_BSY: u8 = 0x80;
const IDE_DRDY: u8 = 0x40;
const IDE_DF: u8 = 0x20;
const IDE_ERR: u8 = 0x01;

const IDE_CMD_READ: u8 = 0x20;
const IDE_CMD_WRITE: u8 = 0x30;
const IDE_CMD_RDMUL: u8 = 0xc4;
const IDE_CMD_WRMUL: u8 = 0xc5;

// IDEQUEUE points to the buf now being read/written to the disk.
// IDEQUEUE->qnext points to the next buf to be processed.
// Hold IDELOCK while manipulating the queue.
static mut IDELOCK: SpinLock = SpinLock::new("ide");
static mut IDEQUEUE: *mut Buf = ptr::null_mut();

static mut HAVEDISK1: bool = false;

/// Wait for the disk to become ready: poll the status port until the
/// busy bit clears and the ready bit is set.
unsafe fn idewait(checkerr: bool) -> i32 {
    let mut r: u8;
    loop {
        r = inb(0x1f7);
        if r & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
            break;
        }
    }
    if checkerr && r & (IDE_DF | IDE_ERR) != 0 {
        return -1;
    }
    0
}

pub unsafe fn ideinit() {
    // Route the disk IRQ: through the PIC on a uniprocessor, and
    // through the I/O APIC to the highest-numbered CPU otherwise.
    picenable(IRQ_IDE);
    ioapicenable(IRQ_IDE, ncpu() - 1);

    idewait(false);

    // Disk 0 must be present; the boot loader and kernel were both
    // loaded from it. Probe whether disk 1 answers on the select port.
    outb(0x1f6, 0xe0 | (1 << 4));
    for _ in 0..1000 {
        if inb(0x1f7) != 0 {
            HAVEDISK1 = true;
            break;
        }
    }

    // Switch back to disk 0.
    outb(0x1f6, 0xe0 | (0 << 4));
}

/// Start a request for b. Caller must hold IDELOCK.
unsafe fn idestart(b: *mut Buf) {
    if b.is_null() {
        panic!("idestart");
    }
    if (*b).blockno as usize >= FSSIZE {
        panic!("incorrect blockno");
    }

    let sector_per_block = BSIZE / SECTOR_SIZE;
    let sector = (*b).blockno as usize * sector_per_block;
    let read_cmd = if sector_per_block == 1 { IDE_CMD_READ } else { IDE_CMD_RDMUL };
    let write_cmd = if sector_per_block == 1 { IDE_CMD_WRITE } else { IDE_CMD_WRMUL };

    if sector_per_block > 7 {
        panic!("idestart");
    }

    idewait(false);
    outb(0x3f6, 0); // generate interrupt
    outb(0x1f2, sector_per_block as u8); // number of sectors
    outb(0x1f3, (sector & 0xff) as u8);
    outb(0x1f4, ((sector >> 8) & 0xff) as u8);
    outb(0x1f5, ((sector >> 16) & 0xff) as u8);
    outb(
        0x1f6,
        0xe0 | ((((*b).dev & 1) as u8) << 4) | (((sector >> 24) & 0x0f) as u8),
    );

    if (*b).flags.contains(BufFlags::DIRTY) {
        // A write: supply the data now; the interrupt will signal that
        // it reached the disk.
        outb(0x1f7, write_cmd);
        outsl(0x1f0, (*b).data.as_ptr(), BSIZE / 4);
    } else {
        // A read: the interrupt will signal that the data is ready and
        // the handler will pull it in.
        outb(0x1f7, read_cmd);
    }
}

/// Interrupt handler: the completed operation is the head of the
/// queue.
pub unsafe fn ideintr() {
    IDELOCK.acquire();

    let b = IDEQUEUE;
    if b.is_null() {
        IDELOCK.release();
        return;
    }
    IDEQUEUE = (*b).qnext;

    // Read data if needed.
    if !(*b).flags.contains(BufFlags::DIRTY) && idewait(true) >= 0 {
        insl(0x1f0, (*b).data.as_mut_ptr(), BSIZE / 4);
    }

    // The buffer is now in sync with the disk.
    (*b).flags |= BufFlags::VALID;
    (*b).flags &= !BufFlags::DIRTY;
    wakeup(b as usize);

    // Pass the next waiting buffer to the disk.
    if !IDEQUEUE.is_null() {
        idestart(IDEQUEUE);
    }

    IDELOCK.release();
}

/// Sync buf with disk.
/// If DIRTY is set, write buf to disk, clear DIRTY, set VALID.
/// Else if VALID is not set, read buf from disk, set VALID.
pub unsafe fn iderw(b: *mut Buf) {
    if !(*b).lock.holding() {
        panic!("iderw: buf not locked");
    }
    if (*b).flags & (BufFlags::VALID | BufFlags::DIRTY) == BufFlags::VALID {
        panic!("iderw: nothing to do");
    }
    if (*b).dev != 0 && !HAVEDISK1 {
        panic!("iderw: ide disk 1 not present");
    }

    IDELOCK.acquire();

    // Append b to the end of the queue.
    (*b).qnext = ptr::null_mut();
    let mut pp = ptr::addr_of_mut!(IDEQUEUE);
    while !(*pp).is_null() {
        pp = ptr::addr_of_mut!((**pp).qnext);
    }
    *pp = b;

    // Start the disk if the queue was empty.
    if IDEQUEUE == b {
        idestart(b);
    }

    // Wait for the request to finish. Other processes run while this
    // one sleeps; the interrupt handler records completion in the
    // buffer's flags and wakes this channel.
    while (*b).flags & (BufFlags::VALID | BufFlags::DIRTY) != BufFlags::VALID {
        sleep(b as usize, ptr::addr_of_mut!(IDELOCK));
    }

    IDELOCK.release();
}
