//! Buffer cache.
//!
//! The buffer cache is a linked list of buf structures holding cached
//! copies of disk block contents. Caching disk blocks in memory
//! reduces the number of disk reads and also provides a
//! synchronization point for disk blocks used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call bread.
//! * After changing buffer data, call bwrite to write it to disk.
//! * When done with the buffer, call brelse.
//! * Do not use the buffer after calling brelse.
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.

use core::ptr;

use crate::buf::{Buf, BufFlags};
use crate::ide::iderw;
use crate::param::NBUF;
use crate::spinlock::SpinLock;

struct Bcache {
    lock: SpinLock,
    buf: [Buf; NBUF],
    // Linked list of all buffers, through prev/next. head.next is the
    // most recently used.
    head: Buf,
}

static mut BCACHE: Bcache = Bcache {
    lock: SpinLock::new("bcache"),
    buf: {
        const B: Buf = Buf::new();
        [B; NBUF]
    },
    head: Buf::new(),
};

pub unsafe fn binit() {
    // Create the linked list of buffers.
    let head = ptr::addr_of_mut!(BCACHE.head);
    (*head).prev = head;
    (*head).next = head;
    for b in BCACHE.buf.iter_mut() {
        b.next = (*head).next;
        b.prev = head;
        (*(*head).next).prev = b;
        (*head).next = b;
    }
}

/// Look through the buffer cache for block blockno on device dev.
/// If not found, allocate a buffer. In either case, return a buffer
/// whose sleep lock is held.
unsafe fn bget(dev: u32, blockno: u32) -> *mut Buf {
    BCACHE.lock.acquire();

    // Is the block already cached?
    let head = ptr::addr_of_mut!(BCACHE.head);
    let mut b = (*head).next;
    while b != head {
        if (*b).dev == dev && (*b).blockno == blockno {
            (*b).refcnt += 1;
            BCACHE.lock.release();
            (*b).lock.acquire();
            return b;
        }
        b = (*b).next;
    }

    // Not cached; recycle the least recently used unused buffer.
    // Even a clean buffer cannot be recycled while dirty: the log
    // still counts on it reaching the disk.
    b = (*head).prev;
    while b != head {
        if (*b).refcnt == 0 && !(*b).flags.contains(BufFlags::DIRTY) {
            (*b).dev = dev;
            (*b).blockno = blockno;
            (*b).flags = BufFlags::empty();
            (*b).refcnt = 1;
            BCACHE.lock.release();
            (*b).lock.acquire();
            return b;
        }
        b = (*b).prev;
    }
    panic!("bget: no buffers");
}

/// Return a locked buf with the contents of the indicated block.
pub unsafe fn bread(dev: u32, blockno: u32) -> *mut Buf {
    let b = bget(dev, blockno);
    if !(*b).flags.contains(BufFlags::VALID) {
        iderw(b);
    }
    b
}

/// Write b's contents to disk. Must hold b's sleep lock.
pub unsafe fn bwrite(b: *mut Buf) {
    if !(*b).lock.holding() {
        panic!("bwrite");
    }
    (*b).flags |= BufFlags::DIRTY;
    iderw(b);
}

/// Release a locked buffer; move it to the head of the MRU list.
pub unsafe fn brelse(b: *mut Buf) {
    if !(*b).lock.holding() {
        panic!("brelse");
    }

    (*b).lock.release();

    BCACHE.lock.acquire();
    (*b).refcnt -= 1;
    if (*b).refcnt == 0 {
        // No one is waiting for it.
        (*(*b).next).prev = (*b).prev;
        (*(*b).prev).next = (*b).next;
        let head = ptr::addr_of_mut!(BCACHE.head);
        (*b).next = (*head).next;
        (*b).prev = head;
        (*(*head).next).prev = b;
        (*head).next = b;
    }
    BCACHE.lock.release();
}
