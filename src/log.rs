//! Write-ahead log for file-system transactions.
//!
//! A system call that will touch the disk brackets its work with
//! begin_op/end_op, and replaces every bwrite with log_write. The log
//! accumulates the modified blocks, and only when the last
//! outstanding operation ends does the group commit copy them home.
//! Recovery at boot replays whatever the header says was committed.

use core::mem::size_of;
use core::ptr;

use crate::bio::{bread, brelse, bwrite};
use crate::buf::Buf;
use crate::fs::{readsb, Superblock, BSIZE, SB};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{sleep, wakeup};
use crate::spinlock::SpinLock;

/// On-disk log header, block `start` of the log area.
#[repr(C)]
#[derive(Copy, Clone)]
struct LogHeader {
    n: i32,                  // Number of committed blocks
    block: [i32; LOGSIZE],   // Home block number for each log block
}

struct Log {
    lock: SpinLock,
    start: i32,       // First log block
    size: i32,        // Number of log blocks
    outstanding: i32, // How many FS sys calls are executing
    committing: bool, // In commit(), please wait
    dev: u32,
    lh: LogHeader, // In-memory log header
}

static mut LOG: Log = Log {
    lock: SpinLock::new("log"),
    start: 0,
    size: 0,
    outstanding: 0,
    committing: false,
    dev: 0,
    lh: LogHeader {
        n: 0,
        block: [0; LOGSIZE],
    },
};

impl Log {
    unsafe fn init(&mut self, dev: u32, sb: &Superblock) {
        if size_of::<LogHeader>() >= BSIZE {
            panic!("initlog: too big logheader");
        }
        self.start = sb.logstart as i32;
        self.size = sb.nlog as i32;
        self.dev = dev;
        self.recover_from_log();
    }

    /// Copy committed blocks from the log to their home location.
    unsafe fn install_trans(&mut self) {
        for tail in 0..self.lh.n {
            let lbuf = bread(self.dev, (self.start + tail + 1) as u32); // log block
            let dbuf = bread(self.dev, self.lh.block[tail as usize] as u32); // dst
            (*dbuf).data = (*lbuf).data;
            bwrite(dbuf);
            brelse(lbuf);
            brelse(dbuf);
        }
    }

    /// Read the log header from disk into the in-memory header.
    unsafe fn read_head(&mut self) {
        let buf = bread(self.dev, self.start as u32);
        let lh = (*buf).data.as_ptr() as *const LogHeader;
        self.lh.n = (*lh).n;
        for i in 0..self.lh.n as usize {
            self.lh.block[i] = (*lh).block[i];
        }
        brelse(buf);
    }

    /// Write the in-memory log header to disk. This is the true point
    /// at which the current transaction commits.
    unsafe fn write_head(&mut self) {
        let buf = bread(self.dev, self.start as u32);
        let hb = (*buf).data.as_mut_ptr() as *mut LogHeader;
        (*hb).n = self.lh.n;
        for i in 0..self.lh.n as usize {
            (*hb).block[i] = self.lh.block[i];
        }
        bwrite(buf);
        brelse(buf);
    }

    unsafe fn recover_from_log(&mut self) {
        self.read_head();
        self.install_trans(); // if committed, copy from log to disk
        self.lh.n = 0;
        self.write_head(); // clear the log
    }

    /// Copy modified blocks from the cache to the log area.
    unsafe fn write_log(&mut self) {
        for tail in 0..self.lh.n {
            let to = bread(self.dev, (self.start + tail + 1) as u32); // log block
            let from = bread(self.dev, self.lh.block[tail as usize] as u32); // cache block
            (*to).data = (*from).data;
            bwrite(to);
            brelse(from);
            brelse(to);
        }
    }

    unsafe fn commit(&mut self) {
        if self.lh.n > 0 {
            self.write_log(); // write modified blocks from cache to log
            self.write_head(); // write header to disk: the real commit
            self.install_trans(); // install writes to home locations
            self.lh.n = 0;
            self.write_head(); // erase the transaction from the log
        }
    }
}

/// Initialize the log from the superblock and recover any committed
/// transaction. Runs in the context of the first process.
pub unsafe fn initlog(dev: u32) {
    readsb(dev, ptr::addr_of_mut!(SB));
    LOG.init(dev, &SB);
}

/// Called at the start of each FS system call. Blocks until the log
/// has room to promise this operation MAXOPBLOCKS blocks.
pub unsafe fn begin_op() {
    LOG.lock.acquire();
    loop {
        if LOG.committing {
            sleep(
                ptr::addr_of!(LOG) as usize,
                ptr::addr_of_mut!(LOG.lock),
            );
        } else if LOG.lh.n + (LOG.outstanding + 1) * MAXOPBLOCKS as i32 > LOGSIZE as i32 {
            // This op might exhaust log space; wait for commit.
            sleep(
                ptr::addr_of!(LOG) as usize,
                ptr::addr_of_mut!(LOG.lock),
            );
        } else {
            LOG.outstanding += 1;
            LOG.lock.release();
            break;
        }
    }
}

/// Called at the end of each FS system call.
/// Commits if this was the last outstanding operation.
pub unsafe fn end_op() {
    let mut do_commit = false;

    LOG.lock.acquire();
    LOG.outstanding -= 1;
    if LOG.committing {
        panic!("log committing");
    }
    if LOG.outstanding == 0 {
        do_commit = true;
        LOG.committing = true;
    } else {
        // begin_op may be waiting for log space, and decrementing
        // outstanding has decreased the amount of reserved space.
        wakeup(ptr::addr_of!(LOG) as usize);
    }
    LOG.lock.release();

    if do_commit {
        // Call commit without locks held, since sleeping inside it is
        // not allowed with a spin lock down.
        LOG.commit();
        LOG.lock.acquire();
        LOG.committing = false;
        wakeup(ptr::addr_of!(LOG) as usize);
        LOG.lock.release();
    }
}

/// Record the block number and pin the buffer in the cache with
/// DIRTY. The block is absorbed if it is already in the current
/// transaction.
pub unsafe fn log_write(b: *mut Buf) {
    if LOG.lh.n as usize >= LOGSIZE || LOG.lh.n >= LOG.size - 1 {
        panic!("too big a transaction");
    }
    if LOG.outstanding < 1 {
        panic!("log_write outside of trans");
    }

    LOG.lock.acquire();
    let mut i = 0;
    while i < LOG.lh.n {
        if LOG.lh.block[i as usize] == (*b).blockno as i32 {
            break; // log absorption
        }
        i += 1;
    }
    LOG.lh.block[i as usize] = (*b).blockno as i32;
    if i == LOG.lh.n {
        LOG.lh.n += 1;
    }
    (*b).flags |= crate::buf::BufFlags::DIRTY; // prevent eviction
    LOG.lock.release();
}
