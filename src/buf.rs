use bitflags::bitflags;

use crate::fs::BSIZE;
use crate::sleeplock::SleepLock;

bitflags! {
    /// Relationship between a buffer's memory and the disk.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        const VALID = 0x2; // buffer has been read in from disk
        const DIRTY = 0x4; // buffer needs to be written to disk
    }
}

/// One cached disk block. Each buffer mirrors the contents of one
/// sector on a particular disk device.
pub struct Buf {
    pub flags: BufFlags,
    pub dev: u32,
    pub blockno: u32,
    pub lock: SleepLock,
    pub refcnt: u32,
    pub prev: *mut Buf, // LRU cache list
    pub next: *mut Buf,
    pub qnext: *mut Buf, // disk queue
    pub data: [u8; BSIZE],
}

impl Buf {
    pub const fn new() -> Self {
        Buf {
            flags: BufFlags::empty(),
            dev: 0,
            blockno: 0,
            lock: SleepLock::new("buffer"),
            refcnt: 0,
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            qnext: core::ptr::null_mut(),
            data: [0; BSIZE],
        }
    }
}
