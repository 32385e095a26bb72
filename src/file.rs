//! The system-wide table of open files, and the device switch.

use core::ptr;

use crate::fs::{ilock, iput, iunlock, readi, stati, writei, Inode};
use crate::fs::BSIZE;
use crate::log::{begin_op, end_op};
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::{pipeclose, piperead, pipewrite, Pipe};
use crate::spinlock::SpinLock;
use crate::stat::Stat;

#[derive(Copy, Clone, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum FdType {
    FD_NONE,
    FD_PIPE,
    FD_INODE,
}

pub struct File {
    pub typ: FdType,
    pub ref_count: i32,
    pub readable: bool,
    pub writable: bool,
    pub pipe: *mut Pipe,
    pub ip: *mut Inode,
    pub off: u32,
}

impl File {
    const fn new() -> Self {
        File {
            typ: FdType::FD_NONE,
            ref_count: 0,
            readable: false,
            writable: false,
            pipe: ptr::null_mut(),
            ip: ptr::null_mut(),
            off: 0,
        }
    }
}

/// Device read/write functions, indexed by major device number.
/// Inode reads and writes on a T_DEV inode are routed through here.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<unsafe fn(*mut Inode, *mut u8, i32) -> i32>,
    pub write: Option<unsafe fn(*mut Inode, *const u8, i32) -> i32>,
}

pub static mut DEVSW: [Devsw; NDEV] = [Devsw {
    read: None,
    write: None,
}; NDEV];

/// Major device number of the console.
pub const CONSOLE: usize = 1;

struct Ftable {
    lock: SpinLock,
    file: [File; NFILE],
}

static mut FTABLE: Ftable = Ftable {
    lock: SpinLock::new("ftable"),
    file: {
        const F: File = File::new();
        [F; NFILE]
    },
};

pub unsafe fn fileinit() {
    for f in FTABLE.file.iter_mut() {
        f.typ = FdType::FD_NONE;
        f.ref_count = 0;
    }
}

/// Allocate a file structure.
pub unsafe fn filealloc() -> *mut File {
    FTABLE.lock.acquire();
    for f in FTABLE.file.iter_mut() {
        if f.ref_count == 0 {
            f.ref_count = 1;
            FTABLE.lock.release();
            return f;
        }
    }
    FTABLE.lock.release();
    ptr::null_mut()
}

/// Increment the reference count for file f.
pub unsafe fn filedup(f: *mut File) -> *mut File {
    FTABLE.lock.acquire();
    if (*f).ref_count < 1 {
        panic!("filedup");
    }
    (*f).ref_count += 1;
    FTABLE.lock.release();
    f
}

/// Close file f: decrement the refcount and release the underlying
/// pipe end or inode when it drops to zero.
pub unsafe fn fileclose(f: *mut File) {
    FTABLE.lock.acquire();
    if (*f).ref_count < 1 {
        panic!("fileclose");
    }
    (*f).ref_count -= 1;
    if (*f).ref_count > 0 {
        FTABLE.lock.release();
        return;
    }
    let typ = (*f).typ;
    let pipe = (*f).pipe;
    let ip = (*f).ip;
    let writable = (*f).writable;
    (*f).ref_count = 0;
    (*f).typ = FdType::FD_NONE;
    FTABLE.lock.release();

    match typ {
        FdType::FD_PIPE => pipeclose(pipe, writable),
        FdType::FD_INODE => {
            begin_op();
            iput(ip);
            end_op();
        }
        FdType::FD_NONE => {}
    }
}

/// Get metadata about file f.
pub unsafe fn filestat(f: *mut File, st: *mut Stat) -> i32 {
    if (*f).typ == FdType::FD_INODE {
        ilock((*f).ip);
        stati((*f).ip, st);
        iunlock((*f).ip);
        return 0;
    }
    -1
}

/// Read from file f.
pub unsafe fn fileread(f: *mut File, addr: *mut u8, n: i32) -> i32 {
    if !(*f).readable {
        return -1;
    }
    match (*f).typ {
        FdType::FD_PIPE => piperead((*f).pipe, addr, n as usize),
        FdType::FD_INODE => {
            ilock((*f).ip);
            let r = readi((*f).ip, addr, (*f).off, n as u32);
            if r > 0 {
                (*f).off += r as u32;
            }
            iunlock((*f).ip);
            r
        }
        FdType::FD_NONE => panic!("fileread"),
    }
}

/// Write to file f.
pub unsafe fn filewrite(f: *mut File, addr: *const u8, n: i32) -> i32 {
    if !(*f).writable {
        return -1;
    }
    match (*f).typ {
        FdType::FD_PIPE => pipewrite((*f).pipe, addr, n as usize),
        FdType::FD_INODE => {
            // Write a few blocks at a time to stay within the log's
            // per-transaction block budget (room is left for the
            // inode, the indirect block, the bitmap, and two blocks
            // of slop for non-aligned writes).
            let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
            let mut i: i32 = 0;
            while i < n {
                let mut n1 = n - i;
                if n1 > max as i32 {
                    n1 = max as i32;
                }

                begin_op();
                ilock((*f).ip);
                let r = writei((*f).ip, addr.add(i as usize), (*f).off, n1 as u32);
                if r > 0 {
                    (*f).off += r as u32;
                }
                iunlock((*f).ip);
                end_op();

                if r < 0 {
                    break;
                }
                if r != n1 {
                    panic!("short filewrite");
                }
                i += r;
            }
            if i == n {
                n
            } else {
                -1
            }
        }
        FdType::FD_NONE => panic!("filewrite"),
    }
}
