use core::ptr;

use crate::file::{filealloc, fileclose, FdType, File};
use crate::kalloc::{kalloc, kfree};
use crate::mmu::PGSIZE;
use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::SpinLock;

pub const PIPESIZE: usize = 512;

/// A bounded byte stream between processes: a ring buffer indexed by
/// monotonic read/write counters, guarded by one spin lock. Each Pipe
/// lives in a page of its own.
#[repr(C)]
pub struct Pipe {
    lock: SpinLock,
    data: [u8; PIPESIZE],
    nread: u32,     // number of bytes read
    nwrite: u32,    // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

/// Allocate a pipe and the two file handles over it, one read-only
/// and one write-only. On any failure, undo whatever was set up.
pub unsafe fn pipealloc(f0: *mut *mut File, f1: *mut *mut File) -> i32 {
    const _: () = assert!(core::mem::size_of::<Pipe>() <= PGSIZE);

    *f0 = ptr::null_mut();
    *f1 = ptr::null_mut();

    let mut p: *mut Pipe = ptr::null_mut();
    let bad = loop {
        *f0 = filealloc();
        if (*f0).is_null() {
            break true;
        }
        *f1 = filealloc();
        if (*f1).is_null() {
            break true;
        }
        p = kalloc() as *mut Pipe;
        if p.is_null() {
            break true;
        }
        break false;
    };
    if bad {
        if !p.is_null() {
            kfree(p as *mut u8);
        }
        if !(*f0).is_null() {
            fileclose(*f0);
        }
        if !(*f1).is_null() {
            fileclose(*f1);
        }
        return -1;
    }

    ptr::write(
        p,
        Pipe {
            lock: SpinLock::new("pipe"),
            data: [0; PIPESIZE],
            nread: 0,
            nwrite: 0,
            readopen: true,
            writeopen: true,
        },
    );

    (**f0).typ = FdType::FD_PIPE;
    (**f0).readable = true;
    (**f0).writable = false;
    (**f0).pipe = p;
    (**f1).typ = FdType::FD_PIPE;
    (**f1).readable = false;
    (**f1).writable = true;
    (**f1).pipe = p;
    0
}

/// Close one end. The opposite end is woken so blocked peers can
/// notice; the pipe itself is freed once both ends are gone.
pub unsafe fn pipeclose(p: *mut Pipe, writable: bool) {
    (*p).lock.acquire();
    if writable {
        (*p).writeopen = false;
        wakeup(ptr::addr_of!((*p).nread) as usize);
    } else {
        (*p).readopen = false;
        wakeup(ptr::addr_of!((*p).nwrite) as usize);
    }
    if !(*p).readopen && !(*p).writeopen {
        (*p).lock.release();
        kfree(p as *mut u8);
    } else {
        (*p).lock.release();
    }
}

pub unsafe fn pipewrite(p: *mut Pipe, addr: *const u8, n: usize) -> i32 {
    (*p).lock.acquire();
    for i in 0..n {
        while (*p).nwrite == (*p).nread.wrapping_add(PIPESIZE as u32) {
            if !(*p).readopen || (*myproc()).killed {
                (*p).lock.release();
                return -1;
            }
            wakeup(ptr::addr_of!((*p).nread) as usize);
            sleep(
                ptr::addr_of!((*p).nwrite) as usize,
                ptr::addr_of_mut!((*p).lock),
            );
        }
        (*p).data[(*p).nwrite as usize % PIPESIZE] = *addr.add(i);
        (*p).nwrite = (*p).nwrite.wrapping_add(1);
    }
    wakeup(ptr::addr_of!((*p).nread) as usize);
    (*p).lock.release();
    n as i32
}

pub unsafe fn piperead(p: *mut Pipe, addr: *mut u8, n: usize) -> i32 {
    (*p).lock.acquire();
    while (*p).nread == (*p).nwrite && (*p).writeopen {
        if (*myproc()).killed {
            (*p).lock.release();
            return -1;
        }
        sleep(
            ptr::addr_of!((*p).nread) as usize,
            ptr::addr_of_mut!((*p).lock),
        );
    }
    let mut i = 0;
    while i < n {
        if (*p).nread == (*p).nwrite {
            break;
        }
        *addr.add(i) = (*p).data[(*p).nread as usize % PIPESIZE];
        (*p).nread = (*p).nread.wrapping_add(1);
        i += 1;
    }
    wakeup(ptr::addr_of!((*p).nwrite) as usize);
    (*p).lock.release();
    i as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::freecount;

    #[test_case]
    fn bytes_come_out_in_order() {
        unsafe {
            let mut f0: *mut File = ptr::null_mut();
            let mut f1: *mut File = ptr::null_mut();
            assert_eq!(pipealloc(&mut f0, &mut f1), 0);
            let p = (*f0).pipe;

            let msg = *b"abc";
            assert_eq!(pipewrite(p, msg.as_ptr(), 3), 3);
            let mut out = [0u8; 4];
            assert_eq!(piperead(p, out.as_mut_ptr(), 4), 3);
            assert_eq!(&out[..3], b"abc");

            fileclose(f0);
            fileclose(f1);
        }
    }

    #[test_case]
    fn read_after_writer_close_hits_eof() {
        unsafe {
            let mut f0: *mut File = ptr::null_mut();
            let mut f1: *mut File = ptr::null_mut();
            assert_eq!(pipealloc(&mut f0, &mut f1), 0);
            let p = (*f0).pipe;

            let msg = *b"xy";
            assert_eq!(pipewrite(p, msg.as_ptr(), 2), 2);
            fileclose(f1); // drop the write end

            let mut out = [0u8; 8];
            assert_eq!(piperead(p, out.as_mut_ptr(), 8), 2);
            assert_eq!(&out[..2], b"xy");
            // Drained and the writer is gone: EOF.
            assert_eq!(piperead(p, out.as_mut_ptr(), 8), 0);

            fileclose(f0);
        }
    }

    #[test_case]
    fn write_with_no_reader_fails_at_capacity() {
        unsafe {
            let mut f0: *mut File = ptr::null_mut();
            let mut f1: *mut File = ptr::null_mut();
            assert_eq!(pipealloc(&mut f0, &mut f1), 0);
            let p = (*f0).pipe;
            fileclose(f0); // drop the read end

            // One byte more than the ring holds: the writer discovers
            // the missing reader instead of blocking.
            let big = [0x5Au8; PIPESIZE + 1];
            assert_eq!(pipewrite(p, big.as_ptr(), PIPESIZE + 1), -1);

            fileclose(f1);
        }
    }

    #[test_case]
    fn closing_both_ends_frees_the_page() {
        unsafe {
            let before = freecount();
            let mut f0: *mut File = ptr::null_mut();
            let mut f1: *mut File = ptr::null_mut();
            assert_eq!(pipealloc(&mut f0, &mut f1), 0);
            assert_eq!(freecount(), before - 1);
            fileclose(f0);
            fileclose(f1);
            assert_eq!(freecount(), before);
        }
    }
}
