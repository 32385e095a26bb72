//! Physical memory allocator, intended to allocate memory for user
//! processes, kernel stacks, page table pages, and pipe buffers.
//! Allocates whole 4096-byte pages.

use core::ptr;

use crate::memlayout::{v2p, PHYSTOP};
use crate::mmu::{pgroundup, PGSIZE};
use crate::spinlock::SpinLock;

extern "C" {
    // First address after the kernel image, defined by kernel.ld.
    static end: [u8; 0];
}

/// Free page node. Each free page holds the link to the next one in
/// its first word.
#[repr(C)]
struct Run {
    next: *mut Run,
}

struct Kmem {
    lock: SpinLock,
    use_lock: bool,
    freelist: *mut Run,
}

static mut KMEM: Kmem = Kmem {
    lock: SpinLock::new("kmem"),
    use_lock: false,
    freelist: ptr::null_mut(),
};

// Initialization happens in two phases:
// 1. main() calls kinit1() while still using entrypgdir, to place just
//    the pages mapped by entrypgdir on the free list.
// 2. main() calls kinit2() with the rest of physical memory after the
//    full kernel map is installed. Locking is only enabled then,
//    because the per-CPU state pushcli relies on is not live earlier.
pub unsafe fn kinit1(vstart: usize, vend: usize) {
    KMEM.use_lock = false;
    freerange(vstart, vend);
}

pub unsafe fn kinit2(vstart: usize, vend: usize) {
    freerange(vstart, vend);
    KMEM.use_lock = true;
}

unsafe fn freerange(vstart: usize, vend: usize) {
    // A PTE can only refer to a 4096-byte-aligned physical address,
    // so round up to free only aligned pages.
    let mut p = pgroundup(vstart);
    while p + PGSIZE <= vend {
        kfree(p as *mut u8);
        p += PGSIZE;
    }
}

/// Free the page of physical memory pointed at by v, which normally
/// should have been returned by a call to kalloc(). The exception is
/// when initializing the allocator; see kinit above.
pub unsafe fn kfree(v: *mut u8) {
    let a = v as usize;
    if a % PGSIZE != 0 || a < end.as_ptr() as usize || v2p(a) >= PHYSTOP {
        panic!("kfree");
    }

    // Fill with junk to catch dangling refs.
    ptr::write_bytes(v, 1, PGSIZE);

    if KMEM.use_lock {
        KMEM.lock.acquire();
    }
    let r = v as *mut Run;
    (*r).next = KMEM.freelist;
    KMEM.freelist = r;
    if KMEM.use_lock {
        KMEM.lock.release();
    }
}

/// Allocate one 4096-byte page of physical memory.
/// Returns a pointer that the kernel can use.
/// Returns null if the memory cannot be allocated.
pub unsafe fn kalloc() -> *mut u8 {
    if KMEM.use_lock {
        KMEM.lock.acquire();
    }
    let r = KMEM.freelist;
    if !r.is_null() {
        KMEM.freelist = (*r).next;
    }
    if KMEM.use_lock {
        KMEM.lock.release();
    }
    r as *mut u8
}

/// Number of pages currently on the free list. Used by tests and by
/// the boot banner; a linear walk is fine at this scale.
pub unsafe fn freecount() -> usize {
    if KMEM.use_lock {
        KMEM.lock.acquire();
    }
    let mut n = 0;
    let mut r = KMEM.freelist;
    while !r.is_null() {
        n += 1;
        r = (*r).next;
    }
    if KMEM.use_lock {
        KMEM.lock.release();
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn frames_are_aligned_and_in_range() {
        unsafe {
            let v = kalloc();
            assert!(!v.is_null());
            let a = v as usize;
            assert_eq!(a % PGSIZE, 0);
            assert!(a >= end.as_ptr() as usize);
            assert!(v2p(a) < PHYSTOP);
            kfree(v);
        }
    }

    #[test_case]
    fn alloc_free_conserves_frames() {
        unsafe {
            let before = freecount();
            let mut held = [ptr::null_mut::<u8>(); 8];
            for (i, slot) in held.iter_mut().enumerate() {
                *slot = kalloc();
                assert!(!slot.is_null());
                assert_eq!(freecount(), before - i - 1);
            }
            for v in held {
                kfree(v);
            }
            assert_eq!(freecount(), before);
        }
    }

    #[test_case]
    fn freed_page_is_junk_filled() {
        unsafe {
            let v = kalloc();
            assert!(!v.is_null());
            ptr::write_bytes(v, 0xAB, PGSIZE);
            kfree(v);
            // The first word now carries the free-list link; every byte
            // past it must show the junk fill.
            for off in [8usize, 64, PGSIZE / 2, PGSIZE - 1] {
                assert_eq!(*v.add(off), 1);
            }
            // Take the page back so later tests see a clean free list.
            let again = kalloc();
            assert_eq!(again, v);
            kfree(again);
        }
    }
}
