use core::cmp::min;
use core::ptr;

use crate::fs::readi;
use crate::kalloc::{kalloc, kfree};
use crate::memlayout::{p2v, v2p, DEVSPACE, EXTMEM, KERNBASE, KERNLINK, PHYSTOP};
use crate::mmu::{
    pdx, pgrounddown, pgroundup, pte_addr, pte_flags, PdEntry, PtEntry, PteFlags, SegDesc,
    TaskState, DescTablePtr, DPL_USER, NPDENTRIES, NPTENTRIES, NSEGS, PGSIZE, SEG_KCODE,
    SEG_KDATA, SEG_TSS, SEG_UCODE, SEG_UDATA, STA_R, STA_W, STA_X, STS_T32A,
};
use crate::proc::{mycpu, Proc};
use crate::mmu::ptx;
use crate::param::KSTACKSIZE;
use crate::spinlock::{popcli, pushcli};
use crate::x86::{lcr3, lgdt, ltr};

/// A page directory: 1024 32-bit entries in one frame.
pub type PageDir = *mut PdEntry;

// Linker-provided section boundaries.
extern "C" {
    static data: [u8; 0]; // start of the kernel data segment
}

// The kernel-only page directory, used by the scheduler and by CPUs
// that are not running any process.
pub static mut KPGDIR: PageDir = ptr::null_mut();

/// Set up this CPU's kernel segment descriptors.
/// Run once on entry on each CPU.
pub unsafe fn seginit() {
    // Map "logical" addresses to virtual addresses using identity
    // maps. A code descriptor cannot be shared between kernel and
    // user because the CPU forbids an interrupt from CPL=0 to DPL=3.
    let c = mycpu();
    (*c).gdt[SEG_KCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xffffffff, 0);
    (*c).gdt[SEG_KDATA] = SegDesc::seg(STA_W, 0, 0xffffffff, 0);
    (*c).gdt[SEG_UCODE] = SegDesc::seg(STA_X | STA_R, 0, 0xffffffff, DPL_USER);
    (*c).gdt[SEG_UDATA] = SegDesc::seg(STA_W, 0, 0xffffffff, DPL_USER);

    let pd = DescTablePtr {
        limit: (core::mem::size_of::<[SegDesc; NSEGS]>() - 1) as u16,
        base: (*c).gdt.as_ptr() as u32,
    };
    lgdt(&pd as *const DescTablePtr as *const u8);
}

/// Return the address of the PTE in page directory pgdir that
/// corresponds to virtual address va. If alloc is set, create any
/// required page table page.
unsafe fn walkpgdir(pgdir: PageDir, va: usize, alloc: bool) -> *mut PtEntry {
    // Mimic the paging hardware: the top 10 bits of the virtual
    // address pick the page directory entry.
    let pde = pgdir.add(pdx(va));

    let pgtab: *mut PtEntry;
    if *pde & PteFlags::P.bits() != 0 {
        pgtab = p2v(pte_addr(*pde)) as *mut PtEntry;
    } else {
        if !alloc {
            return ptr::null_mut();
        }
        let mem = kalloc();
        if mem.is_null() {
            return ptr::null_mut();
        }
        // Make sure all the PTE_P bits are zero.
        ptr::write_bytes(mem, 0, PGSIZE);
        pgtab = mem as *mut PtEntry;
        // The permissions here are overly generous; they are
        // restricted further by the flags in the leaf PTEs.
        *pde = (v2p(pgtab as usize) as u32)
            | (PteFlags::P | PteFlags::W | PteFlags::U).bits();
    }
    // The next 10 bits pick the PTE within the page table page.
    pgtab.add(ptx(va))
}

/// Create PTEs for virtual addresses starting at va that refer to
/// physical addresses starting at pa. va and size might not be
/// page-aligned.
unsafe fn mappages(pgdir: PageDir, va: usize, size: usize, mut pa: usize, perm: PteFlags) -> i32 {
    let mut a = pgrounddown(va);
    let last = pgrounddown(va + size - 1);

    loop {
        let pte = walkpgdir(pgdir, a, true);
        if pte.is_null() {
            return -1;
        }
        if *pte & PteFlags::P.bits() != 0 {
            panic!("remap");
        }
        *pte = pa as u32 | perm.bits() | PteFlags::P.bits();
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    0
}

// There is one page directory per process, plus kpgdir for when no
// process is running. A process's page directory holds the user
// mappings below KERNBASE and, above it, the same four kernel regions
// as every other page directory:
//
//   KERNBASE..KERNBASE+EXTMEM  -> 0..EXTMEM          (I/O space)
//   KERNLINK..data             -> V2P(KERNLINK)..V2P(data)
//                                 (kernel text+rodata, read-only)
//   data..KERNBASE+PHYSTOP     -> V2P(data)..PHYSTOP (data + free RAM)
//   DEVSPACE..0                -> direct             (devices)
struct Kmap {
    virt: usize,
    phys_start: usize,
    phys_end: usize,
    perm: PteFlags,
}

/// Set up the kernel part of a page table; no user mappings.
pub unsafe fn setupkvm() -> PageDir {
    let pgdir = kalloc() as PageDir;
    if pgdir.is_null() {
        return ptr::null_mut();
    }
    ptr::write_bytes(pgdir as *mut u8, 0, PGSIZE);
    if p2v(PHYSTOP) > DEVSPACE {
        panic!("PHYSTOP too high");
    }

    let kmap = [
        Kmap {
            virt: KERNBASE,
            phys_start: 0,
            phys_end: EXTMEM,
            perm: PteFlags::W,
        },
        Kmap {
            virt: KERNLINK,
            phys_start: v2p(KERNLINK),
            phys_end: v2p(data.as_ptr() as usize),
            perm: PteFlags::empty(),
        },
        Kmap {
            virt: data.as_ptr() as usize,
            phys_start: v2p(data.as_ptr() as usize),
            phys_end: PHYSTOP,
            perm: PteFlags::W,
        },
        Kmap {
            virt: DEVSPACE,
            phys_start: DEVSPACE,
            phys_end: 0, // runs to the top of the address space
            perm: PteFlags::W,
        },
    ];

    for k in &kmap {
        let size = k.phys_end.wrapping_sub(k.phys_start);
        if mappages(pgdir, k.virt, size, k.phys_start, k.perm) < 0 {
            freevm(pgdir);
            return ptr::null_mut();
        }
    }
    pgdir
}

/// Allocate the page directory for the kernel address space the
/// scheduler runs in, and switch to it.
pub unsafe fn kvmalloc() {
    KPGDIR = setupkvm();
    if KPGDIR.is_null() {
        panic!("kvmalloc");
    }
    switchkvm();
}

/// Switch the hardware page directory register to the kernel-only
/// page directory, for when no process is running.
pub unsafe fn switchkvm() {
    lcr3(v2p(KPGDIR as usize));
}

/// Switch the TSS and hardware page directory to process p.
pub unsafe fn switchuvm(p: *mut Proc) {
    if p.is_null() {
        panic!("switchuvm: no process");
    }
    if (*p).kstack.is_null() {
        panic!("switchuvm: no kstack");
    }
    if (*p).pgdir.is_null() {
        panic!("switchuvm: no pgdir");
    }

    pushcli();
    let c = mycpu();
    (*c).gdt[SEG_TSS] = SegDesc::seg16(
        STS_T32A,
        &(*c).ts as *const TaskState as usize,
        core::mem::size_of::<TaskState>() - 1,
        0,
    );
    (*c).ts.ss0 = (SEG_KDATA << 3) as u16;
    (*c).ts.esp0 = (*p).kstack as u32 + KSTACKSIZE as u32;
    // Setting IOPL=0 in eflags *and* iomb beyond the TSS segment
    // limit forbids I/O instructions (e.g. inb and outb) from user
    // space.
    (*c).ts.iomb = 0xFFFF;
    ltr((SEG_TSS << 3) as u16);
    lcr3(v2p((*p).pgdir as usize)); // switch to the process's address space
    popcli();
}

/// Load the initcode into address 0 of pgdir.
/// sz must be less than a page.
pub unsafe fn inituvm(pgdir: PageDir, init: *const u8, sz: usize) {
    if sz >= PGSIZE {
        panic!("inituvm: more than a page");
    }
    let mem = kalloc();
    if mem.is_null() {
        panic!("inituvm: out of memory");
    }
    ptr::write_bytes(mem, 0, PGSIZE);
    mappages(pgdir, 0, PGSIZE, v2p(mem as usize), PteFlags::W | PteFlags::U);
    ptr::copy_nonoverlapping(init, mem, sz);
}

/// Load a program segment into pgdir. addr must be page-aligned and
/// the pages from addr to addr+sz must already be mapped.
pub unsafe fn loaduvm(
    pgdir: PageDir,
    addr: usize,
    ip: *mut crate::fs::Inode,
    offset: u32,
    sz: u32,
) -> i32 {
    if addr % PGSIZE != 0 {
        panic!("loaduvm: addr must be page aligned");
    }
    let mut i: u32 = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, addr + i as usize, false);
        if pte.is_null() {
            panic!("loaduvm: address should exist");
        }
        let pa = pte_addr(*pte);
        let n = min(sz - i, PGSIZE as u32);
        if readi(ip, p2v(pa) as *mut u8, offset + i, n) != n as i32 {
            return -1;
        }
        i += PGSIZE as u32;
    }
    0
}

/// Allocate page tables and physical memory to grow a process from
/// oldsz to newsz, which need not be page-aligned.
/// Returns the new size, or 0 on error.
pub unsafe fn allocuvm(pgdir: PageDir, oldsz: usize, newsz: usize) -> usize {
    if newsz >= KERNBASE {
        return 0;
    }
    if newsz < oldsz {
        return oldsz;
    }

    let mut a = pgroundup(oldsz);
    while a < newsz {
        let mem = kalloc();
        if mem.is_null() {
            log::warn!("allocuvm out of memory");
            deallocuvm(pgdir, newsz, oldsz);
            return 0;
        }
        ptr::write_bytes(mem, 0, PGSIZE);
        if mappages(pgdir, a, PGSIZE, v2p(mem as usize), PteFlags::W | PteFlags::U) < 0 {
            log::warn!("allocuvm out of memory (2)");
            deallocuvm(pgdir, newsz, oldsz);
            kfree(mem);
            return 0;
        }
        a += PGSIZE;
    }
    newsz
}

/// Deallocate user pages to bring the process size from oldsz to
/// newsz. oldsz and newsz need not be page-aligned, nor does newsz
/// need to be less than oldsz. oldsz can be larger than the actual
/// process size. Returns the new process size.
pub unsafe fn deallocuvm(pgdir: PageDir, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut a = pgroundup(newsz);
    while a < oldsz {
        let pte = walkpgdir(pgdir, a, false);
        if pte.is_null() {
            // No page table page here; skip the whole span it would
            // have covered.
            a += NPTENTRIES * PGSIZE;
            continue;
        }
        if *pte & PteFlags::P.bits() != 0 {
            let pa = pte_addr(*pte);
            if pa == 0 {
                panic!("kfree");
            }
            kfree(p2v(pa) as *mut u8);
            *pte = 0;
        }
        a += PGSIZE;
    }
    newsz
}

/// Free a page directory and all the physical memory pages in the
/// user part.
pub unsafe fn freevm(pgdir: PageDir) {
    if pgdir.is_null() {
        panic!("freevm: no pgdir");
    }
    deallocuvm(pgdir, KERNBASE, 0);
    for i in 0..NPDENTRIES {
        let pde = *pgdir.add(i);
        if pde & PteFlags::P.bits() != 0 {
            kfree(p2v(pte_addr(pde)) as *mut u8);
        }
    }
    kfree(pgdir as *mut u8);
}

/// Clear PTE_U on a page. Used to create an inaccessible guard page
/// beneath the user stack.
pub unsafe fn clearpteu(pgdir: PageDir, uva: usize) {
    let pte = walkpgdir(pgdir, uva, false);
    if pte.is_null() {
        panic!("clearpteu");
    }
    *pte &= !PteFlags::U.bits();
}

/// Given a parent process's page directory, create a copy of it for a
/// child: a fresh directory whose user pages hold copies of the
/// parent's. Returns null (freeing the partial copy) on failure.
pub unsafe fn copyuvm(pgdir: PageDir, sz: usize) -> PageDir {
    let d = setupkvm();
    if d.is_null() {
        return ptr::null_mut();
    }

    let mut i = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, i, false);
        if pte.is_null() {
            panic!("copyuvm: pte should exist");
        }
        if *pte & PteFlags::P.bits() == 0 {
            panic!("copyuvm: page not present");
        }
        let pa = pte_addr(*pte);
        let flags = pte_flags(*pte);
        let mem = kalloc();
        if mem.is_null() {
            freevm(d);
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(p2v(pa) as *const u8, mem, PGSIZE);
        if mappages(d, i, PGSIZE, v2p(mem as usize), flags) < 0 {
            kfree(mem);
            freevm(d);
            return ptr::null_mut();
        }
        i += PGSIZE;
    }
    d
}

/// Map a user virtual address to a kernel address, requiring that the
/// page is present and user-accessible.
pub unsafe fn uva2ka(pgdir: PageDir, uva: usize) -> *mut u8 {
    let pte = walkpgdir(pgdir, uva, false);
    if pte.is_null() {
        return ptr::null_mut();
    }
    if *pte & PteFlags::P.bits() == 0 {
        return ptr::null_mut();
    }
    if *pte & PteFlags::U.bits() == 0 {
        return ptr::null_mut();
    }
    p2v(pte_addr(*pte)) as *mut u8
}

/// Copy len bytes from p to user address va in page directory pgdir.
/// Most useful when pgdir is not the current page directory; uva2ka
/// ensures this only works for user pages.
pub unsafe fn copyout(pgdir: PageDir, mut va: usize, p: *const u8, mut len: usize) -> i32 {
    let mut buf = p;
    while len > 0 {
        let va0 = pgrounddown(va);
        let pa0 = uva2ka(pgdir, va0);
        if pa0.is_null() {
            return -1;
        }
        let n = min(PGSIZE - (va - va0), len);
        ptr::copy_nonoverlapping(buf, pa0.add(va - va0), n);
        len -= n;
        buf = buf.add(n);
        va = va0 + PGSIZE;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::freecount;

    #[test_case]
    fn kernel_map_covers_io_space() {
        unsafe {
            // Every kernel page directory maps KERNBASE to physical 0.
            let pte = walkpgdir(KPGDIR, KERNBASE, false);
            assert!(!pte.is_null());
            assert!(*pte & PteFlags::P.bits() != 0);
            assert_eq!(pte_addr(*pte), 0);
            // Kernel mappings carry no user bit.
            assert!(*pte & PteFlags::U.bits() == 0);
        }
    }

    #[test_case]
    fn map_then_translate_roundtrip() {
        unsafe {
            let before = freecount();
            let pgdir = setupkvm();
            assert!(!pgdir.is_null());

            let mem = kalloc();
            assert!(!mem.is_null());
            assert_eq!(
                mappages(pgdir, PGSIZE, PGSIZE, v2p(mem as usize), PteFlags::W | PteFlags::U),
                0
            );
            assert_eq!(uva2ka(pgdir, PGSIZE), mem);

            // Dropping the user bit hides the page from uva2ka.
            clearpteu(pgdir, PGSIZE);
            assert!(uva2ka(pgdir, PGSIZE).is_null());
            // Unmapped addresses translate to nothing.
            assert!(uva2ka(pgdir, 3 * PGSIZE).is_null());

            freevm(pgdir);
            assert_eq!(freecount(), before);
        }
    }

    #[test_case]
    fn copyuvm_duplicates_bytes_in_new_frames() {
        unsafe {
            let before = freecount();
            let src = setupkvm();
            assert!(!src.is_null());
            assert_eq!(allocuvm(src, 0, 2 * PGSIZE), 2 * PGSIZE);
            for va in [0usize, PGSIZE] {
                let ka = uva2ka(src, va);
                ptr::write_bytes(ka, (0x40 + va / PGSIZE) as u8, PGSIZE);
            }

            let taken = before - freecount();
            let d = copyuvm(src, 2 * PGSIZE);
            assert!(!d.is_null());
            for va in [0usize, PGSIZE] {
                let a = uva2ka(src, va);
                let b = uva2ka(d, va);
                assert!(a != b);
                for off in [0usize, 1, PGSIZE / 2, PGSIZE - 1] {
                    assert_eq!(*a.add(off), *b.add(off));
                }
            }

            // Freeing the copy gives back exactly what the copy took.
            freevm(d);
            assert_eq!(before - freecount(), taken);
            freevm(src);
            assert_eq!(freecount(), before);
        }
    }

    #[test_case]
    fn allocuvm_and_dealloc_are_inverse() {
        unsafe {
            let before = freecount();
            let pgdir = setupkvm();
            assert!(!pgdir.is_null());
            let sz = allocuvm(pgdir, 0, 3 * PGSIZE + 7);
            assert_eq!(sz, 3 * PGSIZE + 7);
            // Rounds up: four pages mapped, each zeroed.
            assert_eq!(*uva2ka(pgdir, 3 * PGSIZE), 0);
            assert_eq!(deallocuvm(pgdir, sz, 0), 0);
            freevm(pgdir);
            assert_eq!(freecount(), before);
        }
    }

    #[test_case]
    fn allocuvm_rejects_kernel_addresses() {
        unsafe {
            let pgdir = setupkvm();
            assert!(!pgdir.is_null());
            assert_eq!(allocuvm(pgdir, 0, KERNBASE), 0);
            freevm(pgdir);
        }
    }

    #[test_case]
    fn copyout_spans_page_boundaries() {
        unsafe {
            let pgdir = setupkvm();
            assert!(!pgdir.is_null());
            assert_eq!(allocuvm(pgdir, 0, 2 * PGSIZE), 2 * PGSIZE);

            let msg = *b"boundary";
            let va = PGSIZE - 4;
            assert_eq!(copyout(pgdir, va, msg.as_ptr(), msg.len()), 0);
            let lo = uva2ka(pgdir, 0);
            let hi = uva2ka(pgdir, PGSIZE);
            assert_eq!(core::slice::from_raw_parts(lo.add(va), 4), &msg[..4]);
            assert_eq!(core::slice::from_raw_parts(hi, 4), &msg[4..]);

            // Writes beyond the user size fail cleanly.
            assert_eq!(copyout(pgdir, 3 * PGSIZE, msg.as_ptr(), msg.len()), -1);
            freevm(pgdir);
        }
    }
}
