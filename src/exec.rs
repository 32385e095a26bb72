//! exec() builds the user half of a fresh address space from an ELF
//! image. Nothing of the old image is touched until every allocation
//! and copy has succeeded; every error path frees the new directory
//! and leaves the caller's image intact.

use core::ptr;

use crate::elf::{ElfHeader, ProgramHeader, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{ilock, iunlockput, namei, readi, Inode};
use crate::log::{begin_op, end_op};
use crate::mmu::{pgroundup, PGSIZE};
use crate::param::MAXARG;
use crate::proc::myproc;
use crate::string::{safestrcpy, strlen_cstr};
use crate::vm::{allocuvm, clearpteu, copyout, freevm, loaduvm, setupkvm, switchuvm, PageDir};

unsafe fn bad(pgdir: PageDir, ip: *mut Inode) -> i32 {
    if !pgdir.is_null() {
        freevm(pgdir);
    }
    if !ip.is_null() {
        iunlockput(ip);
        end_op();
    }
    log::warn!("exec failed");
    -1
}

/// Replace the current process's user image with the program at path,
/// passing the NUL-terminated argv array. Returns only on failure.
pub unsafe fn exec(path: &[u8], argv: &[*const u8]) -> i32 {
    let curproc = myproc();

    begin_op();

    let ip = namei(path);
    if ip.is_null() {
        end_op();
        return -1;
    }
    ilock(ip);

    let mut pgdir: PageDir = ptr::null_mut();

    // Check the ELF header.
    let mut elf = ElfHeader::zero();
    let ehsize = core::mem::size_of::<ElfHeader>() as u32;
    if readi(ip, &mut elf as *mut ElfHeader as *mut u8, 0, ehsize) != ehsize as i32 {
        return bad(pgdir, ip);
    }
    if elf.magic != ELF_MAGIC {
        return bad(pgdir, ip);
    }

    pgdir = setupkvm();
    if pgdir.is_null() {
        return bad(pgdir, ip);
    }

    // Load each program segment into freshly allocated pages.
    let mut sz: usize = 0;
    let phsize = core::mem::size_of::<ProgramHeader>() as u32;
    for i in 0..elf.phnum as u32 {
        let off = elf.phoff + i * phsize;
        let mut ph = ProgramHeader::zero();
        if readi(ip, &mut ph as *mut ProgramHeader as *mut u8, off, phsize) != phsize as i32 {
            return bad(pgdir, ip);
        }
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return bad(pgdir, ip);
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return bad(pgdir, ip);
        }
        if (ph.vaddr as usize) < sz {
            // Segments must not overlap what is already loaded.
            return bad(pgdir, ip);
        }
        if ph.vaddr as usize % PGSIZE != 0 {
            return bad(pgdir, ip);
        }
        sz = allocuvm(pgdir, sz, (ph.vaddr + ph.memsz) as usize);
        if sz == 0 {
            return bad(pgdir, ip);
        }
        if loaduvm(pgdir, ph.vaddr as usize, ip, ph.off, ph.filesz) < 0 {
            return bad(pgdir, ip);
        }
    }
    iunlockput(ip);
    end_op();

    // Allocate two pages at the next page boundary. The first is the
    // guard, made inaccessible below the user stack; the second is
    // the stack itself.
    sz = pgroundup(sz);
    sz = allocuvm(pgdir, sz, sz + 2 * PGSIZE);
    if sz == 0 {
        return bad(pgdir, ptr::null_mut());
    }
    clearpteu(pgdir, sz - 2 * PGSIZE);
    let mut sp = sz;

    // Push the argument strings, then build the rest of the stack in
    // ustack: fake return PC, argc, argv pointer, then the pointers.
    let mut ustack = [0u32; 3 + MAXARG + 1];
    let mut argc = 0;
    while argc < argv.len() && !argv[argc].is_null() {
        if argc >= MAXARG {
            return bad(pgdir, ptr::null_mut());
        }
        let len = strlen_cstr(argv[argc]);
        sp = (sp - (len + 1)) & !3;
        if copyout(pgdir, sp, argv[argc], len + 1) < 0 {
            return bad(pgdir, ptr::null_mut());
        }
        ustack[3 + argc] = sp as u32;
        argc += 1;
    }
    ustack[3 + argc] = 0;

    ustack[0] = 0xffffffff; // fake return PC
    ustack[1] = argc as u32;
    ustack[2] = (sp - (argc + 1) * 4) as u32; // argv pointer

    sp -= (3 + argc + 1) * 4;
    if copyout(
        pgdir,
        sp,
        ustack.as_ptr() as *const u8,
        (3 + argc + 1) * 4,
    ) < 0
    {
        return bad(pgdir, ptr::null_mut());
    }

    // Save the last path element as the program name, for debugging.
    let last = match path.iter().rposition(|&c| c == b'/') {
        Some(i) => &path[i + 1..],
        None => path,
    };
    safestrcpy(&mut (*curproc).name, last);

    // Commit to the user image.
    let oldpgdir = (*curproc).pgdir;
    (*curproc).pgdir = pgdir;
    (*curproc).sz = sz;
    (*(*curproc).tf).eip = elf.entry; // main
    (*(*curproc).tf).esp = sp as u32;
    switchuvm(curproc);
    freevm(oldpgdir);
    0
}
