//! Boot entry. The multiboot loader drops us in 32-bit protected mode
//! with paging off and this file's header found; entry turns on 4 MiB
//! pages, installs the minimal boot page directory, switches to the
//! boot stack and jumps to main at its high link address.

use core::arch::global_asm;

use crate::memlayout::KERNBASE;
use crate::mmu::{PteFlags, NPDENTRIES, PDXSHIFT};

global_asm!(
    "
    .section .multiboot, \"a\"
    .p2align 2
    # Multiboot header, for multiboot boot loaders like GNU Grub or
    # qemu -kernel.
    .long 0x1BADB002                 # magic
    .long 0                          # flags
    .long -0x1BADB002                # checksum: magic + flags + checksum == 0

    .text

    # By convention, the _start symbol specifies the ELF entry point.
    # Since we haven't set up virtual memory yet, the entry point is
    # the physical address of entry.
    .globl _start
    .set _start, entry - 0x80000000

    # Entering boot processor with paging off.
    .globl entry
entry:
    # Turn on page size extension for 4 MiB pages.
    movl %cr4, %eax
    orl $0x10, %eax
    movl %eax, %cr4

    # Set the page directory.
    movl $(entrypgdir - 0x80000000), %eax
    movl %eax, %cr3

    # Turn on paging and write protection.
    movl %cr0, %eax
    orl $0x80010000, %eax
    movl %eax, %cr0

    # Set up the stack and jump to main() at its high address.
    movl $(bootstack + 4096), %esp
    movl $main, %eax
    jmp *%eax

    .comm bootstack, 4096
",
    options(att_syntax)
);

#[repr(C, align(4096))]
pub struct EntryPgDir([u32; NPDENTRIES]);

/// The boot page table used by entry above: virtual [0, 4MB) and
/// [KERNBASE, KERNBASE+4MB) both map physical [0, 4MB) with 4 MiB
/// pages, just enough for the kernel to run until kvmalloc installs
/// the real map.
#[allow(non_upper_case_globals)]
#[no_mangle]
pub static mut entrypgdir: EntryPgDir = {
    let mut dir = [0u32; NPDENTRIES];
    let pde = PteFlags::P.bits() | PteFlags::W.bits() | PteFlags::PS.bits();
    dir[0] = pde;
    dir[KERNBASE >> PDXSHIFT] = pde;
    EntryPgDir(dir)
};
