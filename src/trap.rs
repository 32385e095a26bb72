use core::arch::global_asm;

use crate::ide::ideintr;
use crate::kbd::kbdintr;
use crate::lapic::lapiceoi;
use crate::mmu::{DescTablePtr, GateDesc, DPL_USER, SEG_KCODE};
use crate::proc::{cpuid, exit, myproc, wakeup, yield_proc, ProcState, TrapFrame};
use crate::println;
use crate::spinlock::SpinLock;
use crate::syscall::syscall;
use crate::uart::uartintr;
use crate::x86::{lidt, rcr2};

// x86 trap and interrupt constants.

// Processor-defined:
pub const T_DIVIDE: u32 = 0; // divide error
pub const T_DEBUG: u32 = 1; // debug exception
pub const T_NMI: u32 = 2; // non-maskable interrupt
pub const T_BRKPT: u32 = 3; // breakpoint
pub const T_OFLOW: u32 = 4; // overflow
pub const T_BOUND: u32 = 5; // bounds check
pub const T_ILLOP: u32 = 6; // illegal opcode
pub const T_DEVICE: u32 = 7; // device not available
pub const T_DBLFLT: u32 = 8; // double fault
pub const T_TSS: u32 = 10; // invalid task switch segment
pub const T_SEGNP: u32 = 11; // segment not present
pub const T_STACK: u32 = 12; // stack exception
pub const T_GPFLT: u32 = 13; // general protection fault
pub const T_PGFLT: u32 = 14; // page fault
pub const T_FPERR: u32 = 16; // floating point error
pub const T_ALIGN: u32 = 17; // alignment check
pub const T_MCHK: u32 = 18; // machine check
pub const T_SIMDERR: u32 = 19; // SIMD floating point error

pub const T_SYSCALL: u32 = 64; // system call
pub const T_DEFAULT: u32 = 500; // catchall

pub const T_IRQ0: u32 = 32; // IRQ 0 corresponds to int T_IRQ0

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;
pub const IRQ_SPURIOUS: u32 = 31;

// Interrupt descriptor table (shared by all CPUs).
static mut IDT: [GateDesc; 256] = [GateDesc::zero(); 256];

pub static mut TICKSLOCK: SpinLock = SpinLock::new("time");
pub static mut TICKS: u32 = 0;

extern "C" {
    // In the stub block below: an array of 256 entry points, one per
    // vector, because the x86 does not hand the trap number to the
    // handler.
    static vectors: [u32; 256];
}

// Trap entry stubs. Each vector pushes a zero error code when the
// hardware did not push one, then the vector number, and joins the
// common path, which completes the trap frame and calls trap(). The
// double fault, TSS, segment, stack, GP, page fault and alignment
// exceptions (8, 10-14, 17) come with a hardware error code.
global_asm!(
    "
    .altmacro
    .macro vector num
    .globl vector\\num
vector\\num:
    .if (\\num != 8) && ((\\num < 10) || (\\num > 14)) && (\\num != 17)
    pushl $0
    .endif
    pushl $\\num
    jmp alltraps
    .endm

    .set i, 0
    .rept 256
    vector %i
    .set i, i + 1
    .endr

    .globl alltraps
alltraps:
    pushl %ds
    pushl %es
    pushl %fs
    pushl %gs
    pushal

    movw $0x10, %ax
    movw %ax, %ds
    movw %ax, %es

    pushl %esp
    call trap
    addl $4, %esp

    .globl trapret
trapret:
    popal
    popl %gs
    popl %fs
    popl %es
    popl %ds
    addl $8, %esp
    iret

    .macro ventry num
    .long vector\\num
    .endm

    .section .rodata
    .globl vectors
vectors:
    .set i, 0
    .rept 256
    ventry %i
    .set i, i + 1
    .endr
    .text
",
    options(att_syntax)
);

/// Build the 256-entry IDT. The system call gate is the one entry a
/// user program may raise with an explicit int instruction, and it is
/// a trap gate so device interrupts stay deliverable during the call.
pub unsafe fn tvinit() {
    for i in 0..256 {
        IDT[i].set(false, (SEG_KCODE << 3) as u16, vectors[i] as usize, 0);
    }
    IDT[T_SYSCALL as usize].set(
        true,
        (SEG_KCODE << 3) as u16,
        vectors[T_SYSCALL as usize] as usize,
        DPL_USER,
    );
}

/// Load the IDT register. Run on each CPU.
pub unsafe fn idtinit() {
    let pd = DescTablePtr {
        limit: (core::mem::size_of::<[GateDesc; 256]>() - 1) as u16,
        base: IDT.as_ptr() as u32,
    };
    lidt(&pd as *const DescTablePtr as *const u8);
}

/// The common trap dispatcher. Every vector stub lands here with the
/// trap frame it built on the current kernel stack.
#[no_mangle]
pub unsafe extern "C" fn trap(tf: *mut TrapFrame) {
    if (*tf).trapno == T_SYSCALL {
        let p = myproc();
        if (*p).killed {
            exit();
        }
        (*p).tf = tf;
        syscall();
        if (*p).killed {
            exit();
        }
        return;
    }

    match (*tf).trapno {
        t if t == T_IRQ0 + IRQ_TIMER => {
            if cpuid() == 0 {
                TICKSLOCK.acquire();
                TICKS = TICKS.wrapping_add(1);
                wakeup(core::ptr::addr_of!(TICKS) as usize);
                TICKSLOCK.release();
            }
            lapiceoi();
        }
        t if t == T_IRQ0 + IRQ_IDE => {
            ideintr();
            lapiceoi();
        }
        t if t == T_IRQ0 + IRQ_IDE + 1 => {
            // Bochs generates spurious IDE1 interrupts.
        }
        t if t == T_IRQ0 + IRQ_KBD => {
            kbdintr();
            lapiceoi();
        }
        t if t == T_IRQ0 + IRQ_COM1 => {
            uartintr();
            lapiceoi();
        }
        t if t == T_IRQ0 + 7 || t == T_IRQ0 + IRQ_SPURIOUS => {
            log::warn!(
                "cpu{}: spurious interrupt at {:x}:{:x}",
                cpuid(),
                (*tf).cs,
                (*tf).eip
            );
            lapiceoi();
        }
        _ => {
            let p = myproc();
            if p.is_null() || (*tf).cs & 3 == 0 {
                // In the kernel: it must be our mistake.
                println!(
                    "unexpected trap {} from cpu {} eip {:x} (cr2={:#x})",
                    (*tf).trapno,
                    cpuid(),
                    (*tf).eip,
                    rcr2()
                );
                panic!("trap");
            }
            // In user space: assume the process misbehaved.
            let len = crate::string::strlen(&(*p).name);
            println!(
                "pid {} {}: trap {} err {} on cpu {} eip {:#x} addr {:#x}--kill proc",
                (*p).pid,
                core::str::from_utf8(&(*p).name[..len]).unwrap_or("???"),
                (*tf).trapno,
                (*tf).err,
                cpuid(),
                (*tf).eip,
                rcr2()
            );
            (*p).killed = true;
        }
    }

    // Force the process to exit if it has been killed and is in user
    // space. (If it is still executing in the kernel, let it keep
    // running until it reaches the regular system call return.)
    let p = myproc();
    if !p.is_null() && (*p).killed && (*tf).cs & 3 == DPL_USER as u16 {
        exit();
    }

    // Force the process to give up the CPU on a clock tick.
    if !p.is_null() && (*p).state == ProcState::RUNNING && (*tf).trapno == T_IRQ0 + IRQ_TIMER {
        yield_proc();
    }

    // Check again: kill() may have run while we yielded.
    if !p.is_null() && (*p).killed && (*tf).cs & 3 == DPL_USER as u16 {
        exit();
    }
}
