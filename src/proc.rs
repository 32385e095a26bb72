use core::arch::global_asm;
use core::ptr;
use core::sync::atomic::AtomicBool;

use spin::Once;

use crate::file::{fileclose, filedup, File};
use crate::fs::{idup, iinit, iput, namei, Inode};
use crate::kalloc::{kalloc, kfree};
use crate::lapic::lapicid;
use crate::log::initlog;
use crate::mmu::{SegDesc, TaskState, DPL_USER, FL_IF, NSEGS, PGSIZE, SEG_UCODE, SEG_UDATA};
use crate::mp::ncpu;
use crate::param::{KSTACKSIZE, NCPU, NOFILE, NPROC, ROOTDEV};
use crate::println;
use crate::spinlock::{popcli, pushcli, SpinLock};
use crate::string::safestrcpy;
use crate::vm::{
    allocuvm, copyuvm, deallocuvm, freevm, inituvm, setupkvm, switchkvm, switchuvm, PageDir,
};
use crate::x86::{readeflags, sti};

/// Saved registers for kernel context switches. The stack pointer is
/// not saved explicitly: the Context lives at the saved stack's
/// address. Nor is %eip; it sits on the stack just above, where
/// swtch's ret finds it. The layout must match the push order in
/// swtch below.
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// Trap frame, laid out by the hardware and by the trap entry stub on
/// the kernel stack. Field order is fixed by the pushal instruction
/// and the iret frame.
#[repr(C)]
pub struct TrapFrame {
    // registers as pushed by pushal
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // useless & ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    // rest of trap frame
    pub gs: u16,
    padding1: u16,
    pub fs: u16,
    padding2: u16,
    pub es: u16,
    padding3: u16,
    pub ds: u16,
    padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings, such as from user to kernel
    pub esp: u32,
    pub ss: u16,
    padding6: u16,
}

/// Per-CPU state
pub struct Cpu {
    pub apicid: u8,                 // Local APIC ID
    pub scheduler: *mut Context,    // swtch() here to enter scheduler()
    pub ts: TaskState,              // Used by x86 to find stack for interrupt
    pub gdt: [SegDesc; NSEGS],      // x86 global descriptor table
    pub started: AtomicBool,        // Has the CPU started?
    pub ncli: i32,                  // Depth of pushcli nesting
    pub intena: bool,               // Were interrupts enabled before pushcli?
    pub proc: *mut Proc,            // The process running on this cpu, or null
}

impl Cpu {
    const fn new() -> Self {
        Cpu {
            apicid: 0,
            scheduler: ptr::null_mut(),
            ts: TaskState::zero(),
            gdt: [SegDesc::zero(); NSEGS],
            started: AtomicBool::new(false),
            ncli: 0,
            intena: false,
            proc: ptr::null_mut(),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub enum ProcState {
    UNUSED,
    EMBRYO,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

/// Per-process state
pub struct Proc {
    pub sz: usize,                    // Size of process memory (bytes)
    pub pgdir: PageDir,               // Page directory
    pub kstack: *mut u8,              // Bottom of kernel stack for this process
    pub state: ProcState,             // Process state
    pub pid: i32,                     // Process ID
    pub parent: *mut Proc,            // Parent process
    pub tf: *mut TrapFrame,           // Trap frame for current syscall
    pub context: *mut Context,        // swtch() here to run process
    pub chan: usize,                  // If non-zero, sleeping on chan
    pub killed: bool,                 // Has been killed?
    pub ofile: [*mut File; NOFILE],   // Open files
    pub cwd: *mut Inode,              // Current directory
    pub name: [u8; 16],               // Process name (debugging)
}

impl Proc {
    pub(crate) const fn new() -> Self {
        Proc {
            sz: 0,
            pgdir: ptr::null_mut(),
            kstack: ptr::null_mut(),
            state: ProcState::UNUSED,
            pid: 0,
            parent: ptr::null_mut(),
            tf: ptr::null_mut(),
            context: ptr::null_mut(),
            chan: 0,
            killed: false,
            ofile: [ptr::null_mut(); NOFILE],
            cwd: ptr::null_mut(),
            name: [0; 16],
        }
    }
}

pub static mut CPUS: [Cpu; NCPU] = {
    const C: Cpu = Cpu::new();
    [C; NCPU]
};

struct PTable {
    lock: SpinLock,
    proc: [Proc; NPROC],
}

static mut PTABLE: PTable = PTable {
    lock: SpinLock::new("ptable"),
    proc: {
        const P: Proc = Proc::new();
        [P; NPROC]
    },
};

static mut INITPROC: *mut Proc = ptr::null_mut();
static mut NEXTPID: i32 = 1;

static FSINIT: Once<()> = Once::new();

// The context switch primitive, cdecl: swtch(&mut old, new) pushes the
// callee-saved registers, stores the old stack pointer through the
// first argument, switches stacks, pops the target's registers, and
// returns into the target's saved %eip.
global_asm!(
    "
    .globl swtch
swtch:
    movl 4(%esp), %eax
    movl 8(%esp), %edx

    pushl %ebp
    pushl %ebx
    pushl %esi
    pushl %edi

    movl %esp, (%eax)
    movl %edx, %esp

    popl %edi
    popl %esi
    popl %ebx
    popl %ebp
    ret
",
    options(att_syntax)
);

extern "C" {
    pub fn swtch(old: *mut *mut Context, new: *mut Context);
    fn trapret();
}

/// The compiled form of the first user program:
///
///     push $argv; push $init; push $0
///     mov $SYS_EXEC, %eax; int $T_SYSCALL
///   exit:
///     mov $SYS_EXIT, %eax; int $T_SYSCALL
///     jmp exit
///   init: "/init\0"
///   argv: [init, 0]
///
/// It runs at user virtual address 0 and asks the kernel for
/// exec("/init", argv); if that ever returns it exits in a loop.
#[rustfmt::skip]
static INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, // push $argv (0x24)
    0x68, 0x1c, 0x00, 0x00, 0x00, // push $init (0x1c)
    0x6a, 0x00,                   // push $0 (fake return pc)
    0xb8, 0x07, 0x00, 0x00, 0x00, // mov $SYS_EXEC, %eax
    0xcd, 0x40,                   // int $T_SYSCALL
    0xb8, 0x02, 0x00, 0x00, 0x00, // mov $SYS_EXIT, %eax
    0xcd, 0x40,                   // int $T_SYSCALL
    0xeb, 0xf7,                   // jmp . - 7 (the exit loop)
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, // "/init\0"
    0x00, 0x00,                   // padding to align argv
    0x1c, 0x00, 0x00, 0x00,       // argv[0] = init
    0x00, 0x00, 0x00, 0x00,       // argv[1] = 0
];

/// Mark every slot unused. Called once at boot, before the first
/// allocproc.
pub unsafe fn pinit() {
    for p in PTABLE.proc.iter_mut() {
        p.state = ProcState::UNUSED;
    }
}

/// Must be called with interrupts disabled to avoid racing with a
/// move to a different CPU.
pub unsafe fn cpuid() -> usize {
    (mycpu() as usize - CPUS.as_ptr() as usize) / core::mem::size_of::<Cpu>()
}

/// Return this CPU's cpu struct, found by APIC id.
/// Interrupts must be disabled.
pub unsafe fn mycpu() -> *mut Cpu {
    if readeflags() & FL_IF != 0 {
        panic!("mycpu called with interrupts enabled");
    }
    let apicid = lapicid();
    for i in 0..ncpu() {
        if CPUS[i].apicid == apicid {
            return &mut CPUS[i];
        }
    }
    panic!("unknown apicid");
}

/// The current process, or null if none. Disables interrupts around
/// the read so the process cannot migrate mid-lookup.
pub unsafe fn myproc() -> *mut Proc {
    pushcli();
    let c = mycpu();
    let p = (*c).proc;
    popcli();
    p
}

/// Look in the process table for an UNUSED slot. If found, change
/// state to EMBRYO and initialize the state required to run in the
/// kernel. Otherwise return null.
unsafe fn allocproc() -> *mut Proc {
    PTABLE.lock.acquire();

    let mut found: *mut Proc = ptr::null_mut();
    for p in PTABLE.proc.iter_mut() {
        if p.state == ProcState::UNUSED {
            found = p;
            break;
        }
    }
    if found.is_null() {
        PTABLE.lock.release();
        return ptr::null_mut();
    }

    let p = found;
    (*p).state = ProcState::EMBRYO;
    (*p).pid = NEXTPID;
    NEXTPID += 1;
    PTABLE.lock.release();

    // Allocate the kernel stack.
    (*p).kstack = kalloc();
    if (*p).kstack.is_null() {
        (*p).state = ProcState::UNUSED;
        return ptr::null_mut();
    }
    let mut sp = (*p).kstack.add(KSTACKSIZE);

    // Leave room for the trap frame.
    sp = sp.sub(core::mem::size_of::<TrapFrame>());
    (*p).tf = sp as *mut TrapFrame;

    // Set up the new context to start executing at forkret, which
    // returns to trapret: once the context is popped, the top word on
    // the stack is trapret, which restores the trap frame as if
    // returning from an interrupt.
    sp = sp.sub(4);
    *(sp as *mut u32) = trapret as usize as u32;

    sp = sp.sub(core::mem::size_of::<Context>());
    (*p).context = sp as *mut Context;
    ptr::write_bytes((*p).context as *mut u8, 0, core::mem::size_of::<Context>());
    (*(*p).context).eip = forkret as usize as u32;

    p
}

/// Set up the first user process.
pub unsafe fn userinit() {
    let p = allocproc();
    if p.is_null() {
        panic!("userinit: no proc");
    }
    INITPROC = p;

    (*p).pgdir = setupkvm();
    if (*p).pgdir.is_null() {
        panic!("userinit: out of memory?");
    }
    inituvm((*p).pgdir, INITCODE.as_ptr(), INITCODE.len());
    (*p).sz = PGSIZE;

    // Build the trap frame the first "return" to user space restores:
    // user segments at CPL=3, interrupts enabled, stack at the top of
    // the single user page, execution starting at address zero.
    ptr::write_bytes((*p).tf as *mut u8, 0, core::mem::size_of::<TrapFrame>());
    (*(*p).tf).cs = (SEG_UCODE << 3) as u16 | DPL_USER as u16;
    (*(*p).tf).ds = (SEG_UDATA << 3) as u16 | DPL_USER as u16;
    (*(*p).tf).es = (*(*p).tf).ds;
    (*(*p).tf).ss = (*(*p).tf).ds;
    (*(*p).tf).eflags = FL_IF;
    (*(*p).tf).esp = PGSIZE as u32;
    (*(*p).tf).eip = 0; // beginning of initcode

    safestrcpy(&mut (*p).name, b"initcode");
    (*p).cwd = namei(b"/");

    // The assignment to state lets other cores run this process; the
    // lock forces the writes above to be visible first.
    PTABLE.lock.acquire();
    (*p).state = ProcState::RUNNABLE;
    PTABLE.lock.release();
}

/// Grow the current process's memory by n bytes (n may be negative).
/// Return 0 on success, -1 on failure.
pub unsafe fn growproc(n: i32) -> i32 {
    let p = myproc();
    let mut sz = (*p).sz;
    if n > 0 {
        sz = allocuvm((*p).pgdir, sz, sz + n as usize);
        if sz == 0 {
            return -1;
        }
    } else if n < 0 {
        sz = deallocuvm((*p).pgdir, sz, sz - (-n) as usize);
        if sz == 0 {
            return -1;
        }
    }
    (*p).sz = sz;
    switchuvm(p);
    0
}

/// Create a new process copying the current one as the parent.
/// Sets up the child's stack to return as if from fork(), with
/// return value 0.
pub unsafe fn fork() -> i32 {
    let curproc = myproc();

    let np = allocproc();
    if np.is_null() {
        return -1;
    }

    // Copy the whole user address space.
    (*np).pgdir = copyuvm((*curproc).pgdir, (*curproc).sz);
    if (*np).pgdir.is_null() {
        kfree((*np).kstack);
        (*np).kstack = ptr::null_mut();
        (*np).state = ProcState::UNUSED;
        return -1;
    }
    (*np).sz = (*curproc).sz;
    (*np).parent = curproc;
    *(*np).tf = ptr::read((*curproc).tf);

    // Clear %eax so that fork returns 0 in the child.
    (*(*np).tf).eax = 0;

    for i in 0..NOFILE {
        if !(*curproc).ofile[i].is_null() {
            (*np).ofile[i] = filedup((*curproc).ofile[i]);
        }
    }
    (*np).cwd = idup((*curproc).cwd);

    safestrcpy(&mut (*np).name, &(*curproc).name);

    let pid = (*np).pid;

    PTABLE.lock.acquire();
    (*np).state = ProcState::RUNNABLE;
    PTABLE.lock.release();

    pid
}

/// Exit the current process. Does not return. The process stays a
/// zombie until its parent calls wait() to learn it exited.
pub unsafe fn exit() -> ! {
    let curproc = myproc();

    if curproc == INITPROC {
        panic!("init exiting");
    }

    // Close all open files.
    for fd in 0..NOFILE {
        if !(*curproc).ofile[fd].is_null() {
            fileclose((*curproc).ofile[fd]);
            (*curproc).ofile[fd] = ptr::null_mut();
        }
    }

    crate::log::begin_op();
    iput((*curproc).cwd);
    crate::log::end_op();
    (*curproc).cwd = ptr::null_mut();

    PTABLE.lock.acquire();

    // Parent might be sleeping in wait().
    wakeup1((*curproc).parent as usize);

    // Pass abandoned children to init.
    for p in PTABLE.proc.iter_mut() {
        if p.parent == curproc {
            p.parent = INITPROC;
            if p.state == ProcState::ZOMBIE {
                wakeup1(INITPROC as usize);
            }
        }
    }

    // Jump into the scheduler, never to return.
    (*curproc).state = ProcState::ZOMBIE;
    sched();
    panic!("zombie exit");
}

/// Wait for a child process to exit and return its pid.
/// Return -1 if this process has no children.
pub unsafe fn wait() -> i32 {
    let curproc = myproc();

    PTABLE.lock.acquire();
    loop {
        // Scan the table looking for exited children.
        let mut havekids = false;
        for p in PTABLE.proc.iter_mut() {
            if p.parent != curproc {
                continue;
            }
            havekids = true;
            if p.state == ProcState::ZOMBIE {
                // Found one; reclaim everything it owned.
                let pid = p.pid;
                kfree(p.kstack);
                p.kstack = ptr::null_mut();
                freevm(p.pgdir);
                p.pgdir = ptr::null_mut();
                p.pid = 0;
                p.parent = ptr::null_mut();
                p.name[0] = 0;
                p.killed = false;
                p.state = ProcState::UNUSED;
                PTABLE.lock.release();
                return pid;
            }
        }

        // No point waiting if we don't have any children.
        if !havekids || (*curproc).killed {
            PTABLE.lock.release();
            return -1;
        }

        // Wait for children to exit. (See wakeup1 call in exit.)
        sleep(curproc as usize, &mut PTABLE.lock);
    }
}

/// Per-CPU process scheduler. Each CPU calls scheduler() after
/// setting itself up. Scheduler never returns. It loops, doing:
///  - choose a process to run
///  - swtch to start running that process
///  - eventually that process transfers control back via swtch
pub unsafe fn scheduler() -> ! {
    let c = mycpu();
    (*c).proc = ptr::null_mut();

    loop {
        // Enable interrupts on this processor.
        sti();

        // Loop over the process table looking for a process to run.
        PTABLE.lock.acquire();
        for p in PTABLE.proc.iter_mut() {
            if p.state != ProcState::RUNNABLE {
                continue;
            }

            // Switch to the chosen process. It is the process's job
            // to release ptable's lock and then reacquire it before
            // jumping back to us.
            (*c).proc = p;
            switchuvm(p);
            p.state = ProcState::RUNNING;

            swtch(&mut (*c).scheduler, p.context);
            switchkvm();

            // The process is done running for now; it should have
            // changed its state before coming back.
            (*c).proc = ptr::null_mut();
        }
        PTABLE.lock.release();
    }
}

/// Enter the scheduler. Must hold only ptable's lock and have changed
/// the current state. Saves and restores intena because intena is a
/// property of this kernel thread, not this CPU.
pub unsafe fn sched() {
    let p = myproc();
    let c = mycpu();

    if !PTABLE.lock.holding() {
        panic!("sched ptable lock");
    }
    if (*c).ncli != 1 {
        panic!("sched locks");
    }
    if (*p).state == ProcState::RUNNING {
        panic!("sched running");
    }
    if readeflags() & FL_IF != 0 {
        panic!("sched interruptible");
    }

    let intena = (*c).intena;
    swtch(&mut (*p).context, (*c).scheduler);
    // The thread may resume on a different CPU.
    (*mycpu()).intena = intena;
}

/// Give up the CPU for one scheduling round.
pub unsafe fn yield_proc() {
    PTABLE.lock.acquire();
    (*myproc()).state = ProcState::RUNNABLE;
    sched();
    PTABLE.lock.release();
}

/// A fork child's very first scheduling by scheduler() will swtch
/// here. "Return" to user space through the trapret slot that
/// allocproc planted above the context.
pub unsafe extern "C" fn forkret() {
    // Still holding ptable's lock from scheduler.
    PTABLE.lock.release();

    // Some initialization must run in the context of a regular
    // process (it sleeps), so it cannot run from main().
    FSINIT.call_once(|| unsafe {
        iinit(ROOTDEV);
        initlog(ROOTDEV);
    });
}

/// Atomically release lk and sleep on chan.
/// Reacquires lk when awakened.
pub unsafe fn sleep(chan: usize, lk: *mut SpinLock) {
    let p = myproc();

    if p.is_null() {
        panic!("sleep");
    }
    if lk.is_null() {
        panic!("sleep without lk");
    }

    // Must acquire ptable's lock in order to change state and then
    // call sched. Once it is held, no wakeup can be missed (wakeup
    // runs with the same lock held), so it is safe to let go of lk.
    let ptlock = ptr::addr_of_mut!(PTABLE.lock);
    if lk != ptlock {
        PTABLE.lock.acquire();
        (*lk).release();
    }

    // Go to sleep.
    (*p).chan = chan;
    (*p).state = ProcState::SLEEPING;
    sched();

    // Tidy up.
    (*p).chan = 0;

    // Reacquire the original lock.
    if lk != ptlock {
        PTABLE.lock.release();
        (*lk).acquire();
    }
}

/// Wake up all processes sleeping on chan.
/// ptable's lock must be held.
unsafe fn wakeup1(chan: usize) {
    for p in PTABLE.proc.iter_mut() {
        if p.state == ProcState::SLEEPING && p.chan == chan {
            p.state = ProcState::RUNNABLE;
        }
    }
}

/// Wake up all processes sleeping on chan.
pub unsafe fn wakeup(chan: usize) {
    PTABLE.lock.acquire();
    wakeup1(chan);
    PTABLE.lock.release();
}

/// Kill the process with the given pid. The victim won't exit until
/// it next crosses the user/kernel boundary (see trap).
pub unsafe fn kill(pid: i32) -> i32 {
    PTABLE.lock.acquire();
    for p in PTABLE.proc.iter_mut() {
        if p.pid == pid {
            p.killed = true;
            // Wake it from sleep if necessary, so it can notice.
            if p.state == ProcState::SLEEPING {
                p.state = ProcState::RUNNABLE;
            }
            PTABLE.lock.release();
            return 0;
        }
    }
    PTABLE.lock.release();
    -1
}

/// Print a process listing to the console for debugging.
/// Runs when a user types ^P on the console.
/// No lock, to avoid wedging a stuck machine further.
pub unsafe fn procdump() {
    for p in PTABLE.proc.iter() {
        if p.state == ProcState::UNUSED {
            continue;
        }
        let state = match p.state {
            ProcState::UNUSED => "unused",
            ProcState::EMBRYO => "embryo",
            ProcState::SLEEPING => "sleep ",
            ProcState::RUNNABLE => "runble",
            ProcState::RUNNING => "run   ",
            ProcState::ZOMBIE => "zombie",
        };
        let len = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
        let name = core::str::from_utf8(&p.name[..len]).unwrap_or("???");
        println!("{} {} {}", p.pid, state, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn unalloc(p: *mut Proc) {
        PTABLE.lock.acquire();
        kfree((*p).kstack);
        (*p).kstack = ptr::null_mut();
        (*p).pid = 0;
        (*p).tf = ptr::null_mut();
        (*p).context = ptr::null_mut();
        (*p).state = ProcState::UNUSED;
        PTABLE.lock.release();
    }

    #[test_case]
    fn allocproc_plants_trapret_above_context() {
        unsafe {
            let p = allocproc();
            assert!(!p.is_null());
            assert!((*p).state == ProcState::EMBRYO);

            // Trap frame at the very top of the kernel stack.
            let top = (*p).kstack as usize + KSTACKSIZE;
            assert_eq!((*p).tf as usize + core::mem::size_of::<TrapFrame>(), top);

            // One word below the trap frame: the trapret address the
            // context's ret will fall into.
            let slot = ((*p).context as usize + core::mem::size_of::<Context>()) as *const u32;
            assert_eq!(*slot, trapret as usize as u32);

            // The context itself resumes at forkret.
            assert_eq!((*(*p).context).eip, forkret as usize as u32);

            unalloc(p);
        }
    }

    #[test_case]
    fn pids_are_monotonic_and_slots_recycle() {
        unsafe {
            let a = allocproc();
            assert!(!a.is_null());
            let pid_a = (*a).pid;
            let b = allocproc();
            assert!(!b.is_null());
            assert_eq!((*b).pid, pid_a + 1);
            assert!(a != b);

            let slot = a;
            unalloc(a);
            unalloc(b);

            // A freed slot is found again by the linear scan.
            let c = allocproc();
            assert_eq!(c, slot);
            assert_eq!((*c).pid, pid_a + 2);
            unalloc(c);
        }
    }
}
