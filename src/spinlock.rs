use core::ptr;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use crate::memlayout::KERNBASE;
use crate::mmu::FL_IF;
use crate::proc::{mycpu, Cpu};
use crate::x86::{cli, readeflags, rebp, sti};

/// Mutual exclusion spin lock
pub struct SpinLock {
    locked: AtomicU32, // Is the lock held?

    // For debugging:
    pub name: &'static str,   // Name of lock
    pub cpu: *mut Cpu,        // The CPU holding the lock
    pub pcs: [usize; 10],     // The call stack (saved %eip chain) that locked the lock
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        SpinLock {
            locked: AtomicU32::new(0),
            name,
            cpu: ptr::null_mut(),
            pcs: [0; 10],
        }
    }

    /// Acquire the lock.
    /// Loops (spins) until the lock is acquired.
    /// Holding a lock for a long time may cause
    /// other CPUs to waste time spinning to acquire it.
    ///
    /// # Safety
    /// Re-entrant acquisition by the same CPU is a fatal error; the
    /// caller must not already hold this lock.
    pub unsafe fn acquire(&mut self) {
        // Some locks are taken from both process context and interrupt
        // handlers. If an interrupt arrived while this CPU held such a
        // lock, the handler would spin on it forever, so interrupts
        // stay off from before the swap until the matching release.
        // pushcli/popcli are counted, so holding two locks keeps
        // interrupts off until both are released.
        pushcli(); // disable interrupts to avoid deadlock
        if self.holding() {
            panic!("acquire {}", self.name);
        }

        // The swap compiles to a locked xchg, which is atomic.
        while self.locked.swap(1, Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }

        // Tell the compiler and the processor not to move loads or
        // stores past this point, so that the critical section's
        // memory references happen after the lock is acquired.
        fence(Ordering::SeqCst);

        // Record info about lock acquisition for debugging.
        self.cpu = mycpu();
        getcallerpcs(&mut self.pcs);
    }

    /// Release the lock.
    ///
    /// # Safety
    /// Must only be called by the CPU holding the lock.
    pub unsafe fn release(&mut self) {
        if !self.holding() {
            panic!("release {}", self.name);
        }

        self.pcs[0] = 0;
        self.cpu = ptr::null_mut();

        // Make all the stores in the critical section visible to other
        // cores before the lock is released.
        fence(Ordering::SeqCst);

        self.locked.store(0, Ordering::Release);

        popcli();
    }

    /// Check whether this cpu is holding the lock.
    ///
    /// # Safety
    /// Interrupts must be off.
    pub unsafe fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != 0 && self.cpu == mycpu()
    }
}

/// Record the current call stack in pcs[] by following the %ebp chain.
unsafe fn getcallerpcs(pcs: &mut [usize; 10]) {
    let mut ebp = rebp() as *const usize;
    let mut i = 0;
    while i < 10 {
        if ebp.is_null() || (ebp as usize) < KERNBASE || ebp as usize == 0xffffffff {
            break;
        }
        pcs[i] = *ebp.add(1); // saved %eip
        ebp = (*ebp) as *const usize; // saved %ebp
        i += 1;
    }
    while i < 10 {
        pcs[i] = 0;
        i += 1;
    }
}

/// Disable interrupts and increment this CPU's cli nesting depth.
/// The first push records whether interrupts were enabled so the
/// matching final popcli can restore them.
#[inline]
pub unsafe fn pushcli() {
    let eflags = readeflags();
    cli();
    let cpu = mycpu();
    if (*cpu).ncli == 0 {
        (*cpu).intena = eflags & FL_IF != 0;
    }
    (*cpu).ncli += 1;
}

/// Decrement the cli nesting depth and re-enable interrupts once the
/// depth reaches zero, if they were enabled at the first pushcli.
///
/// # Panics
/// If interrupts are currently enabled, or on more pops than pushes.
#[inline]
pub unsafe fn popcli() {
    if readeflags() & FL_IF != 0 {
        panic!("popcli - interruptible");
    }
    let cpu = mycpu();
    (*cpu).ncli -= 1;
    if (*cpu).ncli < 0 {
        panic!("popcli");
    }
    if (*cpu).ncli == 0 && (*cpu).intena {
        sti();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn acquire_release_preserve_interrupt_state() {
        unsafe {
            let before = readeflags() & FL_IF;
            let mut lk = SpinLock::new("testlock");
            lk.acquire();
            assert_eq!(readeflags() & FL_IF, 0);
            lk.release();
            assert_eq!(readeflags() & FL_IF, before);
        }
    }

    #[test_case]
    fn nested_cli_restores_only_at_depth_zero() {
        unsafe {
            let before = readeflags() & FL_IF;
            let mut a = SpinLock::new("outer");
            let mut b = SpinLock::new("inner");
            a.acquire();
            b.acquire();
            b.release();
            // Still holding a: interrupts must stay off.
            assert_eq!(readeflags() & FL_IF, 0);
            a.release();
            assert_eq!(readeflags() & FL_IF, before);
        }
    }

    #[test_case]
    fn holding_tracks_owner() {
        unsafe {
            let mut lk = SpinLock::new("owned");
            assert!(!lk.holding());
            lk.acquire();
            assert!(lk.holding());
            lk.release();
            pushcli();
            assert!(!lk.holding());
            popcli();
        }
    }
}
