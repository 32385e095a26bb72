use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::SpinLock;

/// Long-term lock for processes: a mutex that yields the CPU while
/// contended instead of spinning. The lock's own address is the sleep
/// channel.
pub struct SleepLock {
    locked: bool,         // Is the lock held?
    lk: SpinLock,         // spinlock protecting this sleep lock
    pub name: &'static str, // Name of lock, for debugging
    pub pid: i32,         // Process holding lock
}

impl SleepLock {
    pub const fn new(name: &'static str) -> Self {
        SleepLock {
            locked: false,
            lk: SpinLock::new("sleep lock"),
            name,
            pid: 0,
        }
    }

    pub unsafe fn acquire(&mut self) {
        self.lk.acquire();
        while self.locked {
            sleep(self as *mut SleepLock as usize, &mut self.lk);
        }
        self.locked = true;
        self.pid = (*myproc()).pid;
        self.lk.release();
    }

    pub unsafe fn release(&mut self) {
        self.lk.acquire();
        self.locked = false;
        self.pid = 0;
        wakeup(self as *mut SleepLock as usize);
        self.lk.release();
    }

    /// Check whether the current process holds the lock.
    pub unsafe fn holding(&mut self) -> bool {
        self.lk.acquire();
        let r = self.locked && self.pid == (*myproc()).pid;
        self.lk.release();
        r
    }
}
