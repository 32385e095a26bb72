use crate::proc::{exit, fork, growproc, kill, myproc, sleep, wait};
use crate::syscall::argint;
use crate::trap::{TICKS, TICKSLOCK};

pub unsafe fn sys_fork() -> i32 {
    fork()
}

pub unsafe fn sys_exit() -> i32 {
    exit()
}

pub unsafe fn sys_wait() -> i32 {
    wait()
}

pub unsafe fn sys_kill() -> i32 {
    let mut pid: i32 = 0;
    if argint(0, &mut pid) < 0 {
        return -1;
    }
    kill(pid)
}

pub unsafe fn sys_getpid() -> i32 {
    (*myproc()).pid
}

pub unsafe fn sys_sbrk() -> i32 {
    let mut n: i32 = 0;
    if argint(0, &mut n) < 0 {
        return -1;
    }
    let addr = (*myproc()).sz;
    if growproc(n) < 0 {
        return -1;
    }
    addr as i32
}

/// Sleep for n clock ticks. The tick counter is the channel; the
/// timer interrupt wakes all sleepers each tick and each re-checks
/// how far it has come.
pub unsafe fn sys_sleep() -> i32 {
    let mut n: i32 = 0;
    if argint(0, &mut n) < 0 {
        return -1;
    }
    TICKSLOCK.acquire();
    let ticks0 = TICKS;
    while TICKS.wrapping_sub(ticks0) < n as u32 {
        if (*myproc()).killed {
            TICKSLOCK.release();
            return -1;
        }
        sleep(
            core::ptr::addr_of!(TICKS) as usize,
            core::ptr::addr_of_mut!(TICKSLOCK),
        );
    }
    TICKSLOCK.release();
    0
}

/// How many clock ticks have elapsed since start.
pub unsafe fn sys_uptime() -> i32 {
    TICKSLOCK.acquire();
    let xticks = TICKS;
    TICKSLOCK.release();
    xticks as i32
}
