//! System call dispatch.
//!
//! User code traps in with int T_SYSCALL, the call number in %eax and
//! the arguments on the user stack, just above the saved return
//! address of the C library stub: argument n lives at %esp+4+4*n.
//! The return value goes back in %eax.

use crate::proc::myproc;
use crate::string::strlen;

// System call numbers
pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_PIPE: usize = 4;
pub const SYS_READ: usize = 5;
pub const SYS_KILL: usize = 6;
pub const SYS_EXEC: usize = 7;
pub const SYS_FSTAT: usize = 8;
pub const SYS_CHDIR: usize = 9;
pub const SYS_DUP: usize = 10;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_OPEN: usize = 15;
pub const SYS_WRITE: usize = 16;
pub const SYS_MKNOD: usize = 17;
pub const SYS_UNLINK: usize = 18;
pub const SYS_LINK: usize = 19;
pub const SYS_MKDIR: usize = 20;
pub const SYS_CLOSE: usize = 21;
pub const SYS_SYMLINK: usize = 22;

/// Fetch the int at addr from the current process.
///
/// The paging hardware stops user code from touching anything outside
/// its own address space, but the kernel can dereference any address
/// a user program hands it, so every user address is checked against
/// the process size before use.
pub unsafe fn fetchint(addr: usize, ip: *mut i32) -> i32 {
    let p = myproc();
    if addr >= (*p).sz || addr + 4 > (*p).sz {
        return -1;
    }
    // The user and kernel share the process page directory, so the
    // address can be dereferenced directly.
    *ip = core::ptr::read_unaligned(addr as *const i32);
    0
}

/// Fetch the nul-terminated string at addr from the current process.
/// Doesn't actually copy the string, just sets *pp to point at it.
/// Returns the length of the string, not including nul, or -1.
pub unsafe fn fetchstr(addr: usize, pp: *mut *const u8) -> i32 {
    let p = myproc();
    if addr >= (*p).sz {
        return -1;
    }
    *pp = addr as *const u8;
    let mut s = addr;
    while s < (*p).sz {
        if *(s as *const u8) == 0 {
            return (s - addr) as i32;
        }
        s += 1;
    }
    -1
}

/// Fetch the nth 32-bit system call argument.
pub unsafe fn argint(n: usize, ip: *mut i32) -> i32 {
    let p = myproc();
    fetchint((*(*p).tf).esp as usize + 4 + 4 * n, ip)
}

/// Fetch the nth word-sized system call argument as a pointer to a
/// block of memory of the given size, checking that the whole block
/// lies within the process address space.
pub unsafe fn argptr(n: usize, pp: *mut *mut u8, size: usize) -> i32 {
    let mut i: i32 = 0;
    if argint(n, &mut i) < 0 {
        return -1;
    }
    let p = myproc();
    let a = i as u32 as usize;
    if a >= (*p).sz || a + size > (*p).sz {
        return -1;
    }
    *pp = a as *mut u8;
    0
}

/// Fetch the nth word-sized system call argument as a string pointer,
/// checking that the pointer is valid and the string nul-terminated.
/// (There is no shared writable memory, so the string cannot change
/// between this check and its use by the kernel.)
pub unsafe fn argstr(n: usize, pp: *mut *const u8) -> i32 {
    let mut addr: i32 = 0;
    if argint(n, &mut addr) < 0 {
        return -1;
    }
    fetchstr(addr as u32 as usize, pp)
}

use crate::sysfile::{
    sys_chdir, sys_close, sys_dup, sys_exec, sys_fstat, sys_link, sys_mkdir, sys_mknod, sys_open,
    sys_pipe, sys_read, sys_symlink, sys_unlink, sys_write,
};
use crate::sysproc::{
    sys_fork, sys_exit, sys_getpid, sys_kill, sys_sbrk, sys_sleep, sys_uptime, sys_wait,
};

type SyscallFn = unsafe fn() -> i32;

static SYSCALLS: [Option<SyscallFn>; 23] = {
    let mut t: [Option<SyscallFn>; 23] = [None; 23];
    t[SYS_FORK] = Some(sys_fork as SyscallFn);
    t[SYS_EXIT] = Some(sys_exit as SyscallFn);
    t[SYS_WAIT] = Some(sys_wait as SyscallFn);
    t[SYS_PIPE] = Some(sys_pipe as SyscallFn);
    t[SYS_READ] = Some(sys_read as SyscallFn);
    t[SYS_KILL] = Some(sys_kill as SyscallFn);
    t[SYS_EXEC] = Some(sys_exec as SyscallFn);
    t[SYS_FSTAT] = Some(sys_fstat as SyscallFn);
    t[SYS_CHDIR] = Some(sys_chdir as SyscallFn);
    t[SYS_DUP] = Some(sys_dup as SyscallFn);
    t[SYS_GETPID] = Some(sys_getpid as SyscallFn);
    t[SYS_SBRK] = Some(sys_sbrk as SyscallFn);
    t[SYS_SLEEP] = Some(sys_sleep as SyscallFn);
    t[SYS_UPTIME] = Some(sys_uptime as SyscallFn);
    t[SYS_OPEN] = Some(sys_open as SyscallFn);
    t[SYS_WRITE] = Some(sys_write as SyscallFn);
    t[SYS_MKNOD] = Some(sys_mknod as SyscallFn);
    t[SYS_UNLINK] = Some(sys_unlink as SyscallFn);
    t[SYS_LINK] = Some(sys_link as SyscallFn);
    t[SYS_MKDIR] = Some(sys_mkdir as SyscallFn);
    t[SYS_CLOSE] = Some(sys_close as SyscallFn);
    t[SYS_SYMLINK] = Some(sys_symlink as SyscallFn);
    t
};

/// Look the saved call number up in the table, run the handler, and
/// store its result back into the saved %eax.
pub unsafe fn syscall() {
    let p = myproc();
    let num = (*(*p).tf).eax as usize;

    if num > 0 && num < SYSCALLS.len() {
        if let Some(f) = SYSCALLS[num] {
            (*(*p).tf).eax = f() as u32;
            return;
        }
    }

    let len = strlen(&(*p).name);
    log::warn!(
        "{} {}: unknown sys call {}",
        (*p).pid,
        core::str::from_utf8(&(*p).name[..len]).unwrap_or("???"),
        num
    );
    (*(*p).tf).eax = -1i32 as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::{mycpu, Proc, TrapFrame};
    use core::ptr;

    // Stand up a fake current process whose "user size" covers a
    // kernel buffer, so the fetchers' arithmetic can be driven
    // without a live user address space.
    unsafe fn with_proc(sz: usize, f: impl FnOnce(*mut Proc)) {
        let mut tf: TrapFrame = core::mem::zeroed();
        let mut p = Proc::new();
        p.sz = sz;
        p.tf = &mut tf;
        let c = mycpu();
        let old = (*c).proc;
        (*c).proc = &mut p;
        f(&mut p);
        (*c).proc = old;
    }

    #[test_case]
    fn fetchint_rejects_out_of_range_addresses() {
        unsafe {
            with_proc(4096, |_| {
                let mut v: i32 = 0;
                assert_eq!(fetchint(4096, &mut v), -1);
                assert_eq!(fetchint(4094, &mut v), -1); // tail crosses sz
            });
        }
    }

    #[test_case]
    fn fetchstr_requires_terminator_below_sz() {
        unsafe {
            let buf = *b"hello\0trailing";
            let base = buf.as_ptr() as usize;
            // Size ends right after the terminator: the string reads.
            with_proc(base + 6, |_| {
                let mut s: *const u8 = ptr::null();
                assert_eq!(fetchstr(base, &mut s), 5);
                assert_eq!(s, buf.as_ptr());
            });
            // Size ends before the terminator: rejected.
            with_proc(base + 5, |_| {
                let mut s: *const u8 = ptr::null();
                assert_eq!(fetchstr(base, &mut s), -1);
            });
        }
    }
}
