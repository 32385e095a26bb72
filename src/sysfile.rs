//! File-descriptor and file-system system calls. Argument parsing
//! lives here; the heavy lifting is in file.rs, fs.rs and exec.rs.

use core::ptr;

use bitflags::bitflags;

use crate::exec::exec;
use crate::file::{
    filealloc, fileclose, filedup, fileread, filestat, filewrite, FdType, File,
};
use crate::fs::{
    dirlink, dirlookup, ialloc, ilock, iput, iunlock, iunlockput, iupdate, namei, nameiparent,
    readi, writei, Dirent, Inode, DIRSIZ,
};
use crate::log::{begin_op, end_op};
use crate::param::{MAXARG, MAXPATH, MAXSYMLINKS, NOFILE};
use crate::pipe::pipealloc;
use crate::proc::myproc;
use crate::stat::{Stat, T_DEV, T_DIR, T_FILE, T_SYMLINK};
use crate::string::strlen_cstr;
use crate::syscall::{argint, argptr, argstr, fetchint, fetchstr};

bitflags! {
    /// open() mode bits. O_RDONLY is the absence of the write bits.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_WRONLY = 0x001;
        const O_RDWR = 0x002;
        const O_CREATE = 0x200;
    }
}

/// Fetch the nth word-sized argument as a file descriptor and return
/// both the descriptor and the corresponding struct File.
unsafe fn argfd(n: usize, pfd: *mut i32, pf: *mut *mut File) -> i32 {
    let mut fd: i32 = 0;
    if argint(n, &mut fd) < 0 {
        return -1;
    }
    if fd < 0 || fd as usize >= NOFILE {
        return -1;
    }
    let f = (*myproc()).ofile[fd as usize];
    if f.is_null() {
        return -1;
    }
    if !pfd.is_null() {
        *pfd = fd;
    }
    if !pf.is_null() {
        *pf = f;
    }
    0
}

/// Allocate a file descriptor for the given file in the current
/// process's table.
unsafe fn fdalloc(f: *mut File) -> i32 {
    let curproc = myproc();
    for fd in 0..NOFILE {
        if (*curproc).ofile[fd].is_null() {
            (*curproc).ofile[fd] = f;
            return fd as i32;
        }
    }
    -1
}

/// Turn a fetched user path pointer into a byte slice.
unsafe fn path_slice(p: *const u8) -> &'static [u8] {
    core::slice::from_raw_parts(p, strlen_cstr(p))
}

pub unsafe fn sys_dup() -> i32 {
    let mut f: *mut File = ptr::null_mut();
    if argfd(0, ptr::null_mut(), &mut f) < 0 {
        return -1;
    }
    let fd = fdalloc(f);
    if fd < 0 {
        return -1;
    }
    filedup(f);
    fd
}

pub unsafe fn sys_read() -> i32 {
    let mut f: *mut File = ptr::null_mut();
    let mut n: i32 = 0;
    let mut p: *mut u8 = ptr::null_mut();
    if argfd(0, ptr::null_mut(), &mut f) < 0
        || argint(2, &mut n) < 0
        || argptr(1, &mut p, n as usize) < 0
    {
        return -1;
    }
    fileread(f, p, n)
}

pub unsafe fn sys_write() -> i32 {
    let mut f: *mut File = ptr::null_mut();
    let mut n: i32 = 0;
    let mut p: *mut u8 = ptr::null_mut();
    if argfd(0, ptr::null_mut(), &mut f) < 0
        || argint(2, &mut n) < 0
        || argptr(1, &mut p, n as usize) < 0
    {
        return -1;
    }
    filewrite(f, p, n)
}

pub unsafe fn sys_close() -> i32 {
    let mut fd: i32 = 0;
    let mut f: *mut File = ptr::null_mut();
    if argfd(0, &mut fd, &mut f) < 0 {
        return -1;
    }
    (*myproc()).ofile[fd as usize] = ptr::null_mut();
    fileclose(f);
    0
}

pub unsafe fn sys_fstat() -> i32 {
    let mut f: *mut File = ptr::null_mut();
    let mut st: *mut u8 = ptr::null_mut();
    if argfd(0, ptr::null_mut(), &mut f) < 0
        || argptr(1, &mut st, core::mem::size_of::<Stat>()) < 0
    {
        return -1;
    }
    filestat(f, st as *mut Stat)
}

/// Create the path new as a link to the same inode as old.
pub unsafe fn sys_link() -> i32 {
    let mut oldp: *const u8 = ptr::null();
    let mut newp: *const u8 = ptr::null();
    if argstr(0, &mut oldp) < 0 || argstr(1, &mut newp) < 0 {
        return -1;
    }
    let old = path_slice(oldp);
    let new = path_slice(newp);

    begin_op();
    let ip = namei(old);
    if ip.is_null() {
        end_op();
        return -1;
    }

    ilock(ip);
    if (*ip).typ == T_DIR {
        iunlockput(ip);
        end_op();
        return -1;
    }

    (*ip).nlink += 1;
    iupdate(ip);
    iunlock(ip);

    let mut name = [0u8; DIRSIZ];
    let dp = nameiparent(new, &mut name);
    let ok = if dp.is_null() {
        false
    } else {
        ilock(dp);
        let namelen = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        let r = (*dp).dev == (*ip).dev && dirlink(dp, &name[..namelen], (*ip).inum) == 0;
        iunlockput(dp);
        r
    };

    if !ok {
        // Undo the link count.
        ilock(ip);
        (*ip).nlink -= 1;
        iupdate(ip);
        iunlockput(ip);
        end_op();
        return -1;
    }

    iput(ip);
    end_op();
    0
}

/// Is the directory dp empty except for "." and ".." ?
unsafe fn isdirempty(dp: *mut Inode) -> bool {
    let desz = core::mem::size_of::<Dirent>() as u32;
    let mut de = Dirent {
        inum: 0,
        name: [0; DIRSIZ],
    };
    let mut off = 2 * desz;
    while off < (*dp).size {
        if readi(dp, &mut de as *mut Dirent as *mut u8, off, desz) != desz as i32 {
            panic!("isdirempty: readi");
        }
        if de.inum != 0 {
            return false;
        }
        off += desz;
    }
    true
}

pub unsafe fn sys_unlink() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    if argstr(0, &mut pathp) < 0 {
        return -1;
    }
    let path = path_slice(pathp);

    begin_op();
    let mut name = [0u8; DIRSIZ];
    let dp = nameiparent(path, &mut name);
    if dp.is_null() {
        end_op();
        return -1;
    }

    ilock(dp);
    let namelen = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
    let name = &name[..namelen];

    // Cannot unlink "." or "..".
    if name == b"." || name == b".." {
        iunlockput(dp);
        end_op();
        return -1;
    }

    let mut off: u32 = 0;
    let ip = dirlookup(dp, name, &mut off);
    if ip.is_null() {
        iunlockput(dp);
        end_op();
        return -1;
    }
    ilock(ip);

    if (*ip).nlink < 1 {
        panic!("unlink: nlink < 1");
    }
    if (*ip).typ == T_DIR && !isdirempty(ip) {
        iunlockput(ip);
        iunlockput(dp);
        end_op();
        return -1;
    }

    let desz = core::mem::size_of::<Dirent>() as u32;
    let de = Dirent {
        inum: 0,
        name: [0; DIRSIZ],
    };
    if writei(dp, &de as *const Dirent as *const u8, off, desz) != desz as i32 {
        panic!("unlink: writei");
    }
    if (*ip).typ == T_DIR {
        (*dp).nlink -= 1;
        iupdate(dp);
    }
    iunlockput(dp);

    (*ip).nlink -= 1;
    iupdate(ip);
    iunlockput(ip);

    end_op();
    0
}

/// Create an inode at path of the given type, returning it locked.
unsafe fn create(path: &[u8], typ: i16, major: i16, minor: i16) -> *mut Inode {
    let mut name = [0u8; DIRSIZ];
    let dp = nameiparent(path, &mut name);
    if dp.is_null() {
        return ptr::null_mut();
    }
    ilock(dp);

    let namelen = name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
    let name = &name[..namelen];

    let mut ip = dirlookup(dp, name, ptr::null_mut());
    if !ip.is_null() {
        iunlockput(dp);
        ilock(ip);
        if typ == T_FILE && ((*ip).typ == T_FILE || (*ip).typ == T_DEV) {
            return ip;
        }
        iunlockput(ip);
        return ptr::null_mut();
    }

    ip = ialloc((*dp).dev, typ);
    if ip.is_null() {
        panic!("create: ialloc");
    }

    ilock(ip);
    (*ip).major = major;
    (*ip).minor = minor;
    (*ip).nlink = 1;
    iupdate(ip);

    if typ == T_DIR {
        // Create . and .. entries; the parent gains a link from "..".
        (*dp).nlink += 1;
        iupdate(dp);
        if dirlink(ip, b".", (*ip).inum) < 0 || dirlink(ip, b"..", (*dp).inum) < 0 {
            panic!("create dots");
        }
    }

    if dirlink(dp, name, (*ip).inum) < 0 {
        panic!("create: dirlink");
    }

    iunlockput(dp);
    ip
}

pub unsafe fn sys_open() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    let mut omode: i32 = 0;
    if argstr(0, &mut pathp) < 0 || argint(1, &mut omode) < 0 {
        return -1;
    }
    let mut path = path_slice(pathp);
    let omode = OpenFlags::from_bits_truncate(omode as u32);

    begin_op();

    let ip = if omode.contains(OpenFlags::O_CREATE) {
        let ip = create(path, T_FILE, 0, 0);
        if ip.is_null() {
            end_op();
            return -1;
        }
        ip
    } else {
        let mut target = [0u8; MAXPATH];
        let mut depth = 0;
        loop {
            let i = namei(path);
            if i.is_null() {
                end_op();
                return -1;
            }
            ilock(i);
            if (*i).typ == T_SYMLINK {
                // Chase the link, with a depth cap against cycles.
                depth += 1;
                if depth > MAXSYMLINKS {
                    iunlockput(i);
                    end_op();
                    return -1;
                }
                let len = core::cmp::min((*i).size as usize, MAXPATH);
                if readi(i, target.as_mut_ptr(), 0, len as u32) != len as i32 {
                    iunlockput(i);
                    end_op();
                    return -1;
                }
                iunlockput(i);
                path = core::slice::from_raw_parts(target.as_ptr(), len);
                continue;
            }
            if (*i).typ == T_DIR && omode.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR) {
                iunlockput(i);
                end_op();
                return -1;
            }
            break i;
        }
    };

    let f = filealloc();
    let fd = if f.is_null() { -1 } else { fdalloc(f) };
    if f.is_null() || fd < 0 {
        if !f.is_null() {
            fileclose(f);
        }
        iunlockput(ip);
        end_op();
        return -1;
    }
    (*f).typ = FdType::FD_INODE;
    (*f).ip = ip;
    (*f).off = 0;
    (*f).readable = !omode.contains(OpenFlags::O_WRONLY);
    (*f).writable =
        omode.contains(OpenFlags::O_WRONLY) || omode.contains(OpenFlags::O_RDWR);

    iunlock(ip);
    end_op();
    fd
}

pub unsafe fn sys_mkdir() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    begin_op();
    if argstr(0, &mut pathp) < 0 {
        end_op();
        return -1;
    }
    let ip = create(path_slice(pathp), T_DIR, 0, 0);
    if ip.is_null() {
        end_op();
        return -1;
    }
    iunlockput(ip);
    end_op();
    0
}

pub unsafe fn sys_mknod() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    let mut major: i32 = 0;
    let mut minor: i32 = 0;
    begin_op();
    if argstr(0, &mut pathp) < 0 || argint(1, &mut major) < 0 || argint(2, &mut minor) < 0 {
        end_op();
        return -1;
    }
    let ip = create(path_slice(pathp), T_DEV, major as i16, minor as i16);
    if ip.is_null() {
        end_op();
        return -1;
    }
    iunlockput(ip);
    end_op();
    0
}

pub unsafe fn sys_chdir() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    let curproc = myproc();

    begin_op();
    if argstr(0, &mut pathp) < 0 {
        end_op();
        return -1;
    }
    let ip = namei(path_slice(pathp));
    if ip.is_null() {
        end_op();
        return -1;
    }
    ilock(ip);
    if (*ip).typ != T_DIR {
        iunlockput(ip);
        end_op();
        return -1;
    }
    iunlock(ip);
    iput((*curproc).cwd);
    end_op();
    (*curproc).cwd = ip;
    0
}

pub unsafe fn sys_exec() -> i32 {
    let mut pathp: *const u8 = ptr::null();
    let mut uargv: i32 = 0;
    if argstr(0, &mut pathp) < 0 || argint(1, &mut uargv) < 0 {
        return -1;
    }
    let path = path_slice(pathp);

    let mut argv: [*const u8; MAXARG] = [ptr::null(); MAXARG];
    let mut i = 0;
    loop {
        if i >= argv.len() {
            return -1;
        }
        let mut uarg: i32 = 0;
        if fetchint(uargv as u32 as usize + 4 * i, &mut uarg) < 0 {
            return -1;
        }
        if uarg == 0 {
            argv[i] = ptr::null();
            break;
        }
        let mut s: *const u8 = ptr::null();
        if fetchstr(uarg as u32 as usize, &mut s) < 0 {
            return -1;
        }
        argv[i] = s;
        i += 1;
    }
    exec(path, &argv)
}

pub unsafe fn sys_pipe() -> i32 {
    let mut fdarray: *mut u8 = ptr::null_mut();
    if argptr(0, &mut fdarray, 2 * core::mem::size_of::<i32>()) < 0 {
        return -1;
    }
    let mut rf: *mut File = ptr::null_mut();
    let mut wf: *mut File = ptr::null_mut();
    if pipealloc(&mut rf, &mut wf) < 0 {
        return -1;
    }
    let fd0 = fdalloc(rf);
    let fd1 = if fd0 >= 0 { fdalloc(wf) } else { -1 };
    if fd0 < 0 || fd1 < 0 {
        if fd0 >= 0 {
            (*myproc()).ofile[fd0 as usize] = ptr::null_mut();
        }
        fileclose(rf);
        fileclose(wf);
        return -1;
    }
    let fds = fdarray as *mut i32;
    *fds = fd0;
    *fds.add(1) = fd1;
    0
}

/// Create a symbolic link at path holding target.
pub unsafe fn sys_symlink() -> i32 {
    let mut targetp: *const u8 = ptr::null();
    let mut pathp: *const u8 = ptr::null();
    if argstr(0, &mut targetp) < 0 || argstr(1, &mut pathp) < 0 {
        return -1;
    }
    let target = path_slice(targetp);
    let path = path_slice(pathp);

    begin_op();
    let ip = create(path, T_SYMLINK, 0, 0);
    if ip.is_null() {
        end_op();
        return -1;
    }
    // The link target is the inode's sole content.
    if writei(ip, target.as_ptr(), 0, target.len() as u32) != target.len() as i32 {
        iunlockput(ip);
        end_op();
        return -1;
    }
    iunlockput(ip);
    end_op();
    0
}
