//! Console input and output. Output goes to the serial port; input
//! arrives from the serial port and the keyboard through consoleintr,
//! which implements the line discipline. The console is device
//! (major, minor) = (1, 1) in the device switch.

use core::fmt::{self, Write};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::file::{Devsw, CONSOLE, DEVSW};
use crate::fs::{ilock, iunlock, Inode};
use crate::proc::{myproc, procdump, sleep, wakeup};
use crate::spinlock::SpinLock;
use crate::uart::uartputc;

const BACKSPACE: i32 = 0x100;
const INPUT_BUF: usize = 128;

/// Control-x
const fn ctrl(x: u8) -> i32 {
    (x - b'@') as i32
}

static PANICKED: AtomicBool = AtomicBool::new(false);

pub fn panicked() -> bool {
    PANICKED.load(Ordering::SeqCst)
}

/// Called first from the panic handler: output from here on is
/// best-effort and unlocked, so a wedged lock cannot swallow the
/// banner.
pub fn panic_unlock() {
    unsafe {
        CONS.locking = false;
    }
}

/// Called once the banner is out; freezes any CPU that still tries to
/// print.
pub fn set_panicked() {
    PANICKED.store(true, Ordering::SeqCst);
}

struct Cons {
    lock: SpinLock,
    locking: bool,
}

static mut CONS: Cons = Cons {
    lock: SpinLock::new("console"),
    locking: false,
};

unsafe fn consputc(c: i32) {
    if panicked() {
        crate::x86::cli();
        loop {
            crate::x86::hlt();
        }
    }

    if c == BACKSPACE {
        // Overwrite the previous character with a space.
        uartputc(8);
        uartputc(b' ');
        uartputc(8);
    } else {
        uartputc(c as u8);
    }
}

struct Input {
    buf: [u8; INPUT_BUF],
    r: u32, // read index
    w: u32, // write index
    e: u32, // edit index
}

static mut INPUT: Input = Input {
    buf: [0; INPUT_BUF],
    r: 0,
    w: 0,
    e: 0,
}; // input.r <= input.w <= input.e, modulo INPUT_BUF

/// Feed characters from a device's non-blocking getc into the line
/// buffer, handling the editing keys.
pub unsafe fn consoleintr(getc: unsafe fn() -> i32) {
    let mut doprocdump = false;

    CONS.lock.acquire();
    loop {
        let mut c = getc();
        if c < 0 {
            break;
        }
        match c {
            _ if c == ctrl(b'P') => {
                // procdump() locks the process table; defer it until
                // the console lock is down.
                doprocdump = true;
            }
            _ if c == ctrl(b'U') => {
                // Kill line.
                while INPUT.e != INPUT.w
                    && INPUT.buf[(INPUT.e.wrapping_sub(1)) as usize % INPUT_BUF] != b'\n'
                {
                    INPUT.e = INPUT.e.wrapping_sub(1);
                    consputc(BACKSPACE);
                }
            }
            _ if c == ctrl(b'H') || c == 0x7f => {
                // Backspace.
                if INPUT.e != INPUT.w {
                    INPUT.e = INPUT.e.wrapping_sub(1);
                    consputc(BACKSPACE);
                }
            }
            _ => {
                if c != 0 && INPUT.e.wrapping_sub(INPUT.r) < INPUT_BUF as u32 {
                    if c == b'\r' as i32 {
                        c = b'\n' as i32;
                    }
                    INPUT.buf[INPUT.e as usize % INPUT_BUF] = c as u8;
                    INPUT.e = INPUT.e.wrapping_add(1);
                    consputc(c);
                    if c == b'\n' as i32
                        || c == ctrl(b'D')
                        || INPUT.e == INPUT.r.wrapping_add(INPUT_BUF as u32)
                    {
                        // A whole line (or ^D, or a full buffer) is
                        // available to readers.
                        INPUT.w = INPUT.e;
                        wakeup(ptr::addr_of!(INPUT.r) as usize);
                    }
                }
            }
        }
    }
    CONS.lock.release();

    if doprocdump {
        procdump();
    }
}

/// The console read half of the device switch. Blocks until a full
/// line is available.
unsafe fn consoleread(ip: *mut Inode, mut dst: *mut u8, n: i32) -> i32 {
    iunlock(ip);

    let target = n;
    let mut n = n;
    CONS.lock.acquire();
    while n > 0 {
        while INPUT.r == INPUT.w {
            if (*myproc()).killed {
                CONS.lock.release();
                ilock(ip);
                return -1;
            }
            sleep(
                ptr::addr_of!(INPUT.r) as usize,
                ptr::addr_of_mut!(CONS.lock),
            );
        }
        let c = INPUT.buf[INPUT.r as usize % INPUT_BUF];
        INPUT.r = INPUT.r.wrapping_add(1);
        if c as i32 == ctrl(b'D') {
            // End of file. Save ^D for next time if this read already
            // consumed something, so the caller gets a 0-byte read.
            if n < target {
                INPUT.r = INPUT.r.wrapping_sub(1);
            }
            break;
        }
        *dst = c;
        dst = dst.add(1);
        n -= 1;
        if c == b'\n' {
            break;
        }
    }
    CONS.lock.release();
    ilock(ip);

    target - n
}

/// The console write half of the device switch.
unsafe fn consolewrite(ip: *mut Inode, buf: *const u8, n: i32) -> i32 {
    iunlock(ip);
    CONS.lock.acquire();
    for i in 0..n as usize {
        consputc(*buf.add(i) as i32);
    }
    CONS.lock.release();
    ilock(ip);
    n
}

pub struct Stdout;

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            unsafe { consputc(b as i32) };
        }
        Ok(())
    }
}

pub fn _print(args: fmt::Arguments) {
    unsafe {
        let locking = CONS.locking;
        if locking {
            CONS.lock.acquire();
        }
        let _ = Stdout.write_fmt(args);
        if locking {
            CONS.lock.release();
        }
    }
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Serial-backed implementation of the log facade. Boot progress and
/// kernel warnings are emitted through this.
struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let level = match record.level() {
                log::Level::Error => "error",
                log::Level::Warn => "warn",
                log::Level::Info => "info",
                log::Level::Debug => "debug",
                log::Level::Trace => "trace",
            };
            println!("[{}] {}", level, record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLog = KernelLog;

pub unsafe fn consoleinit() {
    DEVSW[CONSOLE] = Devsw {
        read: Some(consoleread),
        write: Some(consolewrite),
    };
    CONS.locking = true;

    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);

    crate::picirq::picenable(crate::trap::IRQ_KBD);
    crate::ioapic::ioapicenable(crate::trap::IRQ_KBD, 0);
}
