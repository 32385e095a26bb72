//! Multiprocessor configuration discovery, following the Intel MP
//! specification: find the floating pointer structure, then walk the
//! configuration table to learn the CPUs' APIC ids, the local APIC
//! address, and the I/O APIC id. Application-processor startup is a
//! boot concern outside this kernel's scope; the table scan exists so
//! mycpu() can key off the APIC id on any CPU that is running.

use core::ptr;

use crate::ioapic::IOAPICID;
use crate::lapic::LAPIC;
use crate::memlayout::p2v;
use crate::param::NCPU;
use crate::proc::CPUS;

/// MP floating pointer structure ("_MP_").
#[repr(C)]
struct Mp {
    signature: [u8; 4],
    physaddr: u32, // physical address of MP config table
    length: u8,
    specrev: u8,
    checksum: u8, // all bytes must add up to 0
    typ: u8,      // MP system config type
    imcrp: u8,
    reserved: [u8; 3],
}

/// MP configuration table header ("PCMP").
#[repr(C)]
struct MpConf {
    signature: [u8; 4],
    length: u16,
    version: u8,
    checksum: u8,
    product: [u8; 20],
    oemtable: u32,
    oemlength: u16,
    entry: u16,      // entry count
    lapicaddr: u32,  // address of local APIC
    xlength: u16,
    xchecksum: u8,
    reserved: u8,
}

/// Processor table entry.
#[repr(C)]
struct MpProc {
    typ: u8,
    apicid: u8, // local APIC id
    version: u8,
    flags: u8,
    signature: [u8; 4],
    feature: u32,
    reserved: [u8; 8],
}

/// I/O APIC table entry.
#[repr(C)]
struct MpIoapic {
    typ: u8,
    apicno: u8,
    version: u8,
    flags: u8,
    addr: u32,
}

// Table entry types
const MPPROC: u8 = 0x00;
const MPBUS: u8 = 0x01;
const MPIOAPIC: u8 = 0x02;
const MPIOINTR: u8 = 0x03;
const MPLINTR: u8 = 0x04;

static mut NCPU_FOUND: usize = 1;

/// Number of CPUs discovered at boot (at least 1).
pub unsafe fn ncpu() -> usize {
    NCPU_FOUND
}

/// Did boot find an MP configuration (and therefore a local APIC)?
pub unsafe fn ismp() -> bool {
    !LAPIC.is_null()
}

unsafe fn sum(addr: *const u8, len: usize) -> u8 {
    let mut s: u8 = 0;
    for i in 0..len {
        s = s.wrapping_add(*addr.add(i));
    }
    s
}

/// Look for an MP structure in the len bytes at physical address a.
unsafe fn mpsearch1(a: usize, len: usize) -> *const Mp {
    let addr = p2v(a);
    let mut p = addr;
    while p < addr + len {
        let mp = p as *const Mp;
        if (*mp).signature == *b"_MP_" && sum(p as *const u8, core::mem::size_of::<Mp>()) == 0 {
            return mp;
        }
        p += core::mem::size_of::<Mp>();
    }
    ptr::null()
}

/// Search for the MP floating pointer structure, which the spec says
/// is in one of the following three locations:
/// 1) in the first KB of the EBDA;
/// 2) in the last KB of system base memory;
/// 3) in the BIOS ROM between 0xF0000 and 0xFFFFF.
unsafe fn mpsearch() -> *const Mp {
    let bda = p2v(0x400) as *const u8;

    let ebda = (((*bda.add(0x0F) as usize) << 8) | *bda.add(0x0E) as usize) << 4;
    if ebda != 0 {
        let mp = mpsearch1(ebda, 1024);
        if !mp.is_null() {
            return mp;
        }
    } else {
        let base = (((*bda.add(0x14) as usize) << 8) | *bda.add(0x13) as usize) * 1024;
        let mp = mpsearch1(base - 1024, 1024);
        if !mp.is_null() {
            return mp;
        }
    }
    mpsearch1(0xF0000, 0x10000)
}

/// Find the MP configuration table. Only checksummed default
/// configurations are accepted.
unsafe fn mpconfig(pmp: *mut *const Mp) -> *const MpConf {
    let mp = mpsearch();
    if mp.is_null() || (*mp).physaddr == 0 {
        return ptr::null();
    }
    let conf = p2v((*mp).physaddr as usize) as *const MpConf;
    if (*conf).signature != *b"PCMP" {
        return ptr::null();
    }
    if (*conf).version != 1 && (*conf).version != 4 {
        return ptr::null();
    }
    if sum(conf as *const u8, (*conf).length as usize) != 0 {
        return ptr::null();
    }
    *pmp = mp;
    conf
}

pub unsafe fn mpinit() {
    let mut mp: *const Mp = ptr::null();
    let conf = mpconfig(&mut mp);
    if conf.is_null() {
        // No MP table: a plain uniprocessor. CPU 0 keeps APIC id 0
        // and the local APIC stays unmapped.
        NCPU_FOUND = 1;
        log::info!("mp: no MP table, assuming uniprocessor");
        return;
    }

    LAPIC = (*conf).lapicaddr as *mut u32;

    let mut ncpu = 0;
    let mut p = conf.add(1) as *const u8;
    let e = (conf as *const u8).add((*conf).length as usize);
    while p < e {
        match *p {
            MPPROC => {
                let proc = p as *const MpProc;
                if ncpu < NCPU {
                    CPUS[ncpu].apicid = (*proc).apicid; // apicid may differ from ncpu
                    ncpu += 1;
                }
                p = p.add(core::mem::size_of::<MpProc>());
            }
            MPIOAPIC => {
                let ioapic = p as *const MpIoapic;
                IOAPICID = (*ioapic).apicno;
                p = p.add(core::mem::size_of::<MpIoapic>());
            }
            MPBUS | MPIOINTR | MPLINTR => {
                p = p.add(8);
            }
            _ => {
                log::warn!("mpinit: unknown config type {:x}", *p);
                p = p.add(8);
            }
        }
    }
    NCPU_FOUND = if ncpu > 0 { ncpu } else { 1 };

    if (*mp).imcrp != 0 {
        // The BIOS is running in IMCR mode: switch interrupt routing
        // from the PIC to the APIC.
        crate::x86::outb(0x22, 0x70); // select IMCR
        let v = crate::x86::inb(0x23);
        crate::x86::outb(0x23, v | 1); // mask external interrupts
    }
}
