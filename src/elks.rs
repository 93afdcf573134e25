//! This module provides the INT 80h system-call emulator for ELKS
//! programs.
//!
//! Call convention: the syscall number is in AX and arguments follow in
//! BX, CX, DX. Pointers are offsets in the program's data segment
//! (SS=DS). The result comes back in AX, with break failures encoded as
//! -ENOMEM the way the ELKS kernel does it.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::cpu::Cpu;
use crate::error::Error;
use crate::exe::{Breaks, IntOutcome};
use crate::memory::{RealMemory, Seg};

const ENOMEM: i32 = 12;

/// Services one INT 80h invocation.
pub fn handle(
    cpu: &mut Cpu,
    mem: &mut RealMemory,
    brk: &mut Breaks,
    _intno: u8,
) -> Result<IntOutcome, Error> {
    let ax = cpu.ax();
    let bx = cpu.bx();
    let cx = cpu.cx();
    let dx = cpu.dx();

    let result: i32 = match ax {
        // exit
        1 => {
            log::debug!("elks exit {}", bx);
            return Ok(IntOutcome::Exit(bx as u8));
        }
        // read(fd, buf, n)
        3 => {
            let mut buf = vec![0u8; dx as usize];
            match unistd::read(bx as i32, &mut buf) {
                Ok(n) => {
                    write_data(cpu, mem, cx, &buf[..n])?;
                    n as i32
                }
                Err(_) => -1,
            }
        }
        // write(fd, buf, n)
        4 => {
            let buf = read_data(cpu, mem, cx, dx as usize)?;
            match unistd::write(bx as i32, &buf) {
                Ok(n) => n as i32,
                Err(_) => -1,
            }
        }
        // open(path, oflag, mode)
        5 => {
            let path = read_path(cpu, mem, bx)?;
            log::trace!("elks open {:?} {:#x} {:#o}", path, cx, dx);
            match open(
                &path,
                OFlag::from_bits_truncate(cx as i32),
                Mode::from_bits_truncate(dx as u32),
            ) {
                Ok(fd) => fd,
                Err(e) => {
                    log::warn!("elks open failed: {:?}: {}", path, e);
                    -1
                }
            }
        }
        // close(fd)
        6 => match unistd::close(bx as i32) {
            Ok(()) => 0,
            Err(_) => -1,
        },
        // brk(addr)
        17 => sys_break(brk, bx),
        // ioctl is accepted for the std streams only.
        54 => {
            log::trace!("elks ioctl {} {:#x} {:#x}", bx, cx, dx);
            if bx < 3 {
                0
            } else {
                -1
            }
        }
        // sbrk(incr, &old)
        69 => {
            let old = brk.endbrk;
            let incr = bx as i16;
            log::trace!("elks sbrk {} old {:04x}", incr, old);
            let mut rc = 0;
            if incr != 0 {
                rc = sys_break(brk, (old as i32 + incr as i32) as u16);
            }
            if rc == 0 {
                mem.write_word(old, cx, Seg::Ss, cpu.ss())?;
            }
            rc
        }
        _ => {
            return Err(Error::UnknownElksCall { ax, bx, cx, dx });
        }
    };
    cpu.set_ax(result as u16);
    Ok(IntOutcome::Handled)
}

/// Moves the break, refusing to cross below the data end or into the
/// minimum stack reservation.
fn sys_break(brk: &mut Breaks, newbrk: u16) -> i32 {
    log::trace!("elks brk old {:04x} new {:04x}", brk.endbrk, newbrk);
    if newbrk < brk.enddata {
        return -ENOMEM;
    }
    if newbrk > brk.begstack.wrapping_sub(brk.minstack) {
        log::warn!(
            "elks brk {:04x} over by {} bytes",
            newbrk,
            newbrk.wrapping_sub(brk.begstack.wrapping_sub(brk.minstack))
        );
        return -ENOMEM;
    }
    brk.endbrk = newbrk;
    0
}

fn read_path(cpu: &Cpu, mem: &mut RealMemory, offset: u16) -> Result<PathBuf, Error> {
    let ss = cpu.ss();
    let mut bytes = Vec::new();
    for i in 0..0x10000u32 {
        let b = mem.read_byte(offset.wrapping_add(i as u16), Seg::Ss, ss)?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

fn read_data(cpu: &Cpu, mem: &mut RealMemory, offset: u16, len: usize) -> Result<Vec<u8>, Error> {
    let ss = cpu.ss();
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(mem.read_byte(offset.wrapping_add(i as u16), Seg::Ss, ss)?);
    }
    Ok(out)
}

fn write_data(cpu: &Cpu, mem: &mut RealMemory, offset: u16, bytes: &[u8]) -> Result<(), Error> {
    let ss = cpu.ss();
    for (i, b) in bytes.iter().enumerate() {
        mem.write_byte(*b, offset.wrapping_add(i as u16), Seg::Ss, ss)?;
    }
    Ok(())
}
