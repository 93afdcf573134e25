//! This module provides [`DosEmu`], the INT 21h system-call emulator
//! for DOS programs, plus the INT 1Ah BIOS tick read.
//!
//! Error convention: a failing call sets CF and leaves a DOS error code
//! in AX. Only ENOENT (2) and the invalid-handle code (6) are guest
//! visible; any other host errno indicates a program the emulator
//! cannot service and is fatal.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::cpu::Cpu;
use crate::error::Error;
use crate::exe::IntOutcome;
use crate::memory::{RealMemory, Seg};

/// DOS error code for "file not found".
const DOS_ENOENT: u16 = 2;
/// DOS error code for "invalid handle".
const DOS_EBADH: u16 = 6;

/// The DOS emulator state: a growable guest handle table. Handles 0-4
/// are pre-wired the way DOS programs expect (stdin, stdout, stderr,
/// stdaux and stdprn both aliased to stdout).
#[derive(Debug)]
pub struct DosEmu {
    fds: Vec<RawFd>,
}

impl DosEmu {
    pub fn new() -> Self {
        Self {
            fds: vec![0, 1, 2, 1, 1, -1],
        }
    }

    fn alloc_handle(&mut self) -> usize {
        if let Some(i) = self.fds.iter().position(|&fd| fd == -1) {
            return i;
        }
        let old = self.fds.len();
        self.fds.resize(old * 2, -1);
        old
    }

    fn host_fd(&self, handle: u16) -> Option<RawFd> {
        match self.fds.get(handle as usize) {
            Some(&fd) if fd != -1 => Some(fd),
            _ => None,
        }
    }

    /// Services one INT 21h (or INT 1Ah) invocation.
    pub fn handle(
        &mut self,
        cpu: &mut Cpu,
        mem: &mut RealMemory,
        load_segment: u16,
        intno: u8,
    ) -> Result<IntOutcome, Error> {
        match (intno as u16) << 8 | cpu.ah() as u16 {
            // BIOS tick count from the BIOS data area.
            0x1a00 => {
                cpu.set_dx(mem.read_word(0x046c, Seg::Es, 0)?);
                cpu.set_cx(mem.read_word(0x046e, Seg::Es, 0)?);
                cpu.set_al(mem.read_byte(0x0470, Seg::Es, 0)?);
            }
            // Write $-terminated string at DS:DX. AX and CF are left
            // untouched, which some programs rely on.
            0x2109 => {
                let bytes = read_guest_cstr(cpu, mem, cpu.dx(), Seg::Ds)?;
                if let Some(n) = bytes.iter().position(|&b| b == b'$') {
                    let _ = unistd::write(1, &bytes[..n]);
                }
            }
            // DOS version.
            0x2130 => {
                cpu.set_ax(0x1403);
                cpu.set_bx(0xff00);
                cpu.set_cx(0);
            }
            // mkdir
            0x2139 => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                host_result(
                    cpu,
                    unistd::mkdir(&path, Mode::from_bits_truncate(0o700)).map(|_| 0),
                )?;
            }
            // rmdir
            0x213a => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                host_result(cpu, std::fs::remove_dir(&path).map(|_| 0).map_err(io_errno))?;
            }
            // chdir
            0x213b => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                host_result(cpu, unistd::chdir(&path).map(|_| 0))?;
            }
            // creat
            0x213c => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                let r = open(
                    &path,
                    OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
                    Mode::from_bits_truncate(0o700),
                );
                match r {
                    Ok(fd) => {
                        let handle = self.alloc_handle();
                        cpu.set_cf(false);
                        cpu.set_ax(handle as u16);
                        self.fds[handle] = fd;
                    }
                    Err(e) => dos_fail(cpu, e)?,
                }
            }
            // open
            0x213d => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                let oflag = match cpu.al() & 3 {
                    0 => OFlag::O_RDONLY,
                    1 => OFlag::O_WRONLY,
                    _ => OFlag::O_RDWR,
                };
                match open(&path, oflag, Mode::from_bits_truncate(0o700)) {
                    Ok(fd) => {
                        let handle = self.alloc_handle();
                        cpu.set_cf(false);
                        cpu.set_ax(handle as u16);
                        self.fds[handle] = fd;
                    }
                    Err(e) => dos_fail(cpu, e)?,
                }
            }
            // close
            0x213e => match self.host_fd(cpu.bx()) {
                None => invalid_handle(cpu),
                Some(fd) => {
                    // Handles 0-4 alias the std streams; never close those.
                    if fd >= 5 {
                        if let Err(e) = unistd::close(fd) {
                            dos_fail(cpu, e)?;
                            return Ok(IntOutcome::Handled);
                        }
                    }
                    self.fds[cpu.bx() as usize] = -1;
                    cpu.set_cf(false);
                }
            },
            // read
            0x213f => match self.host_fd(cpu.bx()) {
                None => invalid_handle(cpu),
                Some(fd) => {
                    let mut buf = vec![0u8; cpu.cx() as usize];
                    let r = unistd::read(fd, &mut buf);
                    write_guest_bytes(cpu, mem, cpu.dx(), Seg::Ds, &buf)?;
                    host_result(cpu, r.map(|n| n as u16))?;
                }
            },
            // write
            0x2140 => match self.host_fd(cpu.bx()) {
                None => invalid_handle(cpu),
                Some(fd) => {
                    let buf = read_guest_bytes(cpu, mem, cpu.dx(), Seg::Ds, cpu.cx() as usize)?;
                    host_result(cpu, unistd::write(fd, &buf).map(|n| n as u16))?;
                }
            },
            // unlink
            0x2141 => {
                let path = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                host_result(cpu, unistd::unlink(&path).map(|_| 0))?;
            }
            // lseek
            0x2142 => match self.host_fd(cpu.bx()) {
                None => invalid_handle(cpu),
                Some(fd) => {
                    let offset = ((cpu.cx() as u32) << 16 | cpu.dx() as u32) as i32;
                    let whence = match cpu.al() {
                        0 => unistd::Whence::SeekSet,
                        1 => unistd::Whence::SeekCur,
                        2 => unistd::Whence::SeekEnd,
                        _ => {
                            dos_fail(cpu, Errno::EINVAL)?;
                            return Ok(IntOutcome::Handled);
                        }
                    };
                    match unistd::lseek(fd, offset as i64, whence) {
                        Ok(pos) => {
                            cpu.set_cf(false);
                            cpu.set_dx((pos as u32 >> 16) as u16);
                            cpu.set_ax(pos as u16);
                        }
                        Err(e) => dos_fail(cpu, e)?,
                    }
                }
            },
            // ioctl: only the isatty query is emulated.
            0x2144 => {
                if cpu.al() != 0 {
                    return Err(Error::UnknownDosIoctl { al: cpu.al() });
                }
                match self.host_fd(cpu.bx()) {
                    None => invalid_handle(cpu),
                    Some(fd) => match unistd::isatty(fd) {
                        Ok(true) => {
                            cpu.set_dx(0x80);
                            cpu.set_cf(false);
                        }
                        Ok(false) | Err(Errno::ENOTTY) => {
                            cpu.set_dx(0);
                            cpu.set_cf(false);
                        }
                        Err(e) => dos_fail(cpu, e)?,
                    },
                }
            }
            // getcwd into DS:SI
            0x2147 => match unistd::getcwd() {
                Ok(cwd) => {
                    let bytes = cwd.as_os_str().as_bytes();
                    if bytes.len() + 1 > 64 {
                        dos_fail(cpu, Errno::ERANGE)?;
                    } else {
                        let mut out = bytes.to_vec();
                        out.push(0);
                        write_guest_bytes(cpu, mem, cpu.si(), Seg::Ds, &out)?;
                        cpu.set_cf(false);
                    }
                }
                Err(e) => dos_fail(cpu, e)?,
            },
            // Resize memory block: only the program's own PSP block may
            // be "resized", and CS:IP / SS:SP must stay inside it.
            0x214a => {
                if cpu.es() == load_segment.wrapping_sub(0x10) {
                    let mem_end = ((cpu.es() as u32).wrapping_add(cpu.bx() as u32)) << 4;
                    let code = mem.physical_address(cpu.ip(), Seg::Cs, cpu.cs(), false)?;
                    let stack =
                        mem.physical_address(cpu.sp().wrapping_sub(1), Seg::Ss, cpu.ss(), true)?;
                    if code < mem_end && stack < mem_end {
                        cpu.set_cf(false);
                        return Ok(IntOutcome::Handled);
                    }
                }
                return Err(Error::BadDosResize {
                    bx: cpu.bx(),
                    es: cpu.es(),
                });
            }
            // exit
            0x214c => {
                log::debug!("dos exit {}", cpu.al());
                return Ok(IntOutcome::Exit(cpu.al()));
            }
            // rename: DS:DX -> ES:DI
            0x2156 => {
                let src = read_guest_path(cpu, mem, cpu.dx(), Seg::Ds)?;
                let dst = read_guest_path(cpu, mem, cpu.di(), Seg::Es)?;
                host_result(cpu, std::fs::rename(&src, &dst).map(|_| 0).map_err(io_errno))?;
            }
            // File times are stubbed to a fixed plausible value.
            0x2157 => match cpu.al() {
                0x00 => match self.host_fd(cpu.bx()) {
                    None => invalid_handle(cpu),
                    Some(_) => {
                        cpu.set_cx(0x0000);
                        cpu.set_dx(0x0021);
                        cpu.set_cf(false);
                    }
                },
                _ => {
                    return Err(Error::UnknownDosCall {
                        intno,
                        ah: cpu.ah(),
                    })
                }
            },
            _ => {
                log::warn!("unknown DOS call int {:#04x} ah {:#04x}", intno, cpu.ah());
                return Err(Error::UnknownDosCall {
                    intno,
                    ah: cpu.ah(),
                });
            }
        }
        Ok(IntOutcome::Handled)
    }
}

impl Default for DosEmu {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a host errno onto the DOS error convention: ENOENT is guest
/// visible, anything else means the program hit something the emulator
/// cannot express and is fatal.
fn dos_error(e: Errno) -> Result<u16, Error> {
    if e == Errno::ENOENT {
        Ok(DOS_ENOENT)
    } else {
        Err(Error::Nix(e.into()))
    }
}

fn dos_fail(cpu: &mut Cpu, e: Errno) -> Result<(), Error> {
    cpu.set_cf(true);
    let code = dos_error(e)?;
    cpu.set_ax(code);
    Ok(())
}

fn invalid_handle(cpu: &mut Cpu) {
    cpu.set_cf(true);
    cpu.set_ax(DOS_EBADH);
}

fn host_result(cpu: &mut Cpu, r: Result<u16, Errno>) -> Result<(), Error> {
    match r {
        Ok(v) => {
            cpu.set_cf(false);
            cpu.set_ax(v);
            Ok(())
        }
        Err(e) => dos_fail(cpu, e),
    }
}

fn io_errno(e: std::io::Error) -> Errno {
    e.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
}

/// Reads guest bytes at `seg:offset` up to and excluding a NUL, bounded
/// by one segment.
fn read_guest_cstr(
    cpu: &Cpu,
    mem: &mut RealMemory,
    offset: u16,
    seg: Seg,
) -> Result<Vec<u8>, Error> {
    let seg_val = cpu.regs[8 + seg as usize];
    let mut out = Vec::new();
    for i in 0..0x10000u32 {
        let b = mem.read_byte(offset.wrapping_add(i as u16), seg, seg_val)?;
        if b == 0 {
            break;
        }
        out.push(b);
    }
    Ok(out)
}

fn read_guest_path(
    cpu: &Cpu,
    mem: &mut RealMemory,
    offset: u16,
    seg: Seg,
) -> Result<PathBuf, Error> {
    let bytes = read_guest_cstr(cpu, mem, offset, seg)?;
    Ok(PathBuf::from(OsString::from_vec(bytes)))
}

fn read_guest_bytes(
    cpu: &Cpu,
    mem: &mut RealMemory,
    offset: u16,
    seg: Seg,
    len: usize,
) -> Result<Vec<u8>, Error> {
    let seg_val = cpu.regs[8 + seg as usize];
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        out.push(mem.read_byte(offset.wrapping_add(i as u16), seg, seg_val)?);
    }
    Ok(out)
}

fn write_guest_bytes(
    cpu: &Cpu,
    mem: &mut RealMemory,
    offset: u16,
    seg: Seg,
    bytes: &[u8],
) -> Result<(), Error> {
    let seg_val = cpu.regs[8 + seg as usize];
    for (i, b) in bytes.iter().enumerate() {
        mem.write_byte(*b, offset.wrapping_add(i as u16), seg, seg_val)?;
    }
    Ok(())
}
