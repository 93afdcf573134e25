//! This module provides the Linux x86-64 syscall translation layer.
//!
//! [`dispatch`] decodes the low 9 bits of the guest `ax`, reads
//! arguments from (di, si, dx, r10, r8, r9), and writes back either the
//! raw non-negative result or `-(errno & 0xfff)`. Pointer arguments
//! resolve through the guest arena; a failed resolution is EFAULT.
//! `exit`, `exit_group`, and `rt_sigreturn` are control flow rather
//! than values and are handled before the value protocol.

use std::convert::TryInto;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::fd::Fd;
use crate::machine::{Halt, Machine, NSIG};
use crate::map::{prot_to_page, PageKey, PAGE_SIZE};
use crate::xlat::*;

/// Poll loop granularity, which doubles as the redraw cadence.
const POLLING_INTERVAL_MS: u64 = 50;

/// Largest guest dirent record: two 8-byte words, reclen, type, and a
/// 256-byte name.
const DIRENT_MAX: i64 = 8 + 8 + 2 + 1 + 256;

/// Syscall numbers of the Linux x86-64 ABI, by dispatch value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive)]
#[allow(clippy::upper_case_acronyms)]
pub enum Sysno {
    Read = 0x000,
    Write = 0x001,
    Open = 0x002,
    Close = 0x003,
    Stat = 0x004,
    Fstat = 0x005,
    Lstat = 0x006,
    Poll = 0x007,
    Lseek = 0x008,
    Mmap = 0x009,
    Mprotect = 0x00a,
    Munmap = 0x00b,
    Brk = 0x00c,
    RtSigaction = 0x00d,
    RtSigprocmask = 0x00e,
    RtSigreturn = 0x00f,
    Ioctl = 0x010,
    Pread = 0x011,
    Pwrite = 0x012,
    Readv = 0x013,
    Writev = 0x014,
    Access = 0x015,
    Pipe = 0x016,
    SchedYield = 0x018,
    Msync = 0x01a,
    Madvise = 0x01c,
    Dup = 0x020,
    Dup2 = 0x021,
    Pause = 0x022,
    Nanosleep = 0x023,
    Getitimer = 0x024,
    Alarm = 0x025,
    Setitimer = 0x026,
    Getpid = 0x027,
    Socket = 0x029,
    Connect = 0x02a,
    Accept = 0x02b,
    Shutdown = 0x030,
    Bind = 0x031,
    Listen = 0x032,
    Getsockname = 0x033,
    Getpeername = 0x034,
    Setsockopt = 0x036,
    Clone = 0x038,
    Fork = 0x039,
    Vfork = 0x03a,
    Execve = 0x03b,
    Exit = 0x03c,
    Wait4 = 0x03d,
    Kill = 0x03e,
    Uname = 0x03f,
    Fcntl = 0x048,
    Flock = 0x049,
    Fsync = 0x04a,
    Fdatasync = 0x04b,
    Truncate = 0x04c,
    Ftruncate = 0x04d,
    Getcwd = 0x04f,
    Chdir = 0x050,
    Rename = 0x052,
    Mkdir = 0x053,
    Rmdir = 0x054,
    Creat = 0x055,
    Link = 0x056,
    Unlink = 0x057,
    Symlink = 0x058,
    Readlink = 0x059,
    Chmod = 0x05a,
    Fchmod = 0x05b,
    Umask = 0x05f,
    Gettimeofday = 0x060,
    Getrlimit = 0x061,
    Getrusage = 0x062,
    Getuid = 0x066,
    Getgid = 0x068,
    Setuid = 0x069,
    Setgid = 0x06a,
    Geteuid = 0x06b,
    Getegid = 0x06c,
    Setpgid = 0x06d,
    Getppid = 0x06e,
    Setsid = 0x070,
    Getpgid = 0x079,
    Sigsuspend = 0x082,
    Sigaltstack = 0x083,
    Mknod = 0x085,
    Prctl = 0x09d,
    ArchPrctl = 0x09e,
    Setrlimit = 0x0a0,
    Gettid = 0x0ba,
    Tkill = 0x0c8,
    Futex = 0x0ca,
    Getdents = 0x0d9,
    SetTidAddress = 0x0da,
    ClockGettime = 0x0e4,
    ClockGetres = 0x0e5,
    ClockNanosleep = 0x0e6,
    ExitGroup = 0x0e7,
    Utimes = 0x0eb,
    Openat = 0x101,
    Mkdirat = 0x102,
    Fstatat = 0x106,
    Unlinkat = 0x107,
    Renameat = 0x108,
    Readlinkat = 0x10b,
    Faccessat = 0x10d,
    Accept4 = 0x120,
    Dup3 = 0x124,
    Pipe2 = 0x125,
    Prlimit = 0x12e,
    Getrandom = 0x13e,
    CloseRange = 0x1b4,
}

/// Translates and executes the syscall pending in the machine's
/// registers, writing the result into `ax`. Returns `Err` only for the
/// halt protocol.
pub fn dispatch(m: &mut Machine) -> Result<(), Halt> {
    let ax = m.regs.ax;
    let di = m.regs.di;
    let si = m.regs.si;
    let dx = m.regs.dx;
    let r10 = m.regs.r10;
    let r8 = m.regs.r8;
    let r9 = m.regs.r9;
    let nr = Sysno::from_u64(ax & 0x1ff);
    log::trace!(
        "syscall {:?}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x})",
        nr,
        di,
        si,
        dx,
        r10,
        r8,
        r9
    );

    match nr {
        Some(Sysno::Exit) => return sys_exit(m, di as i32),
        Some(Sysno::ExitGroup) => return sys_exit_group(m, di as i32),
        Some(Sysno::RtSigreturn) => {
            if let Some(hook) = m.system.sigrestore.clone() {
                hook(m);
            }
            return Ok(());
        }
        _ => {}
    }

    let result: Result<i64, Errno> = match nr {
        Some(Sysno::Read) => sys_read(m, di as i32, si, dx),
        Some(Sysno::Write) => sys_write(m, di as i32, si, dx),
        Some(Sysno::Open) => sys_openat(m, AT_FDCWD_LINUX, di, si as i32, dx as u32),
        Some(Sysno::Close) => sys_close(m, di as i32),
        Some(Sysno::Stat) => sys_fstatat(m, AT_FDCWD_LINUX, di, si, 0),
        Some(Sysno::Fstat) => sys_fstat(m, di as i32, si),
        Some(Sysno::Lstat) => sys_fstatat(m, AT_FDCWD_LINUX, di, si, AT_SYMLINK_NOFOLLOW_LINUX),
        Some(Sysno::Poll) => sys_poll(m, di, si, dx as i32),
        Some(Sysno::Lseek) => sys_lseek(m, di as i32, si as i64, dx as i32),
        Some(Sysno::Mmap) => sys_mmap(m, di, si, dx as i32, r10 as i32, r8 as i32, r9 as i64),
        Some(Sysno::Mprotect) => sys_mprotect(m, di, si, dx as i32),
        Some(Sysno::Munmap) => sys_munmap(m, di, si),
        Some(Sysno::Brk) => sys_brk(m, di),
        Some(Sysno::RtSigaction) => sys_sigaction(m, di as i32, si, dx, r10),
        Some(Sysno::RtSigprocmask) => sys_sigprocmask(m, di as i32, si, dx, r10),
        Some(Sysno::Ioctl) => sys_ioctl(m, di as i32, si, dx),
        Some(Sysno::Pread) => sys_pread(m, di as i32, si, dx, r10),
        Some(Sysno::Pwrite) => sys_pwrite(m, di as i32, si, dx, r10),
        Some(Sysno::Readv) => sys_readv(m, di as i32, si, dx as i32),
        Some(Sysno::Writev) => sys_writev(m, di as i32, si, dx as i32),
        Some(Sysno::Access) => sys_faccessat(m, AT_FDCWD_LINUX, di, si as i32, 0),
        Some(Sysno::Pipe) => sys_pipe(m, di, 0),
        Some(Sysno::Pipe2) => sys_pipe(m, di, si as i32),
        Some(Sysno::SchedYield) => ck(unsafe { libc::sched_yield() } as i64),
        Some(Sysno::Msync) => Err(Errno::ENOSYS),
        Some(Sysno::Madvise) => Ok(0),
        Some(Sysno::Dup) => sys_dup(m, di as i32, -1, 0, 0),
        Some(Sysno::Dup2) => sys_dup2(m, di as i32, si as i32),
        Some(Sysno::Dup3) => sys_dup3(m, di as i32, si as i32, dx as i32),
        Some(Sysno::Pause) => ck(unsafe { libc::pause() } as i64),
        Some(Sysno::Nanosleep) => sys_nanosleep(m, di, si),
        Some(Sysno::Getitimer) => sys_getitimer(m, di as i32, si),
        Some(Sysno::Alarm) => Ok(unsafe { libc::alarm(di as u32) } as i64),
        Some(Sysno::Setitimer) => sys_setitimer(m, di as i32, si, dx),
        Some(Sysno::Getpid) => Ok(m.system.pid as i64),
        Some(Sysno::Gettid) => Ok(m.tid() as i64),
        Some(Sysno::Socket) => sys_socket(m, di as i32, si as i32, dx as i32),
        Some(Sysno::Connect) => sys_connect_bind(m, di as i32, si, dx as u32, libc::connect),
        Some(Sysno::Bind) => sys_connect_bind(m, di as i32, si, dx as u32, libc::bind),
        Some(Sysno::Accept) => sys_accept4(m, di as i32, si, dx, 0),
        Some(Sysno::Accept4) => sys_accept4(m, di as i32, si, dx, r10 as i32),
        Some(Sysno::Shutdown) => sys_shutdown(m, di as i32, si as i32),
        Some(Sysno::Listen) => sys_listen(m, di as i32, si as i32),
        Some(Sysno::Getsockname) => sys_socket_name(m, di as i32, si, dx, libc::getsockname),
        Some(Sysno::Getpeername) => sys_socket_name(m, di as i32, si, dx, libc::getpeername),
        Some(Sysno::Setsockopt) => sys_setsockopt(m, di as i32, si as i32, dx as i32, r10, r8 as u32),
        Some(Sysno::Clone) => sys_clone(m, di, si, dx, r10, r8, r9),
        Some(Sysno::Fork) => sys_fork(m),
        Some(Sysno::Vfork) => sys_fork(m),
        Some(Sysno::Execve) => {
            log::warn!("execve is not supported without an exec hook");
            Err(Errno::ENOSYS)
        }
        Some(Sysno::Wait4) => sys_wait4(m, di as i32, si, dx as i32, r10),
        Some(Sysno::Kill) => sys_kill(m, di as i32, si as i32),
        Some(Sysno::Tkill) => sys_tkill(m, di as i32, si as i32),
        Some(Sysno::Uname) => sys_uname(m, di),
        Some(Sysno::Fcntl) => sys_fcntl(m, di as i32, si as i32, dx as i64),
        Some(Sysno::Flock) => sys_flock(m, di as i32, si as i32),
        Some(Sysno::Fsync) => sys_fsync(m, di as i32, false),
        Some(Sysno::Fdatasync) => sys_fsync(m, di as i32, true),
        Some(Sysno::Truncate) => sys_truncate(m, di, si as i64),
        Some(Sysno::Ftruncate) => sys_ftruncate(m, di as i32, si as i64),
        Some(Sysno::Getcwd) => sys_getcwd(m, di, si),
        Some(Sysno::Chdir) => sys_chdir(m, di),
        Some(Sysno::Rename) => sys_renameat(m, AT_FDCWD_LINUX, di, AT_FDCWD_LINUX, si),
        Some(Sysno::Renameat) => sys_renameat(m, di as i32, si, dx as i32, r10),
        Some(Sysno::Mkdir) => sys_mkdirat(m, AT_FDCWD_LINUX, di, si as u32),
        Some(Sysno::Mkdirat) => sys_mkdirat(m, di as i32, si, dx as u32),
        Some(Sysno::Rmdir) => sys_rmdir(m, di),
        Some(Sysno::Creat) => sys_openat(
            m,
            AT_FDCWD_LINUX,
            di,
            O_WRONLY_LINUX | O_CREAT_LINUX | O_TRUNC_LINUX,
            si as u32,
        ),
        Some(Sysno::Link) => sys_link(m, di, si),
        Some(Sysno::Unlink) => sys_unlink(m, di),
        Some(Sysno::Unlinkat) => sys_unlinkat(m, di as i32, si, dx as i32),
        Some(Sysno::Symlink) => sys_symlink(m, di, si),
        Some(Sysno::Readlink) => sys_readlinkat(m, AT_FDCWD_LINUX, di, si, dx as i64),
        Some(Sysno::Readlinkat) => sys_readlinkat(m, di as i32, si, dx, r10 as i64),
        Some(Sysno::Chmod) => sys_chmod(m, di, si as u32),
        Some(Sysno::Fchmod) => sys_fchmod(m, di as i32, si as u32),
        Some(Sysno::Mknod) => sys_mknod(m, di, si as u32, dx),
        Some(Sysno::Umask) => Ok(unsafe { libc::umask(di as libc::mode_t) } as i64),
        Some(Sysno::Gettimeofday) => sys_gettimeofday(m, di, si),
        Some(Sysno::Getrlimit) => sys_getrlimit(m, di as i32, si),
        Some(Sysno::Setrlimit) => sys_setrlimit(m, di as i32, si),
        Some(Sysno::Prlimit) => sys_prlimit(m, di as i32, si as i32, dx, r10),
        Some(Sysno::Getrusage) => sys_getrusage(m, di as i32, si),
        Some(Sysno::Getuid) => Ok(unsafe { libc::getuid() } as i64),
        Some(Sysno::Getgid) => Ok(unsafe { libc::getgid() } as i64),
        Some(Sysno::Geteuid) => Ok(unsafe { libc::geteuid() } as i64),
        Some(Sysno::Getegid) => Ok(unsafe { libc::getegid() } as i64),
        Some(Sysno::Setuid) => ck(unsafe { libc::setuid(di as libc::uid_t) } as i64),
        Some(Sysno::Setgid) => ck(unsafe { libc::setgid(di as libc::gid_t) } as i64),
        Some(Sysno::Getppid) => Ok(unsafe { libc::getppid() } as i64),
        Some(Sysno::Setpgid) => ck(unsafe {
            libc::setpgid(di as libc::pid_t, si as libc::pid_t)
        } as i64),
        Some(Sysno::Getpgid) => ck(unsafe { libc::getpgid(di as libc::pid_t) } as i64),
        Some(Sysno::Setsid) => ck(unsafe { libc::setsid() } as i64),
        Some(Sysno::Sigsuspend) => sys_sigsuspend(m, di),
        Some(Sysno::Sigaltstack) => Ok(0),
        Some(Sysno::Prctl) => Err(Errno::EINVAL),
        Some(Sysno::ArchPrctl) => sys_arch_prctl(m, di as i32, si),
        Some(Sysno::Futex) => sys_futex(m, di, si as i32, dx as u32, r10, r8, r9 as u32),
        Some(Sysno::Getdents) => sys_getdents(m, di as i32, si, dx as i64),
        Some(Sysno::SetTidAddress) => {
            m.ctid = di;
            Ok(m.tid() as i64)
        }
        Some(Sysno::ClockGettime) => sys_clock_gettime(m, di as i32, si, false),
        Some(Sysno::ClockGetres) => sys_clock_gettime(m, di as i32, si, true),
        Some(Sysno::ClockNanosleep) => sys_clock_nanosleep(m, di as i32, si as i32, dx, r10),
        Some(Sysno::Utimes) => sys_utimes(m, di, si),
        Some(Sysno::Openat) => sys_openat(m, di as i32, si, dx as i32, r10 as u32),
        Some(Sysno::Fstatat) => sys_fstatat(m, di as i32, si, dx, r10 as i32),
        Some(Sysno::Faccessat) => sys_faccessat(m, di as i32, si, dx as i32, r10 as i32),
        Some(Sysno::Getrandom) => sys_getrandom(m, di, si, dx as u32),
        Some(Sysno::CloseRange) => sys_close_range(m, di as i32, si as i32, dx as i32),
        Some(Sysno::Exit) | Some(Sysno::ExitGroup) | Some(Sysno::RtSigreturn) => unreachable!(),
        None => {
            log::warn!("missing syscall {:#05x}", ax & 0x1ff);
            Err(Errno::ENOSYS)
        }
    };

    m.regs.ax = match result {
        Ok(rc) => rc as u64,
        Err(e) => -((xlat_errno(e) as i64) & 0xfff) as u64,
    };
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers.

fn ck(rc: i64) -> Result<i64, Errno> {
    if rc == -1 {
        Err(Errno::last())
    } else {
        Ok(rc)
    }
}

fn load_cstr(m: &mut Machine, addr: u64) -> Result<CString, Errno> {
    CString::new(m.load_str(addr)?).map_err(|_| Errno::EINVAL)
}

/// Clones the Fd handle out of the table, briefly holding the table
/// lock.
fn get_fd(m: &Machine, fildes: i32) -> Result<Arc<Fd>, Errno> {
    m.system
        .fds
        .lock()
        .unwrap()
        .get(fildes)
        .ok_or(Errno::EBADF)
}

fn host_fd(m: &Machine, fildes: i32) -> Result<RawFd, Errno> {
    let fd = get_fd(m, fildes)?;
    let host = fd.host();
    if host < 0 {
        return Err(Errno::EBADF);
    }
    Ok(host)
}

fn dir_fd(m: &Machine, fildes: i32) -> Result<RawFd, Errno> {
    if fildes == AT_FDCWD_LINUX {
        Ok(libc::AT_FDCWD)
    } else {
        host_fd(m, fildes)
    }
}

fn valid_addr_size(m: &Machine, virt: u64, size: u64) -> bool {
    size > 0
        && virt % PAGE_SIZE == 0
        && virt
            .checked_add(size)
            .map_or(false, |end| end <= m.system.mem.size() as u64)
}

// ---------------------------------------------------------------------------
// Plain file I/O.

fn sys_read(m: &mut Machine, fildes: i32, addr: u64, size: u64) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let rc = {
        let buf = m
            .system
            .mem
            .guest_slice(addr, size)
            .ok_or(Errno::EFAULT)?;
        fd.cb.readv(host, &mut [buf])?
    };
    if rc > 0 {
        m.write_tap = Some((addr, rc as u64));
    }
    Ok(rc as i64)
}

fn sys_write(m: &mut Machine, fildes: i32, addr: u64, size: u64) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let rc = {
        let buf = m.system.mem.guest_slice(addr, size).ok_or(Errno::EFAULT)?;
        fd.cb.writev(host, &[&*buf])?
    };
    if rc > 0 {
        m.read_tap = Some((addr, rc as u64));
    }
    Ok(rc as i64)
}

fn tell_and_seek(host: RawFd, offset: u64) -> Result<i64, Errno> {
    let oldpos = unistd::lseek(host, 0, unistd::Whence::SeekCur)?;
    unistd::lseek(host, offset as i64, unistd::Whence::SeekSet)?;
    Ok(oldpos)
}

fn sys_pread(m: &mut Machine, fildes: i32, addr: u64, size: u64, offset: u64) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let oldpos = tell_and_seek(host, offset)?;
    let rc = {
        let buf = m.system.mem.guest_slice(addr, size).ok_or(Errno::EFAULT)?;
        fd.cb.readv(host, &mut [buf])
    };
    let _ = unistd::lseek(host, oldpos, unistd::Whence::SeekSet);
    let rc = rc?;
    if rc > 0 {
        m.write_tap = Some((addr, rc as u64));
    }
    Ok(rc as i64)
}

fn sys_pwrite(
    m: &mut Machine,
    fildes: i32,
    addr: u64,
    size: u64,
    offset: u64,
) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let oldpos = tell_and_seek(host, offset)?;
    let rc = {
        let buf = m.system.mem.guest_slice(addr, size).ok_or(Errno::EFAULT)?;
        fd.cb.writev(host, &[&*buf])
    };
    let _ = unistd::lseek(host, oldpos, unistd::Whence::SeekSet);
    let rc = rc?;
    if rc > 0 {
        m.read_tap = Some((addr, rc as u64));
    }
    Ok(rc as i64)
}

/// Reads the guest iovec array: (base u64, len u64) pairs.
fn load_iovs(m: &mut Machine, iovaddr: u64, iovlen: i32) -> Result<Vec<(u64, u64)>, Errno> {
    if !(0..=1024).contains(&iovlen) {
        return Err(Errno::EINVAL);
    }
    let mut raw = vec![0u8; iovlen as usize * 16];
    m.copy_from_guest(iovaddr, &mut raw)?;
    Ok(raw
        .chunks_exact(16)
        .map(|c| {
            (
                u64::from_le_bytes(c[0..8].try_into().unwrap()),
                u64::from_le_bytes(c[8..16].try_into().unwrap()),
            )
        })
        .collect())
}

fn sys_readv(m: &mut Machine, fildes: i32, iovaddr: u64, iovlen: i32) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let iovs = load_iovs(m, iovaddr, iovlen)?;
    // Guests may hand over overlapping iovecs, so guest memory is never
    // borrowed across the host call; the scatter goes through scratch
    // buffers and is copied out one range at a time.
    for &(base, len) in &iovs {
        m.system.mem.lookup(base, len).ok_or(Errno::EFAULT)?;
    }
    let mut scratch: Vec<Vec<u8>> = iovs
        .iter()
        .map(|&(_, len)| vec![0u8; len as usize])
        .collect();
    let rc = {
        let mut bufs: Vec<&mut [u8]> =
            scratch.iter_mut().map(|b| b.as_mut_slice()).collect();
        fd.cb.readv(host, &mut bufs)?
    };
    let mut remaining = rc;
    for (&(base, _), buf) in iovs.iter().zip(&scratch) {
        if remaining == 0 {
            break;
        }
        let n = remaining.min(buf.len());
        m.copy_to_guest(base, &buf[..n])?;
        remaining -= n;
    }
    Ok(rc as i64)
}

fn sys_writev(m: &mut Machine, fildes: i32, iovaddr: u64, iovlen: i32) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    let iovs = load_iovs(m, iovaddr, iovlen)?;
    let mut scratch: Vec<Vec<u8>> = Vec::with_capacity(iovs.len());
    for &(base, len) in &iovs {
        m.system.mem.lookup(base, len).ok_or(Errno::EFAULT)?;
        let mut buf = vec![0u8; len as usize];
        m.copy_from_guest(base, &mut buf)?;
        scratch.push(buf);
    }
    let bufs: Vec<&[u8]> = scratch.iter().map(|b| b.as_slice()).collect();
    let rc = fd.cb.writev(host, &bufs)?;
    Ok(rc as i64)
}

fn sys_lseek(m: &mut Machine, fildes: i32, offset: i64, whence: i32) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let state = fd.lock();
    if let Some(dir) = &state.dir {
        return if whence == SEEK_SET_LINUX {
            unsafe { libc::seekdir(dir.0, offset as libc::c_long) };
            Ok(0)
        } else {
            Err(Errno::EINVAL)
        };
    }
    drop(state);
    let w = match xlat_whence(whence) {
        Some(libc::SEEK_SET) => unistd::Whence::SeekSet,
        Some(libc::SEEK_CUR) => unistd::Whence::SeekCur,
        Some(libc::SEEK_END) => unistd::Whence::SeekEnd,
        _ => return Err(Errno::EINVAL),
    };
    Ok(unistd::lseek(fd.host(), offset, w)?)
}

// ---------------------------------------------------------------------------
// Descriptor management.

fn sys_openat(
    m: &mut Machine,
    dirfildes: i32,
    path: u64,
    flags: i32,
    mode: u32,
) -> Result<i64, Errno> {
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    let oflag = xlat_open_flags(flags);
    let fd = m
        .system
        .fds
        .lock()
        .unwrap()
        .allocate(0, oflag)
        .ok_or(Errno::EMFILE)?;
    let rc = unsafe {
        libc::openat(dirfd, cpath.as_ptr(), oflag.bits(), mode as libc::c_uint)
    };
    if rc == -1 {
        let e = Errno::last();
        m.system.fds.lock().unwrap().free(fd.fildes);
        return Err(e);
    }
    fd.install(rc);
    Ok(fd.fildes as i64)
}

/// Runs the close vtable entry and gives the slot back.
fn close_host(fd: &Fd) -> Result<(), Errno> {
    let mut state = fd.lock();
    if let Some(dir) = state.dir.take() {
        // closedir releases the underlying fd as well.
        unsafe { libc::closedir(dir.0) };
        return Ok(());
    }
    drop(state);
    let host = fd.host();
    if host >= 0 {
        fd.cb.close(host)
    } else {
        Ok(())
    }
}

fn sys_close(m: &mut Machine, fildes: i32) -> Result<i64, Errno> {
    let fd = m
        .system
        .fds
        .lock()
        .unwrap()
        .free(fildes)
        .ok_or(Errno::EBADF)?;
    close_host(&fd)?;
    Ok(0)
}

fn sys_close_range(m: &mut Machine, first: i32, last: i32, flags: i32) -> Result<i64, Errno> {
    if flags != 0 || first < 0 || last < first {
        return Err(Errno::EINVAL);
    }
    let fildes: Vec<i32> = {
        let fds = m.system.fds.lock().unwrap();
        fds.fildes_above(first)
            .into_iter()
            .filter(|&n| n <= last)
            .collect()
    };
    for n in fildes {
        let fd = m.system.fds.lock().unwrap().free(n);
        if let Some(fd) = fd {
            let _ = close_host(&fd);
        }
    }
    Ok(0)
}

fn sys_dup(m: &mut Machine, fildes: i32, newfildes: i32, flags: i32, start: i64) -> Result<i64, Errno> {
    let old = get_fd(m, fildes)?;
    let host_old = old.host();
    if host_old < 0 {
        return Err(Errno::EBADF);
    }
    let mut oflags = old.lock().oflags;
    if flags & O_CLOEXEC_LINUX != 0 {
        oflags |= OFlag::O_CLOEXEC;
    } else {
        oflags &= !OFlag::O_CLOEXEC;
    }
    let fd = if newfildes >= 0 {
        let (fd, displaced) = m
            .system
            .fds
            .lock()
            .unwrap()
            .allocate_at(newfildes, oflags);
        if let Some(displaced) = displaced {
            let _ = close_host(&displaced);
        }
        fd
    } else {
        m.system
            .fds
            .lock()
            .unwrap()
            .allocate(start.max(0) as i32, oflags)
            .ok_or(Errno::EMFILE)?
    };
    match unistd::dup(host_old) {
        Ok(sysfd) => {
            if flags & O_CLOEXEC_LINUX != 0 {
                let _ = unsafe { libc::fcntl(sysfd, libc::F_SETFD, libc::FD_CLOEXEC) };
            }
            fd.install(sysfd);
            Ok(fd.fildes as i64)
        }
        Err(e) => {
            m.system.fds.lock().unwrap().free(fd.fildes);
            Err(e)
        }
    }
}

fn sys_dup2(m: &mut Machine, fildes: i32, newfildes: i32) -> Result<i64, Errno> {
    if newfildes < 0 {
        return Err(Errno::EBADF);
    }
    if fildes == newfildes {
        get_fd(m, fildes)?;
        return Ok(newfildes as i64);
    }
    sys_dup(m, fildes, newfildes, 0, 0)
}

fn sys_dup3(m: &mut Machine, fildes: i32, newfildes: i32, flags: i32) -> Result<i64, Errno> {
    if newfildes < 0 {
        return Err(Errno::EBADF);
    }
    if fildes == newfildes {
        return Err(Errno::EINVAL);
    }
    if flags & !O_CLOEXEC_LINUX != 0 {
        return Err(Errno::EINVAL);
    }
    sys_dup(m, fildes, newfildes, flags, 0)
}

fn sys_pipe(m: &mut Machine, addr: u64, flags: i32) -> Result<i64, Errno> {
    if flags & !(O_CLOEXEC_LINUX | O_NDELAY_LINUX) != 0 {
        return Err(Errno::EINVAL);
    }
    let host_flags = xlat_open_flags(flags);
    let (r, w) = unistd::pipe2(host_flags & (OFlag::O_CLOEXEC | OFlag::O_NONBLOCK))?;
    let (fda, fdb) = {
        let mut fds = m.system.fds.lock().unwrap();
        let fda = fds.allocate(0, OFlag::O_RDONLY | host_flags).ok_or(Errno::EMFILE)?;
        let fdb = fds.allocate(0, OFlag::O_WRONLY | host_flags).ok_or(Errno::EMFILE)?;
        (fda, fdb)
    };
    fda.install(r);
    fdb.install(w);
    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&fda.fildes.to_le_bytes());
    out[4..8].copy_from_slice(&fdb.fildes.to_le_bytes());
    if let Err(e) = m.copy_to_guest(addr, &out) {
        let mut fds = m.system.fds.lock().unwrap();
        fds.free(fda.fildes);
        fds.free(fdb.fildes);
        drop(fds);
        let _ = close_host(&fda);
        let _ = close_host(&fdb);
        return Err(e);
    }
    Ok(0)
}

fn sys_fcntl(m: &mut Machine, fildes: i32, cmd: i32, arg: i64) -> Result<i64, Errno> {
    if cmd == F_DUPFD_LINUX {
        return sys_dup(m, fildes, -1, 0, arg);
    }
    if cmd == F_DUPFD_CLOEXEC_LINUX {
        return sys_dup(m, fildes, -1, O_CLOEXEC_LINUX, arg);
    }
    let fd = get_fd(m, fildes)?;
    let mut state = fd.lock();
    match cmd {
        F_GETFD_LINUX => Ok(if state.cloexec { FD_CLOEXEC_LINUX as i64 } else { 0 }),
        F_GETFL_LINUX => Ok(unxlat_open_flags(state.oflags) as i64),
        F_SETFD_LINUX => {
            if arg & !(FD_CLOEXEC_LINUX as i64) != 0 {
                return Err(Errno::EINVAL);
            }
            let set = if arg != 0 { libc::FD_CLOEXEC } else { 0 };
            ck(unsafe { libc::fcntl(fd.host(), libc::F_SETFD, set) } as i64)?;
            state.cloexec = arg != 0;
            Ok(0)
        }
        F_SETFL_LINUX => {
            let settable = O_APPEND_LINUX
                | O_ASYNC_LINUX
                | O_DIRECT_LINUX
                | O_NOATIME_LINUX
                | O_NDELAY_LINUX;
            let fl = xlat_open_flags(arg as i32 & settable);
            ck(unsafe { libc::fcntl(fd.host(), libc::F_SETFL, fl.bits()) } as i64)?;
            let mask = OFlag::O_APPEND
                | OFlag::O_ASYNC
                | OFlag::O_DIRECT
                | OFlag::O_NOATIME
                | OFlag::O_NONBLOCK;
            state.oflags = state.oflags & !mask | fl & mask;
            Ok(0)
        }
        _ => {
            log::warn!("missing fcntl() command {}", cmd);
            Err(Errno::EINVAL)
        }
    }
}

fn sys_flock(m: &mut Machine, fildes: i32, op: i32) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    let op = xlat_lock(op).ok_or(Errno::EINVAL)?;
    ck(unsafe { libc::flock(host, op) } as i64)
}

// ---------------------------------------------------------------------------
// Metadata.

fn sys_fstat(m: &mut Machine, fildes: i32, staddr: u64) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    ck(unsafe { libc::fstat(host, &mut st) } as i64)?;
    m.copy_to_guest(staddr, &encode_stat(&st))?;
    Ok(0)
}

fn sys_fstatat(
    m: &mut Machine,
    dirfildes: i32,
    path: u64,
    staddr: u64,
    flags: i32,
) -> Result<i64, Errno> {
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    let atf = xlat_atf(flags).ok_or(Errno::EINVAL)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    ck(unsafe { libc::fstatat(dirfd, cpath.as_ptr(), &mut st, atf) } as i64)?;
    m.copy_to_guest(staddr, &encode_stat(&st))?;
    Ok(0)
}

fn sys_faccessat(
    m: &mut Machine,
    dirfildes: i32,
    path: u64,
    mode: i32,
    flags: i32,
) -> Result<i64, Errno> {
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    let mode = xlat_access(mode).ok_or(Errno::EINVAL)?;
    let atf = if flags & AT_EACCESS_LINUX != 0 {
        libc::AT_EACCESS
    } else {
        0
    };
    ck(unsafe { libc::faccessat(dirfd, cpath.as_ptr(), mode, atf) } as i64)
}

fn sys_mkdirat(m: &mut Machine, dirfildes: i32, path: u64, mode: u32) -> Result<i64, Errno> {
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::mkdirat(dirfd, cpath.as_ptr(), mode as libc::mode_t) } as i64)
}

fn sys_unlinkat(m: &mut Machine, dirfildes: i32, path: u64, flags: i32) -> Result<i64, Errno> {
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    let atf = xlat_atf(flags).ok_or(Errno::EINVAL)?;
    ck(unsafe { libc::unlinkat(dirfd, cpath.as_ptr(), atf) } as i64)
}

fn sys_renameat(
    m: &mut Machine,
    srcdir: i32,
    src: u64,
    dstdir: i32,
    dst: u64,
) -> Result<i64, Errno> {
    let srcfd = dir_fd(m, srcdir)?;
    let dstfd = dir_fd(m, dstdir)?;
    let csrc = load_cstr(m, src)?;
    let cdst = load_cstr(m, dst)?;
    ck(unsafe { libc::renameat(srcfd, csrc.as_ptr(), dstfd, cdst.as_ptr()) } as i64)
}

fn sys_readlinkat(
    m: &mut Machine,
    dirfildes: i32,
    path: u64,
    bufaddr: u64,
    size: i64,
) -> Result<i64, Errno> {
    if size < 0 {
        return Err(Errno::EINVAL);
    }
    if size > libc::PATH_MAX as i64 {
        return Err(Errno::ENOMEM);
    }
    let dirfd = dir_fd(m, dirfildes)?;
    let cpath = load_cstr(m, path)?;
    let mut buf = vec![0u8; size as usize];
    let rc = ck(unsafe {
        libc::readlinkat(dirfd, cpath.as_ptr(), buf.as_mut_ptr() as *mut _, buf.len())
    } as i64)?;
    m.copy_to_guest(bufaddr, &buf[..rc as usize])?;
    Ok(rc)
}

fn sys_getcwd(m: &mut Machine, bufaddr: u64, size: u64) -> Result<i64, Errno> {
    use std::os::unix::ffi::OsStrExt;
    let cwd = unistd::getcwd()?;
    let mut out = cwd.as_os_str().as_bytes().to_vec();
    out.push(0);
    if out.len() > size as usize {
        return Err(Errno::ERANGE);
    }
    m.copy_to_guest(bufaddr, &out)?;
    Ok(bufaddr as i64)
}

fn sys_fsync(m: &mut Machine, fildes: i32, data_only: bool) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    ck(unsafe {
        if data_only {
            libc::fdatasync(host)
        } else {
            libc::fsync(host)
        }
    } as i64)
}

fn sys_truncate(m: &mut Machine, path: u64, length: i64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::truncate(cpath.as_ptr(), length) } as i64)
}

fn sys_ftruncate(m: &mut Machine, fildes: i32, length: i64) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    ck(unsafe { libc::ftruncate(host, length) } as i64)
}

fn sys_chdir(m: &mut Machine, path: u64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::chdir(cpath.as_ptr()) } as i64)
}

fn sys_rmdir(m: &mut Machine, path: u64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::rmdir(cpath.as_ptr()) } as i64)
}

fn sys_link(m: &mut Machine, existing: u64, new: u64) -> Result<i64, Errno> {
    let cexisting = load_cstr(m, existing)?;
    let cnew = load_cstr(m, new)?;
    ck(unsafe { libc::link(cexisting.as_ptr(), cnew.as_ptr()) } as i64)
}

fn sys_unlink(m: &mut Machine, path: u64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::unlink(cpath.as_ptr()) } as i64)
}

fn sys_symlink(m: &mut Machine, target: u64, link: u64) -> Result<i64, Errno> {
    let ctarget = load_cstr(m, target)?;
    let clink = load_cstr(m, link)?;
    ck(unsafe { libc::symlink(ctarget.as_ptr(), clink.as_ptr()) } as i64)
}

fn sys_chmod(m: &mut Machine, path: u64, mode: u32) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::chmod(cpath.as_ptr(), mode as libc::mode_t) } as i64)
}

fn sys_fchmod(m: &mut Machine, fildes: i32, mode: u32) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    ck(unsafe { libc::fchmod(host, mode as libc::mode_t) } as i64)
}

fn sys_mknod(m: &mut Machine, path: u64, mode: u32, dev: u64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    ck(unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, dev as libc::dev_t) } as i64)
}

fn sys_utimes(m: &mut Machine, path: u64, tvsaddr: u64) -> Result<i64, Errno> {
    let cpath = load_cstr(m, path)?;
    if tvsaddr == 0 {
        return ck(unsafe { libc::utimes(cpath.as_ptr(), std::ptr::null()) } as i64);
    }
    let mut raw = [0u8; 2 * TIMEVAL_SIZE];
    m.copy_from_guest(tvsaddr, &mut raw)?;
    let (asec, ausec) = decode_timeval(&raw[0..16]);
    let (msec, musec) = decode_timeval(&raw[16..32]);
    let tvs = [
        libc::timeval {
            tv_sec: asec as libc::time_t,
            tv_usec: ausec as libc::suseconds_t,
        },
        libc::timeval {
            tv_sec: msec as libc::time_t,
            tv_usec: musec as libc::suseconds_t,
        },
    ];
    ck(unsafe { libc::utimes(cpath.as_ptr(), tvs.as_ptr()) } as i64)
}

fn sys_getrandom(m: &mut Machine, addr: u64, size: u64, flags: u32) -> Result<i64, Errno> {
    let mut buf = vec![0u8; size.min(0x100000) as usize];
    let rc = ck(unsafe {
        libc::getrandom(buf.as_mut_ptr() as *mut _, buf.len(), flags)
    } as i64)?;
    m.copy_to_guest(addr, &buf[..rc as usize])?;
    Ok(rc)
}

// ---------------------------------------------------------------------------
// Directory iteration.

fn sys_getdents(m: &mut Machine, fildes: i32, addr: u64, size: i64) -> Result<i64, Errno> {
    if size < DIRENT_MAX {
        return Err(Errno::EINVAL);
    }
    let fd = get_fd(m, fildes)?;
    let mut state = fd.lock();
    if state.dir.is_none() {
        let dir = unsafe { libc::fdopendir(fd.host()) };
        if dir.is_null() {
            return Err(Errno::last());
        }
        state.dir = Some(crate::fd::DirStream(dir));
    }
    let dir = state.dir.as_ref().unwrap().0;
    let mut i: i64 = 0;
    while i + DIRENT_MAX <= size {
        let off = unsafe { libc::telldir(dir) };
        let ent = unsafe { libc::readdir(dir) };
        if ent.is_null() {
            break;
        }
        let ent = unsafe { &*ent };
        let name = unsafe { std::ffi::CStr::from_ptr(ent.d_name.as_ptr()) };
        let name = name.to_bytes();
        if name.len() + 1 > 256 {
            log::warn!("ignoring {} byte d_name", name.len());
            continue;
        }
        let reclen = (8 + 8 + 2 + 1 + name.len() + 1) as i64;
        let mut rec = Vec::with_capacity(reclen as usize);
        rec.extend_from_slice(&0u64.to_le_bytes());
        rec.extend_from_slice(&(off as i64).to_le_bytes());
        rec.extend_from_slice(&(reclen as u16).to_le_bytes());
        rec.push(unxlat_dt(ent.d_type));
        rec.extend_from_slice(name);
        rec.push(0);
        m.copy_to_guest(addr + i as u64, &rec)?;
        i += reclen;
    }
    drop(state);
    Ok(i)
}

// ---------------------------------------------------------------------------
// Terminal ioctls.

fn sys_ioctl(m: &mut Machine, fildes: i32, request: u64, addr: u64) -> Result<i64, Errno> {
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let host = fd.host();
    match request {
        TIOCGWINSZ_LINUX => {
            let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
            fd.cb
                .ioctl(host, libc::TIOCGWINSZ as libc::c_ulong, &mut ws as *mut _ as *mut _)?;
            m.copy_to_guest(addr, &encode_winsize(&ws))?;
            Ok(0)
        }
        TCGETS_LINUX => {
            let mut tio: libc::termios = unsafe { std::mem::zeroed() };
            fd.cb
                .ioctl(host, libc::TCGETS as libc::c_ulong, &mut tio as *mut _ as *mut _)?;
            m.copy_to_guest(addr, &encode_termios(&tio))?;
            Ok(0)
        }
        TCSETS_LINUX | TCSETSW_LINUX | TCSETSF_LINUX => {
            let mut raw = [0u8; TERMIOS_SIZE];
            m.copy_from_guest(addr, &mut raw)?;
            let mut tio: libc::termios = unsafe { std::mem::zeroed() };
            decode_termios(&raw, &mut tio);
            let req = match request {
                TCSETS_LINUX => libc::TCSETS,
                TCSETSW_LINUX => libc::TCSETSW,
                _ => libc::TCSETSF,
            };
            fd.cb
                .ioctl(host, req as libc::c_ulong, &mut tio as *mut _ as *mut _)?;
            Ok(0)
        }
        _ => {
            log::warn!("unknown ioctl request {:#x}", request);
            Err(Errno::EINVAL)
        }
    }
}

// ---------------------------------------------------------------------------
// Polling.

fn sys_poll(m: &mut Machine, fdsaddr: u64, nfds: u64, timeout_ms: i32) -> Result<i64, Errno> {
    let gfdssize = nfds.checked_mul(POLLFD_SIZE as u64).ok_or(Errno::EINVAL)?;
    if gfdssize > 0x7fff_f000 {
        return Err(Errno::EINVAL);
    }
    let mut raw = vec![0u8; gfdssize as usize];
    m.copy_from_guest(fdsaddr, &mut raw)?;
    let started = Instant::now();
    let rc;
    'outer: loop {
        let mut ready = 0i64;
        for chunk in raw.chunks_exact_mut(POLLFD_SIZE) {
            let fildes = i32::from_le_bytes(chunk[0..4].try_into().unwrap());
            let events = i16::from_le_bytes(chunk[4..6].try_into().unwrap());
            let fd = m.system.fds.lock().unwrap().get(fildes);
            let revents = match fd {
                None => POLLNVAL_LINUX,
                Some(fd) => {
                    let host = fd.host();
                    match fd.cb.poll(host, xlat_poll_events(events), 0) {
                        Ok(hostrev) => unxlat_poll_events(hostrev),
                        Err(_) => POLLERR_LINUX,
                    }
                }
            };
            if revents != 0 {
                ready += 1;
            }
            chunk[6..8].copy_from_slice(&revents.to_le_bytes());
        }
        if ready != 0 || timeout_ms == 0 {
            rc = ready;
            break 'outer;
        }
        let mut wait = Duration::from_millis(POLLING_INTERVAL_MS);
        if timeout_ms > 0 {
            let deadline = Duration::from_millis(timeout_ms as u64);
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                rc = 0;
                break 'outer;
            }
            wait = wait.min(deadline - elapsed);
        }
        if let Some(redraw) = &m.system.redraw {
            redraw();
        }
        std::thread::sleep(wait);
    }
    m.copy_to_guest(fdsaddr, &raw)?;
    Ok(rc)
}

// ---------------------------------------------------------------------------
// Memory management.

fn sys_brk(m: &mut Machine, addr: u64) -> Result<i64, Errno> {
    let mut map = m.system.mem.lock();
    log::trace!("brk({:#x}) currently {:#x}", addr, map.brk);
    let addr = (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if addr >= crate::map::MIN_BRK {
        if addr > map.brk {
            let old = map.brk;
            if map.reserve(old, addr - old, PageKey::U | PageKey::RW, -1, false) {
                map.brk = addr;
            }
        } else if addr < map.brk {
            let old = map.brk;
            if map.free(addr, old - addr) {
                map.brk = addr;
            }
        }
    }
    Ok(map.brk as i64)
}

fn sys_mmap(
    m: &mut Machine,
    virt: u64,
    size: u64,
    prot: i32,
    flags: i32,
    fildes: i32,
    offset: i64,
) -> Result<i64, Errno> {
    if !valid_addr_size(m, virt, size) {
        return Err(Errno::EINVAL);
    }
    if flags & MAP_GROWSDOWN_LINUX != 0 {
        return Err(Errno::EOPNOTSUPP);
    }
    if flags & MAP_FIXED_NOREPLACE_LINUX != 0 {
        return Err(Errno::EOPNOTSUPP);
    }
    let key = prot_to_page(prot).ok_or(Errno::EINVAL)?;
    let fd = if fildes != -1 {
        if flags & MAP_ANONYMOUS_LINUX != 0 {
            return Err(Errno::EINVAL);
        }
        Some(get_fd(m, fildes)?)
    } else {
        None
    };
    let systemfd = fd.as_ref().map(|f| f.host()).unwrap_or(-1);
    let _fd_guard = fd.as_ref().map(|f| f.lock());

    let hint = virt;
    let virt = {
        let mut map = m.system.mem.lock();
        let virt = if flags & MAP_FIXED_LINUX == 0 {
            let want = if hint == 0 { map.brk } else { hint };
            let found = map.find_virtual(want, size).ok_or(Errno::ENOMEM)?;
            if hint == 0 {
                // Anonymous placement moves the break past the hole so
                // later brk growth does not collide.
                map.brk = (found + size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
            }
            found
        } else {
            virt
        };
        if !map.reserve(virt, size, key, systemfd, flags & MAP_SHARED_LINUX != 0) {
            return Err(Errno::ENOMEM);
        }
        virt
    };

    if let Some(fd) = &fd {
        // File contents are materialized eagerly; the arena never
        // aliases host pages, so there is no lazy variant to fall back
        // on. An unreadable backing file raises the SIGBUS pending bit
        // instead of faulting the emulator.
        let mut tmp = vec![0u8; size as usize];
        let mut done = 0usize;
        while done < tmp.len() {
            let rc = unsafe {
                libc::pread(
                    fd.host(),
                    tmp[done..].as_mut_ptr() as *mut _,
                    tmp.len() - done,
                    offset + done as i64,
                )
            };
            match rc {
                -1 => {
                    let e = Errno::last();
                    if e == Errno::EINTR {
                        continue;
                    }
                    log::error!(
                        "failed to read {} bytes at offset {} from fd {}: {}",
                        size,
                        offset,
                        fd.host(),
                        e
                    );
                    let _ = m.system.post_signal(m.tid(), 7);
                    break;
                }
                0 => break,
                n => done += n as usize,
            }
        }
        m.copy_to_guest(virt, &tmp)?;
    }
    Ok(virt as i64)
}

fn sys_mprotect(m: &mut Machine, addr: u64, size: u64, prot: i32) -> Result<i64, Errno> {
    if !valid_addr_size(m, addr, size) {
        return Err(Errno::EINVAL);
    }
    let key = prot_to_page(prot).ok_or(Errno::EINVAL)?;
    {
        let mut map = m.system.mem.lock();
        map.protect(addr, size, PageKey::U | PageKey::RW | PageKey::XD, key);
    }
    if prot & 4 != 0 {
        if let Some(hook) = &m.system.jit_reset {
            hook(addr, size);
        }
    }
    Ok(0)
}

fn sys_munmap(m: &mut Machine, virt: u64, size: u64) -> Result<i64, Errno> {
    if !valid_addr_size(m, virt, size) {
        return Err(Errno::EINVAL);
    }
    let mut map = m.system.mem.lock();
    if !map.free(virt, size) {
        return Err(Errno::EINVAL);
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// Signals.

fn sys_sigaction(m: &mut Machine, sig: i32, act: u64, old: u64, sigsetsize: u64) -> Result<i64, Errno> {
    let sig = xlat_signal(sig).ok_or(Errno::EINVAL)?;
    if sigsetsize != 8 || sig as usize > NSIG {
        return Err(Errno::EINVAL);
    }
    let slot = (sig - 1) as usize;
    if old != 0 {
        let current = m.system.hands.lock().unwrap()[slot];
        m.copy_to_guest(old, &encode_sigaction(&current))?;
    }
    if act != 0 {
        let mut raw = [0u8; SIGACTION_SIZE];
        m.copy_from_guest(act, &mut raw)?;
        m.system.hands.lock().unwrap()[slot] = decode_sigaction(&raw);
    }
    Ok(0)
}

fn sys_sigprocmask(m: &mut Machine, how: i32, set: u64, old: u64, sigsetsize: u64) -> Result<i64, Errno> {
    let how = xlat_sig_how(how).ok_or(Errno::EINVAL)?;
    if sigsetsize != 8 {
        return Err(Errno::EINVAL);
    }
    if old != 0 {
        let mask = m.sigmask;
        m.copy_to_guest(old, &mask.to_le_bytes())?;
    }
    if set != 0 {
        let mut raw = [0u8; 8];
        m.copy_from_guest(set, &mut raw)?;
        let word = u64::from_le_bytes(raw);
        m.sigmask = if how == libc::SIG_BLOCK {
            m.sigmask | word
        } else if how == libc::SIG_UNBLOCK {
            m.sigmask & !word
        } else {
            word
        };
    }
    Ok(0)
}

fn sys_sigsuspend(m: &mut Machine, maskaddr: u64) -> Result<i64, Errno> {
    let mut raw = [0u8; 8];
    m.copy_from_guest(maskaddr, &mut raw)?;
    let set = xlat_sigset_to_host(u64::from_le_bytes(raw));
    ck(unsafe { libc::sigsuspend(&set) } as i64)
}

fn sys_kill(m: &mut Machine, pid: i32, sig: i32) -> Result<i64, Errno> {
    if pid == m.system.pid {
        // Queueing a signal against the whole emulation needs delivery
        // support in the outer interpreter.
        log::warn!("kill() aimed at the emulated process itself");
        return Err(Errno::ENOSYS);
    }
    let sig = xlat_signal(sig).ok_or(Errno::EINVAL)?;
    ck(unsafe { libc::kill(pid, sig) } as i64)
}

fn sys_tkill(m: &mut Machine, tid: i32, sig: i32) -> Result<i64, Errno> {
    if !(1..=64).contains(&sig) {
        return Err(Errno::EINVAL);
    }
    m.system.post_signal(tid, sig as u8)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Time.

fn read_timespec(m: &mut Machine, addr: u64) -> Result<(i64, i64), Errno> {
    let mut raw = [0u8; TIMESPEC_SIZE];
    m.copy_from_guest(addr, &mut raw)?;
    Ok(decode_timespec(&raw))
}

fn sys_nanosleep(m: &mut Machine, req: u64, rem: u64) -> Result<i64, Errno> {
    let mut hreq = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if req != 0 {
        let (sec, nsec) = read_timespec(m, req)?;
        hreq.tv_sec = sec as libc::time_t;
        hreq.tv_nsec = nsec as libc::c_long;
    }
    let mut hrem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe {
        libc::nanosleep(
            if req != 0 { &hreq } else { std::ptr::null() },
            if rem != 0 { &mut hrem } else { std::ptr::null_mut() },
        )
    };
    if rc == -1 {
        let e = Errno::last();
        if e == Errno::EINTR && rem != 0 {
            m.copy_to_guest(rem, &encode_timespec(hrem.tv_sec as i64, hrem.tv_nsec as i64))?;
        }
        return Err(e);
    }
    Ok(0)
}

fn sys_clock_nanosleep(m: &mut Machine, clock: i32, flags: i32, req: u64, rem: u64) -> Result<i64, Errno> {
    let clock = xlat_clock(clock).ok_or(Errno::EINVAL)?;
    if flags & !TIMER_ABSTIME_LINUX != 0 {
        return Err(Errno::EINVAL);
    }
    let (sec, nsec) = read_timespec(m, req)?;
    let hreq = libc::timespec {
        tv_sec: sec as libc::time_t,
        tv_nsec: nsec as libc::c_long,
    };
    let hflags = if flags & TIMER_ABSTIME_LINUX != 0 {
        libc::TIMER_ABSTIME
    } else {
        0
    };
    let mut hrem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_nanosleep(clock, hflags, &hreq, &mut hrem) };
    if rc != 0 {
        let e = Errno::from_i32(rc);
        if e == Errno::EINTR && hflags == 0 && rem != 0 {
            m.copy_to_guest(rem, &encode_timespec(hrem.tv_sec as i64, hrem.tv_nsec as i64))?;
        }
        return Err(e);
    }
    Ok(0)
}

fn sys_clock_gettime(m: &mut Machine, clock: i32, ts: u64, res: bool) -> Result<i64, Errno> {
    let clock = xlat_clock(clock).ok_or(Errno::EINVAL)?;
    let mut hts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe {
        if res {
            libc::clock_getres(clock, &mut hts)
        } else {
            libc::clock_gettime(clock, &mut hts)
        }
    };
    ck(rc as i64)?;
    if ts != 0 {
        m.copy_to_guest(ts, &encode_timespec(hts.tv_sec as i64, hts.tv_nsec as i64))?;
    }
    Ok(0)
}

fn sys_gettimeofday(m: &mut Machine, tv: u64, tz: u64) -> Result<i64, Errno> {
    let mut htv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    #[repr(C)]
    struct Timezone {
        tz_minuteswest: i32,
        tz_dsttime: i32,
    }
    let mut htz = Timezone {
        tz_minuteswest: 0,
        tz_dsttime: 0,
    };
    ck(unsafe {
        libc::gettimeofday(
            &mut htv,
            if tz != 0 {
                &mut htz as *mut _ as *mut _
            } else {
                std::ptr::null_mut()
            },
        )
    } as i64)?;
    m.copy_to_guest(tv, &encode_timeval(htv.tv_sec as i64, htv.tv_usec as i64))?;
    if tz != 0 {
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&htz.tz_minuteswest.to_le_bytes());
        raw[4..8].copy_from_slice(&htz.tz_dsttime.to_le_bytes());
        m.copy_to_guest(tz, &raw)?;
    }
    Ok(0)
}

fn sys_getitimer(m: &mut Machine, which: i32, curvaladdr: u64) -> Result<i64, Errno> {
    let mut it: libc::itimerval = unsafe { std::mem::zeroed() };
    ck(unsafe { libc::getitimer(which, &mut it) } as i64)?;
    m.copy_to_guest(curvaladdr, &encode_itimerval(&it))?;
    Ok(0)
}

fn sys_setitimer(m: &mut Machine, which: i32, neuaddr: u64, oldaddr: u64) -> Result<i64, Errno> {
    let mut raw = [0u8; ITIMERVAL_SIZE];
    m.copy_from_guest(neuaddr, &mut raw)?;
    let neu = decode_itimerval(&raw);
    let mut old: libc::itimerval = unsafe { std::mem::zeroed() };
    ck(unsafe { libc::setitimer(which, &neu, &mut old) } as i64)?;
    if oldaddr != 0 {
        m.copy_to_guest(oldaddr, &encode_itimerval(&old))?;
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// Resources.

fn sys_getrlimit(m: &mut Machine, resource: i32, rlimitaddr: u64) -> Result<i64, Errno> {
    let res = xlat_rlimit_resource(resource).ok_or(Errno::EINVAL)?;
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    ck(unsafe { libc::getrlimit(res as _, &mut rlim) } as i64)?;
    m.copy_to_guest(rlimitaddr, &encode_rlimit(&rlim))?;
    Ok(0)
}

fn sys_setrlimit(m: &mut Machine, resource: i32, rlimitaddr: u64) -> Result<i64, Errno> {
    let res = xlat_rlimit_resource(resource).ok_or(Errno::EINVAL)?;
    let mut raw = [0u8; RLIMIT_SIZE];
    m.copy_from_guest(rlimitaddr, &mut raw)?;
    let rlim = decode_rlimit(&raw);
    ck(unsafe { libc::setrlimit(res as _, &rlim) } as i64)
}

fn sys_prlimit(m: &mut Machine, pid: i32, resource: i32, new_addr: u64, old_addr: u64) -> Result<i64, Errno> {
    if pid != 0 && pid != m.system.pid {
        return Err(Errno::EPERM);
    }
    let res = xlat_rlimit_resource(resource).ok_or(Errno::EINVAL)?;
    let mut old = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    ck(unsafe { libc::getrlimit(res as _, &mut old) } as i64)?;
    if new_addr != 0 {
        sys_setrlimit(m, resource, new_addr)?;
    }
    if old_addr != 0 {
        m.copy_to_guest(old_addr, &encode_rlimit(&old))?;
    }
    Ok(0)
}

fn sys_getrusage(m: &mut Machine, who: i32, addr: u64) -> Result<i64, Errno> {
    let who = xlat_rusage_who(who).ok_or(Errno::EINVAL)?;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    ck(unsafe { libc::getrusage(who, &mut ru) } as i64)?;
    m.copy_to_guest(addr, &encode_rusage(&ru))?;
    Ok(0)
}

fn sys_wait4(m: &mut Machine, pid: i32, wstatus_addr: u64, options: i32, rusage_addr: u64) -> Result<i64, Errno> {
    let options = xlat_wait(options).ok_or(Errno::EINVAL)?;
    let mut wstatus: libc::c_int = 0;
    let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = ck(unsafe { libc::wait4(pid, &mut wstatus, options, &mut ru) } as i64)?;
    if wstatus_addr != 0 {
        m.copy_to_guest(wstatus_addr, &wstatus.to_le_bytes())?;
    }
    if rusage_addr != 0 {
        m.copy_to_guest(rusage_addr, &encode_rusage(&ru))?;
    }
    Ok(rc)
}

fn sys_uname(m: &mut Machine, utsaddr: u64) -> Result<i64, Errno> {
    m.copy_to_guest(utsaddr, &encode_utsname())?;
    Ok(0)
}

fn sys_arch_prctl(m: &mut Machine, code: i32, addr: u64) -> Result<i64, Errno> {
    match code {
        ARCH_SET_GS_LINUX => {
            m.gs = addr;
            Ok(0)
        }
        ARCH_SET_FS_LINUX => {
            m.fs = addr;
            Ok(0)
        }
        ARCH_GET_GS_LINUX => {
            let gs = m.gs;
            m.copy_to_guest(addr, &gs.to_le_bytes())?;
            Ok(0)
        }
        ARCH_GET_FS_LINUX => {
            let fs = m.fs;
            m.copy_to_guest(addr, &fs.to_le_bytes())?;
            Ok(0)
        }
        _ => Err(Errno::EINVAL),
    }
}

// ---------------------------------------------------------------------------
// Sockets.

fn fixup_sock(systemfd: RawFd, flags: i32) {
    unsafe {
        if flags & SOCK_CLOEXEC_LINUX != 0 {
            libc::fcntl(systemfd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        if flags & SOCK_NONBLOCK_LINUX != 0 {
            libc::fcntl(systemfd, libc::F_SETFL, libc::O_NONBLOCK);
        }
    }
}

fn sys_socket(m: &mut Machine, family: i32, ty: i32, protocol: i32) -> Result<i64, Errno> {
    let flags = ty & (SOCK_NONBLOCK_LINUX | SOCK_CLOEXEC_LINUX);
    let ty = ty & !(SOCK_NONBLOCK_LINUX | SOCK_CLOEXEC_LINUX);
    let family = xlat_socket_family(family).ok_or(Errno::EAFNOSUPPORT)?;
    let ty = xlat_socket_type(ty).ok_or(Errno::EINVAL)?;
    let protocol = xlat_socket_protocol(protocol).ok_or(Errno::EPROTONOSUPPORT)?;
    let mut oflags = OFlag::O_RDWR;
    if flags & SOCK_CLOEXEC_LINUX != 0 {
        oflags |= OFlag::O_CLOEXEC;
    }
    if flags & SOCK_NONBLOCK_LINUX != 0 {
        oflags |= OFlag::O_NONBLOCK;
    }
    let fd = m
        .system
        .fds
        .lock()
        .unwrap()
        .allocate(0, oflags)
        .ok_or(Errno::EMFILE)?;
    let systemfd = unsafe { libc::socket(family, ty, protocol) };
    if systemfd == -1 {
        let e = Errno::last();
        m.system.fds.lock().unwrap().free(fd.fildes);
        return Err(e);
    }
    fixup_sock(systemfd, flags);
    fd.install(systemfd);
    Ok(fd.fildes as i64)
}

type SockNameFn =
    unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;

fn sys_socket_name(m: &mut Machine, fildes: i32, aa: u64, asa: u64, f: SockNameFn) -> Result<i64, Errno> {
    let mut gaddrsize = [0u8; 4];
    m.copy_from_guest(asa, &mut gaddrsize)?;
    if u32::from_le_bytes(gaddrsize) < SOCKADDR_IN_SIZE as u32 {
        return Err(Errno::EINVAL);
    }
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    ck(unsafe { f(fd.host(), &mut sa as *mut _ as *mut _, &mut len) } as i64)?;
    m.copy_to_guest(asa, &(SOCKADDR_IN_SIZE as u32).to_le_bytes())?;
    m.copy_to_guest(aa, &encode_sockaddr_in(&sa))?;
    Ok(0)
}

type ConnectBindFn =
    unsafe extern "C" fn(libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::c_int;

fn sys_connect_bind(m: &mut Machine, fildes: i32, aa: u64, as_: u32, f: ConnectBindFn) -> Result<i64, Errno> {
    if as_ as usize != SOCKADDR_IN_SIZE {
        return Err(Errno::EINVAL);
    }
    let mut raw = [0u8; SOCKADDR_IN_SIZE];
    m.copy_from_guest(aa, &mut raw)?;
    let sa = decode_sockaddr_in(&raw).ok_or(Errno::EINVAL)?;
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    ck(unsafe {
        f(
            fd.host(),
            &sa as *const _ as *const _,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    } as i64)
}

fn sys_accept4(m: &mut Machine, fildes: i32, aa: u64, asa: u64, flags: i32) -> Result<i64, Errno> {
    if let Some(redraw) = &m.system.redraw {
        redraw();
    }
    if flags & !(SOCK_CLOEXEC_LINUX | SOCK_NONBLOCK_LINUX) != 0 {
        return Err(Errno::EINVAL);
    }
    if aa != 0 {
        let mut gaddrsize = [0u8; 4];
        m.copy_from_guest(asa, &mut gaddrsize)?;
        if u32::from_le_bytes(gaddrsize) < SOCKADDR_IN_SIZE as u32 {
            return Err(Errno::EINVAL);
        }
    }
    let listener = get_fd(m, fildes)?;
    let mut oflags = OFlag::O_RDWR;
    if flags & SOCK_CLOEXEC_LINUX != 0 {
        oflags |= OFlag::O_CLOEXEC;
    }
    if flags & SOCK_NONBLOCK_LINUX != 0 {
        oflags |= OFlag::O_NONBLOCK;
    }
    let fd2 = m
        .system
        .fds
        .lock()
        .unwrap()
        .allocate(0, oflags)
        .ok_or(Errno::EMFILE)?;
    // Hold the listener while accepting so a concurrent close cannot
    // swap its host fd.
    let _guard = listener.lock();
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let systemfd = unsafe {
        libc::accept(listener.host(), &mut sa as *mut _ as *mut _, &mut len)
    };
    if systemfd == -1 {
        let e = Errno::last();
        m.system.fds.lock().unwrap().free(fd2.fildes);
        return Err(e);
    }
    fixup_sock(systemfd, flags);
    if aa != 0 {
        m.copy_to_guest(asa, &(SOCKADDR_IN_SIZE as u32).to_le_bytes())?;
        m.copy_to_guest(aa, &encode_sockaddr_in(&sa))?;
    }
    fd2.install(systemfd);
    Ok(fd2.fildes as i64)
}

fn sys_shutdown(m: &mut Machine, fildes: i32, how: i32) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    let how = xlat_shutdown(how).ok_or(Errno::EINVAL)?;
    ck(unsafe { libc::shutdown(host, how) } as i64)
}

fn sys_listen(m: &mut Machine, fildes: i32, backlog: i32) -> Result<i64, Errno> {
    let host = host_fd(m, fildes)?;
    ck(unsafe { libc::listen(host, backlog) } as i64)
}

fn sys_setsockopt(
    m: &mut Machine,
    fildes: i32,
    level: i32,
    optname: i32,
    optvaladdr: u64,
    optvalsize: u32,
) -> Result<i64, Errno> {
    if optvalsize > 256 {
        return Err(Errno::EINVAL);
    }
    let level = xlat_socket_level(level).ok_or(Errno::EINVAL)?;
    let optname = xlat_socket_optname(level, optname).ok_or(Errno::EINVAL)?;
    let mut optval = vec![0u8; optvalsize as usize];
    m.copy_from_guest(optvaladdr, &mut optval)?;
    let fd = get_fd(m, fildes)?;
    let _guard = fd.lock();
    ck(unsafe {
        libc::setsockopt(
            fd.host(),
            level,
            optname,
            optval.as_ptr() as *const _,
            optvalsize,
        )
    } as i64)
}

// ---------------------------------------------------------------------------
// Threads.

fn sys_fork(m: &mut Machine) -> Result<i64, Errno> {
    match unsafe { unistd::fork() }? {
        unistd::ForkResult::Parent { child } => Ok(child.as_raw() as i64),
        unistd::ForkResult::Child => {
            m.system.isfork.store(true, Ordering::Relaxed);
            Ok(0)
        }
    }
}

fn sys_clone(
    m: &mut Machine,
    flags: u64,
    stack: u64,
    ptid: u64,
    ctid: u64,
    tls: u64,
    _func: u64,
) -> Result<i64, Errno> {
    if flags == SIGCHLD_LINUX {
        if stack != 0 {
            return Err(Errno::EINVAL);
        }
        return sys_fork(m);
    }
    if flags == (CLONE_VM_LINUX | CLONE_VFORK_LINUX | SIGCHLD_LINUX) {
        if stack != 0 {
            return Err(Errno::EINVAL);
        }
        return sys_fork(m);
    }
    sys_spawn(m, flags, stack, ptid, ctid, tls)
}

fn sys_spawn(m: &mut Machine, flags: u64, stack: u64, ptid: u64, ctid: u64, tls: u64) -> Result<i64, Errno> {
    let supported = CLONE_THREAD_LINUX
        | CLONE_VM_LINUX
        | CLONE_FS_LINUX
        | CLONE_FILES_LINUX
        | CLONE_SIGHAND_LINUX
        | CLONE_SETTLS_LINUX
        | CLONE_PARENT_SETTID_LINUX
        | CLONE_CHILD_CLEARTID_LINUX
        | CLONE_CHILD_SETTID_LINUX
        | CLONE_SYSVSEM_LINUX;
    let mandatory = CLONE_THREAD_LINUX
        | CLONE_VM_LINUX
        | CLONE_FS_LINUX
        | CLONE_FILES_LINUX
        | CLONE_SIGHAND_LINUX;
    if flags & !supported != 0 {
        log::warn!("unsupported clone() flags: {:#x}", flags);
        return Err(Errno::EINVAL);
    }
    if flags & mandatory != mandatory {
        log::warn!(
            "missing mandatory clone() thread flags: {:#x}",
            (flags & mandatory) ^ mandatory
        );
        return Err(Errno::EINVAL);
    }
    if flags & CLONE_PARENT_SETTID_LINUX != 0
        && (ptid % 4 != 0 || m.system.mem.atomic_u32(ptid).is_none())
    {
        return Err(Errno::EFAULT);
    }
    if flags & CLONE_CHILD_SETTID_LINUX != 0
        && (ctid % 4 != 0 || m.system.mem.atomic_u32(ctid).is_none())
    {
        return Err(Errno::EFAULT);
    }

    let mut m2 = m.system.new_machine();
    let tid = m2.tid();
    m2.regs = m.regs;
    m2.fs = m.fs;
    m2.gs = m.gs;
    m2.sigmask = m.sigmask;
    if flags & CLONE_SETTLS_LINUX != 0 {
        m2.fs = tls;
    }
    if flags & CLONE_CHILD_CLEARTID_LINUX != 0 {
        m2.ctid = ctid;
    }
    if flags & CLONE_CHILD_SETTID_LINUX != 0 {
        if let Some(word) = m.system.mem.atomic_u32(ctid) {
            word.store(tid as u32, Ordering::Release);
        }
    }
    m2.regs.ax = 0;
    m2.regs.sp = stack;
    crate::machine::spawn_actor(m2).map_err(|_| Errno::EAGAIN)?;
    if flags & CLONE_PARENT_SETTID_LINUX != 0 {
        if let Some(word) = m.system.mem.atomic_u32(ptid) {
            word.store(tid as u32, Ordering::Release);
        }
    }
    Ok(tid as i64)
}

fn sys_exit(m: &mut Machine, rc: i32) -> Result<(), Halt> {
    if m.ctid != 0 {
        if let Some(word) = m.system.mem.atomic_u32(m.ctid) {
            word.store(0, Ordering::SeqCst);
            m.system.futexes.wake(m.ctid, u32::MAX);
        }
    }
    if m.system.is_orphan(m.tid()) {
        Err(Halt::Exit(rc as u8))
    } else {
        Err(Halt::ThreadExit)
    }
}

fn sys_exit_group(m: &mut Machine, rc: i32) -> Result<(), Halt> {
    if m.system.isfork.load(Ordering::Relaxed) {
        unsafe { libc::_exit(rc) };
    }
    Err(Halt::Exit(rc as u8))
}

// ---------------------------------------------------------------------------
// Futexes.

fn sys_futex(
    m: &mut Machine,
    uaddr: u64,
    op: i32,
    val: u32,
    timeout_addr: u64,
    _uaddr2: u64,
    _val3: u32,
) -> Result<i64, Errno> {
    if uaddr % 4 != 0 {
        return Err(Errno::EFAULT);
    }
    match op & !FUTEX_PRIVATE_FLAG_LINUX {
        FUTEX_WAIT_LINUX => {
            let timeout = if timeout_addr != 0 {
                let (sec, nsec) = read_timespec(m, timeout_addr)?;
                if !(0..1_000_000_000).contains(&nsec) {
                    return Err(Errno::EINVAL);
                }
                Some(Duration::new(sec.max(0) as u64, nsec as u32))
            } else {
                None
            };
            m.system.futexes.wait(&m.system.mem, uaddr, val, timeout)
        }
        FUTEX_WAKE_LINUX => Ok(m.system.futexes.wake(uaddr, val)),
        _ => Err(Errno::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_decode() {
        assert_eq!(Sysno::from_u64(0), Some(Sysno::Read));
        assert_eq!(Sysno::from_u64(0x3f), Some(Sysno::Uname));
        assert_eq!(Sysno::from_u64(0xca), Some(Sysno::Futex));
        assert_eq!(Sysno::from_u64(0x101), Some(Sysno::Openat));
        assert_eq!(Sysno::from_u64(0x17), None);
    }
}
