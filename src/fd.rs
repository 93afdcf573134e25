//! This module provides [`Fd`], [`FdTable`], and the [`FdOps`]
//! capability set a file descriptor's operations route through.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::uio::{readv, writev, IoVec};

/// Operations an [`Fd`] routes through. The host variant talks straight
/// to the kernel; embedders may substitute e.g. a terminal multiplexer
/// for the std streams.
pub trait FdOps: Send + Sync {
    fn close(&self, fd: RawFd) -> Result<(), Errno>;
    fn readv(&self, fd: RawFd, bufs: &mut [&mut [u8]]) -> Result<usize, Errno>;
    fn writev(&self, fd: RawFd, bufs: &[&[u8]]) -> Result<usize, Errno>;
    fn ioctl(&self, fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void)
        -> Result<i32, Errno>;
    /// Polls with the given event bits and timeout, returning revents.
    fn poll(&self, fd: RawFd, events: i16, timeout_ms: i32) -> Result<i16, Errno>;
}

/// Pass-through to the host kernel.
pub struct HostOps;

/// The default vtable shared by every ordinary fd.
pub static HOST_OPS: HostOps = HostOps;

impl FdOps for HostOps {
    fn close(&self, fd: RawFd) -> Result<(), Errno> {
        nix::unistd::close(fd)
    }

    fn readv(&self, fd: RawFd, bufs: &mut [&mut [u8]]) -> Result<usize, Errno> {
        let mut iov: Vec<IoVec<&mut [u8]>> =
            bufs.iter_mut().map(|b| IoVec::from_mut_slice(b)).collect();
        readv(fd, &mut iov)
    }

    fn writev(&self, fd: RawFd, bufs: &[&[u8]]) -> Result<usize, Errno> {
        let iov: Vec<IoVec<&[u8]>> = bufs.iter().map(|b| IoVec::from_slice(b)).collect();
        writev(fd, &iov)
    }

    fn ioctl(
        &self,
        fd: RawFd,
        request: libc::c_ulong,
        arg: *mut libc::c_void,
    ) -> Result<i32, Errno> {
        let rc = unsafe { libc::ioctl(fd, request as _, arg) };
        Errno::result(rc)
    }

    fn poll(&self, fd: RawFd, events: i16, timeout_ms: i32) -> Result<i16, Errno> {
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        Errno::result(rc)?;
        Ok(if rc > 0 { pfd.revents } else { 0 })
    }
}

/// An open directory stream lazily attached by getdents.
pub struct DirStream(pub *mut libc::DIR);

// The stream is only touched under its Fd's lock.
unsafe impl Send for DirStream {}

/// State guarded by the per-fd lock.
pub struct FdState {
    pub oflags: OFlag,
    pub cloexec: bool,
    pub dir: Option<DirStream>,
}

/// One guest file descriptor. `systemfd` is installed with release
/// ordering once the host object exists, so any thread observing a
/// non-negative value observes a fully-initialized Fd.
pub struct Fd {
    pub fildes: i32,
    pub systemfd: AtomicI32,
    pub cb: &'static (dyn FdOps + 'static),
    state: Mutex<FdState>,
}

impl Fd {
    fn new(fildes: i32, oflags: OFlag) -> Arc<Self> {
        Arc::new(Self {
            fildes,
            systemfd: AtomicI32::new(-1),
            cb: &HOST_OPS,
            state: Mutex::new(FdState {
                cloexec: oflags.contains(OFlag::O_CLOEXEC),
                oflags,
                dir: None,
            }),
        })
    }

    /// Takes the per-fd lock for a multi-step operation.
    pub fn lock(&self) -> MutexGuard<'_, FdState> {
        self.state.lock().unwrap()
    }

    /// Installs the host fd, publishing the Fd as ready.
    pub fn install(&self, systemfd: RawFd) {
        self.systemfd.store(systemfd, Ordering::Release);
    }

    pub fn host(&self) -> RawFd {
        self.systemfd.load(Ordering::Acquire)
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Some(dir) = self.state.get_mut().unwrap().dir.take() {
            // closedir also closes the underlying fd.
            unsafe {
                libc::closedir(dir.0);
            }
        }
    }
}

/// The guest descriptor table. fildes numbers are unique and stable;
/// allocation always picks the smallest free number at or above the
/// requested minimum.
pub struct FdTable {
    entries: BTreeMap<i32, Arc<Fd>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Wires up a std stream inherited from the host.
    pub fn add_std(&mut self, fildes: RawFd) {
        if let Ok(flags) = fcntl(fildes, FcntlArg::F_GETFL) {
            let fd = self
                .allocate(fildes, OFlag::from_bits_truncate(flags))
                .expect("std fd slot taken");
            assert_eq!(fd.fildes, fildes);
            fd.install(fildes);
        }
    }

    /// Allocates the lowest free fildes >= `min`.
    pub fn allocate(&mut self, min: i32, oflags: OFlag) -> Option<Arc<Fd>> {
        if min < 0 {
            return None;
        }
        let mut fildes = min;
        for (&n, _) in self.entries.range(min..) {
            if n != fildes {
                break;
            }
            fildes += 1;
        }
        let fd = Fd::new(fildes, oflags);
        self.entries.insert(fildes, fd.clone());
        Some(fd)
    }

    /// Allocates a specific fildes, replacing whatever held it (dup2).
    /// The displaced Fd is returned so the caller can close it outside
    /// the table lock.
    pub fn allocate_at(&mut self, fildes: i32, oflags: OFlag) -> (Arc<Fd>, Option<Arc<Fd>>) {
        let old = self.entries.remove(&fildes);
        let fd = Fd::new(fildes, oflags);
        self.entries.insert(fildes, fd.clone());
        (fd, old)
    }

    pub fn get(&self, fildes: i32) -> Option<Arc<Fd>> {
        self.entries.get(&fildes).cloned()
    }

    /// Returns the slot to the free list.
    pub fn free(&mut self, fildes: i32) -> Option<Arc<Fd>> {
        self.entries.remove(&fildes)
    }

    pub fn fildes_above(&self, min: i32) -> Vec<i32> {
        self.entries.range(min..).map(|(&n, _)| n).collect()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_prefers_lowest_free() {
        let mut t = FdTable::new();
        let a = t.allocate(0, OFlag::O_RDWR).unwrap();
        let b = t.allocate(0, OFlag::O_RDWR).unwrap();
        let c = t.allocate(0, OFlag::O_RDWR).unwrap();
        assert_eq!((a.fildes, b.fildes, c.fildes), (0, 1, 2));
        t.free(1);
        let d = t.allocate(0, OFlag::O_RDWR).unwrap();
        assert_eq!(d.fildes, 1);
        let e = t.allocate(0, OFlag::O_RDWR).unwrap();
        assert_eq!(e.fildes, 3);
    }

    #[test]
    fn allocation_honors_minimum() {
        let mut t = FdTable::new();
        let a = t.allocate(10, OFlag::O_RDONLY).unwrap();
        assert_eq!(a.fildes, 10);
        let b = t.allocate(10, OFlag::O_RDONLY).unwrap();
        assert_eq!(b.fildes, 11);
    }

    #[test]
    fn allocate_at_displaces() {
        let mut t = FdTable::new();
        let a = t.allocate(5, OFlag::O_RDONLY).unwrap();
        let (b, old) = t.allocate_at(5, OFlag::O_RDWR);
        assert_eq!(b.fildes, 5);
        assert_eq!(old.unwrap().fildes, a.fildes);
    }

    #[test]
    fn uninstalled_fd_reads_negative() {
        let mut t = FdTable::new();
        let fd = t.allocate(0, OFlag::O_RDONLY).unwrap();
        assert_eq!(fd.host(), -1);
        fd.install(7);
        assert_eq!(fd.host(), 7);
    }
}
