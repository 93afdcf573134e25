//! This module provides [`Machine`] and [`System`] for the Linux
//! variant: the per-thread guest register file, the process-wide shared
//! state, the [`SystemBuilder`] configuration surface, and the halt
//! protocol that unwinds a guest thread back to its actor frame.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use crate::error::Error;
use crate::fd::FdTable;
use crate::futex::FutexPool;
use crate::map::{AddressSpace, DEFAULT_ARENA_SIZE, MIN_BRK};

/// Number of guest signal slots kept in the handler table.
pub const NSIG: usize = 64;

/// A guest `rt_sigaction` record, stored bit-for-bit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

/// The x86-64 guest register file.
#[derive(Clone, Copy, Debug, Default)]
pub struct Regs {
    pub ax: u64,
    pub cx: u64,
    pub dx: u64,
    pub bx: u64,
    pub sp: u64,
    pub bp: u64,
    pub si: u64,
    pub di: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub ip: u64,
    pub flags: u64,
}

/// The part of a machine other threads may touch: its tid and the
/// pending-signal bits tkill sets. Register files stay with the owning
/// host thread.
pub struct MachineShared {
    pub tid: i32,
    pub signals: AtomicU64,
}

/// The stack-unwinding fault raised at a syscall boundary and caught
/// only by the actor frame at the top of the guest thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Halt {
    /// Tear the whole emulation down with this exit code.
    Exit(u8),
    /// Only the current guest thread is done.
    ThreadExit,
}

/// The interpreter loop supplied by the embedding x86-64 engine. It
/// executes instructions on the machine, calling
/// [`crate::syscall::dispatch`] when the guest traps, and returns when
/// the machine halts.
pub type Interpreter = Arc<dyn Fn(&mut Machine) -> Result<(), Halt> + Send + Sync>;

/// One guest thread: register file, signal mask, clear-on-exit ctid
/// address, access taps, and the back-reference to the shared
/// [`System`].
pub struct Machine {
    pub system: Arc<System>,
    pub shared: Arc<MachineShared>,
    pub regs: Regs,
    pub fs: u64,
    pub gs: u64,
    /// Blocked-signal mask, a raw guest sigset word.
    pub sigmask: u64,
    /// Guest address zeroed at thread exit, 0 when unset.
    pub ctid: u64,
    /// Most recent guest read by a syscall, for the front end.
    pub read_tap: Option<(u64, u64)>,
    /// Most recent guest write by a syscall.
    pub write_tap: Option<(u64, u64)>,
}

impl Machine {
    pub fn tid(&self) -> i32 {
        self.shared.tid
    }

    /// Copies guest memory out, recording the read tap.
    pub fn copy_from_guest(&mut self, virt: u64, buf: &mut [u8]) -> Result<(), Errno> {
        let src = self
            .system
            .mem
            .guest_slice(virt, buf.len() as u64)
            .ok_or(Errno::EFAULT)?;
        buf.copy_from_slice(src);
        if !buf.is_empty() {
            self.read_tap = Some((virt, buf.len() as u64));
        }
        Ok(())
    }

    /// Copies into guest memory, recording the write tap.
    pub fn copy_to_guest(&mut self, virt: u64, buf: &[u8]) -> Result<(), Errno> {
        let dst = self
            .system
            .mem
            .guest_slice(virt, buf.len() as u64)
            .ok_or(Errno::EFAULT)?;
        dst.copy_from_slice(buf);
        if !buf.is_empty() {
            self.write_tap = Some((virt, buf.len() as u64));
        }
        Ok(())
    }

    /// Reads a NUL-terminated guest string.
    pub fn load_str(&mut self, virt: u64) -> Result<Vec<u8>, Errno> {
        let mut out = Vec::new();
        let mut addr = virt;
        loop {
            let mut b = [0u8; 1];
            self.copy_from_guest(addr, &mut b)?;
            if b[0] == 0 {
                self.read_tap = Some((virt, out.len() as u64 + 1));
                return Ok(out);
            }
            out.push(b[0]);
            addr += 1;
            if out.len() > 0x10000 {
                return Err(Errno::ENAMETOOLONG);
            }
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.system.unlink(self.shared.tid);
    }
}

/// Process-wide state shared by every machine.
pub struct System {
    pub pid: i32,
    pub mem: AddressSpace,
    pub fds: Mutex<FdTable>,
    pub futexes: FutexPool,
    /// Shared handles of all live machines, for tkill and the orphan
    /// check at exit.
    pub machines: Mutex<Vec<Arc<MachineShared>>>,
    /// Guest signal-handler table.
    pub hands: Mutex<[SigAction; NSIG]>,
    /// True in a child created by fork, which must use `_exit`.
    pub isfork: AtomicBool,
    /// Pre-read file mappings into guest memory instead of aliasing
    /// host pages.
    pub nolinear: bool,
    /// Called before potentially long blocking operations so a front
    /// end can repaint.
    pub redraw: Option<Box<dyn Fn() + Send + Sync>>,
    /// Called with (addr, size) when mprotect makes a range executable,
    /// so an outer JIT can drop cached translations.
    pub jit_reset: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
    /// Restores machine state from a guest signal frame on
    /// rt_sigreturn; supplied by the outer interpreter.
    pub sigrestore: Option<Arc<dyn Fn(&mut Machine) + Send + Sync>>,
    pub interp: Option<Interpreter>,
    tid_next: AtomicI32,
}

impl System {
    /// Creates the initial machine, or a sibling for a cloned thread.
    pub fn new_machine(self: &Arc<Self>) -> Machine {
        let tid = self.tid_next.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(MachineShared {
            tid,
            signals: AtomicU64::new(0),
        });
        self.machines.lock().unwrap().push(shared.clone());
        Machine {
            system: self.clone(),
            shared,
            regs: Regs::default(),
            fs: 0,
            gs: 0,
            sigmask: 0,
            ctid: 0,
            read_tap: None,
            write_tap: None,
        }
    }

    pub(crate) fn unlink(&self, tid: i32) {
        let mut machines = self.machines.lock().unwrap();
        if let Some(i) = machines.iter().position(|m| m.tid == tid) {
            machines.swap_remove(i);
        }
    }

    /// Whether the given machine is the only one left.
    pub fn is_orphan(&self, tid: i32) -> bool {
        let machines = self.machines.lock().unwrap();
        machines.len() == 1 && machines[0].tid == tid
    }

    /// Sets a pending-signal bit on the machine owning `tid`.
    pub fn post_signal(&self, tid: i32, sig: u8) -> Result<(), Errno> {
        let machines = self.machines.lock().unwrap();
        match machines.iter().find(|m| m.tid == tid) {
            Some(m) => {
                m.signals.fetch_or(1 << (sig - 1), Ordering::Relaxed);
                Ok(())
            }
            None => Err(Errno::ESRCH),
        }
    }
}

/// Configures a [`System`] before construction, in the spirit of a VM
/// builder: arena size, initial break, file-map strategy, redraw hook,
/// and the interpreter that cloned threads run.
pub struct SystemBuilder {
    arena_size: usize,
    brk: u64,
    nolinear: bool,
    redraw: Option<Box<dyn Fn() + Send + Sync>>,
    jit_reset: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
    sigrestore: Option<Arc<dyn Fn(&mut Machine) + Send + Sync>>,
    interp: Option<Interpreter>,
}

impl SystemBuilder {
    pub fn new() -> Self {
        Self {
            arena_size: DEFAULT_ARENA_SIZE,
            brk: MIN_BRK,
            nolinear: false,
            redraw: None,
            jit_reset: None,
            sigrestore: None,
            interp: None,
        }
    }

    /// Size of the guest address-space reservation.
    pub fn with_arena_size(mut self, size: usize) -> Self {
        self.arena_size = size;
        self
    }

    /// Initial program break.
    pub fn with_brk(mut self, brk: u64) -> Self {
        self.brk = brk;
        self
    }

    /// Pre-read file mappings instead of aliasing host pages.
    pub fn with_nolinear(mut self, on: bool) -> Self {
        self.nolinear = on;
        self
    }

    pub fn with_redraw(mut self, redraw: Box<dyn Fn() + Send + Sync>) -> Self {
        self.redraw = Some(redraw);
        self
    }

    pub fn with_jit_reset(mut self, hook: Box<dyn Fn(u64, u64) + Send + Sync>) -> Self {
        self.jit_reset = Some(hook);
        self
    }

    pub fn with_sigrestore(mut self, hook: Arc<dyn Fn(&mut Machine) + Send + Sync>) -> Self {
        self.sigrestore = Some(hook);
        self
    }

    pub fn with_interpreter(mut self, interp: Interpreter) -> Self {
        self.interp = Some(interp);
        self
    }

    /// Builds the System with the std streams wired into the fd table.
    pub fn build(self) -> Result<Arc<System>, Error> {
        let pid = std::process::id() as i32;
        let mut fds = FdTable::new();
        fds.add_std(0);
        fds.add_std(1);
        fds.add_std(2);
        Ok(Arc::new(System {
            pid,
            mem: AddressSpace::new(self.arena_size, self.brk)?,
            fds: Mutex::new(fds),
            futexes: FutexPool::new(),
            machines: Mutex::new(Vec::new()),
            hands: Mutex::new([SigAction::default(); NSIG]),
            isfork: AtomicBool::new(false),
            nolinear: self.nolinear,
            redraw: self.redraw,
            jit_reset: self.jit_reset,
            sigrestore: self.sigrestore,
            interp: self.interp,
            tid_next: AtomicI32::new(pid),
        }))
    }
}

impl Default for SystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_TID: Cell<i32> = Cell::new(0);
}

/// The tid of the machine executing on this host thread, or `None`
/// outside an actor. Collaborators use it to find the active register
/// snapshot.
pub fn current_tid() -> Option<i32> {
    let tid = CURRENT_TID.with(|c| c.get());
    if tid == 0 {
        None
    } else {
        Some(tid)
    }
}

/// Marks the calling host thread as driving `tid`. The embedder calls
/// this for the initial thread; spawned actors do it themselves.
pub fn enter_machine(tid: i32) {
    CURRENT_TID.with(|c| c.set(tid));
}

/// Runs a freshly cloned machine on a new detached host thread. The
/// thread executes the System's interpreter until it halts; an
/// exit-group from any thread takes the whole process down, matching
/// guest `exit_group` semantics.
pub fn spawn_actor(mut m: Machine) -> Result<(), Errno> {
    let interp = match &m.system.interp {
        Some(i) => i.clone(),
        None => {
            log::warn!("clone() without an interpreter installed");
            return Err(Errno::ENOSYS);
        }
    };
    let tid = m.tid();
    std::thread::Builder::new()
        .name(format!("guest-{}", tid))
        .spawn(move || {
            enter_machine(tid);
            match interp(&mut m) {
                Ok(()) | Err(Halt::ThreadExit) => {
                    log::debug!("guest thread {} done", tid);
                }
                Err(Halt::Exit(rc)) => {
                    log::debug!("halting machine from thread: {}", rc);
                    drop(m);
                    std::process::exit(rc as i32);
                }
            }
        })
        .map(|_| ())
        .map_err(|_| Errno::EAGAIN)
}
