//! This module provides the program loaders: bare boot sector, DOS
//! MZ/COM, and ELKS a.out. Each places an image in real-mode RAM, sets
//! up the initial register file and stack, and returns the [`Exec`]
//! record carrying the syscall personality for interrupt dispatch.

mod boot;
mod dos;
mod elks;

pub use boot::load_boot;
pub use dos::load_dos;
pub use elks::load_elks;

use std::path::Path;

use crate::cpu::Cpu;
use crate::error::Error;
use crate::exe::Exec;
use crate::memory::RealMemory;

/// Initial FLAGS for every loader: reserved bits on, interrupts
/// enabled.
pub const INITIAL_FLAGS: u16 = 0xf202;

/// Zeroes RAM, the shadow, and the register file before a load.
pub fn init_machine(cpu: &mut Cpu, mem: &mut RealMemory) {
    cpu.reset();
    mem.reset();
}

/// Loads `path` by format: `.exe` and `.com` go through the DOS loader,
/// everything else is treated as an ELKS a.out. `args[0]` is the
/// program path; the DOS command tail is built from `args[2..]`.
pub fn load_program(
    cpu: &mut Cpu,
    mem: &mut RealMemory,
    path: &Path,
    args: &[String],
    envs: &[String],
) -> Result<Exec, Error> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    let exe = match ext.as_deref() {
        Some("exe") | Some("com") => load_dos(cpu, mem, path, args, envs)?,
        _ => load_elks(cpu, mem, path, args, envs)?,
    };
    mem.start();
    Ok(exe)
}

pub(crate) fn loader_err(path: &Path, what: &'static str) -> Error {
    Error::Loader {
        path: path.to_path_buf(),
        what,
    }
}
