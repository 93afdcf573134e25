//! Boot-sector loader: one raw sector placed at 0000:7C00, exactly as
//! the BIOS would.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::cpu::Cpu;
use crate::error::Error;
use crate::exe::{Exec, Personality};
use crate::loader::{init_machine, loader_err, INITIAL_FLAGS};
use crate::memory::RealMemory;

const BOOT_OFFSET: usize = 0x7c00;
const SECTOR_SIZE: usize = 512;

/// Loads a bare boot-sector image. Shadow checking is disabled:
/// bare-metal code owns all of memory.
pub fn load_boot(cpu: &mut Cpu, mem: &mut RealMemory, path: &Path) -> Result<Exec, Error> {
    init_machine(cpu, mem);

    let mut file = File::open(path).map_err(|_| loader_err(path, "can't open"))?;
    let mut sector = [0u8; SECTOR_SIZE];
    file.read_exact(&mut sector)
        .map_err(|_| loader_err(path, "error reading executable"))?;
    mem.raw_mut()[BOOT_OFFSET..BOOT_OFFSET + SECTOR_SIZE].copy_from_slice(&sector);

    mem.set_shadow_check(false);

    cpu.set_es(0x0000);
    cpu.set_ds(0x0000);
    cpu.set_ss(0x0000);
    cpu.set_sp(0x0000);
    cpu.set_cs(0x0000);
    cpu.set_ip(0x7c00);
    cpu.set_flags(INITIAL_FLAGS);

    let mut exe = Exec::new();
    exe.load_segment = 0x07c0;
    exe.text_seg = 0;
    exe.personality = Personality::Boot;
    Ok(exe)
}
