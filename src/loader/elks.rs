//! ELKS a.out loader: text, data and bss placement, break bookkeeping,
//! and the flat argc/argv/envp block beneath the initial stack pointer.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::cpu::Cpu;
use crate::error::Error;
use crate::exe::{AoutHeader, Exec, Personality, ELKS_MAGIC};
use crate::loader::{init_machine, loader_err, INITIAL_FLAGS};
use crate::memory::{RealMemory, Seg, F_READ, F_WRITE, RAM_SIZE};

const LOAD_SEGMENT: u16 = 0x1000;

/// Loads an ELKS a.out executable.
pub fn load_elks(
    cpu: &mut Cpu,
    mem: &mut RealMemory,
    path: &Path,
    args: &[String],
    envs: &[String],
) -> Result<Exec, Error> {
    init_machine(cpu, mem);

    let mut file = File::open(path).map_err(|_| loader_err(path, "can't open"))?;
    let mut header = [0u8; AoutHeader::SIZE];
    file.read_exact(&mut header)
        .map_err(|_| loader_err(path, "can't read header"))?;
    let hdr = AoutHeader::parse(&header).ok_or_else(|| loader_err(path, "can't read header"))?;
    if hdr.magic != ELKS_MAGIC {
        return Err(loader_err(path, "not an ELKS executable"));
    }
    if hdr.hlen as usize != AoutHeader::SIZE {
        return Err(loader_err(path, "medium model programs not yet supported"));
    }
    if hdr.version != 1 {
        return Err(loader_err(path, "version 0 header programs not yet supported"));
    }
    let meta = file.metadata().map_err(|_| loader_err(path, "can't stat"))?;
    // Text and data follow the header; symbols trail the file.
    let filesize = (meta.len() as usize)
        .checked_sub(hdr.syms as usize + hdr.hlen as usize)
        .ok_or_else(|| loader_err(path, "error reading executable"))?;

    let load_offset = (LOAD_SEGMENT as usize) << 4;
    if filesize > RAM_SIZE - load_offset {
        return Err(loader_err(path, "not enough memory to load"));
    }
    file.read_exact(&mut mem.raw_mut()[load_offset..load_offset + filesize])
        .map_err(|_| loader_err(path, "error reading executable"))?;

    let tseg = ((hdr.tseg as usize) + 15) & !15;
    let dseg = hdr.dseg as usize;
    let bseg = hdr.bseg as usize;
    let stack = if hdr.minstack != 0 {
        hdr.minstack as usize
    } else {
        0x1000
    };
    let slen = environ_bytes(args, envs);
    let mut len = dseg + bseg + stack + slen;
    let heap = if hdr.chmem != 0 { hdr.chmem as usize } else { 0x1000 };
    if heap >= 0xfff0 {
        // Maximum heap requested: claim the whole segment.
        if len < 0xfff0 {
            len = 0xfff0;
        }
    } else {
        len += heap;
    }
    len = (len + 15) & !15;
    log::debug!(
        "elks load tseg {:04x} dseg {:04x} bseg {:04x} heap {:04x} stack {:04x} totdata {:04x}",
        tseg,
        dseg,
        bseg,
        heap,
        stack,
        len
    );
    if len > 0xffff {
        return Err(loader_err(path, "program heap+stack >= 64K"));
    }

    // Text is read-only; the data segment sits just past it.
    mem.set_shadow_flags(0, LOAD_SEGMENT, tseg, F_READ);
    let data_segment = LOAD_SEGMENT + (tseg >> 4) as u16;
    mem.set_shadow_flags(0, data_segment, len, F_READ | F_WRITE);
    cpu.set_es(data_segment);
    cpu.set_ss(data_segment);
    cpu.set_ds(data_segment);

    cpu.set_cs(LOAD_SEGMENT);
    cpu.set_ip((hdr.entry & 0xffff) as u16);

    let mut exe = Exec::new();
    exe.load_segment = LOAD_SEGMENT;
    exe.aout = hdr;
    exe.brk.endseg = len as u16;
    exe.brk.begstack = ((len - slen) & !1) as u16;
    exe.brk.minstack = stack as u16;
    exe.brk.enddata = (dseg + bseg) as u16;
    exe.brk.endbrk = exe.brk.enddata;
    if exe.brk.endbrk & 1 != 0 {
        exe.brk.endbrk += 1;
    }
    cpu.set_sp(exe.brk.begstack);
    exe.brk.stack_low =
        ((cpu.ss() as u32) << 4) + exe.brk.begstack as u32 - exe.brk.minstack as u32;

    write_environ(cpu, mem, args, envs)?;

    log::debug!(
        "elks load CS:IP {:04x}:{:04x} DS {:04x} SS:SP {:04x}:{:04x}",
        cpu.cs(),
        cpu.ip(),
        cpu.ds(),
        cpu.ss(),
        cpu.sp()
    );

    cpu.set_es(cpu.ds());
    cpu.set_ax(0x0000);
    cpu.set_bx(0x0000);
    cpu.set_cx(0x0000);
    cpu.set_dx(0x0000);
    cpu.set_bp(0x0000);
    cpu.set_si(0x0000);
    cpu.set_di(0x0000);
    cpu.set_flags(INITIAL_FLAGS);

    exe.text_seg = cpu.cs();
    exe.personality = Personality::Elks;
    Ok(exe)
}

/// Bytes the argc/argv/envp block occupies: argc word, both pointer
/// arrays with their NUL terminators, and the packed strings.
fn environ_bytes(args: &[String], envs: &[String]) -> usize {
    let argv_len: usize = args.iter().map(|a| a.len() + 1).sum();
    let envp_len: usize = envs.iter().map(|e| e.len() + 1).sum();
    let bytes = 2 + args.len() * 2 + 2 + argv_len + envs.len() * 2 + 2 + envp_len;
    (bytes + 1) & !1
}

/// Steps SP down and writes argc, the argv and envp pointer arrays
/// (offsets relative to the SS base), and the packed strings.
fn write_environ(
    cpu: &mut Cpu,
    mem: &mut RealMemory,
    args: &[String],
    envs: &[String],
) -> Result<(), Error> {
    let stack_bytes = environ_bytes(args, envs);
    log::trace!(
        "elks environ argc {} envc {} size {:#x}",
        args.len(),
        envs.len(),
        stack_bytes
    );

    cpu.set_sp(cpu.sp().wrapping_sub(stack_bytes as u16));
    let stk_ptr = cpu.sp();
    let ss = cpu.ss();

    let mut pip = stk_ptr;
    let mut pcp = stk_ptr + 2 * (1 + args.len() as u16 + 1 + envs.len() as u16 + 1);

    mem.write_word(args.len() as u16, pip, Seg::Ss, ss)?;
    pip += 2;
    for arg in args {
        mem.write_word(pcp, pip, Seg::Ss, ss)?;
        pip += 2;
        for (i, b) in arg.bytes().chain(std::iter::once(0)).enumerate() {
            mem.write_byte(b, pcp + i as u16, Seg::Ss, ss)?;
        }
        pcp += arg.len() as u16 + 1;
    }
    mem.write_word(0, pip, Seg::Ss, ss)?;
    pip += 2;

    for env in envs {
        mem.write_word(pcp, pip, Seg::Ss, ss)?;
        pip += 2;
        for (i, b) in env.bytes().chain(std::iter::once(0)).enumerate() {
            mem.write_byte(b, pcp + i as u16, Seg::Ss, ss)?;
        }
        pcp += env.len() as u16 + 1;
    }
    mem.write_word(0, pip, Seg::Ss, ss)?;
    Ok(())
}
