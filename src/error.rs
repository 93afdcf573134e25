//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use std::path::PathBuf;
use thiserror::Error;

/// The `Error` type.
///
/// Guest-fatal conditions (shadow violations, RAM overruns, stack
/// overflows, unset interrupt vectors) carry enough context for the
/// embedder to print a one-line diagnostic with CS:IP before
/// terminating. They are never raised for conditions a guest syscall
/// can legally produce; those come back as negative errnos instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The guest formed a physical address beyond the 1 MiB ceiling.
    #[error("accessing address outside RAM {segname} {segment:04x}:{offset:04x}")]
    AddressOutsideRam {
        segname: &'static str,
        segment: u16,
        offset: u16,
    },
    /// A write hit a byte whose shadow writable bit is clear.
    #[error("writing disallowed address {segname} {segment:04x}:{offset:04x}")]
    ShadowWrite {
        segname: &'static str,
        segment: u16,
        offset: u16,
    },
    /// A read hit a byte that was never initialized or marked readable.
    #[error("reading uninitialized address {segname} {segment:04x}:{offset:04x}")]
    ShadowRead {
        segname: &'static str,
        segment: u16,
        offset: u16,
    },
    /// A push crossed the lowest legal SS:SP for the loaded program.
    #[error("stack overflow SS:SP = {ss:04x}:{sp:04x}")]
    StackOverflow { ss: u16, sp: u16 },
    /// The guest raised an interrupt whose real-mode vector is 0:0.
    #[error("INT {intno:#04x} vector not set")]
    VectorNotSet { intno: u8 },
    /// A far control transfer targeted 0:0.
    #[error("far jump to 0:0")]
    FarJumpToZero,
    /// IRET popped a 0:0 return frame.
    #[error("IRET to 0:0")]
    IretToZero,
    /// The opcode has no 8086 encoding.
    #[error("undefined instruction {opcode:#04x} at {cs:04x}:{ip:04x}")]
    UndefinedInstruction { opcode: u8, cs: u16, ip: u16 },
    /// The opcode is real but the mod/rm encoding is not.
    #[error("invalid instruction {opcode:#04x} {modrm:#04x}")]
    InvalidInstruction { opcode: u8, modrm: u8 },
    /// A REP prefix was applied to a non-string instruction.
    #[error("REP prefix with non-string instruction")]
    RepPrefix,
    /// REPNE was applied to a string instruction that does not compare.
    #[error("REPNE prefix with non-compare string instruction")]
    RepnePrefix,
    /// The instruction requires a memory operand but got a register.
    #[error("{0} needs a memory address")]
    NeedsMemoryOperand(&'static str),
    /// The program image could not be loaded.
    #[error("{path}: {what}")]
    Loader { path: PathBuf, what: &'static str },
    /// An INT 21h function outside the emulated set.
    #[error("unknown DOS/BIOS call: int {intno:#04x}, ah = {ah:#04x}")]
    UnknownDosCall { intno: u8, ah: u8 },
    /// An INT 21h/AH=44h subfunction outside the emulated set.
    #[error("unknown DOS ioctl {al:#04x}")]
    UnknownDosIoctl { al: u8 },
    /// An INT 80h number outside the emulated set.
    #[error("unknown ELKS syscall {ax}: bx {bx:04x} cx {cx:04x} dx {dx:04x}")]
    UnknownElksCall { ax: u16, bx: u16, cx: u16, dx: u16 },
    /// INT 21h/AH=4Ah on anything but the program's own PSP block.
    #[error("bad attempt to resize DOS memory block: bx = {bx:#06x}, es = {es:#06x}")]
    BadDosResize { bx: u16, es: u16 },
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps an error that originates from any calls to the [`nix`] crate.
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
