//! The emu-rs crate provides the core of a user-mode machine emulator
//! that runs foreign-ABI binaries on a host operating system. More
//! specifically, it provides two closely related cores:
//!
//!  * A 64-bit Linux-ABI syscall translation layer meant to sit behind
//!  an x86-64 interpreter: guest system-call numbers, argument layouts,
//!  and error codes follow the Linux x86-64 binary interface, and every
//!  call is converted to host calls with results copied back into guest
//!  memory.
//!  * A 16-bit 8086 interpreter with shadow-tagged real-mode memory,
//!  three program loaders (bare boot sector, DOS MZ/COM, ELKS a.out),
//!  and DOS INT 21h / ELKS INT 80h syscall emulators.
//!
//! The outer pieces — the x86-64 instruction engine, the terminal UI,
//! the disassembler — are collaborators supplied by the embedder; this
//! crate exposes the interfaces they drive.

pub mod cpu;
pub mod dos;
pub mod elks;
pub mod error;
pub mod exe;
pub mod fd;
pub mod futex;
pub mod loader;
pub mod machine;
pub mod map;
pub mod memory;
pub mod syscall;
pub mod xlat;

pub use cpu::{Cpu, StepEvent};
pub use error::Error;
pub use exe::{Exec, Personality};
pub use machine::{Halt, Machine, System, SystemBuilder};
pub use memory::RealMemory;
