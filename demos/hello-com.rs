use std::io::Write;

use emu_rs::cpu::StepEvent;
use emu_rs::loader::load_program;
use emu_rs::{Cpu, RealMemory};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Emu(#[from] emu_rs::Error),
}

fn main() -> Result<(), Error> {
    // Assemble a tiny .com program on the fly:
    //   mov ah, 9        ; print $-terminated string
    //   mov dx, 0x10c
    //   int 21h
    //   mov ax, 0x4c00   ; exit(0)
    //   int 21h
    let mut image = vec![
        0xb4, 0x09, 0xba, 0x0c, 0x01, 0xcd, 0x21, 0xb8, 0x00, 0x4c, 0xcd, 0x21,
    ];
    image.extend_from_slice(b"hello from 8086 land\r\n$");

    let mut file = tempfile::Builder::new().suffix(".com").tempfile()?;
    file.write_all(&image)?;

    // Place the image the way DOS would and drive the CPU one
    // instruction at a time, exactly as the debugger front end does.
    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let args = vec!["demo".to_string(), "demo".to_string()];
    let mut exe = load_program(&mut cpu, &mut mem, file.path(), &args, &[])?;

    loop {
        match cpu.step(&mut mem, &mut exe)? {
            StepEvent::Retired => continue,
            StepEvent::Exited(rc) => {
                println!("guest exited with {}", rc);
                break;
            }
        }
    }

    Ok(())
}
