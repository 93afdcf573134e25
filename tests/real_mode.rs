//! End-to-end scenarios for the 8086 core: whole programs loaded from
//! disk and stepped to completion, with the DOS and ELKS syscall
//! emulators in the loop.

use std::io::Write;
use std::os::unix::io::AsRawFd;

use emu_rs::cpu::{Cpu, StepEvent};
use emu_rs::loader::load_program;
use emu_rs::memory::RealMemory;

fn strs(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

/// Steps until the program exits, with a hard cap so a broken test
/// cannot spin forever.
fn run_to_exit(cpu: &mut Cpu, mem: &mut RealMemory, exe: &mut emu_rs::Exec) -> u8 {
    for _ in 0..10_000 {
        match cpu.step(mem, exe).unwrap() {
            StepEvent::Retired => continue,
            StepEvent::Exited(rc) => return rc,
        }
    }
    panic!("program did not exit");
}

#[test]
fn dos_com_hello_writes_and_exits() {
    // mov ah,9; mov dx,msg; int 21h; mov ax,4c00h; int 21h; msg: "HELLO$"
    let mut image = vec![
        0xb4, 0x09, // mov ah, 9
        0xba, 0x0c, 0x01, // mov dx, 0x10c
        0xcd, 0x21, // int 21h
        0xb8, 0x00, 0x4c, // mov ax, 0x4c00
        0xcd, 0x21, // int 21h
    ];
    image.extend_from_slice(b"HELLO$");
    let mut file = tempfile::Builder::new().suffix(".com").tempfile().unwrap();
    file.write_all(&image).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(
        &mut cpu,
        &mut mem,
        file.path(),
        &strs(&["prog", "prog"]),
        &[],
    )
    .unwrap();

    // First three instructions: the print call must leave CF clear and
    // AH as loaded.
    for _ in 0..3 {
        assert_eq!(cpu.step(&mut mem, &mut exe).unwrap(), StepEvent::Retired);
    }
    assert!(!cpu.cf());
    assert_eq!(cpu.ah(), 9);

    assert_eq!(cpu.step(&mut mem, &mut exe).unwrap(), StepEvent::Retired);
    assert_eq!(cpu.step(&mut mem, &mut exe).unwrap(), StepEvent::Exited(0));
}

#[test]
fn dos_exit_code_comes_from_al() {
    let image = vec![0xb8, 0x2a, 0x4c, 0xcd, 0x21]; // mov ax,0x4c2a; int 21h
    let mut file = tempfile::Builder::new().suffix(".com").tempfile().unwrap();
    file.write_all(&image).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(
        &mut cpu,
        &mut mem,
        file.path(),
        &strs(&["prog", "prog"]),
        &[],
    )
    .unwrap();
    assert_eq!(run_to_exit(&mut cpu, &mut mem, &mut exe), 42);
}

#[test]
fn dos_file_roundtrip_through_int21() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("out.txt");
    let target_str = target.to_str().unwrap();
    assert!(target_str.len() < 0x40);

    // Program layout (org 0x100):
    //   mov ah,3ch; xor cx,cx; mov dx,path; int 21h   ; creat
    //   mov bx,ax                                      ; handle
    //   mov ah,40h; mov cx,5; mov dx,msg; int 21h      ; write
    //   mov ah,3eh; int 21h                            ; close
    //   mov ax,4c00h; int 21h
    let mut code: Vec<u8> = Vec::new();
    let path_off: u16 = 0x130;
    let msg_off: u16 = 0x190;
    code.extend_from_slice(&[0xb4, 0x3c]); // mov ah, 3ch
    code.extend_from_slice(&[0x31, 0xc9]); // xor cx, cx
    code.extend_from_slice(&[0xba, path_off as u8, (path_off >> 8) as u8]);
    code.extend_from_slice(&[0xcd, 0x21]);
    code.extend_from_slice(&[0x89, 0xc3]); // mov bx, ax
    code.extend_from_slice(&[0xb4, 0x40]); // mov ah, 40h
    code.extend_from_slice(&[0xb9, 0x05, 0x00]); // mov cx, 5
    code.extend_from_slice(&[0xba, msg_off as u8, (msg_off >> 8) as u8]);
    code.extend_from_slice(&[0xcd, 0x21]);
    code.extend_from_slice(&[0xb4, 0x3e]); // mov ah, 3eh
    code.extend_from_slice(&[0xcd, 0x21]);
    code.extend_from_slice(&[0xb8, 0x00, 0x4c]);
    code.extend_from_slice(&[0xcd, 0x21]);

    let mut image = vec![0u8; 0x100]; // pad so offsets line up with org 0x100
    image[..code.len()].copy_from_slice(&code);
    let p = (path_off - 0x100) as usize;
    image[p..p + target_str.len()].copy_from_slice(target_str.as_bytes());
    let mo = (msg_off - 0x100) as usize;
    image[mo..mo + 5].copy_from_slice(b"bytes");

    let mut file = tempfile::Builder::new().suffix(".com").tempfile().unwrap();
    file.write_all(&image).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(
        &mut cpu,
        &mut mem,
        file.path(),
        &strs(&["prog", "prog"]),
        &[],
    )
    .unwrap();
    assert_eq!(run_to_exit(&mut cpu, &mut mem, &mut exe), 0);
    assert_eq!(std::fs::read(&target).unwrap(), b"bytes");
}

fn build_elks_image(text: &[u8], data: &[u8]) -> Vec<u8> {
    assert_eq!(text.len() % 16, 0);
    let mut img = vec![0u8; 32];
    img[0] = 0x01;
    img[1] = 0x03; // magic
    img[4] = 32; // hlen
    img[6..8].copy_from_slice(&1u16.to_le_bytes()); // version
    img[8..12].copy_from_slice(&(text.len() as u32).to_le_bytes());
    img[12..16].copy_from_slice(&(data.len() as u32).to_le_bytes());
    img[20..24].copy_from_slice(&0u32.to_le_bytes()); // entry
    img.extend_from_slice(text);
    img.extend_from_slice(data);
    img
}

#[test]
fn elks_write_delivers_bytes_and_count() {
    // The ELKS emulator passes guest descriptors straight to the host,
    // so pointing BX at a temp file observes the write contents.
    let out = tempfile::NamedTempFile::new().unwrap();
    let fd = out.as_file().as_raw_fd() as u16;

    let mut text = vec![
        0xb8, 0x04, 0x00, // mov ax, 4 (write)
        0xbb, fd as u8, (fd >> 8) as u8, // mov bx, fd
        0xb9, 0x00, 0x00, // mov cx, 0 (data offset)
        0xba, 0x05, 0x00, // mov dx, 5
        0xcd, 0x80, // int 80h
        0x89, 0xc6, // mov si, ax (keep the count)
        0xb8, 0x01, 0x00, // mov ax, 1 (exit)
        0xbb, 0x07, 0x00, // mov bx, 7
        0xcd, 0x80, // int 80h
    ];
    while text.len() % 16 != 0 {
        text.push(0x90);
    }
    let img = build_elks_image(&text, b"hello");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&img).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(&mut cpu, &mut mem, file.path(), &strs(&["prog"]), &[]).unwrap();

    // write(fd, 0, 5)
    for _ in 0..5 {
        assert_eq!(cpu.step(&mut mem, &mut exe).unwrap(), StepEvent::Retired);
    }
    assert_eq!(cpu.ax(), 5);
    assert_eq!(run_to_exit(&mut cpu, &mut mem, &mut exe), 7);
    assert_eq!(cpu.si(), 5);
    assert_eq!(std::fs::read(out.path()).unwrap(), b"hello");
}

#[test]
fn elks_sbrk_returns_old_break() {
    // sbrk(0x100, &result); exit(0). The old break lands in a stack
    // word the test inspects through the Breaks record.
    let mut text = vec![
        0xb8, 0x45, 0x00, // mov ax, 69 (sbrk)
        0xbb, 0x00, 0x01, // mov bx, 0x100
        0xb9, 0x00, 0x20, // mov cx, 0x2000 (result slot)
        0xcd, 0x80, // int 80h
        0xb8, 0x01, 0x00, // mov ax, 1
        0xbb, 0x00, 0x00, // mov bx, 0
        0xcd, 0x80, // int 80h
    ];
    while text.len() % 16 != 0 {
        text.push(0x90);
    }
    let img = build_elks_image(&text, &[0u8; 16]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&img).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(&mut cpu, &mut mem, file.path(), &strs(&["prog"]), &[]).unwrap();
    let old_brk = exe.brk.endbrk;

    for _ in 0..4 {
        cpu.step(&mut mem, &mut exe).unwrap();
    }
    assert_eq!(cpu.ax(), 0);
    assert_eq!(exe.brk.endbrk, old_brk + 0x100);
    let ss = cpu.ss();
    let stored = mem
        .read_word(0x2000, emu_rs::memory::Seg::Ss, ss)
        .unwrap();
    assert_eq!(stored, old_brk);
    assert_eq!(run_to_exit(&mut cpu, &mut mem, &mut exe), 0);
}

#[test]
fn stack_overflow_is_fatal() {
    // Recurse until the stack floor is crossed: call $-0 loops pushing.
    let mut text = vec![
        0xe8, 0xfd, 0xff, // call $-0 (back onto itself)
    ];
    while text.len() % 16 != 0 {
        text.push(0x90);
    }
    let img = build_elks_image(&text, &[0u8; 16]);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&img).unwrap();

    let mut cpu = Cpu::new();
    let mut mem = RealMemory::new();
    let mut exe = load_program(&mut cpu, &mut mem, file.path(), &strs(&["prog"]), &[]).unwrap();
    let err = loop {
        match cpu.step(&mut mem, &mut exe) {
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(err, emu_rs::Error::StackOverflow { .. }));
}
