//! End-to-end scenarios for the Linux syscall translation layer,
//! driven through the register-level dispatcher the outer interpreter
//! would use.

use std::convert::TryInto;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use emu_rs::machine::{Halt, Machine, SystemBuilder};
use emu_rs::map::{PageKey, PAGE_SIZE};
use emu_rs::syscall;

const SYS_READ: u64 = 0x000;
const SYS_WRITE: u64 = 0x001;
const SYS_CLOSE: u64 = 0x003;
const SYS_READV: u64 = 0x013;
const SYS_WRITEV: u64 = 0x014;
const SYS_LSEEK: u64 = 0x008;
const SYS_MMAP: u64 = 0x009;
const SYS_MPROTECT: u64 = 0x00a;
const SYS_MUNMAP: u64 = 0x00b;
const SYS_BRK: u64 = 0x00c;
const SYS_PIPE: u64 = 0x016;
const SYS_DUP2: u64 = 0x021;
const SYS_CLONE: u64 = 0x038;
const SYS_UNAME: u64 = 0x03f;
const SYS_GETCWD: u64 = 0x04f;
const SYS_FUTEX: u64 = 0x0ca;
const SYS_GETDENTS: u64 = 0x0d9;
const SYS_OPENAT: u64 = 0x101;

const AT_FDCWD: u64 = -100i64 as u64;
const MAP_PRIVATE_ANON: u64 = 0x22;
const PROT_RW: u64 = 3;

fn sys(m: &mut Machine, nr: u64, args: &[u64]) -> i64 {
    m.regs.ax = nr;
    let mut a = [0u64; 6];
    a[..args.len()].copy_from_slice(args);
    m.regs.di = a[0];
    m.regs.si = a[1];
    m.regs.dx = a[2];
    m.regs.r10 = a[3];
    m.regs.r8 = a[4];
    m.regs.r9 = a[5];
    syscall::dispatch(m).unwrap();
    m.regs.ax as i64
}

fn machine() -> Machine {
    SystemBuilder::new()
        .with_arena_size(1 << 26)
        .build()
        .unwrap()
        .new_machine()
}

/// Maps one anonymous page and returns its guest address.
fn map_page(m: &mut Machine) -> u64 {
    let addr = sys(
        m,
        SYS_MMAP,
        &[0, PAGE_SIZE, PROT_RW, MAP_PRIVATE_ANON, -1i64 as u64, 0],
    );
    assert!(addr > 0, "mmap failed: {}", addr);
    addr as u64
}

#[test]
fn open_write_read_close_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("file.bin");
    let mut m = machine();
    let page = map_page(&mut m);

    let mut cpath = path.to_str().unwrap().as_bytes().to_vec();
    cpath.push(0);
    m.copy_to_guest(page, &cpath).unwrap();

    // open(O_RDWR|O_CREAT, 0644)
    let fd = sys(&mut m, SYS_OPENAT, &[AT_FDCWD, page, 0o102, 0o644]);
    assert!(fd >= 3, "openat failed: {}", fd);

    // The new Fd must be installed: a host fd is present.
    let host = m.system.fds.lock().unwrap().get(fd as i32).unwrap().host();
    assert!(host >= 0);

    let buf = page + 0x100;
    m.copy_to_guest(buf, b"payload").unwrap();
    assert_eq!(sys(&mut m, SYS_WRITE, &[fd as u64, buf, 7]), 7);
    assert_eq!(sys(&mut m, SYS_LSEEK, &[fd as u64, 0, 0]), 0);

    let rbuf = page + 0x200;
    assert_eq!(sys(&mut m, SYS_READ, &[fd as u64, rbuf, 7]), 7);
    let mut back = [0u8; 7];
    m.copy_from_guest(rbuf, &mut back).unwrap();
    assert_eq!(&back, b"payload");
    // Reads record the write tap (guest memory was written).
    assert_eq!(m.write_tap, Some((rbuf, 7)));

    assert_eq!(sys(&mut m, SYS_CLOSE, &[fd as u64]), 0);
    assert_eq!(sys(&mut m, SYS_CLOSE, &[fd as u64]), -9); // EBADF
    assert_eq!(std::fs::read(&path).unwrap(), b"payload");
}

#[test]
fn efault_on_unmapped_buffers() {
    let mut m = machine();
    assert_eq!(sys(&mut m, SYS_WRITE, &[1, 0xdead000, 5]), -14); // EFAULT
    assert_eq!(sys(&mut m, SYS_UNAME, &[0xdead000]), -14);
}

#[test]
fn enosys_for_unknown_numbers() {
    let mut m = machine();
    assert_eq!(sys(&mut m, 0x017, &[]), -38); // ENOSYS
}

#[test]
fn brk_is_monotone_and_page_rounded() {
    let mut m = machine();
    let base = sys(&mut m, SYS_BRK, &[0]) as u64;
    assert_eq!(base % PAGE_SIZE, 0);
    let grown = sys(&mut m, SYS_BRK, &[base + 0x2001]) as u64;
    assert_eq!(grown, (base + 0x2001 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1));
    assert!(m.system.mem.lock().reserved(base, grown - base));
    // Shrink back.
    let shrunk = sys(&mut m, SYS_BRK, &[base]) as u64;
    assert_eq!(shrunk, base);
    assert!(!m.system.mem.lock().reserved(base, 0x1000));
    // A request below the floor is ignored and reports the old break.
    let still = sys(&mut m, SYS_BRK, &[0x1000]) as u64;
    assert_eq!(still, base);
}

#[test]
fn mmap_reserves_and_munmap_releases() {
    let mut m = machine();
    let addr = sys(
        &mut m,
        SYS_MMAP,
        &[0, 3 * PAGE_SIZE, PROT_RW, MAP_PRIVATE_ANON, -1i64 as u64, 0],
    ) as u64;
    {
        let map = m.system.mem.lock();
        assert!(map.reserved(addr, 3 * PAGE_SIZE));
        let entry = map.entry(addr).unwrap();
        assert_eq!(entry.key, PageKey::U | PageKey::RW | PageKey::XD);
        assert_eq!(entry.fd, -1);
        assert!(!entry.shared);
    }
    assert_eq!(sys(&mut m, SYS_MUNMAP, &[addr, 3 * PAGE_SIZE]), 0);
    assert!(!m.system.mem.lock().reserved(addr, PAGE_SIZE));
    // Unaligned unmap is invalid.
    assert_eq!(sys(&mut m, SYS_MUNMAP, &[addr + 1, PAGE_SIZE]), -22);
}

#[test]
fn mprotect_rewrites_page_keys() {
    let mut m = machine();
    let addr = map_page(&mut m);
    m.copy_to_guest(addr, b"x").unwrap();
    assert_eq!(sys(&mut m, SYS_MPROTECT, &[addr, PAGE_SIZE, 1]), 0);
    let key = m.system.mem.lock().entry(addr).unwrap().key;
    assert_eq!(key, PageKey::U | PageKey::XD);
    // Undefined PROT bits are rejected.
    assert_eq!(sys(&mut m, SYS_MPROTECT, &[addr, PAGE_SIZE, 0x10]), -22);
}

#[test]
fn mmap_of_file_contents_is_materialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.bin");
    std::fs::write(&path, vec![0xabu8; PAGE_SIZE as usize]).unwrap();
    let mut m = machine();
    let page = map_page(&mut m);
    let mut cpath = path.to_str().unwrap().as_bytes().to_vec();
    cpath.push(0);
    m.copy_to_guest(page, &cpath).unwrap();
    let fd = sys(&mut m, SYS_OPENAT, &[AT_FDCWD, page, 0, 0]);
    assert!(fd >= 0);
    let addr = sys(
        &mut m,
        SYS_MMAP,
        &[0, PAGE_SIZE, 1, 0x02, fd as u64, 0],
    ) as u64;
    let mut probe = [0u8; 8];
    m.copy_from_guest(addr, &mut probe).unwrap();
    assert_eq!(probe, [0xab; 8]);
}

#[test]
fn uname_reports_unknown() {
    let mut m = machine();
    let page = map_page(&mut m);
    assert_eq!(sys(&mut m, SYS_UNAME, &[page]), 0);
    let mut sysname = [0u8; 8];
    m.copy_from_guest(page, &mut sysname).unwrap();
    assert_eq!(&sysname[..7], b"unknown");
    let mut machine_field = [0u8; 6];
    m.copy_from_guest(page + 4 * 65, &mut machine_field).unwrap();
    assert_eq!(&machine_field, b"x86_64");
}

#[test]
fn getcwd_writes_into_guest() {
    let mut m = machine();
    let page = map_page(&mut m);
    let rc = sys(&mut m, SYS_GETCWD, &[page, PAGE_SIZE]);
    assert_eq!(rc as u64, page);
    let cwd = std::env::current_dir().unwrap();
    let mut buf = vec![0u8; cwd.as_os_str().len()];
    m.copy_from_guest(page, &mut buf).unwrap();
    assert_eq!(buf, cwd.as_os_str().to_str().unwrap().as_bytes());
}

#[test]
fn pipe_and_dup2() {
    let mut m = machine();
    let page = map_page(&mut m);
    assert_eq!(sys(&mut m, SYS_PIPE, &[page]), 0);
    let mut raw = [0u8; 8];
    m.copy_from_guest(page, &mut raw).unwrap();
    let r = i32::from_le_bytes(raw[0..4].try_into().unwrap());
    let w = i32::from_le_bytes(raw[4..8].try_into().unwrap());
    assert!(r >= 3 && w >= 3 && r != w);

    // Send a byte through the pipe via the guest ABI.
    let buf = page + 0x100;
    m.copy_to_guest(buf, b"z").unwrap();
    assert_eq!(sys(&mut m, SYS_WRITE, &[w as u64, buf, 1]), 1);
    let rbuf = page + 0x180;
    assert_eq!(sys(&mut m, SYS_READ, &[r as u64, rbuf, 1]), 1);

    // dup2 onto a fresh number, then onto the read end.
    let dup = sys(&mut m, SYS_DUP2, &[w as u64, 9]);
    assert_eq!(dup, 9);
    assert_eq!(sys(&mut m, SYS_WRITE, &[9, buf, 1]), 1);
    assert_eq!(sys(&mut m, SYS_READ, &[r as u64, rbuf, 1]), 1);
}

#[test]
fn readv_and_writev_tolerate_overlapping_iovecs() {
    let mut m = machine();
    let page = map_page(&mut m);
    assert_eq!(sys(&mut m, SYS_PIPE, &[page]), 0);
    let mut raw = [0u8; 8];
    m.copy_from_guest(page, &mut raw).unwrap();
    let r = i32::from_le_bytes(raw[0..4].try_into().unwrap());
    let w = i32::from_le_bytes(raw[4..8].try_into().unwrap());

    // Gather from two overlapping source ranges: "ab" then "bc".
    let src = page + 0x100;
    m.copy_to_guest(src, b"abc").unwrap();
    let iov = page + 0x200;
    let mut entries = Vec::new();
    entries.extend_from_slice(&src.to_le_bytes());
    entries.extend_from_slice(&2u64.to_le_bytes());
    entries.extend_from_slice(&(src + 1).to_le_bytes());
    entries.extend_from_slice(&2u64.to_le_bytes());
    m.copy_to_guest(iov, &entries).unwrap();
    assert_eq!(sys(&mut m, SYS_WRITEV, &[w as u64, iov, 2]), 4);

    // Scatter into two overlapping destination ranges; the second
    // range lands last.
    let dst = page + 0x300;
    let mut entries = Vec::new();
    entries.extend_from_slice(&dst.to_le_bytes());
    entries.extend_from_slice(&2u64.to_le_bytes());
    entries.extend_from_slice(&(dst + 1).to_le_bytes());
    entries.extend_from_slice(&2u64.to_le_bytes());
    m.copy_to_guest(iov, &entries).unwrap();
    assert_eq!(sys(&mut m, SYS_READV, &[r as u64, iov, 2]), 4);
    let mut out = [0u8; 3];
    m.copy_from_guest(dst, &mut out).unwrap();
    assert_eq!(&out, b"abc");

    // An unmapped iovec entry faults before any I/O happens.
    let mut entries = Vec::new();
    entries.extend_from_slice(&0xdead000u64.to_le_bytes());
    entries.extend_from_slice(&2u64.to_le_bytes());
    m.copy_to_guest(iov, &entries).unwrap();
    assert_eq!(sys(&mut m, SYS_READV, &[r as u64, iov, 1]), -14);
}

#[test]
fn getdents_emits_linux_records() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("alpha"), b"1").unwrap();
    std::fs::write(dir.path().join("beta"), b"2").unwrap();

    let mut m = machine();
    let page = map_page(&mut m);
    let mut cpath = dir.path().to_str().unwrap().as_bytes().to_vec();
    cpath.push(0);
    m.copy_to_guest(page, &cpath).unwrap();
    let fd = sys(&mut m, SYS_OPENAT, &[AT_FDCWD, page, 0o200000, 0]); // O_DIRECTORY
    assert!(fd >= 0);

    let dents = map_page(&mut m);
    let produced = sys(&mut m, SYS_GETDENTS, &[fd as u64, dents, PAGE_SIZE]);
    assert!(produced > 0);

    let mut names = Vec::new();
    let mut raw = vec![0u8; produced as usize];
    m.copy_from_guest(dents, &mut raw).unwrap();
    let mut i = 0usize;
    while i < raw.len() {
        let reclen = u16::from_le_bytes(raw[i + 16..i + 18].try_into().unwrap()) as usize;
        let name_bytes = &raw[i + 19..i + reclen];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap();
        names.push(String::from_utf8_lossy(&name_bytes[..end]).into_owned());
        i += reclen;
    }
    assert!(names.iter().any(|n| n == "alpha"));
    assert!(names.iter().any(|n| n == "beta"));
    // A buffer smaller than one record is rejected.
    assert_eq!(sys(&mut m, SYS_GETDENTS, &[fd as u64, dents, 64]), -22);
}

#[test]
fn futex_wait_wake_ping_pong() {
    let sys_arc = SystemBuilder::new()
        .with_arena_size(1 << 26)
        .build()
        .unwrap();
    let mut m1 = sys_arc.new_machine();
    let u = map_page(&mut m1);
    let word = sys_arc.mem.atomic_u32(u).unwrap();
    word.store(0, Ordering::SeqCst);

    // Waiter thread drives its own machine.
    let sys2 = sys_arc.clone();
    let waiter = std::thread::spawn(move || {
        let mut m2 = sys2.new_machine();
        // timeout lives in guest memory right after the futex word
        let tsaddr = u + 16;
        let mut ts = [0u8; 16];
        ts[0..8].copy_from_slice(&5i64.to_le_bytes());
        m2.copy_to_guest(tsaddr, &ts).unwrap();
        sys(&mut m2, SYS_FUTEX, &[u, 0, 0, tsaddr])
    });

    // Store the sentinel, then wake until the waiter is released.
    let mut woken = 0;
    for _ in 0..1000 {
        word.store(1, Ordering::SeqCst);
        woken = sys(&mut m1, SYS_FUTEX, &[u, 1, 1]);
        if woken > 0 || waiter.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    let rc = waiter.join().unwrap();
    // The waiter either slept and was woken (0) or found the word
    // already changed (EAGAIN); both orders observe the store.
    assert!(rc == 0 || rc == -11, "wait returned {}", rc);
    if rc == 0 {
        assert_eq!(woken, 1);
    }
    assert_eq!(word.load(Ordering::SeqCst), 1);
}

#[test]
fn clone_writes_tids_and_clears_ctid_on_exit() {
    // The interpreter every spawned thread runs: issue exit(0).
    let interp = Arc::new(|m: &mut Machine| -> Result<(), Halt> {
        m.regs.ax = 0x3c;
        m.regs.di = 0;
        syscall::dispatch(m)
    });
    let sys_arc = SystemBuilder::new()
        .with_arena_size(1 << 26)
        .with_interpreter(interp)
        .build()
        .unwrap();
    let mut m = sys_arc.new_machine();
    let page = map_page(&mut m);
    let ptid = page;
    let ctid = page + 64;
    let stack = map_page(&mut m) + PAGE_SIZE - 64;

    // CLONE_VM|FS|FILES|SIGHAND|THREAD|PARENT_SETTID|CHILD_SETTID|
    // CHILD_CLEARTID
    let flags: u64 = 0x100 | 0x200 | 0x400 | 0x800 | 0x10000 | 0x100000 | 0x1000000 | 0x200000;
    let tid = sys(&mut m, SYS_CLONE, &[flags, stack, ptid, ctid, 0, 0]);
    assert!(tid > 0, "clone failed: {}", tid);

    let ptid_word = sys_arc.mem.atomic_u32(ptid).unwrap();
    assert_eq!(ptid_word.load(Ordering::Acquire), tid as u32);

    // Wait for the child to exit: its ctid word is zeroed and woken.
    let tsaddr = page + 128;
    let mut ts = [0u8; 16];
    ts[0..8].copy_from_slice(&5i64.to_le_bytes());
    m.copy_to_guest(tsaddr, &ts).unwrap();
    let rc = sys(&mut m, SYS_FUTEX, &[ctid, 0, tid as u64, tsaddr]);
    assert!(rc == 0 || rc == -11, "ctid wait returned {}", rc);
    let ctid_word = sys_arc.mem.atomic_u32(ctid).unwrap();
    for _ in 0..500 {
        if ctid_word.load(Ordering::SeqCst) == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(ctid_word.load(Ordering::SeqCst), 0);
}

#[test]
fn clone_rejects_unsupported_and_missing_flags() {
    let mut m = machine();
    let page = map_page(&mut m);
    // Missing the mandatory thread set.
    assert_eq!(sys(&mut m, SYS_CLONE, &[0x100, page, 0, 0, 0, 0]), -22);
    // An unsupported flag (CLONE_NEWNS).
    let flags = 0x100 | 0x200 | 0x400 | 0x800 | 0x10000 | 0x20000;
    assert_eq!(sys(&mut m, SYS_CLONE, &[flags, page, 0, 0, 0, 0]), -22);
}
