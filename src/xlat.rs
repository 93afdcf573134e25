//! This module provides the guest/host translation layer: Linux
//! x86-64 ABI constants (the `_LINUX` values), one-to-one enumeration
//! tables, and bit-exact little-endian codecs for the guest structures
//! the syscall layer copies in and out.

use std::convert::TryInto;

use nix::errno::Errno;
use nix::fcntl::OFlag;

// ---------------------------------------------------------------------------
// Guest ABI constants.

pub const AT_FDCWD_LINUX: i32 = -100;
pub const AT_SYMLINK_NOFOLLOW_LINUX: i32 = 0x100;
pub const AT_REMOVEDIR_LINUX: i32 = 0x200;
pub const AT_EACCESS_LINUX: i32 = 0x200;

pub const O_RDONLY_LINUX: i32 = 0o0;
pub const O_WRONLY_LINUX: i32 = 0o1;
pub const O_RDWR_LINUX: i32 = 0o2;
pub const O_ACCMODE_LINUX: i32 = 0o3;
pub const O_CREAT_LINUX: i32 = 0o100;
pub const O_EXCL_LINUX: i32 = 0o200;
pub const O_NOCTTY_LINUX: i32 = 0o400;
pub const O_TRUNC_LINUX: i32 = 0o1000;
pub const O_APPEND_LINUX: i32 = 0o2000;
pub const O_NDELAY_LINUX: i32 = 0o4000;
pub const O_DSYNC_LINUX: i32 = 0o10000;
pub const O_ASYNC_LINUX: i32 = 0o20000;
pub const O_DIRECT_LINUX: i32 = 0o40000;
pub const O_DIRECTORY_LINUX: i32 = 0o200000;
pub const O_NOFOLLOW_LINUX: i32 = 0o400000;
pub const O_NOATIME_LINUX: i32 = 0o1000000;
pub const O_CLOEXEC_LINUX: i32 = 0o2000000;

pub const F_DUPFD_LINUX: i32 = 0;
pub const F_GETFD_LINUX: i32 = 1;
pub const F_SETFD_LINUX: i32 = 2;
pub const F_GETFL_LINUX: i32 = 3;
pub const F_SETFL_LINUX: i32 = 4;
pub const F_DUPFD_CLOEXEC_LINUX: i32 = 0x406;
pub const FD_CLOEXEC_LINUX: i32 = 1;

pub const SEEK_SET_LINUX: i32 = 0;
pub const SEEK_CUR_LINUX: i32 = 1;
pub const SEEK_END_LINUX: i32 = 2;

pub const MAP_SHARED_LINUX: i32 = 0x01;
pub const MAP_PRIVATE_LINUX: i32 = 0x02;
pub const MAP_FIXED_LINUX: i32 = 0x10;
pub const MAP_ANONYMOUS_LINUX: i32 = 0x20;
pub const MAP_GROWSDOWN_LINUX: i32 = 0x100;
pub const MAP_FIXED_NOREPLACE_LINUX: i32 = 0x100000;

pub const FUTEX_WAIT_LINUX: i32 = 0;
pub const FUTEX_WAKE_LINUX: i32 = 1;
pub const FUTEX_PRIVATE_FLAG_LINUX: i32 = 128;

pub const CLONE_VM_LINUX: u64 = 0x100;
pub const CLONE_FS_LINUX: u64 = 0x200;
pub const CLONE_FILES_LINUX: u64 = 0x400;
pub const CLONE_SIGHAND_LINUX: u64 = 0x800;
pub const CLONE_VFORK_LINUX: u64 = 0x4000;
pub const CLONE_THREAD_LINUX: u64 = 0x10000;
pub const CLONE_SYSVSEM_LINUX: u64 = 0x40000;
pub const CLONE_SETTLS_LINUX: u64 = 0x80000;
pub const CLONE_PARENT_SETTID_LINUX: u64 = 0x100000;
pub const CLONE_CHILD_CLEARTID_LINUX: u64 = 0x200000;
pub const CLONE_CHILD_SETTID_LINUX: u64 = 0x1000000;
pub const SIGCHLD_LINUX: u64 = 17;

pub const SIG_BLOCK_LINUX: i32 = 0;
pub const SIG_UNBLOCK_LINUX: i32 = 1;
pub const SIG_SETMASK_LINUX: i32 = 2;

pub const ARCH_SET_GS_LINUX: i32 = 0x1001;
pub const ARCH_SET_FS_LINUX: i32 = 0x1002;
pub const ARCH_GET_FS_LINUX: i32 = 0x1003;
pub const ARCH_GET_GS_LINUX: i32 = 0x1004;

pub const TCGETS_LINUX: u64 = 0x5401;
pub const TCSETS_LINUX: u64 = 0x5402;
pub const TCSETSW_LINUX: u64 = 0x5403;
pub const TCSETSF_LINUX: u64 = 0x5404;
pub const TIOCGWINSZ_LINUX: u64 = 0x5413;

pub const POLLIN_LINUX: i16 = 0x01;
pub const POLLPRI_LINUX: i16 = 0x02;
pub const POLLOUT_LINUX: i16 = 0x04;
pub const POLLERR_LINUX: i16 = 0x08;
pub const POLLHUP_LINUX: i16 = 0x10;
pub const POLLNVAL_LINUX: i16 = 0x20;

pub const SOCK_CLOEXEC_LINUX: i32 = 0o2000000;
pub const SOCK_NONBLOCK_LINUX: i32 = 0o4000;

pub const TIMER_ABSTIME_LINUX: i32 = 1;

pub const DT_UNKNOWN_LINUX: u8 = 0;
pub const DT_FIFO_LINUX: u8 = 1;
pub const DT_CHR_LINUX: u8 = 2;
pub const DT_DIR_LINUX: u8 = 4;
pub const DT_BLK_LINUX: u8 = 6;
pub const DT_REG_LINUX: u8 = 8;
pub const DT_LNK_LINUX: u8 = 10;
pub const DT_SOCK_LINUX: u8 = 12;

// ---------------------------------------------------------------------------
// Enumeration tables.

/// Host errno to the guest's numeric errno. Values agree on Linux
/// hosts; the table keeps foreign hosts honest.
pub fn xlat_errno(e: Errno) -> i32 {
    match e {
        Errno::EPERM => 1,
        Errno::ENOENT => 2,
        Errno::ESRCH => 3,
        Errno::EINTR => 4,
        Errno::EIO => 5,
        Errno::ENXIO => 6,
        Errno::E2BIG => 7,
        Errno::ENOEXEC => 8,
        Errno::EBADF => 9,
        Errno::ECHILD => 10,
        Errno::EAGAIN => 11,
        Errno::ENOMEM => 12,
        Errno::EACCES => 13,
        Errno::EFAULT => 14,
        Errno::ENOTBLK => 15,
        Errno::EBUSY => 16,
        Errno::EEXIST => 17,
        Errno::EXDEV => 18,
        Errno::ENODEV => 19,
        Errno::ENOTDIR => 20,
        Errno::EISDIR => 21,
        Errno::EINVAL => 22,
        Errno::ENFILE => 23,
        Errno::EMFILE => 24,
        Errno::ENOTTY => 25,
        Errno::ETXTBSY => 26,
        Errno::EFBIG => 27,
        Errno::ENOSPC => 28,
        Errno::ESPIPE => 29,
        Errno::EROFS => 30,
        Errno::EMLINK => 31,
        Errno::EPIPE => 32,
        Errno::EDOM => 33,
        Errno::ERANGE => 34,
        Errno::EDEADLK => 35,
        Errno::ENAMETOOLONG => 36,
        Errno::ENOLCK => 37,
        Errno::ENOSYS => 38,
        Errno::ENOTEMPTY => 39,
        Errno::ELOOP => 40,
        Errno::ENOTSOCK => 88,
        Errno::EDESTADDRREQ => 89,
        Errno::EMSGSIZE => 90,
        Errno::EPROTOTYPE => 91,
        Errno::ENOPROTOOPT => 92,
        Errno::EPROTONOSUPPORT => 93,
        Errno::EOPNOTSUPP => 95,
        Errno::EAFNOSUPPORT => 97,
        Errno::EADDRINUSE => 98,
        Errno::EADDRNOTAVAIL => 99,
        Errno::ENETDOWN => 100,
        Errno::ENETUNREACH => 101,
        Errno::ECONNABORTED => 103,
        Errno::ECONNRESET => 104,
        Errno::ENOBUFS => 105,
        Errno::EISCONN => 106,
        Errno::ENOTCONN => 107,
        Errno::ETIMEDOUT => 110,
        Errno::ECONNREFUSED => 111,
        Errno::EHOSTUNREACH => 113,
        Errno::EALREADY => 114,
        Errno::EINPROGRESS => 115,
        e => e as i32,
    }
}

const OPEN_FLAG_TABLE: &[(i32, OFlag)] = &[
    (O_CREAT_LINUX, OFlag::O_CREAT),
    (O_EXCL_LINUX, OFlag::O_EXCL),
    (O_NOCTTY_LINUX, OFlag::O_NOCTTY),
    (O_TRUNC_LINUX, OFlag::O_TRUNC),
    (O_APPEND_LINUX, OFlag::O_APPEND),
    (O_NDELAY_LINUX, OFlag::O_NONBLOCK),
    (O_DSYNC_LINUX, OFlag::O_DSYNC),
    (O_ASYNC_LINUX, OFlag::O_ASYNC),
    (O_DIRECT_LINUX, OFlag::O_DIRECT),
    (O_DIRECTORY_LINUX, OFlag::O_DIRECTORY),
    (O_NOFOLLOW_LINUX, OFlag::O_NOFOLLOW),
    (O_NOATIME_LINUX, OFlag::O_NOATIME),
    (O_CLOEXEC_LINUX, OFlag::O_CLOEXEC),
];

/// Guest open flags to host flags.
pub fn xlat_open_flags(guest: i32) -> OFlag {
    let mut host = match guest & O_ACCMODE_LINUX {
        O_WRONLY_LINUX => OFlag::O_WRONLY,
        O_RDWR_LINUX => OFlag::O_RDWR,
        _ => OFlag::O_RDONLY,
    };
    for &(g, h) in OPEN_FLAG_TABLE {
        if guest & g != 0 {
            host |= h;
        }
    }
    host
}

/// Host open flags back to the guest encoding, for F_GETFL.
pub fn unxlat_open_flags(host: OFlag) -> i32 {
    let mut guest = if host.contains(OFlag::O_RDWR) {
        O_RDWR_LINUX
    } else if host.contains(OFlag::O_WRONLY) {
        O_WRONLY_LINUX
    } else {
        O_RDONLY_LINUX
    };
    for &(g, h) in OPEN_FLAG_TABLE {
        if host.contains(h) {
            guest |= g;
        }
    }
    guest
}

/// Guest signal number to the host's; both follow the Linux numbering.
pub fn xlat_signal(sig: i32) -> Option<i32> {
    if (1..=64).contains(&sig) {
        Some(sig)
    } else {
        None
    }
}

/// Guest sigprocmask `how`.
pub fn xlat_sig_how(how: i32) -> Option<i32> {
    match how {
        SIG_BLOCK_LINUX => Some(libc::SIG_BLOCK),
        SIG_UNBLOCK_LINUX => Some(libc::SIG_UNBLOCK),
        SIG_SETMASK_LINUX => Some(libc::SIG_SETMASK),
        _ => None,
    }
}

/// A guest 8-byte sigset word as a host sigset, covering the real-time
/// range as well.
pub fn xlat_sigset_to_host(mask: u64) -> libc::sigset_t {
    unsafe {
        let mut set = std::mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);
        for sig in 1..=64 {
            if mask & (1u64 << (sig - 1)) != 0 {
                libc::sigaddset(&mut set, sig);
            }
        }
        set
    }
}

pub fn xlat_clock(clock: i32) -> Option<libc::clockid_t> {
    match clock {
        0 => Some(libc::CLOCK_REALTIME),
        1 => Some(libc::CLOCK_MONOTONIC),
        2 => Some(libc::CLOCK_PROCESS_CPUTIME_ID),
        3 => Some(libc::CLOCK_THREAD_CPUTIME_ID),
        4 => Some(libc::CLOCK_MONOTONIC_RAW),
        5 => Some(libc::CLOCK_REALTIME_COARSE),
        6 => Some(libc::CLOCK_MONOTONIC_COARSE),
        7 => Some(libc::CLOCK_BOOTTIME),
        _ => None,
    }
}

pub fn xlat_whence(whence: i32) -> Option<i32> {
    match whence {
        SEEK_SET_LINUX => Some(libc::SEEK_SET),
        SEEK_CUR_LINUX => Some(libc::SEEK_CUR),
        SEEK_END_LINUX => Some(libc::SEEK_END),
        _ => None,
    }
}

pub fn xlat_access(mode: i32) -> Option<i32> {
    if mode & !(libc::R_OK | libc::W_OK | libc::X_OK | libc::F_OK) != 0 {
        return None;
    }
    Some(mode)
}

pub fn xlat_atf(flags: i32) -> Option<i32> {
    let mut host = 0;
    let mut rest = flags;
    if rest & AT_SYMLINK_NOFOLLOW_LINUX != 0 {
        host |= libc::AT_SYMLINK_NOFOLLOW;
        rest &= !AT_SYMLINK_NOFOLLOW_LINUX;
    }
    if rest & AT_REMOVEDIR_LINUX != 0 {
        host |= libc::AT_REMOVEDIR;
        rest &= !AT_REMOVEDIR_LINUX;
    }
    if rest != 0 {
        return None;
    }
    Some(host)
}

pub fn xlat_wait(options: i32) -> Option<i32> {
    let mut host = 0;
    let mut rest = options;
    for &(g, h) in &[
        (1, libc::WNOHANG),
        (2, libc::WUNTRACED),
        (8, libc::WCONTINUED),
    ] {
        if rest & g != 0 {
            host |= h;
            rest &= !g;
        }
    }
    if rest != 0 {
        return None;
    }
    Some(host)
}

pub fn xlat_lock(op: i32) -> Option<i32> {
    let mut host = 0;
    let mut rest = op;
    for &(g, h) in &[
        (1, libc::LOCK_SH),
        (2, libc::LOCK_EX),
        (4, libc::LOCK_NB),
        (8, libc::LOCK_UN),
    ] {
        if rest & g != 0 {
            host |= h;
            rest &= !g;
        }
    }
    if rest != 0 {
        return None;
    }
    Some(host)
}

pub fn xlat_shutdown(how: i32) -> Option<i32> {
    match how {
        0 => Some(libc::SHUT_RD),
        1 => Some(libc::SHUT_WR),
        2 => Some(libc::SHUT_RDWR),
        _ => None,
    }
}

pub fn xlat_socket_family(family: i32) -> Option<i32> {
    match family {
        1 => Some(libc::AF_UNIX),
        2 => Some(libc::AF_INET),
        _ => None,
    }
}

pub fn xlat_socket_type(ty: i32) -> Option<i32> {
    match ty {
        1 => Some(libc::SOCK_STREAM),
        2 => Some(libc::SOCK_DGRAM),
        3 => Some(libc::SOCK_RAW),
        _ => None,
    }
}

pub fn xlat_socket_protocol(protocol: i32) -> Option<i32> {
    match protocol {
        0 => Some(0),
        6 => Some(libc::IPPROTO_TCP),
        17 => Some(libc::IPPROTO_UDP),
        _ => None,
    }
}

pub fn xlat_socket_level(level: i32) -> Option<i32> {
    match level {
        1 => Some(libc::SOL_SOCKET),
        6 => Some(libc::IPPROTO_TCP),
        _ => None,
    }
}

pub fn xlat_socket_optname(level: i32, optname: i32) -> Option<i32> {
    if level == libc::IPPROTO_TCP {
        return match optname {
            1 => Some(libc::TCP_NODELAY),
            _ => None,
        };
    }
    match optname {
        2 => Some(libc::SO_REUSEADDR),
        5 => Some(libc::SO_DONTROUTE),
        6 => Some(libc::SO_BROADCAST),
        7 => Some(libc::SO_SNDBUF),
        8 => Some(libc::SO_RCVBUF),
        9 => Some(libc::SO_KEEPALIVE),
        13 => Some(libc::SO_LINGER),
        15 => Some(libc::SO_REUSEPORT),
        20 => Some(libc::SO_RCVTIMEO),
        21 => Some(libc::SO_SNDTIMEO),
        _ => None,
    }
}

pub fn xlat_rlimit_resource(resource: i32) -> Option<i32> {
    match resource {
        0 => Some(libc::RLIMIT_CPU as i32),
        1 => Some(libc::RLIMIT_FSIZE as i32),
        2 => Some(libc::RLIMIT_DATA as i32),
        3 => Some(libc::RLIMIT_STACK as i32),
        4 => Some(libc::RLIMIT_CORE as i32),
        5 => Some(libc::RLIMIT_RSS as i32),
        6 => Some(libc::RLIMIT_NPROC as i32),
        7 => Some(libc::RLIMIT_NOFILE as i32),
        8 => Some(libc::RLIMIT_MEMLOCK as i32),
        9 => Some(libc::RLIMIT_AS as i32),
        _ => None,
    }
}

pub fn xlat_rusage_who(who: i32) -> Option<i32> {
    match who {
        0 => Some(libc::RUSAGE_SELF),
        -1 => Some(libc::RUSAGE_CHILDREN),
        1 => Some(libc::RUSAGE_THREAD),
        _ => None,
    }
}

/// Host dirent type byte to the guest's.
pub fn unxlat_dt(d_type: u8) -> u8 {
    match d_type {
        libc::DT_FIFO => DT_FIFO_LINUX,
        libc::DT_CHR => DT_CHR_LINUX,
        libc::DT_DIR => DT_DIR_LINUX,
        libc::DT_BLK => DT_BLK_LINUX,
        libc::DT_REG => DT_REG_LINUX,
        libc::DT_LNK => DT_LNK_LINUX,
        libc::DT_SOCK => DT_SOCK_LINUX,
        _ => DT_UNKNOWN_LINUX,
    }
}

pub fn xlat_poll_events(guest: i16) -> i16 {
    let mut host = 0;
    if guest & POLLIN_LINUX != 0 {
        host |= libc::POLLIN;
    }
    if guest & POLLOUT_LINUX != 0 {
        host |= libc::POLLOUT;
    }
    if guest & POLLPRI_LINUX != 0 {
        host |= libc::POLLPRI;
    }
    host
}

pub fn unxlat_poll_events(host: i16) -> i16 {
    let mut guest = 0;
    if host & libc::POLLIN != 0 {
        guest |= POLLIN_LINUX;
    }
    if host & libc::POLLPRI != 0 {
        guest |= POLLPRI_LINUX;
    }
    if host & libc::POLLOUT != 0 {
        guest |= POLLOUT_LINUX;
    }
    if host & libc::POLLERR != 0 {
        guest |= POLLERR_LINUX;
    }
    if host & libc::POLLHUP != 0 {
        guest |= POLLHUP_LINUX;
    }
    if host & libc::POLLNVAL != 0 {
        guest |= POLLERR_LINUX;
    }
    guest
}

// ---------------------------------------------------------------------------
// Guest structure codecs. Every struct is encoded little-endian at the
// canonical Linux x86-64 layout.

pub const TIMESPEC_SIZE: usize = 16;
pub const TIMEVAL_SIZE: usize = 16;
pub const STAT_SIZE: usize = 144;
pub const RLIMIT_SIZE: usize = 16;
pub const RUSAGE_SIZE: usize = 144;
pub const WINSIZE_SIZE: usize = 8;
pub const TERMIOS_SIZE: usize = 36;
pub const POLLFD_SIZE: usize = 8;
pub const ITIMERVAL_SIZE: usize = 32;
pub const SOCKADDR_IN_SIZE: usize = 16;
pub const UTSNAME_SIZE: usize = 390;
pub const SIGACTION_SIZE: usize = 32;

pub fn decode_timespec(b: &[u8]) -> (i64, i64) {
    (
        i64::from_le_bytes(b[0..8].try_into().unwrap()),
        i64::from_le_bytes(b[8..16].try_into().unwrap()),
    )
}

pub fn encode_timespec(sec: i64, nsec: i64) -> [u8; TIMESPEC_SIZE] {
    let mut out = [0u8; TIMESPEC_SIZE];
    out[0..8].copy_from_slice(&sec.to_le_bytes());
    out[8..16].copy_from_slice(&nsec.to_le_bytes());
    out
}

pub fn decode_timeval(b: &[u8]) -> (i64, i64) {
    decode_timespec(b)
}

pub fn encode_timeval(sec: i64, usec: i64) -> [u8; TIMEVAL_SIZE] {
    encode_timespec(sec, usec)
}

pub fn encode_stat(st: &libc::stat) -> [u8; STAT_SIZE] {
    let mut out = [0u8; STAT_SIZE];
    let mut w64 = |off: usize, v: u64| out[off..off + 8].copy_from_slice(&v.to_le_bytes());
    w64(0, st.st_dev as u64);
    w64(8, st.st_ino as u64);
    w64(16, st.st_nlink as u64);
    w64(40, st.st_rdev as u64);
    w64(48, st.st_size as u64);
    w64(56, st.st_blksize as u64);
    w64(64, st.st_blocks as u64);
    w64(72, st.st_atime as u64);
    w64(80, st.st_atime_nsec as u64);
    w64(88, st.st_mtime as u64);
    w64(96, st.st_mtime_nsec as u64);
    w64(104, st.st_ctime as u64);
    w64(112, st.st_ctime_nsec as u64);
    out[24..28].copy_from_slice(&(st.st_mode as u32).to_le_bytes());
    out[28..32].copy_from_slice(&(st.st_uid as u32).to_le_bytes());
    out[32..36].copy_from_slice(&(st.st_gid as u32).to_le_bytes());
    out
}

pub fn encode_rlimit(rlim: &libc::rlimit) -> [u8; RLIMIT_SIZE] {
    let mut out = [0u8; RLIMIT_SIZE];
    out[0..8].copy_from_slice(&(rlim.rlim_cur as u64).to_le_bytes());
    out[8..16].copy_from_slice(&(rlim.rlim_max as u64).to_le_bytes());
    out
}

pub fn decode_rlimit(b: &[u8]) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: u64::from_le_bytes(b[0..8].try_into().unwrap()) as libc::rlim_t,
        rlim_max: u64::from_le_bytes(b[8..16].try_into().unwrap()) as libc::rlim_t,
    }
}

pub fn encode_rusage(ru: &libc::rusage) -> [u8; RUSAGE_SIZE] {
    let mut out = [0u8; RUSAGE_SIZE];
    out[0..16].copy_from_slice(&encode_timeval(
        ru.ru_utime.tv_sec as i64,
        ru.ru_utime.tv_usec as i64,
    ));
    out[16..32].copy_from_slice(&encode_timeval(
        ru.ru_stime.tv_sec as i64,
        ru.ru_stime.tv_usec as i64,
    ));
    let fields = [
        ru.ru_maxrss,
        ru.ru_ixrss,
        ru.ru_idrss,
        ru.ru_isrss,
        ru.ru_minflt,
        ru.ru_majflt,
        ru.ru_nswap,
        ru.ru_inblock,
        ru.ru_oublock,
        ru.ru_msgsnd,
        ru.ru_msgrcv,
        ru.ru_nsignals,
        ru.ru_nvcsw,
        ru.ru_nivcsw,
    ];
    for (i, f) in fields.iter().enumerate() {
        out[32 + i * 8..40 + i * 8].copy_from_slice(&(*f as i64).to_le_bytes());
    }
    out
}

pub fn encode_winsize(ws: &libc::winsize) -> [u8; WINSIZE_SIZE] {
    let mut out = [0u8; WINSIZE_SIZE];
    out[0..2].copy_from_slice(&ws.ws_row.to_le_bytes());
    out[2..4].copy_from_slice(&ws.ws_col.to_le_bytes());
    out[4..6].copy_from_slice(&ws.ws_xpixel.to_le_bytes());
    out[6..8].copy_from_slice(&ws.ws_ypixel.to_le_bytes());
    out
}

/// Encodes a host termios as the guest's kernel-layout termios
/// (four flag words, line discipline, 19 control characters).
pub fn encode_termios(tio: &libc::termios) -> [u8; TERMIOS_SIZE] {
    let mut out = [0u8; TERMIOS_SIZE];
    out[0..4].copy_from_slice(&(tio.c_iflag as u32).to_le_bytes());
    out[4..8].copy_from_slice(&(tio.c_oflag as u32).to_le_bytes());
    out[8..12].copy_from_slice(&(tio.c_cflag as u32).to_le_bytes());
    out[12..16].copy_from_slice(&(tio.c_lflag as u32).to_le_bytes());
    out[16] = tio.c_line;
    for i in 0..19 {
        out[17 + i] = tio.c_cc[i];
    }
    out
}

pub fn decode_termios(b: &[u8], tio: &mut libc::termios) {
    tio.c_iflag = u32::from_le_bytes(b[0..4].try_into().unwrap()) as libc::tcflag_t;
    tio.c_oflag = u32::from_le_bytes(b[4..8].try_into().unwrap()) as libc::tcflag_t;
    tio.c_cflag = u32::from_le_bytes(b[8..12].try_into().unwrap()) as libc::tcflag_t;
    tio.c_lflag = u32::from_le_bytes(b[12..16].try_into().unwrap()) as libc::tcflag_t;
    tio.c_line = b[16];
    for i in 0..19 {
        tio.c_cc[i] = b[17 + i];
    }
}

pub fn encode_itimerval(it: &libc::itimerval) -> [u8; ITIMERVAL_SIZE] {
    let mut out = [0u8; ITIMERVAL_SIZE];
    out[0..16].copy_from_slice(&encode_timeval(
        it.it_interval.tv_sec as i64,
        it.it_interval.tv_usec as i64,
    ));
    out[16..32].copy_from_slice(&encode_timeval(
        it.it_value.tv_sec as i64,
        it.it_value.tv_usec as i64,
    ));
    out
}

pub fn decode_itimerval(b: &[u8]) -> libc::itimerval {
    let (isec, iusec) = decode_timeval(&b[0..16]);
    let (vsec, vusec) = decode_timeval(&b[16..32]);
    libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: isec as libc::time_t,
            tv_usec: iusec as libc::suseconds_t,
        },
        it_value: libc::timeval {
            tv_sec: vsec as libc::time_t,
            tv_usec: vusec as libc::suseconds_t,
        },
    }
}

/// Guest sockaddr_in: family, big-endian port, big-endian address.
pub fn decode_sockaddr_in(b: &[u8]) -> Option<libc::sockaddr_in> {
    let family = u16::from_le_bytes(b[0..2].try_into().unwrap());
    if family as i32 != 2 {
        return None;
    }
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = u16::from_be_bytes(b[2..4].try_into().unwrap()).to_be();
    sa.sin_addr.s_addr = u32::from_be_bytes(b[4..8].try_into().unwrap()).to_be();
    Some(sa)
}

pub fn encode_sockaddr_in(sa: &libc::sockaddr_in) -> [u8; SOCKADDR_IN_SIZE] {
    let mut out = [0u8; SOCKADDR_IN_SIZE];
    out[0..2].copy_from_slice(&2u16.to_le_bytes());
    out[2..4].copy_from_slice(&u16::from_be(sa.sin_port).to_be_bytes());
    out[4..8].copy_from_slice(&u32::from_be(sa.sin_addr.s_addr).to_be_bytes());
    out
}

/// Builds the guest utsname record. The sysname the guest observes is
/// "unknown"; the remaining fields carry fixed plausible values so
/// libcs do not complain about ancient kernels.
pub fn encode_utsname() -> [u8; UTSNAME_SIZE] {
    let mut out = [0u8; UTSNAME_SIZE];
    let mut put = |i: usize, s: &str| {
        out[i * 65..i * 65 + s.len()].copy_from_slice(s.as_bytes());
    };
    put(0, "unknown");
    put(1, "unknown.local");
    put(2, "4.0");
    put(3, "unknown 4.0");
    put(4, "x86_64");
    out
}

pub fn encode_sigaction(sa: &crate::machine::SigAction) -> [u8; SIGACTION_SIZE] {
    let mut out = [0u8; SIGACTION_SIZE];
    out[0..8].copy_from_slice(&sa.handler.to_le_bytes());
    out[8..16].copy_from_slice(&sa.flags.to_le_bytes());
    out[16..24].copy_from_slice(&sa.restorer.to_le_bytes());
    out[24..32].copy_from_slice(&sa.mask.to_le_bytes());
    out
}

pub fn decode_sigaction(b: &[u8]) -> crate::machine::SigAction {
    crate::machine::SigAction {
        handler: u64::from_le_bytes(b[0..8].try_into().unwrap()),
        flags: u64::from_le_bytes(b[8..16].try_into().unwrap()),
        restorer: u64::from_le_bytes(b[16..24].try_into().unwrap()),
        mask: u64::from_le_bytes(b[24..32].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_roundtrip() {
        let guest = O_RDWR_LINUX | O_CREAT_LINUX | O_CLOEXEC_LINUX | O_APPEND_LINUX;
        let host = xlat_open_flags(guest);
        assert!(host.contains(OFlag::O_RDWR));
        assert!(host.contains(OFlag::O_CREAT));
        assert!(host.contains(OFlag::O_CLOEXEC));
        assert_eq!(unxlat_open_flags(host), guest);
    }

    #[test]
    fn errno_maps_to_linux_numbers() {
        assert_eq!(xlat_errno(Errno::ENOENT), 2);
        assert_eq!(xlat_errno(Errno::EAGAIN), 11);
        assert_eq!(xlat_errno(Errno::ETIMEDOUT), 110);
    }

    #[test]
    fn stat_layout_is_canonical() {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_ino = 42;
        st.st_mode = 0o100644;
        st.st_size = 1234;
        let b = encode_stat(&st);
        assert_eq!(u64::from_le_bytes(b[8..16].try_into().unwrap()), 42);
        assert_eq!(
            u32::from_le_bytes(b[24..28].try_into().unwrap()),
            0o100644
        );
        assert_eq!(i64::from_le_bytes(b[48..56].try_into().unwrap()), 1234);
    }

    #[test]
    fn sockaddr_roundtrip_preserves_network_order() {
        let mut guest = [0u8; SOCKADDR_IN_SIZE];
        guest[0..2].copy_from_slice(&2u16.to_le_bytes());
        guest[2..4].copy_from_slice(&0x1f90u16.to_be_bytes()); // port 8080
        guest[4..8].copy_from_slice(&[127, 0, 0, 1]);
        let sa = decode_sockaddr_in(&guest).unwrap();
        assert_eq!(u16::from_be(sa.sin_port), 8080);
        let back = encode_sockaddr_in(&sa);
        assert_eq!(&back[0..8], &guest[0..8]);
    }

    #[test]
    fn bad_sockaddr_family_is_rejected() {
        let guest = [9u8; SOCKADDR_IN_SIZE];
        assert!(decode_sockaddr_in(&guest).is_none());
    }

    #[test]
    fn utsname_reports_unknown_sysname() {
        let b = encode_utsname();
        assert_eq!(&b[0..7], b"unknown");
        assert_eq!(b[7], 0);
        assert_eq!(&b[4 * 65..4 * 65 + 6], b"x86_64");
    }

    #[test]
    fn timespec_roundtrip() {
        let b = encode_timespec(5, 250_000_000);
        assert_eq!(decode_timespec(&b), (5, 250_000_000));
    }

    #[test]
    fn sigaction_roundtrip() {
        let sa = crate::machine::SigAction {
            handler: 0x401000,
            flags: 0x04000000,
            restorer: 0x401080,
            mask: 0xdead,
        };
        assert_eq!(decode_sigaction(&encode_sigaction(&sa)), sa);
    }
}
