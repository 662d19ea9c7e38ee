// System call dispatch. a7 selects the call, a0..a5 carry arguments, the
// result goes back in a0 and sepc advances past the ecall.

mod sysfile;
mod sysproc;

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{sysret, Error, Result};
use crate::proc::{Process, PROCESS_UIOMAX};
use crate::trap::TrapFrame;
use crate::uio::UioRef;
use crate::vm::{validate_vstr, MapFlags};

pub const SYSCALL_EXIT: u64 = 0;
pub const SYSCALL_EXEC: u64 = 1;
pub const SYSCALL_FORK: u64 = 2;
pub const SYSCALL_WAIT: u64 = 3;
pub const SYSCALL_PRINT: u64 = 4;
pub const SYSCALL_USLEEP: u64 = 5;
pub const SYSCALL_FSCREATE: u64 = 6;
pub const SYSCALL_FSDELETE: u64 = 7;
pub const SYSCALL_OPEN: u64 = 8;
pub const SYSCALL_CLOSE: u64 = 9;
pub const SYSCALL_READ: u64 = 10;
pub const SYSCALL_WRITE: u64 = 11;
pub const SYSCALL_FCNTL: u64 = 12;
pub const SYSCALL_PIPE: u64 = 13;
pub const SYSCALL_UIODUP: u64 = 14;

pub fn handle_syscall(tfr: &mut TrapFrame) {
    let ret = syscall(tfr);
    tfr.a[0] = ret as u64;
    tfr.sepc += 4;
}

fn syscall(tfr: &mut TrapFrame) -> i64 {
    let a = tfr.a;
    match a[7] {
        SYSCALL_EXIT => sysproc::sysexit(),
        SYSCALL_EXEC => sysret(sysproc::sysexec(a[0] as i64, a[1] as i64, a[2])),
        SYSCALL_FORK => sysret(sysproc::sysfork(tfr)),
        SYSCALL_WAIT => sysret(sysproc::syswait(a[0] as i64)),
        SYSCALL_PRINT => sysret(sysproc::sysprint(a[0])),
        SYSCALL_USLEEP => sysret(sysproc::sysusleep(a[0])),
        SYSCALL_FSCREATE => sysret(sysfile::sysfscreate(a[0])),
        SYSCALL_FSDELETE => sysret(sysfile::sysfsdelete(a[0])),
        SYSCALL_OPEN => sysret(sysfile::sysopen(a[0] as i64, a[1])),
        SYSCALL_CLOSE => sysret(sysfile::sysclose(a[0] as i64)),
        SYSCALL_READ => sysret(sysfile::sysread(a[0] as i64, a[1], a[2])),
        SYSCALL_WRITE => sysret(sysfile::syswrite(a[0] as i64, a[1], a[2])),
        SYSCALL_FCNTL => sysret(sysfile::sysfcntl(a[0] as i64, a[1] as i32, a[2])),
        SYSCALL_PIPE => sysret(sysfile::syspipe(a[0], a[1])),
        SYSCALL_UIODUP => sysret(sysfile::sysuiodup(a[0] as i64, a[1] as i64)),
        _ => Error::NotSup.code(),
    }
}

// Shared argument plumbing.

/// Copies a validated NUL-terminated user string into kernel memory.
fn user_str(addr: u64) -> Result<String> {
    let len = validate_vstr(addr as usize, MapFlags::U | MapFlags::R)?;
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| Error::Inval)
}

fn checked_fd(fd: i64) -> Result<usize> {
    if fd < 0 || fd as usize >= PROCESS_UIOMAX {
        return Err(Error::BadFd);
    }
    Ok(fd as usize)
}

fn uio_at(proc: *mut Process, fd: i64) -> Result<UioRef> {
    let fd = checked_fd(fd)?;
    unsafe { (*proc).uiotab[fd].clone() }.ok_or(Error::BadFd)
}

/// Lowest free descriptor slot, skipping `taken` (used while installing pipe
/// ends pairwise).
fn lowest_free_fd(proc: *mut Process, taken: Option<usize>) -> Result<usize> {
    for fd in 0..PROCESS_UIOMAX {
        if Some(fd) == taken {
            continue;
        }
        if unsafe { (*proc).uiotab[fd].is_none() } {
            return Ok(fd);
        }
    }
    Err(Error::MFile)
}

fn install(proc: *mut Process, fd: usize, uio: Arc<dyn crate::uio::Uio>) {
    unsafe { (*proc).uiotab[fd] = Some(uio) };
}
