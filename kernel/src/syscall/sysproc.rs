// Process-side syscall handlers.

use alloc::string::String;
use alloc::vec::Vec;

use super::{checked_fd, user_str};
use crate::error::{Error, Result};
use crate::print;
use crate::proc::{current_process, process_exec, process_exit, process_fork};
use crate::thread::thread_join;
use crate::timer::sleep_us;
use crate::trap::TrapFrame;
use crate::vm::{validate_vptr, validate_vstr, MapFlags};

pub fn sysexit() -> ! {
    process_exit();
}

/// Replaces the image with the executable open at fd. The uio reference is
/// taken out of the descriptor table first, so it survives the caller-side
/// close and the address-space reset.
pub fn sysexec(fd: i64, argc: i64, argv: u64) -> Result<i64> {
    let fd = checked_fd(fd)?;
    if argc < 0 {
        return Err(Error::Inval);
    }
    let argc = argc as usize;

    let proc = current_process();
    let exe = unsafe { (*proc).uiotab[fd].clone() }.ok_or(Error::BadFd)?;

    // Deep-copy argv while the old user mappings still exist.
    let ru = MapFlags::U | MapFlags::R;
    let mut kargv: Vec<String> = Vec::new();
    if argc > 0 {
        validate_vptr(argv as usize, (argc + 1) * 8, ru)?;
        for i in 0..argc {
            let strp = unsafe { *((argv as usize + 8 * i) as *const u64) };
            validate_vstr(strp as usize, ru)?;
            kargv.push(user_str(strp)?);
        }
    }

    unsafe { (*proc).uiotab[fd] = None };
    process_exec(exe, kargv)
}

pub fn sysfork(tfr: &TrapFrame) -> Result<i64> {
    process_fork(tfr)
}

pub fn syswait(tid: i64) -> Result<i64> {
    if tid < 0 {
        return Err(Error::Inval);
    }
    thread_join(tid as usize).map(|t| t as i64)
}

pub fn sysprint(msg: u64) -> Result<i64> {
    let s = user_str(msg)?;
    print!("{}", s);
    Ok(0)
}

pub fn sysusleep(us: u64) -> Result<i64> {
    sleep_us(us);
    Ok(0)
}
