// Processes: one thread, one memory space, sixteen descriptor slots. The
// process records live in a fixed table; slot 0 is the main process, which
// is never freed.

use core::ptr;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use crate::elf::elf_load;
use crate::error::{Error, Result};
use crate::kalloc::{alloc_phys_page, free_phys_page};
use crate::memlayout::UMEM_END_VMA;
use crate::riscv::{PAGE_SIZE, SSTATUS_SPIE};
use crate::thread::{
    running_thread, running_thread_exit, running_thread_process, spawn_thread, thread_set_process,
    Condition,
};
use crate::trap::{trap_frame_jump, TrapFrame};
use crate::uio::UioRef;
use crate::vm::{
    clone_active_mspace, discard_active_mspace, map_page, reset_active_mspace, switch_mspace,
    MTag, MapFlags,
};

pub const NPROC: usize = 16;
pub const PROCESS_UIOMAX: usize = 16;

pub struct Process {
    pub tid: usize,
    pub mtag: MTag,
    pub uiotab: [Option<UioRef>; PROCESS_UIOMAX],
}

const NO_UIO: Option<UioRef> = None;

static mut MAIN_PROC: Process = Process {
    tid: 0,
    mtag: 0,
    uiotab: [NO_UIO; PROCESS_UIOMAX],
};

static mut PROCTAB: [*mut Process; NPROC] = [ptr::null_mut(); NPROC];

pub static mut PROCMGR_INITIALIZED: bool = false;

pub fn procmgr_init() {
    unsafe {
        assert!(crate::vm::MEMORY_INITIALIZED && crate::thread::THRMGR_INITIALIZED);
        let main = ptr::addr_of_mut!(MAIN_PROC);
        (*main).tid = running_thread();
        (*main).mtag = crate::vm::active_mspace();
        PROCTAB[0] = main;
        thread_set_process((*main).tid, main);
        PROCMGR_INITIALIZED = true;
    }
}

pub fn current_process() -> *mut Process {
    running_thread_process()
}

pub fn main_process() -> *mut Process {
    unsafe { ptr::addr_of_mut!(MAIN_PROC) }
}

/// Replaces the current image with the executable behind `exe`. The caller
/// has already copied argv into kernel memory; the old user mappings are
/// gone by the time the ELF loads, and any failure past that point can only
/// end the process.
pub fn process_exec(exe: UioRef, argv: Vec<String>) -> ! {
    reset_active_mspace();

    let entry = match elf_load(&exe) {
        Ok(entry) => entry,
        Err(e) => {
            log::error!("exec: loading failed: {}", e);
            drop(exe);
            process_exit();
        }
    };
    drop(exe);

    let stack_page = alloc_phys_page();
    let stksz = match build_stack(stack_page, &argv) {
        Ok(n) => n,
        Err(e) => {
            log::error!("exec: argument stack too large: {}", e);
            free_phys_page(stack_page);
            process_exit();
        }
    };

    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    map_page(
        stack_vma,
        stack_page,
        MapFlags::R | MapFlags::W | MapFlags::U,
    );

    let sp = (UMEM_END_VMA - stksz) as u64;
    let mut tfr = TrapFrame::zeroed();
    tfr.sepc = entry as u64;
    tfr.sp = sp;
    tfr.a[0] = argv.len() as u64;
    tfr.a[1] = sp; // argv[] sits at the base of the occupied stack
    tfr.sstatus = SSTATUS_SPIE; // SPP clear: sret lands in U mode
    drop(argv);

    trap_frame_jump(&tfr);
}

/// Builds the initial user stack inside `stack` (one page): the argument
/// vector, a terminating null pointer, then the string bytes. The vector's
/// pointers are user virtual addresses, valid once the page is mapped at the
/// top of user memory. Returns the occupied size, 16-byte aligned.
fn build_stack(stack: *mut u8, argv: &[String]) -> Result<usize> {
    let argc = argv.len();
    if PAGE_SIZE / core::mem::size_of::<usize>() - 1 < argc {
        return Err(Error::NoMem);
    }

    let mut stksz = (argc + 1) * core::mem::size_of::<usize>();
    for arg in argv {
        let argsz = arg.len() + 1;
        if PAGE_SIZE - stksz < argsz {
            return Err(Error::NoMem);
        }
        stksz += argsz;
    }
    stksz = (stksz + 15) & !15;

    let base = PAGE_SIZE - stksz;
    let vec_off = base;
    let mut str_off = base + (argc + 1) * core::mem::size_of::<usize>();
    let user_page = UMEM_END_VMA - PAGE_SIZE;

    unsafe {
        for (i, arg) in argv.iter().enumerate() {
            let slot = stack.add(vec_off + i * 8) as *mut u64;
            *slot = (user_page + str_off) as u64;
            ptr::copy_nonoverlapping(arg.as_ptr(), stack.add(str_off), arg.len());
            *stack.add(str_off + arg.len()) = 0;
            str_off += arg.len() + 1;
        }
        *(stack.add(vec_off + argc * 8) as *mut u64) = 0;
    }
    Ok(stksz)
}

/// Forks the calling process. The child inherits a clone of the address
/// space and shallow copies of every open descriptor; it resumes from a copy
/// of the parent's trap frame with a0 = 0. The parent returns the child TID
/// once the child has taken ownership of that copy.
pub fn process_fork(parent_tfr: &TrapFrame) -> Result<i64> {
    let mut slot = None;
    for (i, p) in unsafe { (*ptr::addr_of!(PROCTAB)).iter().enumerate() } {
        if p.is_null() {
            slot = Some(i);
            break;
        }
    }
    let slot = slot.ok_or(Error::MProc)?;

    let mut child = Box::new(Process {
        tid: 0,
        mtag: clone_active_mspace(),
        uiotab: [NO_UIO; PROCESS_UIOMAX],
    });

    let mut kid_tfr = Box::new(*parent_tfr);
    kid_tfr.a[0] = 0;
    kid_tfr.sepc += 4; // the child does not run the syscall epilogue

    let handoff = Condition::new("fork.handoff");
    let kid_raw = Box::into_raw(kid_tfr);
    let ctid = match spawn_thread(
        "forked-child",
        fork_entry,
        &[&handoff as *const Condition as u64, kid_raw as u64],
    ) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(kid_raw) });
            let prev = switch_mspace(child.mtag);
            discard_active_mspace();
            switch_mspace(prev);
            return Err(e);
        }
    };
    child.tid = ctid;

    let parent = current_process();
    if !parent.is_null() {
        for i in 0..PROCESS_UIOMAX {
            child.uiotab[i] = unsafe { (*parent).uiotab[i].clone() };
        }
    }

    let child_raw = Box::into_raw(child);
    unsafe { PROCTAB[slot] = child_raw };
    thread_set_process(ctid, child_raw);

    // Block until the child has consumed the trap frame copy.
    handoff.wait();

    Ok(ctid as i64)
}

unsafe extern "C" fn fork_entry(handoff: u64, tfr: u64) {
    // Take the frame onto this stack before releasing the parent, which owns
    // the heap copy's lifetime expectations.
    let frame = *(tfr as *const TrapFrame);
    drop(Box::from_raw(tfr as *mut TrapFrame));
    (*(handoff as *const Condition)).broadcast();

    let proc = running_thread_process();
    switch_mspace((*proc).mtag);
    trap_frame_jump(&frame);
}

/// Tears the current process down: descriptors closed, memory space
/// discarded, record freed (unless it is the main process), thread exited.
pub fn process_exit() -> ! {
    let proc = running_thread_process();
    if proc.is_null() {
        running_thread_exit();
    }

    unsafe {
        let tid = (*proc).tid;
        for slot in (*proc).uiotab.iter_mut() {
            *slot = None;
        }

        discard_active_mspace();

        if proc != ptr::addr_of_mut!(MAIN_PROC) {
            for p in (*ptr::addr_of_mut!(PROCTAB)).iter_mut() {
                if *p == proc {
                    *p = ptr::null_mut();
                    break;
                }
            }
            drop(Box::from_raw(proc));
        }

        thread_set_process(tid, ptr::null_mut());
    }
    running_thread_exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn build_stack_rewrites_pointers_to_user_addresses() {
        let _g = crate::test_guard();
        let mut page = alloc::vec![0u8; PAGE_SIZE];
        let argv = ["sh".to_string(), "-x".to_string()];
        let stksz = build_stack(page.as_mut_ptr(), &argv).unwrap();

        assert_eq!(stksz % 16, 0);
        // vector (3 slots) + "sh\0" + "-x\0" = 30, rounded to 32
        assert_eq!(stksz, 32);

        let base = PAGE_SIZE - stksz;
        let slot = |i: usize| {
            u64::from_le_bytes(page[base + 8 * i..base + 8 * i + 8].try_into().unwrap())
        };
        let user_page = (UMEM_END_VMA - PAGE_SIZE) as u64;

        // Pointers land inside the user stack page, strings in order.
        let p0 = slot(0);
        let p1 = slot(1);
        assert_eq!(p0, user_page + (base + 24) as u64);
        assert_eq!(p1, p0 + 3);
        assert_eq!(slot(2), 0);

        let s0 = (p0 - user_page) as usize;
        assert_eq!(&page[s0..s0 + 3], b"sh\0");
        let s1 = (p1 - user_page) as usize;
        assert_eq!(&page[s1..s1 + 3], b"-x\0");
    }

    #[test]
    fn build_stack_rejects_oversized_argument_lists() {
        let _g = crate::test_guard();
        let mut page = alloc::vec![0u8; PAGE_SIZE];
        let big = alloc::vec!["x".repeat(2000), "y".repeat(2000), "z".repeat(200)];
        assert_eq!(
            build_stack(page.as_mut_ptr(), &big),
            Err(Error::NoMem)
        );

        // An empty argv still produces the terminating null slot.
        let stksz = build_stack(page.as_mut_ptr(), &[]).unwrap();
        assert_eq!(stksz, 16);
    }
}
