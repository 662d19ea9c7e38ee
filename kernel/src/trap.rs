// Trap entry and dispatch.
//
// The vector convention: while a thread runs in U mode, sscratch holds the
// address of its trap frame region, which sits immediately below the stack
// anchor at the top of its kernel stack; while in S mode, sscratch is zero.
// Entry from U mode lands on the frame region, saves everything there, and
// recovers the kernel tp and gp from the anchor. Entry from S mode pushes a
// frame on the live kernel stack.

use crate::intr;
use crate::proc;
use crate::riscv::{
    csrr_stval, csrw_stvec, SCAUSE_BREAKPOINT, SCAUSE_ECALL_FROM_SMODE,
    SCAUSE_ECALL_FROM_UMODE, SCAUSE_ILLEGAL_INSTR, SCAUSE_INSTR_ACCESS_FAULT,
    SCAUSE_INSTR_ADDR_MISALIGNED, SCAUSE_INSTR_PAGE_FAULT, SCAUSE_INTERRUPT_BIT,
    SCAUSE_LOAD_ACCESS_FAULT, SCAUSE_LOAD_ADDR_MISALIGNED, SCAUSE_LOAD_PAGE_FAULT,
    SCAUSE_STORE_ACCESS_FAULT, SCAUSE_STORE_ADDR_MISALIGNED, SCAUSE_STORE_PAGE_FAULT,
    SSTATUS_SPP,
};
use crate::syscall;
use crate::vm;

/// Processor state saved on every S-mode trap. The layout is shared with the
/// vector assembly; keep the two in sync.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub a: [u64; 8],  // 0
    pub t: [u64; 7],  // 64
    pub s: [u64; 12], // 120 (s0 is the frame pointer)
    pub ra: u64,      // 216
    pub sp: u64,      // 224
    pub gp: u64,      // 232
    pub tp: u64,      // 240
    pub sstatus: u64, // 248
    pub sepc: u64,    // 256
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        TrapFrame {
            a: [0; 8],
            t: [0; 7],
            s: [0; 12],
            ra: 0,
            sp: 0,
            gp: 0,
            tp: 0,
            sstatus: 0,
            sepc: 0,
        }
    }
}

/// Bytes reserved for the frame region below each stack anchor; the frame
/// itself plus padding to keep the stack 16-aligned.
pub const TFR_RESERVE: usize = 272;

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
        .align 4
        .globl _trap_entry
_trap_entry:
        csrrw sp, sscratch, sp
        bnez  sp, 1f

        # From S mode: undo the swap and push a frame on the kernel stack.
        csrrw sp, sscratch, sp
        addi  sp, sp, -272
        sd    t0, 64(sp)
        addi  t0, sp, 272
        sd    t0, 224(sp)
        sd    gp, 232(sp)
        sd    tp, 240(sp)
        j     2f

        # From U mode: sp is the frame region; the user sp sits in sscratch.
        # The anchor just above the frame supplies the kernel tp and gp.
1:
        sd    t0, 64(sp)
        csrr  t0, sscratch
        sd    t0, 224(sp)
        csrw  sscratch, zero
        sd    gp, 232(sp)
        sd    tp, 240(sp)
        ld    tp, 272(sp)
        ld    gp, 280(sp)

2:
        sd    ra, 216(sp)
        sd    a0, 0(sp)
        sd    a1, 8(sp)
        sd    a2, 16(sp)
        sd    a3, 24(sp)
        sd    a4, 32(sp)
        sd    a5, 40(sp)
        sd    a6, 48(sp)
        sd    a7, 56(sp)
        sd    t1, 72(sp)
        sd    t2, 80(sp)
        sd    t3, 88(sp)
        sd    t4, 96(sp)
        sd    t5, 104(sp)
        sd    t6, 112(sp)
        sd    s0, 120(sp)
        sd    s1, 128(sp)
        sd    s2, 136(sp)
        sd    s3, 144(sp)
        sd    s4, 152(sp)
        sd    s5, 160(sp)
        sd    s6, 168(sp)
        sd    s7, 176(sp)
        sd    s8, 184(sp)
        sd    s9, 192(sp)
        sd    s10, 200(sp)
        sd    s11, 208(sp)
        csrr  t0, sstatus
        sd    t0, 248(sp)
        csrr  t0, sepc
        sd    t0, 256(sp)

        csrr  a0, scause
        mv    a1, sp
        call  trap_dispatch

        .globl _trap_restore
_trap_restore:
        ld    t0, 248(sp)
        csrw  sstatus, t0
        ld    t1, 256(sp)
        csrw  sepc, t1

        # Returning to U mode re-arms sscratch with the frame region.
        andi  t0, t0, 256
        bnez  t0, 3f
        csrw  sscratch, sp
3:
        ld    ra, 216(sp)
        ld    gp, 232(sp)
        ld    tp, 240(sp)
        ld    a0, 0(sp)
        ld    a1, 8(sp)
        ld    a2, 16(sp)
        ld    a3, 24(sp)
        ld    a4, 32(sp)
        ld    a5, 40(sp)
        ld    a6, 48(sp)
        ld    a7, 56(sp)
        ld    t1, 72(sp)
        ld    t2, 80(sp)
        ld    t3, 88(sp)
        ld    t4, 96(sp)
        ld    t5, 104(sp)
        ld    t6, 112(sp)
        ld    s0, 120(sp)
        ld    s1, 128(sp)
        ld    s2, 136(sp)
        ld    s3, 144(sp)
        ld    s4, 152(sp)
        ld    s5, 160(sp)
        ld    s6, 168(sp)
        ld    s7, 176(sp)
        ld    s8, 184(sp)
        ld    s9, 192(sp)
        ld    s10, 200(sp)
        ld    s11, 208(sp)
        ld    t0, 64(sp)
        ld    sp, 224(sp)
        sret

        # a0 = frame base to restore from (exec and fork use this to enter
        # U mode for the first time).
        .globl _trap_return
_trap_return:
        mv    sp, a0
        j     _trap_restore
"#
);

#[cfg(target_arch = "riscv64")]
extern "C" {
    fn _trap_entry();
    fn _trap_return(frame: *mut TrapFrame) -> !;
}

pub fn trap_init() {
    #[cfg(target_arch = "riscv64")]
    csrw_stvec(_trap_entry as usize as u64);
    #[cfg(not(target_arch = "riscv64"))]
    csrw_stvec(0);
}

/// Restores CPU state from a trap frame as when returning to U mode. The
/// frame is staged into the running thread's frame region first, so the next
/// trap finds it in the expected place.
#[cfg(target_arch = "riscv64")]
pub fn trap_frame_jump(tfr: &TrapFrame) -> ! {
    use crate::thread::running_thread_stack_base;

    intr::disable_interrupts();
    let region = (running_thread_stack_base() as usize - TFR_RESERVE) as *mut TrapFrame;
    unsafe {
        *region = *tfr;
        _trap_return(region)
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn trap_frame_jump(_tfr: &TrapFrame) -> ! {
    unreachable!()
}

fn excp_name(cause: u64) -> Option<&'static str> {
    Some(match cause {
        SCAUSE_INSTR_ADDR_MISALIGNED => "Misaligned instruction address",
        SCAUSE_INSTR_ACCESS_FAULT => "Instruction access fault",
        SCAUSE_ILLEGAL_INSTR => "Illegal instruction",
        SCAUSE_BREAKPOINT => "Breakpoint",
        SCAUSE_LOAD_ADDR_MISALIGNED => "Misaligned load address",
        SCAUSE_LOAD_ACCESS_FAULT => "Load access fault",
        SCAUSE_STORE_ADDR_MISALIGNED => "Misaligned store address",
        SCAUSE_STORE_ACCESS_FAULT => "Store access fault",
        SCAUSE_ECALL_FROM_UMODE => "Environment call from U mode",
        SCAUSE_ECALL_FROM_SMODE => "Environment call from S mode",
        SCAUSE_INSTR_PAGE_FAULT => "Instruction page fault",
        SCAUSE_LOAD_PAGE_FAULT => "Load page fault",
        SCAUSE_STORE_PAGE_FAULT => "Store page fault",
        _ => return None,
    })
}

#[no_mangle]
extern "C" fn trap_dispatch(scause: u64, tfr: &mut TrapFrame) {
    let from_umode = tfr.sstatus & SSTATUS_SPP == 0;
    if scause & SCAUSE_INTERRUPT_BIT != 0 {
        intr::handle_interrupt(scause & !SCAUSE_INTERRUPT_BIT, from_umode);
    } else if from_umode {
        // Exception and syscall handlers may block; let the timer and the
        // devices in while they run.
        intr::enable_interrupts();
        handle_umode_exception(scause, tfr);
        intr::disable_interrupts();
    } else {
        handle_smode_exception(scause, tfr);
    }
}

/// The kernel never expects to fault on itself.
fn handle_smode_exception(cause: u64, tfr: &TrapFrame) -> ! {
    match excp_name(cause) {
        Some(name) => panic!(
            "{} at {:#x} for {:#x} in S mode",
            name,
            tfr.sepc,
            csrr_stval()
        ),
        None => panic!("Exception {} at {:#x} in S mode", cause, tfr.sepc),
    }
}

fn handle_umode_exception(cause: u64, tfr: &mut TrapFrame) {
    if cause == SCAUSE_ECALL_FROM_UMODE {
        syscall::handle_syscall(tfr);
        return;
    }

    let is_page_fault = matches!(
        cause,
        SCAUSE_INSTR_PAGE_FAULT | SCAUSE_LOAD_PAGE_FAULT | SCAUSE_STORE_PAGE_FAULT
    );
    let bad_vaddr = csrr_stval();

    if is_page_fault && vm::handle_umode_page_fault(tfr, bad_vaddr as usize) {
        return;
    }

    match excp_name(cause) {
        Some(name) => log::error!(
            "{} at {:#x} for {:#x} in U mode",
            name,
            tfr.sepc,
            bad_vaddr
        ),
        None => log::error!("Exception {} at {:#x} in U mode", cause, tfr.sepc),
    }
    proc::process_exit();
}
