// Interrupt management: the global enable bit, the external-interrupt ISR
// table, and routing for the two interrupt causes this kernel takes.

use core::ptr;

use crate::plic;
use crate::riscv::{
    csrrc_sstatus, csrrs_sstatus, csrw_sie, SCAUSE_SEI, SCAUSE_STI, SSTATUS_SIE,
};
use crate::thread::running_thread_yield;
use crate::timer;

pub const NIRQ: usize = 32;

const SIE_STIE: u64 = 1 << 5;
const SIE_SEIE: u64 = 1 << 9;

pub type Isr = fn(srcno: u32, aux: *mut ());

#[derive(Clone, Copy)]
struct IsrEntry {
    isr: Option<Isr>,
    aux: *mut (),
}

static mut ISRTAB: [IsrEntry; NIRQ] = [IsrEntry {
    isr: None,
    aux: ptr::null_mut(),
}; NIRQ];

pub static mut INTRMGR_INITIALIZED: bool = false;

/// Masks interrupts; returns the previous enable state for restore.
pub fn disable_interrupts() -> u64 {
    csrrc_sstatus(SSTATUS_SIE) & SSTATUS_SIE
}

pub fn restore_interrupts(pie: u64) {
    if pie != 0 {
        csrrs_sstatus(SSTATUS_SIE);
    }
}

pub fn enable_interrupts() {
    csrrs_sstatus(SSTATUS_SIE);
}

pub fn intrmgr_init() {
    disable_interrupts();
    plic::plic_init();
    csrw_sie(SIE_SEIE | SIE_STIE);
    unsafe { INTRMGR_INITIALIZED = true };
}

pub fn enable_intr_source(srcno: u32, prio: u32, isr: Isr, aux: *mut ()) {
    assert!(0 < srcno && (srcno as usize) < NIRQ);
    assert!(prio > 0);
    unsafe {
        ISRTAB[srcno as usize] = IsrEntry { isr: Some(isr), aux };
    }
    plic::enable_source(srcno, prio);
}

pub fn disable_intr_source(srcno: u32) {
    plic::disable_source(srcno);
    unsafe {
        ISRTAB[srcno as usize] = IsrEntry {
            isr: None,
            aux: ptr::null_mut(),
        };
    }
}

/// Interrupt leg of trap dispatch. U-mode and S-mode interrupts take the
/// same path; preemption only fires when the trap came from U mode.
pub fn handle_interrupt(cause: u64, from_umode: bool) {
    match cause {
        SCAUSE_STI => {
            timer::handle_timer_interrupt();
            if timer::take_preemption_flag() && from_umode {
                running_thread_yield();
            }
        }
        SCAUSE_SEI => handle_extern_interrupt(),
        _ => panic!("unexpected interrupt cause {}", cause),
    }
}

fn handle_extern_interrupt() {
    let srcno = plic::claim_interrupt();
    assert!((srcno as usize) < NIRQ);
    if srcno == 0 {
        return;
    }
    let entry = unsafe { ISRTAB[srcno as usize] };
    match entry.isr {
        Some(isr) => isr(srcno, entry.aux),
        None => panic!("interrupt from source {} with no ISR", srcno),
    }
    plic::finish_interrupt(srcno);
}
