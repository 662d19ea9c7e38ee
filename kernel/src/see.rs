// Exit paths to the execution environment. qemu's test device turns these
// writes into a clean exit with the corresponding status.

#[cfg(target_arch = "riscv64")]
const TEST_DEVICE: usize = 0x10_0000;

#[cfg(target_arch = "riscv64")]
pub fn halt_success() -> ! {
    unsafe { core::ptr::write_volatile(TEST_DEVICE as *mut u32, 0x5555) };
    loop {
        crate::riscv::wfi();
    }
}

#[cfg(target_arch = "riscv64")]
pub fn halt_failure() -> ! {
    unsafe { core::ptr::write_volatile(TEST_DEVICE as *mut u32, 0x3333) };
    loop {
        crate::riscv::wfi();
    }
}

#[cfg(not(target_arch = "riscv64"))]
pub fn halt_success() -> ! {
    panic!("halt_success");
}

#[cfg(not(target_arch = "riscv64"))]
pub fn halt_failure() -> ! {
    panic!("halt_failure");
}
