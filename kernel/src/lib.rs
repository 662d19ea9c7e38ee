// A small RV64 Sv39 teaching kernel: physical and virtual memory, a
// cooperative thread core preempted on the way back to user mode, trap and
// syscall dispatch, a write-back block cache, and the KTFS filesystem.
//
// The library builds on the host too, with the architecture shims stubbed
// out, so the portable cores carry unit tests.

#![cfg_attr(not(test), no_std)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;

#[macro_use]
pub mod printf;

pub mod bio;
pub mod console;
pub mod elf;
pub mod error;
pub mod fs;
pub mod heap;
pub mod intr;
pub mod kalloc;
pub mod memlayout;
pub mod pipe;
pub mod plic;
pub mod proc;
pub mod ramdisk;
pub mod riscv;
pub mod see;
pub mod start;
pub mod storage;
pub mod syscall;
pub mod thread;
pub mod timer;
pub mod trap;
pub mod uart;
pub mod uio;
pub mod virtio;
pub mod vm;

#[cfg(all(target_arch = "riscv64", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("kernel panic: {}", info);
    see::halt_failure();
}

#[cfg(target_arch = "riscv64")]
pub fn kmain() -> ! {
    console::console_init();
    printf::logger_init();
    println!("\nktos booting\n");

    trap::trap_init();
    intr::intrmgr_init();
    thread::thrmgr_init();
    timer::timer_init();
    vm::memory_init();
    proc::procmgr_init();
    fs::fsmgr_init();

    intr::enable_interrupts();

    mount_cdrive();
    run_init();
}

// Attach the boot disk, put the cache on it, and mount the volume as "c".
#[cfg(target_arch = "riscv64")]
fn mount_cdrive() {
    let disk = match virtio::VirtioDisk::attach() {
        Ok(disk) => disk,
        Err(e) => {
            println!("no boot disk: {}", e);
            see::halt_failure();
        }
    };
    let cache = match bio::Cache::new(disk) {
        Ok(cache) => cache,
        Err(e) => {
            println!("create cache failed: {}", e);
            see::halt_failure();
        }
    };
    if let Err(e) = fs::ktfs::mount_ktfs("c", cache) {
        println!("mount c failed: {}", e);
        see::halt_failure();
    }
    log::info!("mounted c");
}

// Wire the console to descriptors 0/1/2 and hand control to the initial
// user program.
#[cfg(target_arch = "riscv64")]
fn run_init() -> ! {
    use alloc::string::String;
    use alloc::vec;

    const INITEXE: &str = "shell";

    let console = console::ConsoleUio::open();
    let main = proc::main_process();
    unsafe {
        (*main).uiotab[0] = Some(console.clone());
        (*main).uiotab[1] = Some(console.clone());
        (*main).uiotab[2] = Some(console);
    }

    let exe = match fs::open_file("c", INITEXE) {
        Ok(exe) => exe,
        Err(e) => {
            println!("cannot open c/{}: {}", INITEXE, e);
            see::halt_failure();
        }
    };

    println!("running c/{}", INITEXE);
    proc::process_exec(exe, vec![String::from(INITEXE)]);
}

// Tests that touch crate-global state (the page pool, the mount table, the
// kernel lock bookkeeping on the stand-in main thread) serialize on this.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GUARD.lock().unwrap_or_else(|e| e.into_inner())
}
