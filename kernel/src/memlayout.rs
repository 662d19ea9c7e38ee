// Physical memory layout of the qemu virt machine and the fixed pieces of
// the kernel's address space.
//
// 0C000000 -- PLIC
// 10000000 -- uart0
// 10001000 -- virtio disk
// 80000000 -- kernel text and data, then heap, then the free page pool

use crate::riscv::PAGE_SIZE;

pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

pub const PLIC: usize = 0x0c00_0000;

pub const RAM_START: usize = 0x8000_0000;
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
pub const RAM_END: usize = RAM_START + RAM_SIZE;

// Bytes handed to the kernel byte heap between the image and the page pool.
pub const HEAP_SIZE: usize = 64 * PAGE_SIZE;

// Per-process user window. PT_LOAD segments land here and the initial stack
// occupies the highest page.
pub const UMEM_START_VMA: usize = 0xc000_0000;
pub const UMEM_END_VMA: usize = 0xd000_0000;

// Hardware time counter frequency on qemu virt.
pub const TIMER_FREQ: u64 = 10_000_000;
