// Kernel byte heap. Backs the `alloc` crate (Box, Arc, Vec) with a
// linked-list allocator fed one fixed region between the kernel image and
// the free page pool.

#[cfg(all(target_arch = "riscv64", not(test)))]
#[global_allocator]
static HEAP: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

pub static mut HEAP_INITIALIZED: bool = false;

/// Hands [start, start+len) to the heap allocator. Called once from
/// memory_init before anything allocates.
#[cfg(all(target_arch = "riscv64", not(test)))]
pub fn heap_init(start: usize, len: usize) {
    unsafe {
        HEAP.lock().init(start as *mut u8, len);
        HEAP_INITIALIZED = true;
    }
}

#[cfg(not(all(target_arch = "riscv64", not(test))))]
pub fn heap_init(_start: usize, _len: usize) {
    unsafe {
        HEAP_INITIALIZED = true;
    }
}
