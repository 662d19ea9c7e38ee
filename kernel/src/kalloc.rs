// Physical page allocator.
//
// Free pages live in a singly linked list of chunks sorted by ascending
// address. A chunk header sits in the first bytes of the region it describes,
// so freeing a region scribbles on it before reinsertion. Allocation is
// smallest-fit; a partial allocation carves pages off the high end of the
// chosen chunk and shrinks it in place. Chunks are never coalesced: callers
// free regions in exactly the shapes they allocated them.

use core::ptr;

use crate::riscv::{PAGE_ORDER, PAGE_SIZE};

#[repr(C)]
struct Chunk {
    next: *mut Chunk,
    pagecnt: usize,
}

pub struct PagePool {
    head: *mut Chunk,
    base: usize,
    end: usize,
}

unsafe impl Send for PagePool {}

pub static mut PAGE_POOL: PagePool = PagePool::empty();

impl PagePool {
    pub const fn empty() -> Self {
        PagePool {
            head: ptr::null_mut(),
            base: 0,
            end: 0,
        }
    }

    /// Seeds the pool with the page-aligned region [start, end).
    pub fn init(&mut self, start: usize, end: usize) {
        assert!(start % PAGE_SIZE == 0 && end % PAGE_SIZE == 0);
        self.base = start;
        self.end = end;
        if end > start {
            let chunk = start as *mut Chunk;
            unsafe {
                (*chunk).pagecnt = (end - start) >> PAGE_ORDER;
                (*chunk).next = ptr::null_mut();
            }
            self.head = chunk;
        } else {
            self.head = ptr::null_mut();
        }
    }

    pub fn alloc(&mut self, cnt: usize) -> *mut u8 {
        if cnt == 0 {
            return ptr::null_mut();
        }
        if self.head.is_null() {
            panic!("alloc_phys_pages: free chunk list is empty");
        }

        // Smallest chunk that still fits the request.
        let mut best: *mut Chunk = ptr::null_mut();
        let mut best_prev: *mut Chunk = ptr::null_mut();
        let mut prev: *mut Chunk = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                if (*cur).pagecnt >= cnt
                    && (best.is_null() || (*cur).pagecnt < (*best).pagecnt)
                {
                    best = cur;
                    best_prev = prev;
                }
                prev = cur;
                cur = (*cur).next;
            }
        }
        if best.is_null() {
            panic!("alloc_phys_pages: no chunk of {} pages", cnt);
        }

        unsafe {
            if (*best).pagecnt == cnt {
                // Exact fit: unlink the whole chunk.
                if best_prev.is_null() {
                    self.head = (*best).next;
                } else {
                    (*best_prev).next = (*best).next;
                }
                best as *mut u8
            } else {
                // Carve the allocation off the high end.
                let chunk_bytes = (*best).pagecnt << PAGE_ORDER;
                let alloc_bytes = cnt << PAGE_ORDER;
                (*best).pagecnt -= cnt;
                (best as usize + chunk_bytes - alloc_bytes) as *mut u8
            }
        }
    }

    pub fn free(&mut self, pp: *mut u8, cnt: usize) {
        if cnt == 0 || pp.is_null() {
            return;
        }
        let start = pp as usize;
        assert!(start % PAGE_SIZE == 0, "free_phys_pages: unaligned");
        assert!(start >= self.base && start + (cnt << PAGE_ORDER) <= self.end);
        let end = start + (cnt << PAGE_ORDER);

        // Find the sorted insertion point; any overlap is a double free.
        let mut prev: *mut Chunk = ptr::null_mut();
        let mut cur = self.head;
        while !cur.is_null() {
            let cur_start = cur as usize;
            let cur_end = unsafe { cur_start + ((*cur).pagecnt << PAGE_ORDER) };
            if cur_start >= end {
                break;
            }
            if start >= cur_end {
                prev = cur;
                cur = unsafe { (*cur).next };
                continue;
            }
            panic!("free_phys_pages: overlapping chunk");
        }

        let chunk = start as *mut Chunk;
        unsafe {
            (*chunk).pagecnt = cnt;
            if prev.is_null() {
                (*chunk).next = self.head;
                self.head = chunk;
            } else {
                (*chunk).next = cur;
                (*prev).next = chunk;
            }
        }
    }

    pub fn page_count(&self) -> usize {
        let mut total = 0;
        let mut cur = self.head;
        while !cur.is_null() {
            unsafe {
                total += (*cur).pagecnt;
                cur = (*cur).next;
            }
        }
        total
    }

    /// Bounds of the region the pool manages.
    pub fn bounds(&self) -> (usize, usize) {
        (self.base, self.end)
    }
}

pub fn alloc_phys_pages(cnt: usize) -> *mut u8 {
    unsafe { (*ptr::addr_of_mut!(PAGE_POOL)).alloc(cnt) }
}

pub fn free_phys_pages(pp: *mut u8, cnt: usize) {
    unsafe { (*ptr::addr_of_mut!(PAGE_POOL)).free(pp, cnt) }
}

pub fn alloc_phys_page() -> *mut u8 {
    alloc_phys_pages(1)
}

pub fn free_phys_page(pp: *mut u8) {
    free_phys_pages(pp, 1)
}

pub fn free_phys_page_count() -> usize {
    unsafe { (*ptr::addr_of!(PAGE_POOL)).page_count() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, Layout};

    // A page-aligned arena standing in for the free pool region of RAM.
    fn arena(pages: usize) -> usize {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { alloc_zeroed(layout) as usize }
    }

    #[test]
    fn accounting_round_trip() {
        let base = arena(16);
        let mut pool = PagePool::empty();
        pool.init(base, base + 16 * PAGE_SIZE);
        assert_eq!(pool.page_count(), 16);

        let a = pool.alloc(4);
        assert_eq!(pool.page_count(), 12);
        let b = pool.alloc(1);
        assert_eq!(pool.page_count(), 11);
        pool.free(a, 4);
        pool.free(b, 1);
        assert_eq!(pool.page_count(), 16);
    }

    #[test]
    fn carves_from_the_high_end() {
        let base = arena(8);
        let mut pool = PagePool::empty();
        pool.init(base, base + 8 * PAGE_SIZE);

        // The surviving chunk keeps its original base; the allocation is the
        // top of the region.
        let p = pool.alloc(3);
        assert_eq!(p as usize, base + 5 * PAGE_SIZE);
        assert_eq!(pool.page_count(), 5);

        // Exact fit unlinks the remaining chunk entirely.
        let q = pool.alloc(5);
        assert_eq!(q as usize, base);
        assert_eq!(pool.page_count(), 0);
    }

    #[test]
    fn smallest_fit_prefers_tight_chunks() {
        let base = arena(12);
        let mut pool = PagePool::empty();
        pool.init(base, base + 12 * PAGE_SIZE);

        // Split the pool into a 2-page chunk at the bottom and a larger one
        // above it: take everything, then free two disjoint pieces.
        let all = pool.alloc(12);
        pool.free(all, 2);
        pool.free(unsafe { all.add(4 * PAGE_SIZE) }, 8);

        // A 2-page request must come from the 2-page chunk even though the
        // big chunk appears later in the list.
        let p = pool.alloc(2);
        assert_eq!(p as usize, base);
        assert_eq!(pool.page_count(), 8);
    }

    #[test]
    fn free_list_stays_sorted_without_coalescing() {
        let base = arena(6);
        let mut pool = PagePool::empty();
        pool.init(base, base + 6 * PAGE_SIZE);
        let all = pool.alloc(6);

        // Free out of order; adjacent chunks must remain distinct.
        pool.free(unsafe { all.add(2 * PAGE_SIZE) }, 2);
        pool.free(all, 2);
        pool.free(unsafe { all.add(4 * PAGE_SIZE) }, 2);
        assert_eq!(pool.page_count(), 6);

        // No merge happened: a 3-page request cannot be satisfied by three
        // adjacent 2-page chunks.
        let got = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.alloc(3);
        }));
        assert!(got.is_err());
    }

    #[test]
    fn overlapping_free_panics() {
        let base = arena(4);
        let mut pool = PagePool::empty();
        pool.init(base, base + 4 * PAGE_SIZE);
        let p = pool.alloc(2);
        pool.free(p, 2);
        let got = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pool.free(p, 1);
        }));
        assert!(got.is_err());
    }

    #[test]
    fn zero_page_request_returns_null() {
        let base = arena(2);
        let mut pool = PagePool::empty();
        pool.init(base, base + 2 * PAGE_SIZE);
        assert!(pool.alloc(0).is_null());
        assert_eq!(pool.page_count(), 2);
    }
}
