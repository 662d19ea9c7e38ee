// Block cache.
//
// A fixed table of 64 block-sized entries over one storage device, write
// back. An entry handed out by get_block stays pinned to the calling thread
// until the guard drops; a thread that wants a block someone else has pinned
// waits on the one shared condition and rescans. Eviction prefers invalid
// entries, then the valid unpinned entry with the oldest access time.

use core::cell::UnsafeCell;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::storage::Storage;
use crate::thread::{running_thread, Condition, Lock};

pub const CACHE_BLKSZ: usize = 512;
const NENTRY: usize = 64;

struct Entry {
    block_no: u64,
    valid: bool,
    dirty: bool,
    in_use: bool,
    owner_tid: usize,
    access_time: u64,
    data: [u8; CACHE_BLKSZ],
}

struct CacheState {
    entries: Box<[Entry]>,
    timer: u64,
}

pub struct Cache {
    stor: Arc<dyn Storage>,
    mtx: Lock,
    avail: Condition,
    state: UnsafeCell<CacheState>,
}

unsafe impl Sync for Cache {}
unsafe impl Send for Cache {}

/// Pins one cache entry for the holder's lifetime. Reading goes through
/// data(); data_mut() also marks the block dirty. Dropping the guard unpins
/// the entry and wakes threads waiting for one.
pub struct BlockGuard<'a> {
    cache: &'a Cache,
    idx: usize,
    dirty: bool,
}

impl Cache {
    pub fn new(stor: Arc<dyn Storage>) -> Result<Arc<Cache>> {
        if stor.blksz() != CACHE_BLKSZ {
            return Err(Error::Inval);
        }
        let entries: Vec<Entry> = (0..NENTRY)
            .map(|_| Entry {
                block_no: 0,
                valid: false,
                dirty: false,
                in_use: false,
                owner_tid: 0,
                access_time: 0,
                data: [0; CACHE_BLKSZ],
            })
            .collect();
        Ok(Arc::new(Cache {
            stor,
            mtx: Lock::new(),
            avail: Condition::new("cache.avail"),
            state: UnsafeCell::new(CacheState {
                entries: entries.into_boxed_slice(),
                timer: 0,
            }),
        }))
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut CacheState {
        &mut *self.state.get()
    }

    /// Pins the block at byte position pos (a block multiple) and returns a
    /// guard over its in-cache data, fetching and possibly evicting first.
    pub fn get_block(&self, pos: u64) -> Result<BlockGuard<'_>> {
        if pos % CACHE_BLKSZ as u64 != 0 {
            return Err(Error::Inval);
        }
        let block_no = pos / CACHE_BLKSZ as u64;
        let me = running_thread();

        self.mtx.acquire();
        loop {
            let st = unsafe { self.state() };

            // Hit?
            if let Some(i) = st
                .entries
                .iter()
                .position(|e| e.valid && e.block_no == block_no)
            {
                if st.entries[i].in_use {
                    assert!(
                        st.entries[i].owner_tid != me,
                        "get_block: block already pinned by caller"
                    );
                    // Pinned elsewhere: wait and rescan, the table may have
                    // shifted under us.
                    self.mtx.release();
                    self.avail.wait();
                    self.mtx.acquire();
                    continue;
                }
                return Ok(self.pin(i, me));
            }

            // Miss: pick a victim.
            let victim = match self.pick_victim() {
                Some(i) => i,
                None => {
                    self.mtx.release();
                    return Err(Error::Busy);
                }
            };

            if st.entries[victim].valid && st.entries[victim].dirty {
                let wpos = st.entries[victim].block_no * CACHE_BLKSZ as u64;
                if let Err(e) = self.full_block_io(wpos, victim, true) {
                    self.mtx.release();
                    return Err(e);
                }
                st.entries[victim].dirty = false;
            }

            if let Err(e) = self.full_block_io(pos, victim, false) {
                self.mtx.release();
                return Err(e);
            }

            let e = &mut st.entries[victim];
            e.block_no = block_no;
            e.valid = true;
            e.dirty = false;
            return Ok(self.pin(victim, me));
        }
    }

    /// Writes every dirty block back to storage and marks it clean.
    pub fn flush(&self) -> Result<()> {
        self.mtx.acquire();
        let st = unsafe { self.state() };
        for i in 0..NENTRY {
            if st.entries[i].valid && st.entries[i].dirty {
                let pos = st.entries[i].block_no * CACHE_BLKSZ as u64;
                if let Err(e) = self.full_block_io(pos, i, true) {
                    self.mtx.release();
                    return Err(e);
                }
                st.entries[i].dirty = false;
            }
        }
        self.mtx.release();
        Ok(())
    }

    // Called with the mutex held; consumes it.
    fn pin(&self, idx: usize, tid: usize) -> BlockGuard<'_> {
        let st = unsafe { self.state() };
        st.timer += 1;
        let e = &mut st.entries[idx];
        e.in_use = true;
        e.owner_tid = tid;
        e.access_time = st.timer;
        self.mtx.release();
        BlockGuard {
            cache: self,
            idx,
            dirty: false,
        }
    }

    // First invalid unpinned slot, else the least recently used valid
    // unpinned one, else none (everything is pinned).
    fn pick_victim(&self) -> Option<usize> {
        let st = unsafe { self.state() };
        for (i, e) in st.entries.iter().enumerate() {
            if !e.valid && !e.in_use {
                return Some(i);
            }
        }
        let mut best: Option<usize> = None;
        for (i, e) in st.entries.iter().enumerate() {
            if e.valid && !e.in_use {
                match best {
                    Some(b) if st.entries[b].access_time <= e.access_time => {}
                    _ => best = Some(i),
                }
            }
        }
        best
    }

    // One full-block transfer to or from the entry's buffer; anything short
    // of a whole block is an I/O error.
    fn full_block_io(&self, pos: u64, idx: usize, write: bool) -> Result<()> {
        let st = unsafe { self.state() };
        let n = if write {
            self.stor.store(pos, &st.entries[idx].data)?
        } else {
            self.stor.fetch(pos, &mut st.entries[idx].data)?
        };
        if n != CACHE_BLKSZ {
            return Err(Error::Io);
        }
        Ok(())
    }
}

impl<'a> BlockGuard<'a> {
    pub fn data(&self) -> &[u8; CACHE_BLKSZ] {
        let st = unsafe { self.cache.state() };
        &st.entries[self.idx].data
    }

    pub fn data_mut(&mut self) -> &mut [u8; CACHE_BLKSZ] {
        self.dirty = true;
        let st = unsafe { self.cache.state() };
        &mut st.entries[self.idx].data
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl<'a> Drop for BlockGuard<'a> {
    fn drop(&mut self) {
        self.cache.mtx.acquire();
        let st = unsafe { self.cache.state() };
        let e = &mut st.entries[self.idx];
        if self.dirty {
            e.dirty = true;
        }
        e.in_use = false;
        e.owner_tid = 0;
        self.cache.avail.broadcast();
        self.cache.mtx.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    fn disk_with_pattern(blocks: usize) -> Arc<RamDisk> {
        let rd = Arc::new(RamDisk::new(blocks));
        for b in 0..blocks {
            let block = [b as u8; CACHE_BLKSZ];
            rd.store(b as u64 * CACHE_BLKSZ as u64, &block).unwrap();
        }
        rd
    }

    #[test]
    fn hit_returns_same_contents_without_refetch() {
        let _g = crate::test_guard();
        let rd = disk_with_pattern(8);
        let cache = Cache::new(rd.clone()).unwrap();

        {
            let b = cache.get_block(3 * 512).unwrap();
            assert!(b.data().iter().all(|&x| x == 3));
        }
        // Change the backing store; a hit must serve the cached copy.
        rd.store(3 * 512, &[0xee; 512]).unwrap();
        let b = cache.get_block(3 * 512).unwrap();
        assert!(b.data().iter().all(|&x| x == 3));
    }

    #[test]
    fn misaligned_position_is_rejected() {
        let _g = crate::test_guard();
        let cache = Cache::new(disk_with_pattern(2)).unwrap();
        assert!(matches!(cache.get_block(100), Err(Error::Inval)));
    }

    #[test]
    fn dirty_block_written_back_once_on_flush() {
        let _g = crate::test_guard();
        let rd = disk_with_pattern(4);
        let cache = Cache::new(rd.clone()).unwrap();

        {
            let mut b = cache.get_block(0).unwrap();
            b.data_mut().fill(0x5a);
        }
        // Not yet on disk: write back is lazy.
        let mut out = [0u8; 512];
        rd.fetch(0, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0));

        cache.flush().unwrap();
        rd.fetch(0, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0x5a));

        // A second flush has nothing left to write.
        rd.store(0, &[0u8; 512]).unwrap();
        cache.flush().unwrap();
        rd.fetch(0, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0));
    }

    #[test]
    fn eviction_is_least_recently_used_and_writes_back() {
        let _g = crate::test_guard();
        let rd = disk_with_pattern(80);
        let cache = Cache::new(rd.clone()).unwrap();

        // Fill all 64 entries, dirtying block 1.
        for b in 0..64u64 {
            let mut g = cache.get_block(b * 512).unwrap();
            if b == 1 {
                g.data_mut().fill(0x11);
            }
        }
        // Touch block 0 so block 1 is the oldest.
        drop(cache.get_block(0).unwrap());

        // A miss now evicts block 1 and writes it back on the way out.
        drop(cache.get_block(70 * 512).unwrap());
        let mut out = [0u8; 512];
        rd.fetch(512, &mut out).unwrap();
        assert!(out.iter().all(|&x| x == 0x11));

        // Block 1 was evicted: rereading it refetches from disk, which now
        // holds the written-back bytes.
        let b = cache.get_block(512).unwrap();
        assert!(b.data().iter().all(|&x| x == 0x11));
    }

    #[test]
    fn all_entries_pinned_reports_busy() {
        let _g = crate::test_guard();
        let cache = Cache::new(disk_with_pattern(80)).unwrap();
        let mut guards = alloc::vec::Vec::new();
        for b in 0..64u64 {
            guards.push(cache.get_block(b * 512).unwrap());
        }
        assert!(matches!(cache.get_block(70 * 512), Err(Error::Busy)));
        drop(guards);
        assert!(cache.get_block(70 * 512).is_ok());
    }

    #[test]
    fn short_device_transfer_is_an_io_error() {
        let _g = crate::test_guard();
        // Two-block device: block 4 is out of range, so the fetch is short.
        let cache = Cache::new(Arc::new(RamDisk::new(2))).unwrap();
        assert!(matches!(cache.get_block(4 * 512), Err(Error::Io)));
    }
}
