// KTFS: superblock, inode bitmap, data bitmap, inode table, data blocks.
//
// All on-disk integers are little endian. Inodes map file blocks through
// four direct slots, one single-indirect table and two double-indirect
// tables; stored indices are relative to the start of the data region and a
// zero index denotes a hole. Reads serve holes as zeros; writes allocate, so
// they never create one. The root directory is a flat array of 16-byte
// entries inside an ordinary file.
//
// Locking: the mount lock serializes namespace, bitmap and inode-size
// updates; each open file adds its own lock for position and size snapshots.
// Mount before file, always.

use core::cell::UnsafeCell;

use alloc::sync::Arc;

use crate::bio::Cache;
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::thread::Lock;
use crate::uio::{Uio, UioRef, FCNTL_GETEND, FCNTL_GETPOS, FCNTL_SETEND, FCNTL_SETPOS};

pub const KTFS_BLKSZ: usize = 512;
pub const KTFS_INOSZ: usize = 32;
pub const KTFS_DENSZ: usize = 16;
pub const KTFS_MAX_FILENAME_LEN: usize = 13;
pub const KTFS_NUM_DIRECT: usize = 4;
pub const KTFS_NUM_DINDIRECT: usize = 2;

/// u32 indices per indirection table block.
pub const PTRS_PER_BLOCK: usize = KTFS_BLKSZ / 4;

pub const KTFS_MAX_FILE_SIZE: u64 = ((KTFS_NUM_DIRECT
    + PTRS_PER_BLOCK
    + KTFS_NUM_DINDIRECT * PTRS_PER_BLOCK * PTRS_PER_BLOCK)
    * KTFS_BLKSZ) as u64;

const INODES_PER_BLOCK: u32 = (KTFS_BLKSZ / KTFS_INOSZ) as u32;
const BITS_PER_BLOCK: u32 = (KTFS_BLKSZ * 8) as u32;

#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub block_count: u32,
    pub inode_bitmap_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub inode_blocks: u32,
    pub root_inode: u16,
}

impl Superblock {
    pub fn from_bytes(b: &[u8]) -> Self {
        Superblock {
            block_count: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            inode_bitmap_blocks: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            data_bitmap_blocks: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            inode_blocks: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            root_inode: u16::from_le_bytes(b[16..18].try_into().unwrap()),
        }
    }

    pub fn to_bytes(&self, b: &mut [u8]) {
        b[0..4].copy_from_slice(&self.block_count.to_le_bytes());
        b[4..8].copy_from_slice(&self.inode_bitmap_blocks.to_le_bytes());
        b[8..12].copy_from_slice(&self.data_bitmap_blocks.to_le_bytes());
        b[12..16].copy_from_slice(&self.inode_blocks.to_le_bytes());
        b[16..18].copy_from_slice(&self.root_inode.to_le_bytes());
    }
}

/// Region anchors computed from the superblock.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub inode_bitmap_start: u32,
    pub data_bitmap_start: u32,
    pub inode_table_start: u32,
    pub data_start: u32,
}

impl Layout {
    pub fn of(sb: &Superblock) -> Self {
        let inode_bitmap_start = 1;
        let data_bitmap_start = inode_bitmap_start + sb.inode_bitmap_blocks;
        let inode_table_start = data_bitmap_start + sb.data_bitmap_blocks;
        let data_start = inode_table_start + sb.inode_blocks;
        Layout {
            inode_bitmap_start,
            data_bitmap_start,
            inode_table_start,
            data_start,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Inode {
    pub size: u32,
    pub block: [u32; KTFS_NUM_DIRECT],
    pub indirect: u32,
    pub dindirect: [u32; KTFS_NUM_DINDIRECT],
}

impl Inode {
    pub fn from_bytes(b: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(b[4 * i..4 * i + 4].try_into().unwrap());
        Inode {
            size: word(0),
            block: [word(1), word(2), word(3), word(4)],
            indirect: word(5),
            dindirect: [word(6), word(7)],
        }
    }

    pub fn to_bytes(&self, b: &mut [u8]) {
        let words = [
            self.size,
            self.block[0],
            self.block[1],
            self.block[2],
            self.block[3],
            self.indirect,
            self.dindirect[0],
            self.dindirect[1],
        ];
        for (i, w) in words.iter().enumerate() {
            b[4 * i..4 * i + 4].copy_from_slice(&w.to_le_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inode: u16,
    pub name: [u8; KTFS_MAX_FILENAME_LEN + 1],
}

impl DirEntry {
    pub fn from_bytes(b: &[u8]) -> Self {
        let mut name = [0u8; KTFS_MAX_FILENAME_LEN + 1];
        name.copy_from_slice(&b[2..KTFS_DENSZ]);
        name[KTFS_MAX_FILENAME_LEN] = 0;
        DirEntry {
            inode: u16::from_le_bytes(b[0..2].try_into().unwrap()),
            name,
        }
    }

    pub fn to_bytes(&self, b: &mut [u8]) {
        b[0..2].copy_from_slice(&self.inode.to_le_bytes());
        b[2..KTFS_DENSZ].copy_from_slice(&self.name);
    }

    fn name_len(&self) -> usize {
        self.name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(KTFS_MAX_FILENAME_LEN)
    }

    /// True when the stored name equals the first 13 characters of `name`.
    fn name_matches(&self, name: &str) -> bool {
        let truncated = &name.as_bytes()[..name.len().min(KTFS_MAX_FILENAME_LEN)];
        &self.name[..self.name_len()] == truncated
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Bitmap {
    Inode,
    Data,
}

struct KtfsMount {
    cache: Arc<Cache>,
    lock: Lock,
}

/// The mount-table face of a KTFS volume.
pub struct Ktfs {
    mount: Arc<KtfsMount>,
}

impl Ktfs {
    pub fn new(cache: Arc<Cache>) -> Ktfs {
        Ktfs {
            mount: Arc::new(KtfsMount {
                cache,
                lock: Lock::new(),
            }),
        }
    }
}

/// Mounts a KTFS volume backed by `cache` under `name`.
pub fn mount_ktfs(name: &str, cache: Arc<Cache>) -> Result<()> {
    crate::fs::attach_filesystem(name, Arc::new(Ktfs::new(cache)))
}

impl FileSystem for Ktfs {
    fn open(&self, name: &str) -> Result<UioRef> {
        KtfsMount::open_on(&self.mount, name)
    }

    fn create(&self, name: &str) -> Result<()> {
        let m = &self.mount;
        m.lock.acquire();
        let r = m.create(name);
        m.lock.release();
        r
    }

    fn delete(&self, name: &str) -> Result<()> {
        let m = &self.mount;
        m.lock.acquire();
        let r = m.delete(name);
        m.lock.release();
        r
    }

    fn flush(&self) {
        if let Err(e) = self.mount.cache.flush() {
            log::error!("ktfs flush failed: {}", e);
        }
    }
}

fn read_u32(block: &[u8], index: usize) -> u32 {
    u32::from_le_bytes(block[4 * index..4 * index + 4].try_into().unwrap())
}

fn write_u32(block: &mut [u8], index: usize, val: u32) {
    block[4 * index..4 * index + 4].copy_from_slice(&val.to_le_bytes());
}

impl KtfsMount {
    fn read_super(&self) -> Result<Superblock> {
        let b = self.cache.get_block(0)?;
        Ok(Superblock::from_bytes(&b.data()[..18]))
    }

    fn inode_get(&self, sb: &Superblock, inum: u32) -> Result<Inode> {
        let layout = Layout::of(sb);
        let off = inum as u64 * KTFS_INOSZ as u64;
        let blk = layout.inode_table_start as u64 + off / KTFS_BLKSZ as u64;
        let within = (off % KTFS_BLKSZ as u64) as usize;
        let b = self.cache.get_block(blk * KTFS_BLKSZ as u64)?;
        Ok(Inode::from_bytes(&b.data()[within..within + KTFS_INOSZ]))
    }

    fn inode_put(&self, sb: &Superblock, inum: u32, ino: &Inode) -> Result<()> {
        let layout = Layout::of(sb);
        let off = inum as u64 * KTFS_INOSZ as u64;
        let blk = layout.inode_table_start as u64 + off / KTFS_BLKSZ as u64;
        let within = (off % KTFS_BLKSZ as u64) as usize;
        let mut b = self.cache.get_block(blk * KTFS_BLKSZ as u64)?;
        ino.to_bytes(&mut b.data_mut()[within..within + KTFS_INOSZ]);
        Ok(())
    }

    /// Resolves a logical block number to an absolute block number. A zero
    /// index anywhere along the path is a hole and reports NoEnt.
    fn map_block(&self, sb: &Superblock, ino: &Inode, mut lbn: u32) -> Result<u32> {
        let data_start = Layout::of(sb).data_start;
        let ptrs = PTRS_PER_BLOCK as u32;

        if (lbn as usize) < KTFS_NUM_DIRECT {
            let idx = ino.block[lbn as usize];
            if idx == 0 {
                return Err(Error::NoEnt);
            }
            return Ok(data_start + idx);
        }
        lbn -= KTFS_NUM_DIRECT as u32;

        if lbn < ptrs {
            if ino.indirect == 0 {
                return Err(Error::NoEnt);
            }
            let table = self
                .cache
                .get_block((data_start + ino.indirect) as u64 * KTFS_BLKSZ as u64)?;
            let idx = read_u32(table.data(), lbn as usize);
            if idx == 0 {
                return Err(Error::NoEnt);
            }
            return Ok(data_start + idx);
        }
        lbn -= ptrs;

        let width = ptrs * ptrs;
        for di in 0..KTFS_NUM_DINDIRECT {
            if lbn >= width {
                lbn -= width;
                continue;
            }
            if ino.dindirect[di] == 0 {
                return Err(Error::NoEnt);
            }
            let l1 = self
                .cache
                .get_block((data_start + ino.dindirect[di]) as u64 * KTFS_BLKSZ as u64)?;
            let l2_idx = read_u32(l1.data(), (lbn / ptrs) as usize);
            drop(l1);
            if l2_idx == 0 {
                return Err(Error::NoEnt);
            }
            let l2 = self
                .cache
                .get_block((data_start + l2_idx) as u64 * KTFS_BLKSZ as u64)?;
            let idx = read_u32(l2.data(), (lbn % ptrs) as usize);
            if idx == 0 {
                return Err(Error::NoEnt);
            }
            return Ok(data_start + idx);
        }
        Err(Error::NoEnt)
    }

    /// map_block that fills holes: missing tables and data blocks are
    /// allocated zeroed, and the inode is updated in place. The caller
    /// persists the inode.
    fn map_or_allocate(&self, sb: &Superblock, ino: &mut Inode, mut lbn: u32) -> Result<u32> {
        let data_start = Layout::of(sb).data_start;
        let ptrs = PTRS_PER_BLOCK as u32;

        if (lbn as usize) < KTFS_NUM_DIRECT {
            if ino.block[lbn as usize] == 0 {
                let abs = self.alloc_zero_block(sb)?;
                ino.block[lbn as usize] = abs - data_start;
                return Ok(abs);
            }
            return Ok(data_start + ino.block[lbn as usize]);
        }
        lbn -= KTFS_NUM_DIRECT as u32;

        if lbn < ptrs {
            if ino.indirect == 0 {
                let abs = self.alloc_zero_block(sb)?;
                ino.indirect = abs - data_start;
            }
            return self.table_slot_or_allocate(sb, data_start + ino.indirect, lbn as usize);
        }
        lbn -= ptrs;

        let width = ptrs * ptrs;
        for di in 0..KTFS_NUM_DINDIRECT {
            if lbn >= width {
                lbn -= width;
                continue;
            }
            if ino.dindirect[di] == 0 {
                let abs = self.alloc_zero_block(sb)?;
                ino.dindirect[di] = abs - data_start;
            }

            let l1_abs = data_start + ino.dindirect[di];
            let i1 = (lbn / ptrs) as usize;
            let mut l2_idx = {
                let l1 = self.cache.get_block(l1_abs as u64 * KTFS_BLKSZ as u64)?;
                read_u32(l1.data(), i1)
            };
            if l2_idx == 0 {
                let abs = self.alloc_zero_block(sb)?;
                l2_idx = abs - data_start;
                let mut l1 = self.cache.get_block(l1_abs as u64 * KTFS_BLKSZ as u64)?;
                write_u32(l1.data_mut(), i1, l2_idx);
            }

            return self.table_slot_or_allocate(sb, data_start + l2_idx, (lbn % ptrs) as usize);
        }
        Err(Error::NoEnt)
    }

    // Reads slot `index` of the table block at `table_abs`, allocating a
    // data block into the slot if it holds a hole.
    fn table_slot_or_allocate(
        &self,
        sb: &Superblock,
        table_abs: u32,
        index: usize,
    ) -> Result<u32> {
        let data_start = Layout::of(sb).data_start;
        let existing = {
            let t = self.cache.get_block(table_abs as u64 * KTFS_BLKSZ as u64)?;
            read_u32(t.data(), index)
        };
        if existing != 0 {
            return Ok(data_start + existing);
        }
        let abs = self.alloc_zero_block(sb)?;
        let mut t = self.cache.get_block(table_abs as u64 * KTFS_BLKSZ as u64)?;
        write_u32(t.data_mut(), index, abs - data_start);
        Ok(abs)
    }

    fn alloc_zero_block(&self, sb: &Superblock) -> Result<u32> {
        let abs = self.find_free_bit(sb, Bitmap::Data)?;
        self.bitmap_set(sb, Bitmap::Data, abs, true)?;
        let mut b = self.cache.get_block(abs as u64 * KTFS_BLKSZ as u64)?;
        b.data_mut().fill(0);
        Ok(abs)
    }

    // (first bitmap block, bitmap block count, addressable bits). Data bits
    // are absolute block numbers; inode bits are inode numbers.
    fn bitmap_bounds(&self, sb: &Superblock, kind: Bitmap) -> (u32, u32, u32) {
        let layout = Layout::of(sb);
        match kind {
            Bitmap::Inode => (
                layout.inode_bitmap_start,
                sb.inode_bitmap_blocks,
                sb.inode_blocks * INODES_PER_BLOCK,
            ),
            Bitmap::Data => (layout.data_bitmap_start, sb.data_bitmap_blocks, sb.block_count),
        }
    }

    /// First-fit scan for a clear bit. The data bitmap walk starts at the
    /// data region, leaving the metadata bits permanently reserved; the
    /// inode walk starts at zero.
    fn find_free_bit(&self, sb: &Superblock, kind: Bitmap) -> Result<u32> {
        let (start_blk, blk_cnt, total_bits) = self.bitmap_bounds(sb, kind);
        let exhausted = match kind {
            Bitmap::Inode => Error::NoInodeBlks,
            Bitmap::Data => Error::NoDataBlks,
        };
        let first_allowed = match kind {
            Bitmap::Inode => 0,
            Bitmap::Data => Layout::of(sb).data_start,
        };
        if first_allowed >= total_bits {
            return Err(Error::Inval);
        }

        for b in (first_allowed / BITS_PER_BLOCK)..blk_cnt {
            let blk = self
                .cache
                .get_block((start_blk + b) as u64 * KTFS_BLKSZ as u64)?;
            let bytes = blk.data();
            let base_bit = b * BITS_PER_BLOCK;
            for (byi, &by) in bytes.iter().enumerate() {
                if by == 0xff {
                    continue;
                }
                for bit in 0..8u32 {
                    let global = base_bit + byi as u32 * 8 + bit;
                    if global < first_allowed {
                        continue;
                    }
                    if global >= total_bits {
                        return Err(exhausted);
                    }
                    if by & (1 << bit) == 0 {
                        return Ok(global);
                    }
                }
            }
        }
        Err(exhausted)
    }

    fn bitmap_set(&self, sb: &Superblock, kind: Bitmap, index: u32, value: bool) -> Result<()> {
        let (start_blk, blk_cnt, total_bits) = self.bitmap_bounds(sb, kind);
        if index >= total_bits {
            return Err(Error::Inval);
        }
        let blk = index / BITS_PER_BLOCK;
        let byte = (index % BITS_PER_BLOCK) as usize / 8;
        let mask = 1u8 << (index % 8);
        if blk >= blk_cnt {
            return Err(Error::Inval);
        }
        let mut b = self
            .cache
            .get_block((start_blk + blk) as u64 * KTFS_BLKSZ as u64)?;
        if value {
            b.data_mut()[byte] |= mask;
        } else {
            b.data_mut()[byte] &= !mask;
        }
        Ok(())
    }

    fn dir_entry_count(&self, root: &Inode) -> Result<u32> {
        if root.size as usize % KTFS_DENSZ != 0 {
            return Err(Error::Io);
        }
        Ok(root.size / KTFS_DENSZ as u32)
    }

    fn dir_get_entry(&self, sb: &Superblock, root: &Inode, idx: u32) -> Result<DirEntry> {
        if idx >= self.dir_entry_count(root)? {
            return Err(Error::NoEnt);
        }
        let off = idx as u64 * KTFS_DENSZ as u64;
        let abs = self.map_block(sb, root, (off / KTFS_BLKSZ as u64) as u32)?;
        let within = (off % KTFS_BLKSZ as u64) as usize;
        let b = self.cache.get_block(abs as u64 * KTFS_BLKSZ as u64)?;
        Ok(DirEntry::from_bytes(&b.data()[within..within + KTFS_DENSZ]))
    }

    fn dir_put_entry(
        &self,
        sb: &Superblock,
        root: &Inode,
        idx: u32,
        entry: &DirEntry,
    ) -> Result<()> {
        let off = idx as u64 * KTFS_DENSZ as u64;
        let abs = self.map_block(sb, root, (off / KTFS_BLKSZ as u64) as u32)?;
        let within = (off % KTFS_BLKSZ as u64) as usize;
        let mut b = self.cache.get_block(abs as u64 * KTFS_BLKSZ as u64)?;
        entry.to_bytes(&mut b.data_mut()[within..within + KTFS_DENSZ]);
        Ok(())
    }

    /// Linear scan of the root directory. Returns (entry index, inode).
    fn lookup(&self, sb: &Superblock, root: &Inode, name: &str) -> Result<(u32, u16)> {
        let nents = self.dir_entry_count(root)?;
        for idx in 0..nents {
            let entry = match self.dir_get_entry(sb, root, idx) {
                Ok(e) => e,
                Err(Error::NoEnt) => continue,
                Err(e) => return Err(e),
            };
            if entry.inode == 0 {
                continue;
            }
            if entry.name_matches(name) {
                return Ok((idx, entry.inode));
            }
        }
        Err(Error::NoEnt)
    }

    fn open_on(m: &Arc<KtfsMount>, name: &str) -> Result<UioRef> {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Self::open_listing_on(m);
        }

        m.lock.acquire();
        let r = (|| {
            let sb = m.read_super()?;
            let root = m.inode_get(&sb, sb.root_inode as u32)?;
            let (_, inum) = m.lookup(&sb, &root, name)?;
            let ino = m.inode_get(&sb, inum as u32)?;
            Ok(Arc::new(KtfsFile {
                mount: m.clone(),
                inum: inum as u32,
                flock: Lock::new(),
                st: UnsafeCell::new(OpenState {
                    size: ino.size as u64,
                    position: 0,
                }),
            }) as UioRef)
        })();
        m.lock.release();
        r
    }

    fn open_listing_on(m: &Arc<KtfsMount>) -> Result<UioRef> {
        m.lock.acquire();
        let r = (|| {
            let sb = m.read_super()?;
            let root = m.inode_get(&sb, sb.root_inode as u32)?;
            let total = m.dir_entry_count(&root)?;
            Ok(Arc::new(KtfsListing {
                mount: m.clone(),
                sb,
                root,
                st: UnsafeCell::new(ListState {
                    next_index: 0,
                    total_entries: total,
                }),
            }) as UioRef)
        })();
        m.lock.release();
        r
    }

    // Caller holds the mount lock.
    fn create(&self, name: &str) -> Result<()> {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Err(Error::Inval);
        }

        let sb = self.read_super()?;
        let mut root = self.inode_get(&sb, sb.root_inode as u32)?;

        if self.lookup(&sb, &root, name).is_ok() {
            return Err(Error::Exists);
        }

        let inum = self.find_free_bit(&sb, Bitmap::Inode)?;
        self.bitmap_set(&sb, Bitmap::Inode, inum, true)?;
        self.inode_put(&sb, inum, &Inode::default())?;

        let mut entry = DirEntry {
            inode: inum as u16,
            name: [0; KTFS_MAX_FILENAME_LEN + 1],
        };
        let n = name.len().min(KTFS_MAX_FILENAME_LEN);
        entry.name[..n].copy_from_slice(&name.as_bytes()[..n]);

        // Append at the end of the directory, allocating a fresh block when
        // the previous one is exactly full.
        let idx = self.dir_entry_count(&root)?;
        let lbn = (idx as u64 * KTFS_DENSZ as u64 / KTFS_BLKSZ as u64) as u32;
        if let Err(Error::NoEnt) = self.map_block(&sb, &root, lbn) {
            self.map_or_allocate(&sb, &mut root, lbn)?;
        }
        root.size += KTFS_DENSZ as u32;
        self.dir_put_entry(&sb, &root, idx, &entry)?;
        self.inode_put(&sb, sb.root_inode as u32, &root)?;
        Ok(())
    }

    // Caller holds the mount lock.
    fn delete(&self, name: &str) -> Result<()> {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            return Err(Error::Inval);
        }

        let sb = self.read_super()?;
        let mut root = self.inode_get(&sb, sb.root_inode as u32)?;
        let nents = self.dir_entry_count(&root)?;
        if nents == 0 {
            return Err(Error::NoEnt);
        }

        let (victim_idx, victim_ino) = self.lookup(&sb, &root, name)?;

        let mut victim = self.inode_get(&sb, victim_ino as u32)?;
        self.free_all_blocks(&sb, &mut victim)?;
        self.inode_put(&sb, victim_ino as u32, &victim)?;
        self.bitmap_set(&sb, Bitmap::Inode, victim_ino as u32, false)?;

        // Swap the last entry into the hole and shrink the directory.
        let last_idx = nents - 1;
        if victim_idx != last_idx {
            let last = match self.dir_get_entry(&sb, &root, last_idx) {
                Err(Error::NoEnt) => return Err(Error::Io),
                r => r?,
            };
            self.dir_put_entry(&sb, &root, victim_idx, &last)?;
        }
        root.size -= KTFS_DENSZ as u32;
        self.inode_put(&sb, sb.root_inode as u32, &root)?;
        Ok(())
    }

    /// Frees every data block and indirection table the inode references,
    /// then zeroes it. Hole entries are skipped.
    fn free_all_blocks(&self, sb: &Superblock, ino: &mut Inode) -> Result<()> {
        let data_start = Layout::of(sb).data_start;
        let ptrs = PTRS_PER_BLOCK as u32;
        let total_blocks = if ino.size == 0 {
            0
        } else {
            (ino.size as u64).div_ceil(KTFS_BLKSZ as u64) as u32
        };

        for i in 0..KTFS_NUM_DIRECT {
            if (i as u32) < total_blocks && ino.block[i] != 0 {
                self.bitmap_set(sb, Bitmap::Data, data_start + ino.block[i], false)?;
            }
            ino.block[i] = 0;
        }

        let used_indirect = total_blocks
            .saturating_sub(KTFS_NUM_DIRECT as u32)
            .min(ptrs);
        if used_indirect > 0 && ino.indirect != 0 {
            let table_abs = data_start + ino.indirect;
            self.free_table(sb, table_abs, used_indirect)?;
            self.bitmap_set(sb, Bitmap::Data, table_abs, false)?;
        }
        ino.indirect = 0;

        let mut remaining = total_blocks.saturating_sub(KTFS_NUM_DIRECT as u32 + ptrs);
        let width = ptrs * ptrs;
        for di in 0..KTFS_NUM_DINDIRECT {
            let here = remaining.min(width);
            remaining -= here;
            if here == 0 || ino.dindirect[di] == 0 {
                ino.dindirect[di] = 0;
                continue;
            }

            let l1_abs = data_start + ino.dindirect[di];
            let l2_count = here.div_ceil(ptrs);
            for i1 in 0..l2_count {
                let l2_idx = {
                    let l1 = self.cache.get_block(l1_abs as u64 * KTFS_BLKSZ as u64)?;
                    read_u32(l1.data(), i1 as usize)
                };
                if l2_idx == 0 {
                    continue;
                }
                let l2_abs = data_start + l2_idx;
                let span = (here - i1 * ptrs).min(ptrs);
                self.free_table(sb, l2_abs, span)?;
                self.bitmap_set(sb, Bitmap::Data, l2_abs, false)?;
            }
            self.bitmap_set(sb, Bitmap::Data, l1_abs, false)?;
            ino.dindirect[di] = 0;
        }

        ino.size = 0;
        Ok(())
    }

    // Frees the first `used` data blocks named by an indirection table and
    // zeroes the whole table.
    fn free_table(&self, sb: &Superblock, table_abs: u32, used: u32) -> Result<()> {
        let data_start = Layout::of(sb).data_start;
        for n in 0..used as usize {
            let idx = {
                let t = self.cache.get_block(table_abs as u64 * KTFS_BLKSZ as u64)?;
                read_u32(t.data(), n)
            };
            if idx != 0 {
                self.bitmap_set(sb, Bitmap::Data, data_start + idx, false)?;
            }
        }
        let mut t = self.cache.get_block(table_abs as u64 * KTFS_BLKSZ as u64)?;
        t.data_mut().fill(0);
        Ok(())
    }

    #[cfg(test)]
    fn count_free_bits(&self, sb: &Superblock, kind: Bitmap) -> Result<u32> {
        let (start_blk, _blk_cnt, total_bits) = self.bitmap_bounds(sb, kind);
        let mut free = 0;
        for bit in 0..total_bits {
            let blk = start_blk + bit / BITS_PER_BLOCK;
            let b = self.cache.get_block(blk as u64 * KTFS_BLKSZ as u64)?;
            let byte = b.data()[(bit % BITS_PER_BLOCK) as usize / 8];
            if byte & (1 << (bit % 8)) == 0 {
                free += 1;
            }
        }
        Ok(free)
    }
}

struct OpenState {
    size: u64,
    position: u64,
}

struct KtfsFile {
    mount: Arc<KtfsMount>,
    inum: u32,
    flock: Lock,
    st: UnsafeCell<OpenState>,
}

unsafe impl Sync for KtfsFile {}
unsafe impl Send for KtfsFile {}

impl KtfsFile {
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut OpenState {
        &mut *self.st.get()
    }

    // Holds the file lock.
    fn read_locked(&self, buf: &mut [u8]) -> Result<usize> {
        let m = &self.mount;
        let sb = m.read_super()?;
        let ino = m.inode_get(&sb, self.inum)?;

        let st = unsafe { self.state() };
        st.size = ino.size as u64;
        let pos = st.position;
        if pos >= st.size {
            return Ok(0);
        }

        let want = (buf.len() as u64).min(st.size - pos);
        let mut copied: u64 = 0;
        while copied < want {
            let off = pos + copied;
            let lbn = (off / KTFS_BLKSZ as u64) as u32;
            let within = (off % KTFS_BLKSZ as u64) as usize;
            let width = ((want - copied) as usize).min(KTFS_BLKSZ - within);
            let dst = &mut buf[copied as usize..copied as usize + width];

            match m.map_block(&sb, &ino, lbn) {
                Ok(abs) => {
                    let b = m.cache.get_block(abs as u64 * KTFS_BLKSZ as u64)?;
                    dst.copy_from_slice(&b.data()[within..within + width]);
                }
                // Hole: reads see zeros.
                Err(Error::NoEnt) => dst.fill(0),
                Err(e) => return Err(e),
            }
            copied += width as u64;
        }

        st.position += copied;
        Ok(copied as usize)
    }

    // Holds the mount and file locks, in that order.
    fn write_locked(&self, buf: &[u8]) -> Result<usize> {
        let m = &self.mount;
        let sb = m.read_super()?;
        let mut ino = m.inode_get(&sb, self.inum)?;

        let st = unsafe { self.state() };
        let pos = st.position;
        if pos > KTFS_MAX_FILE_SIZE {
            return Err(Error::Inval);
        }
        let want = (buf.len() as u64).min(KTFS_MAX_FILE_SIZE - pos);
        if want == 0 {
            return Ok(0);
        }

        let size = ino.size as u64;
        let write_end = pos + want;

        // Growing: allocate every logical block from the current tail to the
        // new end, so the file never acquires holes.
        if write_end > size {
            let old_blocks = size.div_ceil(KTFS_BLKSZ as u64) as u32;
            let new_blocks = write_end.div_ceil(KTFS_BLKSZ as u64) as u32;
            for lbn in old_blocks..new_blocks {
                m.map_or_allocate(&sb, &mut ino, lbn)?;
            }
        }

        let mut done: u64 = 0;
        while done < want {
            let off = pos + done;
            let lbn = (off / KTFS_BLKSZ as u64) as u32;
            let within = (off % KTFS_BLKSZ as u64) as usize;
            let width = ((want - done) as usize).min(KTFS_BLKSZ - within);

            let abs = m.map_or_allocate(&sb, &mut ino, lbn)?;
            let mut b = m.cache.get_block(abs as u64 * KTFS_BLKSZ as u64)?;
            b.data_mut()[within..within + width]
                .copy_from_slice(&buf[done as usize..done as usize + width]);
            done += width as u64;
        }

        if write_end > size {
            ino.size = write_end as u32;
        }
        m.inode_put(&sb, self.inum, &ino)?;

        st.size = ino.size as u64;
        st.position = write_end;
        Ok(done as usize)
    }

    // Holds the mount and file locks, in that order.
    fn set_end_locked(&self, newend: u64) -> Result<()> {
        let m = &self.mount;
        if newend > KTFS_MAX_FILE_SIZE {
            return Err(Error::Inval);
        }
        let sb = m.read_super()?;
        let mut ino = m.inode_get(&sb, self.inum)?;
        let old_size = ino.size as u64;
        if newend < old_size {
            return Err(Error::Inval);
        }

        if newend > old_size {
            let old_blocks = old_size.div_ceil(KTFS_BLKSZ as u64) as u32;
            let new_blocks = newend.div_ceil(KTFS_BLKSZ as u64) as u32;
            for lbn in old_blocks..new_blocks {
                m.map_or_allocate(&sb, &mut ino, lbn)?;
            }
            ino.size = newend as u32;
            m.inode_put(&sb, self.inum, &ino)?;
        }

        let st = unsafe { self.state() };
        st.size = ino.size as u64;
        if st.position > st.size {
            st.position = st.size;
        }
        Ok(())
    }
}

impl Uio for KtfsFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.flock.acquire();
        let r = self.read_locked(buf);
        self.flock.release();
        r
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.mount.lock.acquire();
        self.flock.acquire();
        let r = self.write_locked(buf);
        self.flock.release();
        self.mount.lock.release();
        r
    }

    fn cntl(&self, op: i32, arg: &mut u64) -> Result<()> {
        match op {
            FCNTL_GETEND => {
                self.flock.acquire();
                *arg = unsafe { self.state() }.size;
                self.flock.release();
                Ok(())
            }
            FCNTL_SETEND => {
                self.mount.lock.acquire();
                self.flock.acquire();
                let r = self.set_end_locked(*arg);
                self.flock.release();
                self.mount.lock.release();
                r
            }
            FCNTL_GETPOS => {
                self.flock.acquire();
                *arg = unsafe { self.state() }.position;
                self.flock.release();
                Ok(())
            }
            FCNTL_SETPOS => {
                if *arg > KTFS_MAX_FILE_SIZE {
                    return Err(Error::Inval);
                }
                self.flock.acquire();
                unsafe { self.state() }.position = *arg;
                self.flock.release();
                Ok(())
            }
            _ => Err(Error::NotSup),
        }
    }
}

struct ListState {
    next_index: u32,
    total_entries: u32,
}

/// Directory listing over a snapshot of the root inode; each read yields one
/// file name, and 0 means the end.
struct KtfsListing {
    mount: Arc<KtfsMount>,
    sb: Superblock,
    root: Inode,
    st: UnsafeCell<ListState>,
}

unsafe impl Sync for KtfsListing {}
unsafe impl Send for KtfsListing {}

impl Uio for KtfsListing {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let st = unsafe { &mut *self.st.get() };
        while st.next_index < st.total_entries {
            let idx = st.next_index;
            st.next_index += 1;
            let entry = match self.mount.dir_get_entry(&self.sb, &self.root, idx) {
                Ok(e) => e,
                Err(Error::NoEnt) => continue,
                Err(e) => return Err(e),
            };
            if entry.inode == 0 {
                continue;
            }
            let len = entry.name_len();
            let n = len.min(buf.len());
            buf[..n].copy_from_slice(&entry.name[..n]);
            return Ok(n);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramdisk::RamDisk;

    const BLOCKS: u32 = 2048;
    const INODE_BLOCKS: u32 = 8;
    const DATA_START: u32 = 1 + 1 + 1 + INODE_BLOCKS; // 11

    // Formats an empty volume: superblock, one block per bitmap, the inode
    // table, root inode zero. Relative data index 0 is the hole marker, so
    // the first data block is reserved at format time.
    fn format_image() -> alloc::vec::Vec<u8> {
        let mut img = alloc::vec![0u8; BLOCKS as usize * KTFS_BLKSZ];
        let sb = Superblock {
            block_count: BLOCKS,
            inode_bitmap_blocks: 1,
            data_bitmap_blocks: 1,
            inode_blocks: INODE_BLOCKS,
            root_inode: 0,
        };
        sb.to_bytes(&mut img[..18]);

        // inode bitmap: root inode in use
        img[KTFS_BLKSZ] |= 1;
        // data bitmap: reserve the hole-marker block (absolute DATA_START)
        let bit = DATA_START;
        img[2 * KTFS_BLKSZ + bit as usize / 8] |= 1 << (bit % 8);
        img
    }

    fn fresh_fs() -> Ktfs {
        let rd = RamDisk::from_image(format_image()).unwrap();
        let cache = Cache::new(Arc::new(rd)).unwrap();
        Ktfs::new(cache)
    }

    fn set_pos(f: &UioRef, pos: u64) {
        let mut arg = pos;
        f.cntl(FCNTL_SETPOS, &mut arg).unwrap();
    }

    fn free_data_bits(fs: &Ktfs) -> u32 {
        let sb = fs.mount.read_super().unwrap();
        fs.mount.count_free_bits(&sb, Bitmap::Data).unwrap()
    }

    #[test]
    fn on_disk_structs_round_trip_little_endian() {
        let sb = Superblock {
            block_count: 0x01020304,
            inode_bitmap_blocks: 1,
            data_bitmap_blocks: 2,
            inode_blocks: 3,
            root_inode: 7,
        };
        let mut b = [0u8; 18];
        sb.to_bytes(&mut b);
        assert_eq!(&b[0..4], &[4, 3, 2, 1]);
        let back = Superblock::from_bytes(&b);
        assert_eq!(back.block_count, sb.block_count);
        assert_eq!(back.root_inode, 7);

        let ino = Inode {
            size: 600,
            block: [9, 0, 0, 0],
            indirect: 5,
            dindirect: [0, 8],
        };
        let mut b = [0u8; KTFS_INOSZ];
        ino.to_bytes(&mut b);
        let back = Inode::from_bytes(&b);
        assert_eq!(back.size, 600);
        assert_eq!(back.block[0], 9);
        assert_eq!(back.indirect, 5);
        assert_eq!(back.dindirect[1], 8);
    }

    #[test]
    fn layout_anchors_follow_the_superblock() {
        let sb = Superblock {
            block_count: 100,
            inode_bitmap_blocks: 2,
            data_bitmap_blocks: 3,
            inode_blocks: 4,
            root_inode: 0,
        };
        let l = Layout::of(&sb);
        assert_eq!(l.inode_bitmap_start, 1);
        assert_eq!(l.data_bitmap_start, 3);
        assert_eq!(l.inode_table_start, 6);
        assert_eq!(l.data_start, 10);
    }

    #[test]
    fn create_write_read_round_trip() {
        let _g = crate::test_guard();
        let fs = fresh_fs();

        fs.create("greet").unwrap();
        let f = fs.open("greet").unwrap();
        assert_eq!(f.write(b"hi"), Ok(2));

        let f2 = fs.open("greet").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f2.read(&mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");
        // Position advanced to EOF; the next read is empty.
        assert_eq!(f2.read(&mut buf), Ok(0));
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("twice").unwrap();
        assert_eq!(fs.create("twice"), Err(Error::Exists));
        assert!(matches!(fs.open("missing"), Err(Error::NoEnt)));
    }

    #[test]
    fn set_end_grows_zero_filled() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("sparse").unwrap();
        let f = fs.open("sparse").unwrap();

        let mut arg = 600u64;
        f.cntl(FCNTL_SETEND, &mut arg).unwrap();
        let mut out = [0xffu8; 600];
        assert_eq!(f.read(&mut out), Ok(600));
        assert!(out.iter().all(|&b| b == 0));

        // Shrinking is not a thing.
        let mut arg = 100u64;
        assert_eq!(f.cntl(FCNTL_SETEND, &mut arg), Err(Error::Inval));
    }

    #[test]
    fn holes_read_as_zeros() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("holey").unwrap();

        // Hand-craft a file whose size covers blocks that were never
        // allocated.
        let m = &fs.mount;
        m.lock.acquire();
        let sb = m.read_super().unwrap();
        let root = m.inode_get(&sb, 0).unwrap();
        let (_, inum) = m.lookup(&sb, &root, "holey").unwrap();
        let mut ino = m.inode_get(&sb, inum as u32).unwrap();
        ino.size = 600;
        m.inode_put(&sb, inum as u32, &ino).unwrap();
        m.lock.release();

        let f = fs.open("holey").unwrap();
        let mut out = [0xffu8; 600];
        assert_eq!(f.read(&mut out), Ok(600));
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn first_indirect_crossing_allocates_table_once() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("grow").unwrap();
        let f = fs.open("grow").unwrap();
        let before = free_data_bits(&fs);

        // Six blocks of payload: 4 direct + 2 via the single-indirect table,
        // which itself costs one block on the first crossing.
        let payload = alloc::vec![0x42u8; 6 * KTFS_BLKSZ];
        assert_eq!(f.write(&payload), Ok(payload.len()));
        assert_eq!(free_data_bits(&fs), before - 7);

        // Rewriting the same range allocates nothing further.
        set_pos(&f, 0);
        assert_eq!(f.write(&payload), Ok(payload.len()));
        assert_eq!(free_data_bits(&fs), before - 7);

        set_pos(&f, 0);
        let mut out = alloc::vec![0u8; payload.len()];
        assert_eq!(f.read(&mut out), Ok(payload.len()));
        assert_eq!(out, payload);
    }

    #[test]
    fn first_dindirect_crossing_allocates_both_levels() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("deep").unwrap();
        let f = fs.open("deep").unwrap();
        let before = free_data_bits(&fs);

        // One byte at LBN 132. Growth fills every block up to there: 133
        // data blocks, the single-indirect table, one dindirect table and
        // one second-level table.
        let lbn = (KTFS_NUM_DIRECT + PTRS_PER_BLOCK) as u64; // 132
        set_pos(&f, lbn * KTFS_BLKSZ as u64);
        assert_eq!(f.write(b"x"), Ok(1));
        assert_eq!(free_data_bits(&fs), before - (133 + 3));

        let mut arg = 0u64;
        f.cntl(FCNTL_GETEND, &mut arg).unwrap();
        assert_eq!(arg, lbn * KTFS_BLKSZ as u64 + 1);

        set_pos(&f, lbn * KTFS_BLKSZ as u64);
        let mut out = [0u8; 4];
        assert_eq!(f.read(&mut out), Ok(1));
        assert_eq!(out[0], b'x');
    }

    #[test]
    fn delete_reclaims_every_block() {
        let _g = crate::test_guard();
        let fs = fresh_fs();

        // Baseline after create: the directory block itself stays allocated.
        fs.create("big").unwrap();
        let baseline = free_data_bits(&fs);
        let f = fs.open("big").unwrap();
        // 20 KiB: 40 data blocks, 36 of them behind the indirect table.
        let payload = alloc::vec![7u8; 20480];
        assert_eq!(f.write(&payload), Ok(20480));
        assert_eq!(free_data_bits(&fs), baseline - 41);
        drop(f);

        fs.delete("big").unwrap();
        assert_eq!(free_data_bits(&fs), baseline);
        assert!(matches!(fs.open("big"), Err(Error::NoEnt)));

        // The freed inode is reusable.
        fs.create("next").unwrap();
        assert!(fs.open("next").is_ok());
    }

    #[test]
    fn delete_swaps_last_directory_entry_into_the_hole() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("aa").unwrap();
        fs.create("bb").unwrap();
        fs.create("cc").unwrap();
        fs.delete("aa").unwrap();

        // Both survivors remain reachable and the listing shows exactly
        // them.
        assert!(fs.open("bb").is_ok());
        assert!(fs.open("cc").is_ok());
        let ls = fs.open("/").unwrap();
        let mut names = alloc::vec::Vec::new();
        let mut buf = [0u8; 32];
        loop {
            let n = ls.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            names.push(alloc::string::String::from_utf8_lossy(&buf[..n]).into_owned());
        }
        names.sort();
        assert_eq!(names, ["bb", "cc"]);
    }

    #[test]
    fn writes_stop_at_the_file_size_cap() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("cap").unwrap();
        let f = fs.open("cap").unwrap();

        // At the cap the write degenerates to zero bytes; past it the
        // position itself is rejected.
        set_pos(&f, KTFS_MAX_FILE_SIZE);
        assert_eq!(f.write(b"zzz"), Ok(0));
        let mut arg = KTFS_MAX_FILE_SIZE + 1;
        assert_eq!(f.cntl(FCNTL_SETPOS, &mut arg), Err(Error::Inval));
    }

    #[test]
    fn long_names_compare_on_thirteen_characters() {
        let _g = crate::test_guard();
        let fs = fresh_fs();
        fs.create("exactly-13-ch-and-more").unwrap();
        // The stored name is the 13-character prefix.
        assert!(fs.open("exactly-13-ch").is_ok());
        assert_eq!(fs.create("exactly-13-ch"), Err(Error::Exists));
    }

    #[test]
    fn flush_persists_through_remount() {
        let _g = crate::test_guard();
        let rd = Arc::new(RamDisk::from_image(format_image()).unwrap());
        {
            let cache = Cache::new(rd.clone()).unwrap();
            let fs = Ktfs::new(cache);
            fs.create("keep").unwrap();
            let f = fs.open("keep").unwrap();
            f.write(b"persisted").unwrap();
            fs.flush();
        }
        // A second mount over the same device sees the flushed state.
        let cache = Cache::new(rd).unwrap();
        let fs = Ktfs::new(cache);
        let f = fs.open("keep").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf), Ok(9));
        assert_eq!(&buf[..9], b"persisted");
    }
}
