use std::mem;

/*
    Constants and on-disk structs shared with the kernel's ktfs module.
    Pulling the kernel crate in as a host dependency drags the whole
    bare-metal surface along, so they are mirrored here instead.
*/

pub const BLKSZ: usize = 512;
pub const INOSZ: usize = 32;
pub const DENSZ: usize = 16;
pub const MAX_FILENAME_LEN: usize = 13;
pub const NUM_DIRECT: usize = 4;
pub const NUM_DINDIRECT: usize = 2;
pub const PTRS_PER_BLOCK: usize = BLKSZ / mem::size_of::<u32>();

pub const MAX_FILE_SIZE: u64 =
    ((NUM_DIRECT + PTRS_PER_BLOCK + NUM_DINDIRECT * PTRS_PER_BLOCK * PTRS_PER_BLOCK) * BLKSZ)
        as u64;

pub const INODES_PER_BLOCK: u32 = (BLKSZ / INOSZ) as u32;
pub const BITS_PER_BLOCK: u32 = (BLKSZ * 8) as u32;

#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub block_count: u32,
    pub inode_bitmap_blocks: u32,
    pub data_bitmap_blocks: u32,
    pub inode_blocks: u32,
    pub root_inode: u16,
}

impl Superblock {
    pub fn to_bytes(&self, b: &mut [u8]) {
        b[0..4].copy_from_slice(&self.block_count.to_le_bytes());
        b[4..8].copy_from_slice(&self.inode_bitmap_blocks.to_le_bytes());
        b[8..12].copy_from_slice(&self.data_bitmap_blocks.to_le_bytes());
        b[12..16].copy_from_slice(&self.inode_blocks.to_le_bytes());
        b[16..18].copy_from_slice(&self.root_inode.to_le_bytes());
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        Superblock {
            block_count: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            inode_bitmap_blocks: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            data_bitmap_blocks: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            inode_blocks: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            root_inode: u16::from_le_bytes(b[16..18].try_into().unwrap()),
        }
    }

    /// First block of each on-disk region, in layout order.
    pub fn anchors(&self) -> (u32, u32, u32, u32) {
        let inode_bitmap_start = 1;
        let data_bitmap_start = inode_bitmap_start + self.inode_bitmap_blocks;
        let inode_table_start = data_bitmap_start + self.data_bitmap_blocks;
        let data_start = inode_table_start + self.inode_blocks;
        (
            inode_bitmap_start,
            data_bitmap_start,
            inode_table_start,
            data_start,
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Inode {
    pub size: u32,
    pub block: [u32; NUM_DIRECT],
    pub indirect: u32,
    pub dindirect: [u32; NUM_DINDIRECT],
}

impl Inode {
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

    pub fn from_bytes(b: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(b[4 * i..4 * i + 4].try_into().unwrap());
        Inode {
            size: word(0),
            block: [word(1), word(2), word(3), word(4)],
            indirect: word(5),
            dindirect: [word(6), word(7)],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DirEntry {
    pub inode: u16,
    pub name: [u8; MAX_FILENAME_LEN + 1],
}

impl DirEntry {
    pub fn new(inode: u16, name: &str) -> Self {
        let mut bytes = [0u8; MAX_FILENAME_LEN + 1];
        let n = name.len().min(MAX_FILENAME_LEN);
        bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
        DirEntry { inode, name: bytes }
    }

    pub fn to_bytes(&self, b: &mut [u8]) {
        b[0..2].copy_from_slice(&self.inode.to_le_bytes());
        b[2..DENSZ].copy_from_slice(&self.name);
    }

    pub fn from_bytes(b: &[u8]) -> Self {
        let mut name = [0u8; MAX_FILENAME_LEN + 1];
        name.copy_from_slice(&b[2..DENSZ]);
        name[MAX_FILENAME_LEN] = 0;
        DirEntry {
            inode: u16::from_le_bytes(b[0..2].try_into().unwrap()),
            name,
        }
    }

    pub fn name_str(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(MAX_FILENAME_LEN);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}
