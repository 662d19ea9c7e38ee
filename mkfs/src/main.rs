use std::fs::File;
use std::io::{Result, Write};

use clap::Parser;

use crate::deps::{
    DirEntry, Inode, Superblock, BITS_PER_BLOCK, BLKSZ, DENSZ, INOSZ, INODES_PER_BLOCK,
    MAX_FILE_SIZE, NUM_DIRECT, PTRS_PER_BLOCK,
};

mod deps;

// Volume image layout:
// [ superblock | inode bitmap | data bitmap | inode table | data blocks ]

#[derive(Parser, Debug)]
struct Args {
    /// Name of the output img file
    #[arg(short, long)]
    output_name: String,

    /// Total size of the volume in 512-byte blocks
    #[arg(short, long, default_value_t = 4096)]
    blocks: u32,

    /// Number of inode-table blocks (16 inodes each)
    #[arg(short, long, default_value_t = 8)]
    inode_blocks: u32,

    /// Files whose contents become root-directory entries
    #[arg(short, long)]
    files: Option<Vec<String>>,
}

struct ImageBuilder {
    img: Vec<u8>,
    sb: Superblock,
    data_start: u32,
    // bump allocators over the relative data index and the inode numbers
    next_block: u32,
    next_inode: u32,
}

impl ImageBuilder {
    fn new(blocks: u32, inode_blocks: u32) -> ImageBuilder {
        let sb = Superblock {
            block_count: blocks,
            inode_bitmap_blocks: (inode_blocks * INODES_PER_BLOCK).div_ceil(BITS_PER_BLOCK),
            data_bitmap_blocks: blocks.div_ceil(BITS_PER_BLOCK),
            inode_blocks,
            root_inode: 0,
        };
        let (_, _, _, data_start) = sb.anchors();
        assert!(data_start < blocks, "volume too small for its metadata");

        let mut builder = ImageBuilder {
            img: vec![0u8; blocks as usize * BLKSZ],
            sb,
            data_start,
            // relative index 0 denotes a hole, so the first data block is
            // reserved and allocation starts at 1
            next_block: 1,
            next_inode: 0,
        };
        sb.to_bytes(&mut builder.img[..18]);
        builder.mark_data_bit(data_start);
        let root = builder.alloc_inode();
        assert_eq!(root, 0);
        builder
    }

    fn mark_data_bit(&mut self, abs: u32) {
        let (_, data_bitmap_start, _, _) = self.sb.anchors();
        let off = data_bitmap_start as usize * BLKSZ + abs as usize / 8;
        self.img[off] |= 1 << (abs % 8);
    }

    fn mark_inode_bit(&mut self, inum: u32) {
        let (inode_bitmap_start, _, _, _) = self.sb.anchors();
        let off = inode_bitmap_start as usize * BLKSZ + inum as usize / 8;
        self.img[off] |= 1 << (inum % 8);
    }

    fn alloc_inode(&mut self) -> u32 {
        let inum = self.next_inode;
        assert!(inum < self.sb.inode_blocks * INODES_PER_BLOCK, "out of inodes");
        self.next_inode += 1;
        self.mark_inode_bit(inum);
        inum
    }

    /// Allocates one data block, returning its index relative to the data
    /// region.
    fn alloc_block(&mut self) -> u32 {
        let rel = self.next_block;
        let abs = self.data_start + rel;
        assert!(abs < self.sb.block_count, "out of data blocks");
        self.next_block += 1;
        self.mark_data_bit(abs);
        rel
    }

    fn block_mut(&mut self, rel: u32) -> &mut [u8] {
        let abs = (self.data_start + rel) as usize;
        &mut self.img[abs * BLKSZ..(abs + 1) * BLKSZ]
    }

    fn write_inode(&mut self, inum: u32, ino: &Inode) {
        let (_, _, inode_table_start, _) = self.sb.anchors();
        let off = inode_table_start as usize * BLKSZ + inum as usize * INOSZ;
        ino.to_bytes(&mut self.img[off..off + INOSZ]);
    }

    fn read_inode(&self, inum: u32) -> Inode {
        let (_, _, inode_table_start, _) = self.sb.anchors();
        let off = inode_table_start as usize * BLKSZ + inum as usize * INOSZ;
        Inode::from_bytes(&self.img[off..off + INOSZ])
    }

    /// Stores `data` as a fresh file named `name` in the root directory.
    fn add_file(&mut self, name: &str, data: &[u8]) {
        assert!(data.len() as u64 <= MAX_FILE_SIZE, "file too large");
        let inum = self.alloc_inode();

        let mut ino = Inode {
            size: data.len() as u32,
            ..Inode::default()
        };

        let nblocks = data.len().div_ceil(BLKSZ);
        for lbn in 0..nblocks {
            let chunk = &data[lbn * BLKSZ..data.len().min((lbn + 1) * BLKSZ)];
            let rel = self.alloc_block();
            self.block_mut(rel)[..chunk.len()].copy_from_slice(chunk);
            self.map_into(&mut ino, lbn as u32, rel);
        }

        self.write_inode(inum, &ino);
        self.append_dir_entry(&DirEntry::new(inum as u16, name));
    }

    // Links `rel` as logical block `lbn`, allocating indirection tables on
    // first use.
    fn map_into(&mut self, ino: &mut Inode, mut lbn: u32, rel: u32) {
        let ptrs = PTRS_PER_BLOCK as u32;

        if (lbn as usize) < NUM_DIRECT {
            ino.block[lbn as usize] = rel;
            return;
        }
        lbn -= NUM_DIRECT as u32;

        if lbn < ptrs {
            if ino.indirect == 0 {
                ino.indirect = self.alloc_block();
            }
            let table = ino.indirect;
            self.set_table_entry(table, lbn as usize, rel);
            return;
        }
        lbn -= ptrs;

        let di = (lbn / (ptrs * ptrs)) as usize;
        let within = lbn % (ptrs * ptrs);
        if ino.dindirect[di] == 0 {
            ino.dindirect[di] = self.alloc_block();
        }
        let l1 = ino.dindirect[di];
        let mut l2 = self.get_table_entry(l1, (within / ptrs) as usize);
        if l2 == 0 {
            l2 = self.alloc_block();
            self.set_table_entry(l1, (within / ptrs) as usize, l2);
        }
        self.set_table_entry(l2, (within % ptrs) as usize, rel);
    }

    fn set_table_entry(&mut self, table_rel: u32, index: usize, value: u32) {
        let b = self.block_mut(table_rel);
        b[4 * index..4 * index + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_table_entry(&self, table_rel: u32, index: usize) -> u32 {
        let abs = (self.data_start + table_rel) as usize;
        let b = &self.img[abs * BLKSZ..(abs + 1) * BLKSZ];
        u32::from_le_bytes(b[4 * index..4 * index + 4].try_into().unwrap())
    }

    fn append_dir_entry(&mut self, entry: &DirEntry) {
        let mut root = self.read_inode(self.sb.root_inode as u32);
        let off = root.size as usize;
        let lbn = (off / BLKSZ) as u32;

        // The directory grows one block at a time; entries never straddle.
        if off % BLKSZ == 0 {
            let rel = self.alloc_block();
            self.map_into(&mut root, lbn, rel);
        }
        let rel = self.resolve(&root, lbn);
        let within = off % BLKSZ;
        let mut bytes = [0u8; DENSZ];
        entry.to_bytes(&mut bytes);
        self.block_mut(rel)[within..within + DENSZ].copy_from_slice(&bytes);

        root.size += DENSZ as u32;
        self.write_inode(self.sb.root_inode as u32, &root);
    }

    // Logical block to relative index, panicking on holes; the builder
    // never creates any.
    fn resolve(&self, ino: &Inode, mut lbn: u32) -> u32 {
        let ptrs = PTRS_PER_BLOCK as u32;
        if (lbn as usize) < NUM_DIRECT {
            return ino.block[lbn as usize];
        }
        lbn -= NUM_DIRECT as u32;
        if lbn < ptrs {
            return self.get_table_entry(ino.indirect, lbn as usize);
        }
        lbn -= ptrs;
        let di = (lbn / (ptrs * ptrs)) as usize;
        let within = lbn % (ptrs * ptrs);
        let l2 = self.get_table_entry(ino.dindirect[di], (within / ptrs) as usize);
        self.get_table_entry(l2, (within % ptrs) as usize)
    }

    fn finish(self) -> Vec<u8> {
        self.img
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut builder = ImageBuilder::new(args.blocks, args.inode_blocks);
    for path in args.files.unwrap_or_default() {
        let data = std::fs::read(&path)?;
        let name = path.rsplit('/').next().unwrap_or(&path);
        builder.add_file(name, &data);
        println!("added {} ({} bytes)", name, data.len());
    }

    let img = builder.finish();
    let mut out = File::create(&args.output_name)?;
    out.write_all(&img)?;
    println!(
        "{}: {} blocks ({} KiB)",
        args.output_name,
        args.blocks,
        img.len() / 1024
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // A reader over a finished image, mirroring how the kernel walks it.
    fn lookup(img: &[u8], name: &str) -> Option<Vec<u8>> {
        let sb = Superblock::from_bytes(&img[..18]);
        let (_, _, inode_table_start, data_start) = sb.anchors();
        let read_inode = |inum: u32| {
            let off = inode_table_start as usize * BLKSZ + inum as usize * INOSZ;
            Inode::from_bytes(&img[off..off + INOSZ])
        };
        let table = |rel: u32, idx: usize| {
            let abs = (data_start + rel) as usize;
            u32::from_le_bytes(img[abs * BLKSZ + 4 * idx..abs * BLKSZ + 4 * idx + 4].try_into().unwrap())
        };
        let resolve = |ino: &Inode, mut lbn: u32| -> u32 {
            let ptrs = PTRS_PER_BLOCK as u32;
            if (lbn as usize) < NUM_DIRECT {
                return ino.block[lbn as usize];
            }
            lbn -= NUM_DIRECT as u32;
            if lbn < ptrs {
                return table(ino.indirect, lbn as usize);
            }
            lbn -= ptrs;
            let di = (lbn / (ptrs * ptrs)) as usize;
            let within = lbn % (ptrs * ptrs);
            let l2 = table(ino.dindirect[di], (within / ptrs) as usize);
            table(l2, (within % ptrs) as usize)
        };

        let root = read_inode(sb.root_inode as u32);
        for i in 0..(root.size as usize / DENSZ) {
            let rel = resolve(&root, (i * DENSZ / BLKSZ) as u32);
            let abs = (data_start + rel) as usize;
            let off = abs * BLKSZ + i * DENSZ % BLKSZ;
            let entry = DirEntry::from_bytes(&img[off..off + DENSZ]);
            if entry.name_str() != name {
                continue;
            }

            let ino = read_inode(entry.inode as u32);
            let mut data = Vec::with_capacity(ino.size as usize);
            let mut remaining = ino.size as usize;
            let mut lbn = 0;
            while remaining > 0 {
                let rel = resolve(&ino, lbn);
                let abs = (data_start + rel) as usize;
                let n = remaining.min(BLKSZ);
                data.extend_from_slice(&img[abs * BLKSZ..abs * BLKSZ + n]);
                remaining -= n;
                lbn += 1;
            }
            return Some(data);
        }
        None
    }

    fn bitmap_bit(img: &[u8], bitmap_start: u32, bit: u32) -> bool {
        img[bitmap_start as usize * BLKSZ + bit as usize / 8] & (1 << (bit % 8)) != 0
    }

    #[test]
    fn empty_volume_layout() {
        let img = ImageBuilder::new(2048, 8).finish();
        assert_eq!(img.len(), 2048 * BLKSZ);

        let sb = Superblock::from_bytes(&img[..18]);
        assert_eq!(sb.block_count, 2048);
        assert_eq!(sb.inode_bitmap_blocks, 1);
        assert_eq!(sb.data_bitmap_blocks, 1);
        assert_eq!(sb.inode_blocks, 8);
        assert_eq!(sb.root_inode, 0);

        let (ibm, dbm, itab, data) = sb.anchors();
        assert_eq!((ibm, dbm, itab, data), (1, 2, 3, 11));

        // Root inode allocated and empty; the hole-marker block reserved.
        assert!(bitmap_bit(&img, ibm, 0));
        assert!(!bitmap_bit(&img, ibm, 1));
        assert!(bitmap_bit(&img, dbm, data));

        let root = Inode::from_bytes(&img[itab as usize * BLKSZ..itab as usize * BLKSZ + INOSZ]);
        assert_eq!(root.size, 0);
    }

    #[test]
    fn small_file_round_trips() {
        let mut b = ImageBuilder::new(2048, 8);
        b.add_file("hello", b"hi there");
        let img = b.finish();
        assert_eq!(lookup(&img, "hello").as_deref(), Some(&b"hi there"[..]));
        assert_eq!(lookup(&img, "absent"), None);
    }

    #[test]
    fn several_files_share_the_directory_block() {
        let mut b = ImageBuilder::new(2048, 8);
        for i in 0..40 {
            // 40 entries span two directory blocks (32 per block).
            b.add_file(&format!("file{:02}", i), format!("c{:02}", i).as_bytes());
        }
        let img = b.finish();
        for i in 0..40 {
            let data = lookup(&img, &format!("file{:02}", i)).unwrap();
            assert_eq!(data, format!("c{:02}", i).as_bytes());
        }
    }

    #[test]
    fn indirect_and_double_indirect_files_round_trip() {
        let mut b = ImageBuilder::new(40000, 8);

        // 10 blocks: direct + single indirect.
        let medium: Vec<u8> = (0..10 * BLKSZ).map(|i| (i % 251) as u8).collect();
        b.add_file("medium", &medium);

        // 200 blocks: spills into the first double-indirect table.
        let large: Vec<u8> = (0..200 * BLKSZ).map(|i| (i % 241) as u8).collect();
        b.add_file("large", &large);

        let img = b.finish();
        assert_eq!(lookup(&img, "medium").unwrap(), medium);
        assert_eq!(lookup(&img, "large").unwrap(), large);

        // The large file's inode actually uses the double-indirect path.
        let sb = Superblock::from_bytes(&img[..18]);
        let (_, _, itab, _) = sb.anchors();
        // inode 2: root is 0, medium is 1.
        let off = itab as usize * BLKSZ + 2 * INOSZ;
        let ino = Inode::from_bytes(&img[off..off + INOSZ]);
        assert_eq!(ino.size as usize, 200 * BLKSZ);
        assert_ne!(ino.indirect, 0);
        assert_ne!(ino.dindirect[0], 0);
        assert_eq!(ino.dindirect[1], 0);
    }

    #[test]
    fn allocation_never_hands_out_the_hole_marker() {
        let mut b = ImageBuilder::new(2048, 8);
        b.add_file("x", b"data");
        let img = b.finish();
        let sb = Superblock::from_bytes(&img[..18]);
        let (_, _, itab, _) = sb.anchors();
        // inode 1 is the file; its first block index must not be 0.
        let off = itab as usize * BLKSZ + INOSZ;
        let ino = Inode::from_bytes(&img[off..off + INOSZ]);
        assert_ne!(ino.block[0], 0);
    }
}
