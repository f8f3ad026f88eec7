//! where every metadata region lives on the device pool
//!
//! The pool starts with a metadata header and is followed by the block space:
//! - superblock (one block)
//! - inode bitmap
//! - block bitmap
//! - inode table
//! - journal
//! - data block 0, 1, ...
use serde::{Deserialize, Serialize};

use crate::utils::fs_size_calculator::{bitmap_size, blocks_for, inode_table_size};

/// a run of blocks inside the metadata header
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Region {
    /// first device block of the region
    pub start: u64,
    /// blocks occupied
    pub blocks: u64,
    /// meaningful bytes at the start of the region
    pub bytes: u64,
}

impl Region {
    pub const fn end(&self) -> u64 {
        self.start + self.blocks
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    pub superblock: Region,
    pub inode_bitmap: Region,
    pub block_bitmap: Region,
    pub inode_table: Region,
    pub journal: Region,
    /// blocks in front of data block 0
    pub header_blocks: u64,
}

impl Layout {
    pub fn compute(total_blocks: u64, total_inodes: u64, block_size: u32, journal_size: u64) -> Self {
        let mut next = 0;
        let mut region = |bytes: u64| {
            let blocks = blocks_for(bytes, block_size);
            let region = Region {
                start: next,
                blocks,
                bytes,
            };
            next += blocks;
            region
        };
        let superblock = region(block_size as u64);
        let inode_bitmap = region(bitmap_size(total_inodes));
        let block_bitmap = region(bitmap_size(total_blocks));
        let inode_table = region(inode_table_size(total_inodes));
        // only whole slots count
        let journal = region(journal_size - journal_size % block_size as u64);
        Layout {
            superblock,
            inode_bitmap,
            block_bitmap,
            inode_table,
            journal,
            header_blocks: next,
        }
    }

    pub fn header_bytes(&self, block_size: u32) -> u64 {
        self.header_blocks * block_size as u64
    }

    /// device block that holds data block `block`
    #[inline]
    pub fn device_block(&self, block: u64) -> u64 {
        self.header_blocks + block
    }

    /// regions must be contiguous, in order, and start right after the superblock
    pub fn is_consistent(&self) -> bool {
        let regions = [
            self.superblock,
            self.inode_bitmap,
            self.block_bitmap,
            self.inode_table,
            self.journal,
        ];
        self.superblock.start == 0
            && self.superblock.blocks == 1
            && regions.windows(2).all(|w| w[0].end() == w[1].start)
            && self.journal.end() == self.header_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::INODE_RECORD_SIZE;

    #[test]
    fn test_layout_of_64_mib_volume() {
        // 64 MiB with 4 KiB blocks
        let layout = Layout::compute(16384, 4096, 4096, 1 << 20);
        assert_eq!(layout.superblock, Region { start: 0, blocks: 1, bytes: 4096 });
        assert_eq!(layout.inode_bitmap.start, 1);
        assert_eq!(layout.inode_bitmap.bytes, 512);
        assert_eq!(layout.block_bitmap.start, 2);
        assert_eq!(layout.block_bitmap.bytes, 2048);
        assert_eq!(layout.inode_table.start, 3);
        assert_eq!(layout.inode_table.blocks, 4096 * INODE_RECORD_SIZE as u64 / 4096);
        assert_eq!(layout.journal.blocks, 256);
        assert_eq!(layout.header_blocks, 3 + 256 + 256);
        assert!(layout.is_consistent());
        assert_eq!(layout.device_block(0), layout.header_blocks);
    }

    #[test]
    fn test_no_journal() {
        let layout = Layout::compute(1024, 256, 1024, 0);
        assert_eq!(layout.journal.blocks, 0);
        assert!(layout.is_consistent());
    }
}
