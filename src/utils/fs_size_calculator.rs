//! This module contains functions to calculate the size of different fs components

use crate::fs::INODE_RECORD_SIZE;

/// calculate needed bitmap size in bytes, bits are stored in 32-bit words
/// # Arguments
/// - `element_count`: the number of tracked blocks or inodes
/// # Example
/// ```
/// use dslsfs::utils::fs_size_calculator::bitmap_size;
/// assert_eq!(bitmap_size(100), 16);
/// assert_eq!(bitmap_size(32), 4);
/// ```
pub const fn bitmap_size(element_count: u64) -> u64 {
    element_count.div_ceil(32) * 4
}

/// calculate needed Inode Table size
/// # Example
/// ```
/// use dslsfs::utils::fs_size_calculator::inode_table_size;
/// use dslsfs::fs::INODE_RECORD_SIZE;
/// assert_eq!(inode_table_size(10), 10 * INODE_RECORD_SIZE as u64);
/// ```
pub const fn inode_table_size(inode_count: u64) -> u64 {
    inode_count * INODE_RECORD_SIZE as u64
}

/// number of blocks needed to hold `bytes`
pub const fn blocks_for(bytes: u64, block_size: u32) -> u64 {
    bytes.div_ceil(block_size as u64)
}

/// number of journal slots, one block each
pub const fn journal_capacity(journal_size: u64, block_size: u32) -> u64 {
    journal_size / block_size as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocks_for() {
        assert_eq!(blocks_for(0, 4096), 0);
        assert_eq!(blocks_for(1, 4096), 1);
        assert_eq!(blocks_for(4096, 4096), 1);
        assert_eq!(blocks_for(4097, 4096), 2);
    }

    #[test]
    fn test_journal_capacity() {
        assert_eq!(journal_capacity(1 << 20, 4096), 256);
        assert_eq!(journal_capacity(100, 4096), 0);
    }
}
