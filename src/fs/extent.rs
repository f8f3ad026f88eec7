use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExtentFlags: u32 {
        /// blocks were zero-filled when allocated
        const ZEROED = 1;
        /// extent holds directory entries
        const METADATA = 1 << 1;
    }
}

/// A contiguous run of blocks backing a byte range of a file
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub start_block: u64,
    pub block_count: u64,
    /// byte offset in the file of the first block
    pub file_offset: u64,
    pub flags: u32,
}

impl Extent {
    pub fn flags(&self) -> ExtentFlags {
        ExtentFlags::from_bits_truncate(self.flags)
    }

    pub fn end_block(&self) -> u64 {
        self.start_block + self.block_count
    }

    pub fn blocks(&self) -> impl Iterator<Item = u64> {
        self.start_block..self.end_block()
    }
}

/// Ordered extents of one file, sorted by file offset
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentList {
    extents: SmallVec<[Extent; 4]>,
}

impl ExtentList {
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    pub fn total_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.block_count).sum()
    }

    /// append `block` as the next logical block, merging into the last extent when contiguous
    pub fn append_block(&mut self, block: u64, block_size: u32, flags: ExtentFlags) {
        let file_offset = self.total_blocks() * block_size as u64;
        if let Some(last) = self.extents.last_mut() {
            if last.end_block() == block && last.flags() == flags {
                last.block_count += 1;
                return;
            }
        }
        self.extents.push(Extent {
            start_block: block,
            block_count: 1,
            file_offset,
            flags: flags.bits(),
        });
    }

    /// physical block backing logical block `index`
    pub fn lookup(&self, index: u64, block_size: u32) -> Option<u64> {
        self.extents.iter().find_map(|e| {
            let first = e.file_offset / block_size as u64;
            (first..first + e.block_count)
                .contains(&index)
                .then(|| e.start_block + (index - first))
        })
    }

    /// every physical block in logical order
    pub fn blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.extents.iter().flat_map(|e| e.blocks())
    }

    /// keep the first `keep` logical blocks, returning the released ones
    pub fn truncate_blocks(&mut self, keep: u64) -> Vec<u64> {
        let mut released = Vec::new();
        let mut seen = 0;
        self.extents.retain(|e| {
            if seen >= keep {
                released.extend(e.blocks());
                return false;
            }
            let kept = (keep - seen).min(e.block_count);
            released.extend(e.start_block + kept..e.end_block());
            e.block_count = kept;
            seen += kept;
            true
        });
        released
    }

    /// extents must not overlap each other nor leave the block range
    pub fn validate(&self, block_count: u64, block_size: u32) -> Result<(), String> {
        let mut expected_offset = 0;
        let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(self.extents.len());
        for e in &self.extents {
            if e.block_count == 0 {
                return Err(format!("empty extent at block {}", e.start_block));
            }
            if e.end_block() > block_count {
                return Err(format!(
                    "extent {}..{} past the last block {}",
                    e.start_block,
                    e.end_block(),
                    block_count
                ));
            }
            if e.file_offset != expected_offset {
                return Err(format!(
                    "extent at file offset {} expected at {}",
                    e.file_offset, expected_offset
                ));
            }
            expected_offset += e.block_count * block_size as u64;
            ranges.push((e.start_block, e.end_block()));
        }
        ranges.sort_unstable();
        if ranges.windows(2).any(|w| w[0].1 > w[1].0) {
            return Err("overlapping extents".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_blocks_merge() {
        let mut list = ExtentList::default();
        for b in 100..104 {
            list.append_block(b, 4096, ExtentFlags::ZEROED);
        }
        list.append_block(200, 4096, ExtentFlags::ZEROED);
        assert_eq!(list.len(), 2);
        assert_eq!(list.total_blocks(), 5);
        assert_eq!(list.lookup(0, 4096), Some(100));
        assert_eq!(list.lookup(3, 4096), Some(103));
        assert_eq!(list.lookup(4, 4096), Some(200));
        assert_eq!(list.lookup(5, 4096), None);
        assert_eq!(list.iter().nth(1).unwrap().file_offset, 4 * 4096);
    }

    #[test]
    fn test_truncate_releases_tail() {
        let mut list = ExtentList::default();
        for b in [10, 11, 12, 20, 21] {
            list.append_block(b, 512, ExtentFlags::empty());
        }
        let released = list.truncate_blocks(2);
        assert_eq!(released, vec![12, 20, 21]);
        assert_eq!(list.blocks().collect::<Vec<_>>(), vec![10, 11]);
        assert!(list.validate(100, 512).is_ok());
        assert_eq!(list.truncate_blocks(0), vec![10, 11]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_validate_detects_overlap_and_range() {
        let mut list = ExtentList::default();
        list.append_block(5, 512, ExtentFlags::empty());
        list.append_block(5, 512, ExtentFlags::METADATA);
        assert!(list.validate(100, 512).is_err());

        let mut list = ExtentList::default();
        list.append_block(99, 512, ExtentFlags::empty());
        assert!(list.validate(99, 512).is_err());
    }
}
