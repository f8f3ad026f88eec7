use serde::{Deserialize, Serialize};

use crate::utils::{
    time_util::TimeDurationStruct,
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::{filekind::FileKind, ExtentFlags, ExtentList, DIRECT_POINTERS};

/// Metadata for one filesystem object.
///
/// The extent map is the authoritative block mapping and lives in memory;
/// the on-disk record keeps the first [DIRECT_POINTERS] blocks and the extent count.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Inode {
    pub inode_number: u64,
    pub file_kind: FileKind,
    pub mode: u16,
    pub hard_links: u32,
    pub user_id: u32,
    pub group_id: u32,
    /// [FileAttributes](crate::object::FileAttributes) bits
    pub attributes: u32,
    pub file_size: u64,
    pub allocation_size: u64,
    pub created_at: TimeDurationStruct,
    pub accessed_at: TimeDurationStruct,
    pub modified_at: TimeDurationStruct,
    pub metadata_changed_at: TimeDurationStruct,
    pub direct_blocks: [u64; DIRECT_POINTERS],
    pub indirect_block: u64,
    pub double_indirect_block: u64,
    pub extent_count: u32,
    #[serde(skip)]
    pub extents: ExtentList,
    pub digest: [u8; 32],
}

impl DigestInSelf for Inode {
    fn digest_field(&mut self) -> &mut [u8; 32] {
        &mut self.digest
    }
}

impl SerializeAndDigest for Inode {}

impl Inode {
    pub fn new(
        index: u64,
        file_kind: FileKind,
        permissions: u16,
        owner: (u32, u32),
        now: TimeDurationStruct,
    ) -> Self {
        Inode {
            inode_number: index,
            file_kind,
            mode: file_kind.mode_bits() | (permissions & 0o7777),
            hard_links: if file_kind == FileKind::Directory { 2 } else { 1 },
            user_id: owner.0,
            group_id: owner.1,
            created_at: now,
            accessed_at: now,
            modified_at: now,
            metadata_changed_at: now,
            ..Inode::default()
        }
    }
}

/// This block is about file metadata operations
impl Inode {
    pub fn is_regular_file(&self) -> bool {
        self.file_kind == FileKind::RegularFile
    }

    pub fn is_dir(&self) -> bool {
        self.file_kind == FileKind::Directory
    }

    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    pub fn update_modified_at(&mut self, now: TimeDurationStruct) {
        self.metadata_changed_at = now;
        self.modified_at = now;
    }

    pub fn update_accessed_at(&mut self, now: TimeDurationStruct) {
        self.accessed_at = now;
    }

    pub fn update_changed_at(&mut self, now: TimeDurationStruct) {
        self.metadata_changed_at = now;
    }

    /// self-consistency of an allocated inode stored under `expected_id`
    pub fn validate(&self, expected_id: u64) -> Result<(), String> {
        if self.inode_number != expected_id {
            return Err(format!(
                "inode {expected_id} records number {}",
                self.inode_number
            ));
        }
        if !self.file_kind.is_valid() {
            return Err(format!("inode {expected_id} has no valid type"));
        }
        if self.hard_links == 0 {
            return Err(format!("inode {expected_id} is allocated with no links"));
        }
        if self.allocation_size < self.file_size {
            return Err(format!(
                "inode {expected_id} holds {} bytes in a {} byte allocation",
                self.file_size, self.allocation_size
            ));
        }
        Ok(())
    }
}

/// This block is about the block map
impl Inode {
    pub fn allocated_blocks(&self, block_size: u32) -> u64 {
        self.allocation_size / block_size as u64
    }

    /// physical block holding byte `offset`
    pub fn block_for_offset(&self, offset: u64, block_size: u32) -> Option<u64> {
        self.extents.lookup(offset / block_size as u64, block_size)
    }

    pub fn append_block(&mut self, block: u64, block_size: u32, flags: ExtentFlags) {
        let index = self.extents.total_blocks() as usize;
        if index < DIRECT_POINTERS {
            self.direct_blocks[index] = block;
        }
        self.extents.append_block(block, block_size, flags);
        self.allocation_size += block_size as u64;
        self.extent_count = self.extents.len() as u32;
    }

    /// shrink the allocation to `keep` blocks, returning the released blocks
    pub fn truncate_blocks(&mut self, keep: u64, block_size: u32) -> Vec<u64> {
        let released = self.extents.truncate_blocks(keep);
        for pointer in self.direct_blocks.iter_mut().skip(keep as usize) {
            *pointer = 0;
        }
        self.allocation_size = self.extents.total_blocks() * block_size as u64;
        self.file_size = self.file_size.min(self.allocation_size);
        self.extent_count = self.extents.len() as u32;
        released
    }

    pub fn direct_blocks(&self) -> Vec<u64> {
        self.direct_blocks
            .iter()
            .filter_map(|x| if *x != 0 { Some(*x) } else { None })
            .collect()
    }
}
