use serde::{Deserialize, Serialize};

use crate::{
    error::{FsError, FsResult},
    utils::{
        time_util::TimeDurationStruct,
        traits::{DigestInSelf, SerializeAndDigest},
    },
};

use super::{Layout, FS_MAGIC, FS_VERSION, RESERVED_BLOCKS, RESERVED_INODES};

type InodeCountType = u64;
type BlockCountType = u64;

/// The superblock of a volume
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SuperBlock {
    /// magic number
    pub magic: u32,
    pub version: u32,
    pub volume_id: u64,
    pub volume_name: String,
    /// data block size
    pub block_size: u32,
    pub cluster_size: u32,
    pub block_count: BlockCountType,
    pub free_blocks_count: BlockCountType,
    pub inode_count: InodeCountType,
    pub free_inodes: InodeCountType,
    pub reserved_blocks: BlockCountType,
    pub reserved_inodes: InodeCountType,
    pub layout: Layout,
    pub created_at: TimeDurationStruct,
    pub modified_at: Option<TimeDurationStruct>,
    pub last_mounted_at: Option<TimeDurationStruct>,
    pub last_checked_at: Option<TimeDurationStruct>,
    /// set when corruption was found and not repaired
    pub error_flag: bool,
    pub error_count: u64,
    /// to verify the integrity of this superblock
    pub digest: [u8; 32],
}

impl SuperBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        volume_id: u64,
        volume_name: &str,
        block_size: u32,
        cluster_size: u32,
        block_count: u64,
        inode_count: u64,
        layout: Layout,
        now: TimeDurationStruct,
    ) -> Self {
        Self {
            magic: FS_MAGIC,
            version: FS_VERSION,
            volume_id,
            volume_name: volume_name.to_string(),
            block_size,
            cluster_size,
            block_count,
            free_blocks_count: block_count,
            inode_count,
            free_inodes: inode_count,
            reserved_blocks: RESERVED_BLOCKS,
            reserved_inodes: RESERVED_INODES,
            layout,
            created_at: now,
            modified_at: None,
            last_mounted_at: None,
            last_checked_at: None,
            error_flag: false,
            error_count: 0,
            digest: [0u8; 32],
        }
    }
}

impl SuperBlock {
    pub fn update_last_mounted_at(&mut self, now: TimeDurationStruct) {
        self.last_mounted_at = Some(now);
    }

    pub fn update_last_checked_at(&mut self, now: TimeDurationStruct) {
        self.last_checked_at = Some(now);
    }

    pub fn update_modified_at(&mut self, now: TimeDurationStruct) {
        self.modified_at = Some(now);
    }

    /// the checks a mount performs: identity and non-empty geometry
    pub fn validate_identity(&self) -> FsResult<()> {
        if self.magic != FS_MAGIC {
            return Err(FsError::InvalidVolume(format!(
                "bad magic number {:#x}",
                self.magic
            )));
        }
        if self.version != FS_VERSION {
            return Err(FsError::InvalidVolume(format!(
                "unsupported version {:#x}",
                self.version
            )));
        }
        if self.block_count == 0 || self.inode_count == 0 {
            return Err(FsError::InvalidVolume(format!(
                "empty geometry: {} blocks, {} inodes",
                self.block_count, self.inode_count
            )));
        }
        Ok(())
    }

    /// every field-level check of a volume check
    pub fn validate(&self) -> FsResult<()> {
        self.validate_identity()?;
        if !self.block_size.is_power_of_two() {
            return Err(FsError::DiskCorrupt(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.cluster_size == 0 || self.cluster_size % self.block_size != 0 {
            return Err(FsError::DiskCorrupt(format!(
                "cluster size {} is not a multiple of block size {}",
                self.cluster_size, self.block_size
            )));
        }
        if self.free_blocks_count > self.block_count {
            return Err(FsError::DiskCorrupt(format!(
                "{} free blocks out of {}",
                self.free_blocks_count, self.block_count
            )));
        }
        if self.free_inodes > self.inode_count {
            return Err(FsError::DiskCorrupt(format!(
                "{} free inodes out of {}",
                self.free_inodes, self.inode_count
            )));
        }
        if self.reserved_blocks >= self.block_count || self.reserved_inodes >= self.inode_count {
            return Err(FsError::DiskCorrupt(
                "reserved area larger than the volume".into(),
            ));
        }
        if !self.layout.is_consistent() {
            return Err(FsError::DiskCorrupt("metadata regions overlap".into()));
        }
        Ok(())
    }

    pub fn used_blocks(&self) -> u64 {
        self.block_count - self.free_blocks_count
    }
}

impl DigestInSelf for SuperBlock {
    fn digest_field(&mut self) -> &mut [u8; 32] {
        &mut self.digest
    }
}

impl SerializeAndDigest for SuperBlock {}
