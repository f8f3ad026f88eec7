//! volumes: one superblock, two bitmaps, an inode table and a journal over a device pool
pub mod check;
pub mod io;
pub mod manager;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use spin::{Mutex, RwLock};

use crate::{
    cache::BlockCache,
    device::DevicePool,
    error::{FsError, FsResult},
    fs::{Bitmap, Directory, InodeTable, Layout, SuperBlock},
    journal::{Journal, JournalPayload},
    object::{Acl, ObjectTable},
    stats::Statistics,
    utils::time_util::{Clock, TimeDurationStruct},
};

pub use check::CheckReport;
pub use manager::{OnDiskImage, VolumeEnv, VolumeInfo};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeType {
    Local,
    Distributed,
    Replicated,
    Hybrid,
}

impl VolumeType {
    /// mounting this kind of volume joins a replication group
    pub fn is_replicated(self) -> bool {
        matches!(self, VolumeType::Distributed | VolumeType::Replicated)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
    Checking,
    Repairing,
    Failed,
}

/// per-volume knobs taken from the instance configuration
#[derive(Debug, Clone, Copy)]
pub struct VolumeParams {
    pub block_size: u32,
    pub cluster_size: u32,
    pub journal_enabled: bool,
    pub journal_size: u64,
    pub volume_cache_lines: usize,
    pub file_cache_lines: usize,
    pub directory_cache_lines: usize,
    pub replication_factor: u32,
}

/// A mountable storage unit.
///
/// Everything below the state lives behind its own lock. Locks nest in the
/// order directories → inodes → bitmaps → superblock, and no spin lock is held
/// across device I/O.
#[derive(Debug)]
pub struct Volume {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) volume_type: VolumeType,
    /// usable bytes, a whole number of blocks
    pub(crate) size: u64,
    pub(crate) block_size: u32,
    pub(crate) replication_factor: u32,
    pub(crate) params: VolumeParams,
    pub(crate) layout: Layout,
    pub(crate) state: Mutex<VolumeState>,
    pub(crate) pool: DevicePool,
    pub(crate) superblock: Mutex<SuperBlock>,
    pub(crate) inode_bitmap: Mutex<Bitmap>,
    pub(crate) block_bitmap: Mutex<Bitmap>,
    pub(crate) inodes: RwLock<InodeTable>,
    /// contents of every directory, by inode number
    pub(crate) directories: RwLock<HashMap<u64, Directory>>,
    pub(crate) acls: RwLock<HashMap<u64, Acl>>,
    pub(crate) journal: Option<Mutex<Journal>>,
    pub(crate) cache: BlockCache,
    pub(crate) global_cache: Arc<BlockCache>,
    pub(crate) objects: ObjectTable,
    pub(crate) stats: Arc<Statistics>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) replication_group: Mutex<Option<u64>>,
    /// serializes directory write-out so older snapshots never land last
    pub(crate) directory_writer: std::sync::Mutex<()>,
    pub(crate) journal_errors: AtomicU64,
}

/// This block is about identity and state
impl Volume {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_type(&self) -> VolumeType {
        self.volume_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn replication_factor(&self) -> u32 {
        self.replication_factor
    }

    pub fn replication_group(&self) -> Option<u64> {
        *self.replication_group.lock()
    }

    pub fn state(&self) -> VolumeState {
        *self.state.lock()
    }

    pub fn free_space(&self) -> u64 {
        self.superblock.lock().free_blocks_count * self.block_size as u64
    }

    pub fn used_space(&self) -> u64 {
        self.size - self.free_space()
    }

    pub fn superblock(&self) -> SuperBlock {
        self.superblock.lock().clone()
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn now(&self) -> TimeDurationStruct {
        self.clock.now()
    }

    /// move from one of `from` to `to`, failing with the state found otherwise
    pub(crate) fn transition(&self, from: &[VolumeState], to: VolumeState) -> FsResult<VolumeState> {
        let mut state = self.state.lock();
        if !from.contains(&*state) {
            return Err(FsError::InvalidDeviceState(format!(
                "volume {} is {:?}, cannot become {:?}",
                self.name, *state, to
            )));
        }
        let previous = *state;
        *state = to;
        debug!("volume {}: {previous:?} -> {to:?}", self.name);
        Ok(previous)
    }

    pub(crate) fn set_state(&self, to: VolumeState) {
        let mut state = self.state.lock();
        if to == VolumeState::Failed {
            error!("volume {} failed while {:?}", self.name, *state);
        }
        *state = to;
    }

    pub(crate) fn require_mounted(&self) -> FsResult<()> {
        let state = self.state();
        if state != VolumeState::Mounted {
            return Err(FsError::InvalidDeviceState(format!(
                "volume {} is {state:?}",
                self.name
            )));
        }
        Ok(())
    }

    /// a fatal error: stop journaling without committing and fail the volume
    pub(crate) fn fail(&self, cause: &FsError) {
        error!("volume {}: {cause}", self.name);
        if let Some(journal) = &self.journal {
            journal.lock().halt();
        }
        let mut sb = self.superblock.lock();
        sb.error_flag = true;
        sb.error_count += 1;
        drop(sb);
        self.set_state(VolumeState::Failed);
    }
}

/// This block is about allocation, bitmap first and superblock second
impl Volume {
    /// allocate `count` blocks at once, all or nothing
    pub fn allocate_blocks(&self, count: u64) -> FsResult<Vec<u64>> {
        let mut bitmap = self.block_bitmap.lock();
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match bitmap.allocate() {
                Some(block) => blocks.push(block),
                None => {
                    for block in blocks {
                        // just set by us
                        let _ = bitmap.free(block);
                    }
                    return Err(FsError::DiskFull(self.name.clone()));
                }
            }
        }
        self.superblock.lock().free_blocks_count -= count;
        debug!("volume {}: allocated blocks {blocks:?}", self.name);
        Ok(blocks)
    }

    /// release blocks and drop their cached copies
    pub fn free_blocks(&self, blocks: &[u64]) -> FsResult<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let mut freed = 0;
        let mut first_error = None;
        {
            let mut bitmap = self.block_bitmap.lock();
            for block in blocks {
                match bitmap.free(*block) {
                    Ok(()) => freed += 1,
                    Err(e) => {
                        warn!("volume {}: freeing block {block}: {e}", self.name);
                        first_error.get_or_insert(e);
                    }
                }
            }
            self.superblock.lock().free_blocks_count += freed;
        }
        for block in blocks {
            self.cache.invalidate((self.id, *block));
            self.global_cache.invalidate((self.id, *block));
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn allocate_inode(&self) -> FsResult<u64> {
        let mut bitmap = self.inode_bitmap.lock();
        let inode = bitmap
            .allocate()
            .ok_or_else(|| FsError::DiskFull(format!("{}: no free inode", self.name)))?;
        self.superblock.lock().free_inodes -= 1;
        Ok(inode)
    }

    pub fn free_inode(&self, inode: u64) -> FsResult<()> {
        let mut bitmap = self.inode_bitmap.lock();
        bitmap.free(inode)?;
        self.superblock.lock().free_inodes += 1;
        Ok(())
    }

    /// remove an inode from the table and give back its number and blocks
    pub(crate) fn release_inode(&self, inode: u64) -> FsResult<()> {
        let removed = self.inodes.write().remove(inode);
        self.directories.write().remove(&inode);
        self.acls.write().remove(&inode);
        if let Some(removed) = removed {
            let blocks: Vec<u64> = removed.extents.blocks().collect();
            self.free_blocks(&blocks)?;
        }
        self.free_inode(inode)
    }
}

/// This block is about best-effort journaling
impl Volume {
    /// append an entry; failures are logged and the operation goes on unjournaled
    pub(crate) fn journal_append(&self, payload: JournalPayload) -> Option<u64> {
        let journal = self.journal.as_ref()?;
        let result = journal.lock().append(payload, self.clock.now());
        match result {
            Ok(sequence) => {
                self.stats.inc_journal_ops();
                Some(sequence)
            }
            Err(e) => {
                self.journal_errors.fetch_add(1, Ordering::Relaxed);
                warn!("volume {}: journaling skipped: {e}", self.name);
                None
            }
        }
    }

    pub(crate) fn journal_commit(&self, sequence: Option<u64>) {
        if let (Some(journal), Some(sequence)) = (&self.journal, sequence) {
            if let Err(e) = journal.lock().commit(sequence) {
                self.journal_errors.fetch_add(1, Ordering::Relaxed);
                warn!("volume {}: commit of #{sequence} failed: {e}", self.name);
            }
        }
    }

    /// forget the entry of an operation that failed before changing anything
    pub(crate) fn journal_discard(&self, sequence: Option<u64>) {
        if let (Some(journal), Some(sequence)) = (&self.journal, sequence) {
            if let Err(e) = journal.lock().discard(sequence) {
                warn!("volume {}: discard of #{sequence} failed: {e}", self.name);
            }
        }
    }

    /// journal failures seen since creation
    pub fn journal_errors(&self) -> u64 {
        self.journal_errors.load(Ordering::Relaxed)
    }

    pub fn journal_pending(&self) -> usize {
        self.journal.as_ref().map_or(0, |j| j.lock().pending())
    }

    /// trim committed entries, returning how many went away
    pub fn checkpoint_journal(&self) -> usize {
        self.journal.as_ref().map_or(0, |j| j.lock().checkpoint())
    }
}
