//! volume lifecycle: format, mount, unmount and the metadata header
use std::{
    collections::HashMap,
    sync::{atomic::AtomicU64, Arc},
};

use log::{info, warn};
use serde::Serialize;
use spin::{Mutex, RwLock};

use crate::{
    cache::{BlockCache, CacheLevel},
    coordinator::Coordinator,
    device::{BlockDevice, DevicePool},
    error::{FsError, FsResult},
    fs::{
        Bitmap, Directory, DirectoryEntry, FileKind, Inode, InodeTable, Layout, Region, SuperBlock,
        BLOCKS_PER_INODE, INODE_RECORD_SIZE, RESERVED_BLOCKS, RESERVED_INODES, ROOT_INODE,
    },
    journal::{Journal, JournalEntry, JournalPayload},
    object::{Credentials, FileAttributes, ObjectTable},
    stats::Statistics,
    utils::{
        fs_size_calculator::journal_capacity,
        time_util::Clock,
        traits::SerializeAndDigest,
    },
};

use super::{Volume, VolumeParams, VolumeState, VolumeType};

/// longest volume name accepted
const MAX_VOLUME_NAME: usize = 64;
/// bytes read from the first device to find the superblock
const SUPERBLOCK_PROBE: u64 = 4096;

/// services a volume shares with the rest of its instance
#[derive(Debug, Clone)]
pub struct VolumeEnv {
    pub global_cache: Arc<BlockCache>,
    pub stats: Arc<Statistics>,
    pub clock: Arc<dyn Clock>,
}

/// This block is about creating a volume
impl Volume {
    /// Lay out a new filesystem over `pool` and write its metadata header.
    ///
    /// Nothing is registered anywhere, so a failure leaves no trace once the
    /// pool is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        id: u64,
        name: &str,
        volume_type: VolumeType,
        requested_size: u64,
        pool: DevicePool,
        params: VolumeParams,
        owner: Credentials,
        env: VolumeEnv,
    ) -> FsResult<Volume> {
        if name.is_empty() || name.len() > MAX_VOLUME_NAME || name.contains('/') {
            return Err(FsError::InvalidArgument(format!("volume name {name:?}")));
        }
        let block_size = params.block_size;
        let block_count = requested_size / block_size as u64;
        let inode_count = block_count / BLOCKS_PER_INODE;
        if block_count <= RESERVED_BLOCKS || inode_count <= RESERVED_INODES + 1 {
            return Err(FsError::InvalidArgument(format!(
                "{requested_size} bytes is too small for a volume of {block_size} byte blocks"
            )));
        }
        let journal_size = if params.journal_enabled {
            params.journal_size
        } else {
            0
        };
        let layout = Layout::compute(block_count, inode_count, block_size, journal_size);
        let size = block_count * block_size as u64;
        let required = layout.header_bytes(block_size) + size;
        if pool.capacity_bytes() < required {
            return Err(FsError::InsufficientResources(format!(
                "volume {name} needs {required} bytes, devices provide {}",
                pool.capacity_bytes()
            )));
        }

        let now = env.clock.now();
        let mut block_bitmap = Bitmap::new(block_count);
        block_bitmap.reserve_leading(RESERVED_BLOCKS)?;
        // the root inode sits inside the reserved range and is counted on top of it
        let mut inode_bitmap = Bitmap::new(inode_count);
        inode_bitmap.reserve_leading(RESERVED_INODES + 1)?;

        let mut superblock = SuperBlock::new(
            id,
            name,
            block_size,
            params.cluster_size,
            block_count,
            inode_count,
            layout,
            now,
        );
        superblock.free_blocks_count = block_bitmap.count_free();
        superblock.free_inodes = inode_bitmap.count_free();

        let mut inodes = InodeTable::new(inode_count);
        let mut root = Inode::new(
            ROOT_INODE,
            FileKind::Directory,
            0o755,
            (owner.uid, owner.gid),
            now,
        );
        root.hard_links = 3;
        root.attributes = FileAttributes::DIRECTORY.bits();
        inodes.insert(root)?;
        let mut directories = HashMap::new();
        directories.insert(ROOT_INODE, Directory::new(ROOT_INODE));

        let journal = params
            .journal_enabled
            .then(|| Mutex::new(Journal::new(id, journal_capacity(journal_size, block_size))));
        let replication_factor = if volume_type.is_replicated() {
            params.replication_factor
        } else {
            1
        };

        let volume = Volume {
            id,
            name: name.to_string(),
            volume_type,
            size,
            block_size,
            replication_factor,
            params,
            layout,
            state: Mutex::new(VolumeState::Unmounted),
            pool,
            superblock: Mutex::new(superblock),
            inode_bitmap: Mutex::new(inode_bitmap),
            block_bitmap: Mutex::new(block_bitmap),
            inodes: RwLock::new(inodes),
            directories: RwLock::new(directories),
            acls: RwLock::new(HashMap::new()),
            journal,
            cache: BlockCache::new(CacheLevel::Volume, params.volume_cache_lines, env.stats.clone()),
            global_cache: env.global_cache,
            objects: ObjectTable::default(),
            stats: env.stats,
            clock: env.clock,
            replication_group: Mutex::new(None),
            directory_writer: std::sync::Mutex::new(()),
            journal_errors: AtomicU64::new(0),
        };
        volume.write_metadata()?;
        info!(
            "formatted volume {name} ({volume_type:?}): {block_count} blocks of {block_size}, {inode_count} inodes, {} header blocks",
            layout.header_blocks
        );
        Ok(volume)
    }
}

/// This block is about mounting and unmounting
impl Volume {
    pub fn mount(&self, coordinator: &Coordinator) -> FsResult<()> {
        info!("mounting volume {}", self.name);
        self.transition(&[VolumeState::Unmounted], VolumeState::Mounting)?;
        if let Err(e) = self.mount_steps(coordinator) {
            warn!("mounting volume {} failed: {e}", self.name);
            if let Some(journal) = &self.journal {
                journal.lock().halt();
            }
            if let Some(group) = self.replication_group.lock().take() {
                coordinator.leave_replication(self.id, group);
            }
            self.set_state(VolumeState::Unmounted);
            return Err(e);
        }
        self.superblock
            .lock()
            .update_last_mounted_at(self.clock.now());
        self.set_state(VolumeState::Mounted);
        Ok(())
    }

    fn mount_steps(&self, coordinator: &Coordinator) -> FsResult<()> {
        self.superblock.lock().validate_identity()?;
        if self.volume_type.is_replicated() {
            let group = coordinator.join_replication(self.id, &self.name, self.replication_factor)?;
            *self.replication_group.lock() = Some(group);
        }
        let pending = match &self.journal {
            Some(journal) => journal.lock().start(),
            None => Vec::new(),
        };
        self.pool.mount_all()?;
        self.recover(pending);
        Ok(())
    }

    /// redo or discard the entries an interrupted run left uncommitted
    pub(crate) fn recover(&self, pending: Vec<JournalEntry>) {
        for entry in pending {
            let redone = match self.redo(&entry.payload) {
                Ok(redone) => redone,
                Err(e) => {
                    warn!("volume {}: redo of #{} failed: {e}", self.name, entry.sequence);
                    false
                }
            };
            if redone {
                info!("volume {}: redid #{} {:?}", self.name, entry.sequence, entry.operation);
                self.journal_commit(Some(entry.sequence));
            } else {
                warn!(
                    "volume {}: discarding #{} {:?}",
                    self.name, entry.sequence, entry.operation
                );
                self.journal_discard(Some(entry.sequence));
                self.superblock.lock().error_count += 1;
            }
        }
        self.checkpoint_journal();
    }

    /// complete one journaled mutation, false when it cannot be redone safely
    fn redo(&self, payload: &JournalPayload) -> FsResult<bool> {
        let now = self.clock.now();
        match payload {
            JournalPayload::Create {
                parent,
                name,
                inode,
                kind,
            } => {
                let Some(entry) = self.inodes.read().get(*inode).map(|i| DirectoryEntry {
                    name: name.clone(),
                    kind: i.file_kind,
                    target: *inode,
                    size: i.file_size,
                    created_at: i.created_at,
                    modified_at: i.modified_at,
                    accessed_at: i.accessed_at,
                }) else {
                    return Ok(false);
                };
                if entry.kind != *kind {
                    return Ok(false);
                }
                let inserted = match self.directories.write().get_mut(parent) {
                    Some(dir) if !dir.contains(name) => dir.insert(entry).is_ok(),
                    Some(dir) => dir.entry(name).is_some_and(|e| e.target == *inode),
                    None => return Ok(false),
                };
                if inserted {
                    self.persist_directory(*parent, None)?;
                }
                Ok(inserted)
            }
            JournalPayload::Write {
                inode, new_size, ..
            } => {
                let mut inodes = self.inodes.write();
                let Some(inode) = inodes.get_mut(*inode) else {
                    return Ok(false);
                };
                if inode.allocation_size < *new_size {
                    return Ok(false);
                }
                inode.file_size = inode.file_size.max(*new_size);
                inode.update_modified_at(now);
                Ok(true)
            }
            JournalPayload::Delete {
                parent,
                name,
                inode,
            } => {
                let removed = match self.directories.write().get_mut(parent) {
                    Some(dir) if dir.entry(name).is_some_and(|e| e.target == *inode) => {
                        dir.remove(name);
                        true
                    }
                    _ => false,
                };
                if removed {
                    self.persist_directory(*parent, None)?;
                }
                if self.inodes.read().get(*inode).is_some() {
                    self.release_inode(*inode)?;
                }
                Ok(true)
            }
            JournalPayload::Rename {
                inode,
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => {
                let mut directories = self.directories.write();
                let points_at = |dirs: &HashMap<u64, Directory>, parent: &u64, name: &str| {
                    dirs.get(parent)
                        .and_then(|d| d.entry(name))
                        .is_some_and(|e| e.target == *inode)
                };
                let at_new = points_at(&*directories, new_parent, new_name.as_str());
                let at_old = points_at(&*directories, old_parent, old_name.as_str());
                let done = match (at_old, at_new) {
                    (true, true) => {
                        if let Some(dir) = directories.get_mut(old_parent) {
                            dir.remove(old_name);
                        }
                        true
                    }
                    (false, true) => true,
                    (true, false) => {
                        let target_free = directories
                            .get(new_parent)
                            .is_some_and(|d| !d.contains(new_name));
                        let moved = if target_free {
                            directories
                                .get_mut(old_parent)
                                .and_then(|d| d.remove(old_name))
                        } else {
                            None
                        };
                        match (moved, directories.get_mut(new_parent)) {
                            (Some(mut entry), Some(dir)) => {
                                entry.name = new_name.clone();
                                dir.insert(entry).is_ok()
                            }
                            _ => false,
                        }
                    }
                    (false, false) => false,
                };
                drop(directories);
                if done {
                    self.persist_directory(*old_parent, None)?;
                    if new_parent != old_parent {
                        self.persist_directory(*new_parent, None)?;
                    }
                }
                Ok(done)
            }
            JournalPayload::SetAttribute { inode, attributes } => {
                match self.inodes.write().get_mut(*inode) {
                    Some(inode) => {
                        inode.attributes = *attributes;
                        inode.update_changed_at(now);
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            JournalPayload::Truncate { inode, new_size } => {
                let allocation = match self.inodes.read().get(*inode) {
                    Some(i) => i.allocation_size,
                    None => return Ok(false),
                };
                if *new_size > allocation {
                    return Ok(false);
                }
                self.shrink_allocation(*inode, *new_size, None)?;
                if let Some(inode) = self.inodes.write().get_mut(*inode) {
                    inode.file_size = *new_size;
                    inode.update_modified_at(now);
                }
                Ok(true)
            }
        }
    }

    /// Flush, stop the journal, write the header and release the devices.
    ///
    /// A device error on the way leaves the volume `Failed`.
    pub fn unmount(&self, coordinator: &Coordinator) -> FsResult<()> {
        info!("unmounting volume {}", self.name);
        self.transition(&[VolumeState::Mounted], VolumeState::Unmounting)?;
        if let Err(e) = self.unmount_steps() {
            self.fail(&e);
            return Err(e);
        }
        if let Some(group) = self.replication_group.lock().take() {
            coordinator.leave_replication(self.id, group);
        }
        self.set_state(VolumeState::Unmounted);
        Ok(())
    }

    fn unmount_steps(&self) -> FsResult<()> {
        self.close_all_objects()?;
        self.flush_cache(&self.cache)?;
        if let Some(journal) = &self.journal {
            journal.lock().stop();
        }
        self.write_metadata()?;
        self.pool.flush()?;
        self.pool.unmount_all()
    }

    /// last step of deleting a volume: drop what other instances share
    pub(crate) fn release(&self, coordinator: &Coordinator) {
        if let Some(group) = self.replication_group.lock().take() {
            coordinator.leave_replication(self.id, group);
        }
        self.global_cache.invalidate_volume(self.id);
        self.cache.invalidate_volume(self.id);
    }

    pub fn info(&self) -> VolumeInfo {
        let sb = self.superblock.lock().clone();
        VolumeInfo {
            id: self.id,
            name: self.name.clone(),
            volume_type: self.volume_type,
            state: self.state(),
            size: self.size,
            used_space: self.size - sb.free_blocks_count * self.block_size as u64,
            free_space: sb.free_blocks_count * self.block_size as u64,
            block_size: self.block_size,
            cluster_size: sb.cluster_size,
            replication_factor: self.replication_factor,
            replication_group: self.replication_group(),
            devices: self.pool.devices().iter().map(|d| d.path.clone()).collect(),
            inode_count: sb.inode_count,
            free_inodes: sb.free_inodes,
            open_handles: self.objects.handle_count(),
            error_count: sb.error_count,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub id: u64,
    pub name: String,
    pub volume_type: VolumeType,
    pub state: VolumeState,
    pub size: u64,
    pub used_space: u64,
    pub free_space: u64,
    pub block_size: u32,
    pub cluster_size: u32,
    pub replication_factor: u32,
    pub replication_group: Option<u64>,
    pub devices: Vec<String>,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub open_handles: usize,
    pub error_count: u64,
}

fn words_to_region(words: &[u32], region: Region, block_size: u32) -> Vec<u8> {
    let mut bytes = vec![0u8; (region.blocks * block_size as u64) as usize];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn region_to_words(bytes: &[u8], region: Region) -> Vec<u32> {
    bytes[..region.bytes as usize]
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// This block is about the metadata header
impl Volume {
    /// persist superblock, bitmaps, inode records and the journal ring
    pub fn write_metadata(&self) -> FsResult<()> {
        let bs = self.block_size;
        let layout = self.layout;
        let inode_words = self.inode_bitmap.lock().to_words();
        let block_words = self.block_bitmap.lock().to_words();
        let mut superblock = {
            let mut live = self.superblock.lock();
            live.update_modified_at(self.clock.now());
            live.clone()
        };

        let mut sb_block = vec![0u8; bs as usize];
        superblock.serialize_into_slot(&mut sb_block)?;

        let record = INODE_RECORD_SIZE as usize;
        let mut table = vec![0u8; (layout.inode_table.blocks * bs as u64) as usize];
        for (index, inode) in self.inodes.read().iter() {
            let at = index as usize * record;
            inode.clone().serialize_into_slot(&mut table[at..at + record])?;
        }

        let mut ring = vec![0u8; (layout.journal.blocks * bs as u64) as usize];
        if let Some(journal) = &self.journal {
            for (slot, block) in journal.lock().encode_slots(bs) {
                let at = slot as usize * bs as usize;
                ring[at..at + bs as usize].copy_from_slice(&block);
            }
        }

        let regions = [
            (layout.superblock, sb_block),
            (layout.inode_bitmap, words_to_region(&inode_words, layout.inode_bitmap, bs)),
            (layout.block_bitmap, words_to_region(&block_words, layout.block_bitmap, bs)),
            (layout.inode_table, table),
            (layout.journal, ring),
        ];
        for (region, bytes) in regions {
            if region.blocks > 0 {
                self.pool.write_blocks(region.start, region.blocks, &bytes)?;
            }
        }
        Ok(())
    }

    /// Read the metadata header of a formatted device set, for offline inspection.
    pub fn read_metadata(devices: Vec<(String, Arc<dyn BlockDevice>)>) -> FsResult<OnDiskImage> {
        let (_, first) = devices
            .first()
            .ok_or_else(|| FsError::InvalidArgument("no device given".into()))?;
        let native = first.block_size() as u64;
        let probe = (SUPERBLOCK_PROBE / native).clamp(1, first.capacity_blocks());
        let head = first.read_blocks(0, probe)?;
        let (superblock, _) = <SuperBlock as SerializeAndDigest>::deserialize(&head)
            .map_err(|e| FsError::InvalidVolume(format!("no readable superblock: {e}")))?;
        superblock.validate_identity()?;

        let pool = DevicePool::new(superblock.block_size, devices)?;
        let layout = superblock.layout;
        let read = |region: Region| -> FsResult<Vec<u8>> {
            if region.blocks == 0 {
                return Ok(Vec::new());
            }
            pool.read_blocks(region.start, region.blocks)
        };

        let inode_bitmap = Bitmap::from_words(
            region_to_words(&read(layout.inode_bitmap)?, layout.inode_bitmap),
            superblock.inode_count,
        )?;
        let block_bitmap = Bitmap::from_words(
            region_to_words(&read(layout.block_bitmap)?, layout.block_bitmap),
            superblock.block_count,
        )?;

        let mut inodes = Vec::new();
        let mut unreadable_inodes = Vec::new();
        let table = read(layout.inode_table)?;
        for (index, slot) in table
            .chunks_exact(INODE_RECORD_SIZE as usize)
            .take(superblock.inode_count as usize)
            .enumerate()
        {
            if slot.iter().all(|b| *b == 0) {
                continue;
            }
            match <Inode as SerializeAndDigest>::deserialize(slot) {
                Ok((inode, _)) => inodes.push(inode),
                Err(_) => unreadable_inodes.push(index as u64),
            }
        }
        let journal = Journal::decode_slots(&read(layout.journal)?, superblock.block_size);

        Ok(OnDiskImage {
            superblock,
            inode_bitmap,
            block_bitmap,
            inodes,
            unreadable_inodes,
            journal,
        })
    }
}

/// The metadata header as found on the devices
#[derive(Debug, Clone)]
pub struct OnDiskImage {
    pub superblock: SuperBlock,
    pub inode_bitmap: Bitmap,
    pub block_bitmap: Bitmap,
    pub inodes: Vec<Inode>,
    /// slots holding a record that fails its digest
    pub unreadable_inodes: Vec<u64>,
    pub journal: Vec<JournalEntry>,
}

impl OnDiskImage {
    /// every inconsistency between the header's parts
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.superblock.validate() {
            problems.push(e.to_string());
        }
        if self.block_bitmap.count_free() != self.superblock.free_blocks_count {
            problems.push(format!(
                "block bitmap has {} free blocks, superblock records {}",
                self.block_bitmap.count_free(),
                self.superblock.free_blocks_count
            ));
        }
        if self.inode_bitmap.count_free() != self.superblock.free_inodes {
            problems.push(format!(
                "inode bitmap has {} free inodes, superblock records {}",
                self.inode_bitmap.count_free(),
                self.superblock.free_inodes
            ));
        }
        for inode in &self.inodes {
            if let Err(e) = inode.validate(inode.inode_number) {
                problems.push(e);
            }
            if !self.inode_bitmap.test(inode.inode_number).unwrap_or(false) {
                problems.push(format!(
                    "inode {} has a record but a clear bit",
                    inode.inode_number
                ));
            }
        }
        for index in &self.unreadable_inodes {
            problems.push(format!("inode record {index} fails its digest"));
        }
        problems
    }

    pub fn pending_journal_entries(&self) -> usize {
        self.journal.iter().filter(|e| !e.committed).count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::FsConfig,
        device::MemoryDevice,
        utils::time_util::{ManualClock, TimeDurationStruct},
    };

    pub(crate) fn params() -> VolumeParams {
        VolumeParams {
            block_size: 1024,
            cluster_size: 4096,
            journal_enabled: true,
            journal_size: 64 * 1024,
            volume_cache_lines: 64,
            file_cache_lines: 8,
            directory_cache_lines: 4,
            replication_factor: 1,
        }
    }

    pub(crate) fn env() -> VolumeEnv {
        let stats = Arc::new(Statistics::default());
        VolumeEnv {
            global_cache: Arc::new(BlockCache::new(CacheLevel::Global, 128, stats.clone())),
            stats,
            clock: Arc::new(ManualClock::new(TimeDurationStruct::from_nanos(1_000_000_000))),
        }
    }

    pub(crate) fn coordinator(env: &VolumeEnv) -> Coordinator {
        Coordinator::new(&FsConfig::default(), env.clock.clone(), env.stats.clone())
    }

    /// a formatted 2 MiB volume on a 4 MiB memory device
    pub(crate) fn formatted_volume(name: &str) -> anyhow::Result<(Volume, Arc<MemoryDevice>)> {
        let device = Arc::new(MemoryDevice::new("/dev/mem0", 4 << 20, 512));
        let pool = DevicePool::new(1024, vec![("/dev/mem0".into(), device.clone() as Arc<dyn BlockDevice>)])?;
        let volume = Volume::format(
            7,
            name,
            VolumeType::Local,
            2 << 20,
            pool,
            params(),
            Credentials::new(0, 0),
            env(),
        )?;
        Ok((volume, device))
    }

    pub(crate) fn mounted_volume(name: &str) -> anyhow::Result<(Arc<Volume>, Arc<MemoryDevice>)> {
        let (volume, device) = formatted_volume(name)?;
        let coordinator = coordinator(&VolumeEnv {
            global_cache: volume.global_cache.clone(),
            stats: volume.stats.clone(),
            clock: volume.clock.clone(),
        });
        volume.mount(&coordinator)?;
        Ok((Arc::new(volume), device))
    }

    #[test]
    fn test_format_geometry() -> anyhow::Result<()> {
        let (volume, _) = formatted_volume("geometry")?;
        let sb = volume.superblock();
        assert_eq!(sb.block_count, 2048);
        assert_eq!(sb.inode_count, 512);
        assert_eq!(sb.free_blocks_count, 2048 - RESERVED_BLOCKS);
        assert_eq!(sb.free_inodes, 512 - RESERVED_INODES - 1);
        let root = volume.inodes.read().expect(ROOT_INODE)?.clone();
        assert!(root.is_dir());
        assert_eq!(root.permissions(), 0o755);
        assert_eq!(root.hard_links, 3);
        assert!(FileAttributes::from_bits_truncate(root.attributes).contains(FileAttributes::DIRECTORY));
        assert_eq!(volume.used_space() + volume.free_space(), volume.size());
        assert_eq!(volume.state(), VolumeState::Unmounted);
        Ok(())
    }

    #[test]
    fn test_format_rejects_small_devices() {
        let device = Arc::new(MemoryDevice::new("/dev/small", 1 << 20, 512));
        let pool = DevicePool::new(1024, vec![("/dev/small".into(), device as Arc<dyn BlockDevice>)]).unwrap();
        let result = Volume::format(
            1,
            "small",
            VolumeType::Local,
            2 << 20,
            pool,
            params(),
            Credentials::new(0, 0),
            env(),
        );
        assert!(matches!(result, Err(FsError::InsufficientResources(_))));
    }

    #[test]
    fn test_mount_state_machine() -> anyhow::Result<()> {
        let (volume, device) = formatted_volume("states")?;
        let coordinator = coordinator(&env());
        volume.mount(&coordinator)?;
        assert_eq!(volume.state(), VolumeState::Mounted);
        assert!(device.is_mounted());
        assert!(volume.superblock().last_mounted_at.is_some());
        assert!(matches!(
            volume.mount(&coordinator),
            Err(FsError::InvalidDeviceState(_))
        ));
        volume.unmount(&coordinator)?;
        assert_eq!(volume.state(), VolumeState::Unmounted);
        assert!(!device.is_mounted());
        assert!(volume.unmount(&coordinator).is_err());
        Ok(())
    }

    #[test]
    fn test_failed_device_mount_reverts() -> anyhow::Result<()> {
        let (volume, device) = formatted_volume("revert")?;
        let coordinator = coordinator(&env());
        device
            .faults
            .fail_mount
            .store(true, std::sync::atomic::Ordering::Release);
        assert!(volume.mount(&coordinator).is_err());
        assert_eq!(volume.state(), VolumeState::Unmounted);

        device
            .faults
            .fail_mount
            .store(false, std::sync::atomic::Ordering::Release);
        volume.mount(&coordinator)?;
        device
            .faults
            .fail_unmount
            .store(true, std::sync::atomic::Ordering::Release);
        assert!(volume.unmount(&coordinator).is_err());
        assert_eq!(volume.state(), VolumeState::Failed);
        assert!(volume.superblock().error_flag);
        Ok(())
    }

    #[test]
    fn test_bad_magic_refuses_mount() -> anyhow::Result<()> {
        let (volume, _) = formatted_volume("magic")?;
        volume.superblock.lock().magic = 0;
        assert!(matches!(
            volume.mount(&coordinator(&env())),
            Err(FsError::InvalidVolume(_))
        ));
        assert_eq!(volume.state(), VolumeState::Unmounted);
        Ok(())
    }

    #[test]
    fn test_header_round_trip() -> anyhow::Result<()> {
        let (volume, device) = mounted_volume("header")?;
        let blocks = volume.allocate_blocks(3)?;
        volume.unmount(&coordinator(&env()))?;

        let image = Volume::read_metadata(vec![("/dev/mem0".into(), device as Arc<dyn BlockDevice>)])?;
        assert_eq!(image.superblock.volume_name, "header");
        assert_eq!(
            image.superblock.free_blocks_count,
            volume.superblock().free_blocks_count
        );
        assert!(blocks
            .iter()
            .all(|b| image.block_bitmap.test(*b).unwrap_or(false)));
        assert_eq!(image.inodes.len(), 1);
        assert_eq!(image.inodes[0].inode_number, ROOT_INODE);
        assert!(image.problems().is_empty());
        Ok(())
    }

    #[test]
    fn test_recovery_redoes_and_discards() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("recovery")?;
        let coordinator = coordinator(&env());
        let ino = volume.allocate_inode()?;
        volume.inodes.write().insert(Inode::new(
            ino,
            FileKind::RegularFile,
            0o644,
            (0, 0),
            volume.now(),
        ))?;
        // a create whose directory entry never landed, and a write past the allocation
        volume.journal_append(JournalPayload::Create {
            parent: ROOT_INODE,
            name: "orphan".into(),
            inode: ino,
            kind: FileKind::RegularFile,
        });
        volume.journal_append(JournalPayload::Write {
            inode: ino,
            offset: 0,
            length: 10,
            new_size: 10,
        });
        volume.fail(&FsError::Io(std::io::Error::other("power loss")));
        let errors_before = volume.superblock().error_count;

        volume.repair()?;
        assert_eq!(volume.state(), VolumeState::Unmounted);
        volume.mount(&coordinator)?;
        assert_eq!(
            volume.directories.read()[&ROOT_INODE]
                .entry("orphan")
                .map(|e| e.target),
            Some(ino)
        );
        assert_eq!(volume.superblock().error_count, errors_before + 1);
        assert_eq!(volume.journal_pending(), 0);
        Ok(())
    }
}
