//! volume check and repair
use std::collections::{HashMap, HashSet, VecDeque};

use log::{info, warn};
use serde::Serialize;

use crate::{
    error::{FsError, FsResult},
    fs::{Bitmap, Directory, FileKind, InodeTable, RESERVED_BLOCKS, RESERVED_INODES, ROOT_INODE},
};

use super::{Volume, VolumeState};

/// What a check found and, when repairing, fixed
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub problems: Vec<String>,
    pub repaired: usize,
    pub inodes_checked: usize,
    pub directories_checked: usize,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

struct Scan<'a> {
    volume: &'a Volume,
    repair: bool,
    report: CheckReport,
    /// directories whose contents changed and must be written out
    touched: HashSet<u64>,
    /// deleted inodes still held open, unlinked until their last close
    unlinked_open: HashSet<u64>,
}

impl Scan<'_> {
    /// report a problem; without repair the first one ends the check
    fn found(&mut self, problem: String) -> FsResult<()> {
        if !self.repair {
            return Err(FsError::DiskCorrupt(problem));
        }
        if self.report.problems.is_empty() {
            self.volume.set_state(VolumeState::Repairing);
        }
        warn!("volume {}: repairing: {problem}", self.volume.name);
        self.report.problems.push(problem);
        self.report.repaired += 1;
        Ok(())
    }

    fn check_inodes(&mut self, inodes: &mut InodeTable, block_count: u64) -> FsResult<()> {
        let bs = self.volume.block_size;
        let mut claimed = HashSet::new();
        let mut invalid = Vec::new();
        for (index, inode) in inodes.iter_mut() {
            self.report.inodes_checked += 1;
            if inode.inode_number != index {
                self.found(format!(
                    "inode {index} records number {}",
                    inode.inode_number
                ))?;
                inode.inode_number = index;
            }
            if !inode.file_kind.is_valid() {
                self.found(format!("inode {index} has no valid type"))?;
                invalid.push(index);
                continue;
            }
            if inode.hard_links == 0 && !self.unlinked_open.contains(&index) {
                self.found(format!("inode {index} is allocated with no links"))?;
                inode.hard_links = if inode.is_dir() { 2 } else { 1 };
            }
            if let Err(problem) = inode.extents.validate(block_count, bs) {
                self.found(format!("inode {index}: {problem}"))?;
                inode.truncate_blocks(0, bs);
            }
            let shared = inode
                .extents
                .blocks()
                .position(|block| !claimed.insert(block));
            if let Some(at) = shared {
                self.found(format!(
                    "inode {index} shares its block {at} with another inode"
                ))?;
                inode.truncate_blocks(at as u64, bs);
            }
            if inode.allocation_size < inode.file_size {
                self.found(format!(
                    "inode {index} holds {} bytes in a {} byte allocation",
                    inode.file_size, inode.allocation_size
                ))?;
                inode.file_size = inode.allocation_size;
            }
        }
        for index in invalid {
            inodes.remove(index);
        }
        Ok(())
    }

    /// walk the tree from the root, every directory is reached exactly once
    fn check_tree(
        &mut self,
        inodes: &mut InodeTable,
        directories: &mut HashMap<u64, Directory>,
    ) -> FsResult<()> {
        let listed: Vec<u64> = directories.keys().copied().collect();
        for dir in listed {
            if !inodes.get(dir).is_some_and(|i| i.is_dir()) {
                self.found(format!("directory contents stored for non-directory {dir}"))?;
                directories.remove(&dir);
            }
        }
        let dir_inodes: Vec<u64> = inodes
            .iter()
            .filter(|(_, i)| i.is_dir())
            .map(|(index, _)| index)
            .collect();
        for dir in dir_inodes {
            if !directories.contains_key(&dir) {
                self.found(format!("directory {dir} has no contents"))?;
                directories.insert(dir, Directory::new(ROOT_INODE));
                self.touched.insert(dir);
            }
        }

        let mut reached = HashSet::from([ROOT_INODE]);
        let mut queue = VecDeque::from([ROOT_INODE]);
        if let Some(root) = directories.get_mut(&ROOT_INODE) {
            root.parent = ROOT_INODE;
        }
        while let Some(dir) = queue.pop_front() {
            self.report.directories_checked += 1;
            let Some(names) = directories
                .get(&dir)
                .map(|d| d.entries.keys().cloned().collect::<Vec<_>>())
            else {
                continue;
            };
            for name in names {
                let Some(entry) = directories.get(&dir).and_then(|d| d.entry(&name)).cloned() else {
                    continue;
                };
                if entry.name != name {
                    self.found(format!("entry {name:?} of {dir} is named {:?}", entry.name))?;
                    if let Some(e) = directories.get_mut(&dir).and_then(|d| d.entry_mut(&name)) {
                        e.name = name.clone();
                    }
                    self.touched.insert(dir);
                }
                let dangling = match inodes.get(entry.target) {
                    None => {
                        self.found(format!(
                            "entry {name:?} of {dir} points at free inode {}",
                            entry.target
                        ))?;
                        true
                    }
                    Some(_) if reached.contains(&entry.target) => {
                        self.found(format!(
                            "entry {name:?} of {dir} links inode {} a second time",
                            entry.target
                        ))?;
                        true
                    }
                    Some(target) => {
                        if target.file_kind != entry.kind {
                            self.found(format!(
                                "entry {name:?} of {dir} says {:?}, inode says {:?}",
                                entry.kind, target.file_kind
                            ))?;
                            let kind = target.file_kind;
                            if let Some(e) =
                                directories.get_mut(&dir).and_then(|d| d.entry_mut(&name))
                            {
                                e.kind = kind;
                            }
                            self.touched.insert(dir);
                        }
                        false
                    }
                };
                if dangling {
                    if let Some(d) = directories.get_mut(&dir) {
                        d.remove(&name);
                    }
                    self.touched.insert(dir);
                    continue;
                }
                reached.insert(entry.target);
                if let Some(child) = directories.get_mut(&entry.target) {
                    if child.parent != dir {
                        let recorded = child.parent;
                        child.parent = dir;
                        self.found(format!(
                            "directory {} names {recorded} as parent, found under {dir}",
                            entry.target
                        ))?;
                        self.touched.insert(entry.target);
                    }
                    queue.push_back(entry.target);
                }
            }
        }

        let orphans: Vec<u64> = inodes
            .iter()
            .map(|(index, _)| index)
            .filter(|index| {
                *index > RESERVED_INODES
                    && !reached.contains(index)
                    && !self.unlinked_open.contains(index)
            })
            .collect();
        for orphan in orphans {
            self.found(format!("inode {orphan} is not reachable from the root"))?;
            inodes.remove(orphan);
            directories.remove(&orphan);
            self.touched.remove(&orphan);
        }
        Ok(())
    }

    /// bitmaps must match what the inode table references
    fn check_bitmaps(
        &mut self,
        inodes: &InodeTable,
        inode_bitmap: &mut Bitmap,
        block_bitmap: &mut Bitmap,
    ) -> FsResult<()> {
        let mut expected_inodes = Bitmap::new(inode_bitmap.len());
        expected_inodes.reserve_leading((RESERVED_INODES + 1).min(inode_bitmap.len()))?;
        let mut expected_blocks = Bitmap::new(block_bitmap.len());
        expected_blocks.reserve_leading(RESERVED_BLOCKS.min(block_bitmap.len()))?;
        for (index, inode) in inodes.iter() {
            expected_inodes.set(index)?;
            for block in inode.extents.blocks() {
                expected_blocks.set(block)?;
            }
        }
        if expected_inodes != *inode_bitmap {
            self.found(format!(
                "inode bitmap marks {} inodes, {} are in use",
                inode_bitmap.count_used(),
                expected_inodes.count_used()
            ))?;
            *inode_bitmap = expected_inodes;
        }
        if expected_blocks != *block_bitmap {
            self.found(format!(
                "block bitmap marks {} blocks, {} are in use",
                block_bitmap.count_used(),
                expected_blocks.count_used()
            ))?;
            *block_bitmap = expected_blocks;
        }
        Ok(())
    }
}

impl Volume {
    /// Validate superblock, bitmaps, inodes and the directory tree.
    ///
    /// Without `repair` the first problem is returned as `DiskCorrupt` and the
    /// volume stays mounted. With `repair` everything found is fixed in place;
    /// a problem that cannot be fixed fails the volume.
    pub fn check(&self, repair: bool) -> FsResult<CheckReport> {
        info!("checking volume {} (repair: {repair})", self.name);
        self.transition(&[VolumeState::Mounted], VolumeState::Checking)?;
        match self.scan(repair) {
            Ok(report) => {
                self.set_state(VolumeState::Mounted);
                Ok(report)
            }
            Err(e) if !repair && e.is_corruption() => {
                let mut sb = self.superblock.lock();
                sb.error_flag = true;
                sb.error_count += 1;
                drop(sb);
                self.set_state(VolumeState::Mounted);
                Err(e)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Repair a mounted volume in place, or bring a failed one back to `Unmounted`.
    pub fn repair(&self) -> FsResult<CheckReport> {
        if self.state() != VolumeState::Failed {
            return self.check(true);
        }
        info!("repairing failed volume {}", self.name);
        self.transition(&[VolumeState::Failed], VolumeState::Repairing)?;
        if let Err(e) = self.pool.ensure_mounted() {
            self.fail(&e);
            return Err(e);
        }
        if let Some(journal) = &self.journal {
            let pending = journal.lock().start();
            self.recover(pending);
            journal.lock().halt();
        }
        let report = match self.scan(true) {
            Ok(report) => report,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        if let Err(e) = self.pool.unmount_all() {
            // devices that were never mounted refuse, that is expected here
            warn!("volume {}: releasing devices: {e}", self.name);
        }
        self.superblock.lock().error_flag = false;
        self.set_state(VolumeState::Unmounted);
        Ok(report)
    }

    fn scan(&self, repair: bool) -> FsResult<CheckReport> {
        let mut scan = Scan {
            volume: self,
            repair,
            report: CheckReport::default(),
            touched: HashSet::new(),
            unlinked_open: self.objects.delete_pending(),
        };
        {
            let mut directories = self.directories.write();
            let mut inodes = self.inodes.write();
            let mut inode_bitmap = self.inode_bitmap.lock();
            let mut block_bitmap = self.block_bitmap.lock();
            let mut sb = self.superblock.lock();

            sb.validate_identity()?;
            if sb.block_size != self.block_size || !sb.block_size.is_power_of_two() {
                return Err(FsError::InvalidVolume(format!(
                    "block size {} on a volume of {} byte blocks",
                    sb.block_size, self.block_size
                )));
            }
            if sb.block_count != block_bitmap.len() || sb.inode_count != inode_bitmap.len() {
                return Err(FsError::InvalidVolume(format!(
                    "superblock geometry {}/{} disagrees with bitmaps {}/{}",
                    sb.block_count,
                    sb.inode_count,
                    block_bitmap.len(),
                    inode_bitmap.len()
                )));
            }
            if sb.cluster_size == 0 || sb.cluster_size % sb.block_size != 0 {
                scan.found(format!(
                    "cluster size {} is not a multiple of block size {}",
                    sb.cluster_size, sb.block_size
                ))?;
                sb.cluster_size = sb.block_size;
            }

            scan.check_inodes(&mut inodes, sb.block_count)?;
            scan.check_tree(&mut inodes, &mut directories)?;
            scan.check_bitmaps(&inodes, &mut inode_bitmap, &mut block_bitmap)?;

            if block_bitmap.count_free() != sb.free_blocks_count {
                scan.found(format!(
                    "block bitmap has {} free blocks, superblock records {}",
                    block_bitmap.count_free(),
                    sb.free_blocks_count
                ))?;
                sb.free_blocks_count = block_bitmap.count_free();
            }
            if inode_bitmap.count_free() != sb.free_inodes {
                scan.found(format!(
                    "inode bitmap has {} free inodes, superblock records {}",
                    inode_bitmap.count_free(),
                    sb.free_inodes
                ))?;
                sb.free_inodes = inode_bitmap.count_free();
            }
            sb.validate()?;
            sb.update_last_checked_at(self.clock.now());
        }

        let acls_of_freed: Vec<u64> = {
            let inodes = self.inodes.read();
            self.acls
                .read()
                .keys()
                .filter(|ino| inodes.get(**ino).is_none())
                .copied()
                .collect()
        };
        for ino in acls_of_freed {
            self.acls.write().remove(&ino);
        }
        for dir in scan.touched.clone() {
            self.persist_directory(dir, None)?;
        }
        info!(
            "volume {}: check done, {} problems repaired",
            self.name, scan.report.repaired
        );
        Ok(scan.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{DirectoryEntry, Inode},
        object::{file::tests::owner, ShareMode},
        utils::time_util::TimeDurationStruct,
        volume::manager::tests::mounted_volume,
    };

    fn entry(name: &str, target: u64, kind: FileKind) -> DirectoryEntry {
        DirectoryEntry {
            name: name.into(),
            kind,
            target,
            size: 0,
            created_at: TimeDurationStruct::default(),
            modified_at: TimeDurationStruct::default(),
            accessed_at: TimeDurationStruct::default(),
        }
    }

    #[test]
    fn test_fresh_volume_is_clean() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("clean")?;
        let report = volume.check(false)?;
        assert!(report.is_clean());
        assert_eq!(report.directories_checked, 1);
        assert_eq!(volume.state(), VolumeState::Mounted);
        assert!(volume.superblock().last_checked_at.is_some());
        Ok(())
    }

    #[test]
    fn test_counter_mismatch_is_reported_then_repaired() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("counters")?;
        volume.superblock.lock().free_blocks_count -= 5;
        assert!(matches!(volume.check(false), Err(FsError::DiskCorrupt(_))));
        assert_eq!(volume.state(), VolumeState::Mounted);
        assert!(volume.superblock().error_flag);

        let report = volume.repair()?;
        assert_eq!(report.repaired, 1);
        assert_eq!(volume.state(), VolumeState::Mounted);
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_dangling_entries_and_orphans() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("tree")?;
        let orphan = volume.allocate_inode()?;
        volume.inodes.write().insert(Inode::new(
            orphan,
            FileKind::RegularFile,
            0o644,
            (0, 0),
            volume.now(),
        ))?;
        volume
            .directories
            .write()
            .get_mut(&ROOT_INODE)
            .unwrap()
            .insert(entry("ghost", 300, FileKind::RegularFile))
            .unwrap();
        // the root listed under itself
        volume
            .directories
            .write()
            .get_mut(&ROOT_INODE)
            .unwrap()
            .insert(entry("loop", ROOT_INODE, FileKind::Directory))
            .unwrap();
        let free_inodes = volume.superblock().free_inodes;

        let report = volume.check(true)?;
        // two entries, the orphan, then the inode bitmap and its counter
        assert_eq!(report.repaired, 5);
        let dirs = volume.directories.read();
        assert!(dirs[&ROOT_INODE].is_empty());
        drop(dirs);
        assert!(volume.inodes.read().get(orphan).is_none());
        assert_eq!(volume.superblock().free_inodes, free_inodes + 1);
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_deleted_file_still_open_is_left_alone() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("unlinked")?;
        let everything = ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE;
        let file = volume.create_file("/gone", &owner().share(everything))?;
        volume.write_file(file, 0, b"still here")?;
        let other = volume.open_file("/gone", &owner().share(everything))?;
        volume.delete_file(file)?;

        assert!(volume.check(false)?.is_clean());
        let report = volume.repair()?;
        assert!(report.is_clean());
        assert_eq!(report.repaired, 0);

        let mut buf = [0u8; 10];
        volume.read_file(other, 0, &mut buf)?;
        assert_eq!(&buf, b"still here");
        let free_inodes = volume.superblock().free_inodes;
        volume.close_file(other)?;
        assert_eq!(volume.superblock().free_inodes, free_inodes + 1);
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_unrepairable_superblock_fails_volume() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("broken")?;
        volume.superblock.lock().version = 7;
        assert!(matches!(volume.repair(), Err(FsError::InvalidVolume(_))));
        assert_eq!(volume.state(), VolumeState::Failed);
        Ok(())
    }
}
