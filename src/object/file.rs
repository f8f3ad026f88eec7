use std::time::Instant;

use log::{info, warn};

use crate::{
    error::{FsError, FsResult},
    fs::{ExtentFlags, FileKind},
    journal::JournalPayload,
    utils::time_util::TimeDurationStruct,
    volume::Volume,
};

use super::{
    AccessMask, Acl, Disposition, FileAttributes, FileHandle, FsObject, ObjectState, OpenHandle,
    OpenOptions,
};

/// what `get_file_information` reports about an open file
#[derive(Debug, Clone, PartialEq)]
pub struct FileInformation {
    pub handle: u64,
    pub inode: u64,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub allocation_size: u64,
    pub attributes: FileAttributes,
    pub state: ObjectState,
    pub open_count: usize,
    pub link_count: u32,
    pub mode: u16,
    pub owner: (u32, u32),
    pub created_at: TimeDurationStruct,
    pub modified_at: TimeDurationStruct,
    pub accessed_at: TimeDurationStruct,
    pub changed_at: TimeDurationStruct,
}

impl Volume {
    fn file_handle(&self, handle: FileHandle) -> FsResult<OpenHandle> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.objects.handle(handle.id, FileKind::RegularFile)
    }

    fn attributes_of(&self, inode: u64) -> FsResult<FileAttributes> {
        Ok(FileAttributes::from_bits_truncate(
            self.inodes.read().expect(inode)?.attributes,
        ))
    }

    fn require_writable(&self, object: &FsObject) -> FsResult<()> {
        if self.attributes_of(object.inode)?.contains(FileAttributes::READ_ONLY) {
            return Err(FsError::MediaWriteProtected(object.location().path));
        }
        Ok(())
    }

    /// create a regular file that must not exist yet and open it
    pub fn create_file(&self, path: &str, options: &OpenOptions) -> FsResult<FileHandle> {
        self.open_file(path, &options.disposition(Disposition::CreateNew))
    }

    pub fn open_file(&self, path: &str, options: &OpenOptions) -> FsResult<FileHandle> {
        let id = self.open_object(path, FileKind::RegularFile, options)?;
        let handle = FileHandle {
            volume_id: self.id,
            id,
        };
        if matches!(
            options.disposition,
            Disposition::TruncateExisting | Disposition::CreateAlways
        ) {
            if let Err(e) = self.truncate_file(handle, 0) {
                let _ = self.close_file(handle);
                return Err(e);
            }
        }
        Ok(handle)
    }

    /// Closing a closed handle is `InvalidHandle` and changes nothing.
    pub fn close_file(&self, handle: FileHandle) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.close_object(handle.id, FileKind::RegularFile)
    }

    /// Read into `buf` at `offset`, returning the bytes read.
    ///
    /// The read is clamped to the end of the file; starting at or past it is
    /// `EndOfFile`.
    pub fn read_file(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::READ)?;
        self.require_mounted()?;
        let object = &handle.object;
        object.begin_io(ObjectState::Reading)?;
        let result = self.read_object(object, offset, buf);
        object.end_io();
        result
    }

    fn read_object(&self, object: &FsObject, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        let started = Instant::now();
        let size = self.inodes.read().expect(object.inode)?.file_size;
        if offset >= size {
            return Err(FsError::EndOfFile);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;
        self.read_bytes(object.inode, offset, &mut buf[..len], Some(&object.cache))?;
        if let Some(inode) = self.inodes.write().get_mut(object.inode) {
            inode.update_accessed_at(self.clock.now());
        }
        self.stats.record_read(len as u64, started.elapsed());
        Ok(len)
    }

    /// Write `data` at `offset`, growing the file first when it ends past the current size.
    pub fn write_file(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::WRITE)?;
        self.require_mounted()?;
        let object = &handle.object;
        self.require_writable(object)?;
        object.begin_io(ObjectState::Writing)?;
        let result = self.write_object(object, offset, data);
        object.end_io();
        result
    }

    fn write_object(&self, object: &FsObject, offset: u64, data: &[u8]) -> FsResult<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument(format!("write at {offset} overflows")))?;
        let _serial = object.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let (size, allocated) = {
            let inodes = self.inodes.read();
            let inode = inodes.expect(object.inode)?;
            (inode.file_size, inode.allocation_size)
        };
        let sequence = self.journal_append(JournalPayload::Write {
            inode: object.inode,
            offset,
            length: data.len() as u64,
            new_size: size.max(end),
        });
        let written = self
            .grow_allocation(object.inode, end, ExtentFlags::ZEROED)
            .and_then(|()| self.write_bytes(object.inode, offset, data, Some(&object.cache)));
        if let Err(e) = written {
            self.journal_discard(sequence);
            if let Err(undo) = self.shrink_allocation(object.inode, allocated, Some(&object.cache)) {
                warn!(
                    "volume {}: giving back blocks of inode {}: {undo}",
                    self.name, object.inode
                );
            }
            return Err(e);
        }
        if let Some(inode) = self.inodes.write().get_mut(object.inode) {
            inode.file_size = inode.file_size.max(end);
            inode.update_modified_at(self.clock.now());
        }
        self.journal_commit(sequence);
        self.stats.record_write(data.len() as u64, started.elapsed());
        if self.volume_type.is_replicated() && self.replication_factor > 1 {
            self.stats
                .inc_replication_ops(u64::from(self.replication_factor - 1));
        }
        Ok(data.len())
    }

    /// Grow the file to `new_size`, all or nothing. Shrinking is `InvalidArgument`.
    pub fn extend_file(&self, handle: FileHandle, new_size: u64) -> FsResult<()> {
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::WRITE)?;
        self.require_mounted()?;
        let object = &handle.object;
        self.require_writable(object)?;
        let _serial = object.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let size = self.inodes.read().expect(object.inode)?.file_size;
        if new_size < size {
            return Err(FsError::InvalidArgument(format!(
                "cannot extend a {size} byte file to {new_size}"
            )));
        }
        self.resize(object, new_size)
    }

    /// Set the file size, releasing whole blocks past a smaller one.
    pub fn truncate_file(&self, handle: FileHandle, new_size: u64) -> FsResult<()> {
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::WRITE)?;
        self.require_mounted()?;
        let object = &handle.object;
        self.require_writable(object)?;
        let _serial = object.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.resize(object, new_size)
    }

    /// the caller holds the file's write lock
    fn resize(&self, object: &FsObject, new_size: u64) -> FsResult<()> {
        let size = self.inodes.read().expect(object.inode)?.file_size;
        if new_size == size {
            return Ok(());
        }
        info!(
            "volume {}: resize inode {} {size} -> {new_size}",
            self.name, object.inode
        );
        let sequence = self.journal_append(JournalPayload::Truncate {
            inode: object.inode,
            new_size,
        });
        let resized = if new_size > size {
            self.grow_allocation(object.inode, new_size, ExtentFlags::ZEROED)
        } else {
            self.shrink_allocation(object.inode, new_size, Some(&object.cache))
        };
        if let Err(e) = resized {
            self.journal_discard(sequence);
            return Err(e);
        }
        if let Some(inode) = self.inodes.write().get_mut(object.inode) {
            inode.file_size = new_size;
            inode.update_modified_at(self.clock.now());
        }
        self.journal_commit(sequence);
        Ok(())
    }

    /// write back the file's dirty lines without closing it
    pub fn flush_file(&self, handle: FileHandle) -> FsResult<()> {
        let handle = self.file_handle(handle)?;
        self.flush_cache(&handle.object.cache)
    }

    /// Remove the file's name now; its inode and blocks go with the last handle.
    pub fn delete_file(&self, handle: FileHandle) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.delete_object(handle.id, FileKind::RegularFile)
    }

    pub fn rename_file(&self, handle: FileHandle, new_path: &str) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.rename_object(handle.id, FileKind::RegularFile, new_path)
    }

    pub fn set_file_attributes(&self, handle: FileHandle, attributes: FileAttributes) -> FsResult<()> {
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::WRITE_ATTRIBUTES)?;
        self.require_mounted()?;
        let ino = handle.object.inode;
        let attributes = attributes - FileAttributes::DIRECTORY;
        info!("volume {}: attributes of inode {ino} = {attributes:?}", self.name);
        let sequence = self.journal_append(JournalPayload::SetAttribute {
            inode: ino,
            attributes: attributes.bits(),
        });
        match self.inodes.write().get_mut(ino) {
            Some(inode) => {
                inode.attributes = attributes.bits();
                inode.update_changed_at(self.clock.now());
            }
            None => {
                self.journal_discard(sequence);
                return Err(FsError::NotFound(format!("inode {ino}")));
            }
        }
        self.journal_commit(sequence);
        Ok(())
    }

    pub fn get_file_information(&self, handle: FileHandle) -> FsResult<FileInformation> {
        let id = handle.id;
        let handle = self.file_handle(handle)?;
        handle.require(AccessMask::READ_ATTRIBUTES)?;
        let object = &handle.object;
        let location = object.location();
        let inodes = self.inodes.read();
        let inode = inodes.expect(object.inode)?;
        Ok(FileInformation {
            handle: id,
            inode: object.inode,
            name: location.name,
            path: location.path,
            size: inode.file_size,
            allocation_size: inode.allocation_size,
            attributes: FileAttributes::from_bits_truncate(inode.attributes),
            state: object.state(),
            open_count: object.open_count(),
            link_count: inode.hard_links,
            mode: inode.mode,
            owner: (inode.user_id, inode.group_id),
            created_at: inode.created_at,
            modified_at: inode.modified_at,
            accessed_at: inode.accessed_at,
            changed_at: inode.metadata_changed_at,
        })
    }

    pub fn get_file_security(&self, handle: FileHandle) -> FsResult<Acl> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.object_security(handle.id, FileKind::RegularFile)
    }

    pub fn set_file_security(&self, handle: FileHandle, acl: Acl) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.set_object_security(handle.id, FileKind::RegularFile, acl)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        object::{AclEntry, Credentials, Principal, ShareMode},
        volume::manager::tests::mounted_volume,
    };

    pub(crate) fn owner() -> OpenOptions {
        OpenOptions::new().credentials(Credentials::new(0, 0))
    }

    #[test]
    fn test_write_close_reopen_read() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("files")?;
        let file = volume.create_file("/a.txt", &owner())?;
        assert_eq!(volume.write_file(file, 0, b"0123456789")?, 10);
        volume.close_file(file)?;

        let file = volume.open_file("/a.txt", &owner())?;
        let mut buf = [0u8; 10];
        assert_eq!(volume.read_file(file, 0, &mut buf)?, 10);
        assert_eq!(&buf, b"0123456789");

        // clamped at the end, nothing at or past it
        let mut long = [0u8; 32];
        assert_eq!(volume.read_file(file, 6, &mut long)?, 4);
        assert_eq!(&long[..4], b"6789");
        assert!(matches!(
            volume.read_file(file, 10, &mut buf),
            Err(FsError::EndOfFile)
        ));
        assert!(matches!(
            volume.read_file(file, 11, &mut buf),
            Err(FsError::EndOfFile)
        ));

        let info = volume.get_file_information(file)?;
        assert_eq!(info.size, 10);
        assert_eq!(info.allocation_size, 1024);
        assert_eq!(info.path, "/a.txt");
        assert_eq!(info.state, ObjectState::Open);
        volume.close_file(file)?;
        assert!(matches!(
            volume.close_file(file),
            Err(FsError::InvalidHandle(_))
        ));
        Ok(())
    }

    #[test]
    fn test_sparse_write_reads_zeros_before_data() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("sparse")?;
        let file = volume.create_file("/s", &owner())?;
        volume.write_file(file, 3000, b"end")?;
        let mut buf = vec![0xaau8; 3003];
        assert_eq!(volume.read_file(file, 0, &mut buf)?, 3003);
        assert!(buf[..3000].iter().all(|b| *b == 0));
        assert_eq!(&buf[3000..], b"end");
        Ok(())
    }

    #[test]
    fn test_read_only_attribute() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("readonly")?;
        let file = volume.create_file("/r", &owner())?;
        volume.set_file_attributes(file, FileAttributes::READ_ONLY)?;
        assert!(matches!(
            volume.write_file(file, 0, b"x"),
            Err(FsError::MediaWriteProtected(_))
        ));
        assert!(matches!(
            volume.extend_file(file, 10),
            Err(FsError::MediaWriteProtected(_))
        ));
        volume.set_file_attributes(file, FileAttributes::NORMAL)?;
        assert_eq!(volume.write_file(file, 0, b"x")?, 1);
        Ok(())
    }

    #[test]
    fn test_extend_on_full_volume_changes_nothing() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("full")?;
        let file = volume.create_file("/f", &owner())?;
        volume.extend_file(file, 1000)?;
        let free = volume.superblock().free_blocks_count;
        volume.allocate_blocks(free)?;

        assert!(matches!(
            volume.extend_file(file, 5000),
            Err(FsError::DiskFull(_))
        ));
        let info = volume.get_file_information(file)?;
        assert_eq!((info.size, info.allocation_size), (1000, 1024));
        assert_eq!(volume.superblock().free_blocks_count, 0);
        assert!(matches!(
            volume.extend_file(file, 10),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_truncate_releases_blocks() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("truncate")?;
        let file = volume.create_file("/t", &owner())?;
        volume.write_file(file, 0, &[7u8; 4096])?;
        let free = volume.superblock().free_blocks_count;
        volume.truncate_file(file, 1500)?;
        assert_eq!(volume.superblock().free_blocks_count, free + 2);
        let info = volume.get_file_information(file)?;
        assert_eq!((info.size, info.allocation_size), (1500, 2048));

        // growing again reads zeros, not the old bytes
        volume.truncate_file(file, 3000)?;
        let mut buf = vec![0xffu8; 1500];
        volume.read_file(file, 1500, &mut buf)?;
        assert!(buf.iter().all(|b| *b == 0));
        Ok(())
    }

    #[test]
    fn test_open_dispositions() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("dispositions")?;
        assert!(matches!(
            volume.open_file("/missing", &owner()),
            Err(FsError::NotFound(_))
        ));
        let file = volume.open_file("/d", &owner().disposition(Disposition::OpenAlways))?;
        volume.write_file(file, 0, b"data")?;
        volume.close_file(file)?;
        assert!(matches!(
            volume.create_file("/d", &owner()),
            Err(FsError::NameCollision(_))
        ));
        let file = volume.open_file("/d", &owner().disposition(Disposition::TruncateExisting))?;
        assert_eq!(volume.get_file_information(file)?.size, 0);
        volume.close_file(file)?;
        assert!(matches!(
            volume.open_directory("/d", &owner()),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_sharing_and_access() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("sharing")?;
        let file = volume.create_file("/shared", &owner())?;
        assert!(matches!(
            volume.open_file("/shared", &owner()),
            Err(FsError::SharingViolation(_))
        ));
        let reader = volume.open_file(
            "/shared",
            &owner()
                .access(AccessMask::GENERIC_READ)
                .share(ShareMode::READ | ShareMode::WRITE),
        )?;
        assert!(matches!(
            volume.write_file(reader, 0, b"x"),
            Err(FsError::AccessDenied(_))
        ));
        volume.close_file(reader)?;
        volume.close_file(file)?;

        let stranger = OpenOptions::new().credentials(Credentials::new(1000, 1000));
        assert!(matches!(
            volume.open_file("/shared", &stranger),
            Err(FsError::AccessDenied(_))
        ));
        let file = volume.open_file("/shared", &owner())?;
        let mut acl = volume.get_file_security(file)?;
        acl.entries
            .push(AclEntry::allow(Principal::User(1000), AccessMask::GENERIC_WRITE));
        volume.set_file_security(file, acl)?;
        volume.close_file(file)?;
        let file = volume.open_file("/shared", &stranger)?;
        volume.write_file(file, 0, b"ok")?;
        Ok(())
    }

    #[test]
    fn test_delete_waits_for_last_handle() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("delete")?;
        let free_inodes = volume.superblock().free_inodes;
        let everything = ShareMode::READ | ShareMode::WRITE | ShareMode::DELETE;
        let file = volume.create_file("/gone", &owner().share(everything))?;
        volume.write_file(file, 0, b"still here")?;
        let other = volume.open_file("/gone", &owner().share(everything))?;

        volume.delete_file(file)?;
        assert!(matches!(volume.lookup("/gone"), Err(FsError::NotFound(_))));
        assert!(matches!(
            volume.close_file(file),
            Err(FsError::InvalidHandle(_))
        ));
        let mut buf = [0u8; 10];
        volume.read_file(other, 0, &mut buf)?;
        assert_eq!(&buf, b"still here");
        assert_eq!(volume.superblock().free_inodes, free_inodes - 1);

        let free_blocks = volume.superblock().free_blocks_count;
        volume.close_file(other)?;
        assert_eq!(volume.superblock().free_inodes, free_inodes);
        assert_eq!(volume.superblock().free_blocks_count, free_blocks + 1);
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_failed_write_gives_its_blocks_back() -> anyhow::Result<()> {
        let (volume, device) = mounted_volume("rollback")?;
        let file = volume.create_file("/f", &owner())?;
        volume.write_file(file, 0, b"0123456789")?;
        let free_blocks = volume.superblock().free_blocks_count;

        // the new block is zeroed fine, merging into it must read the device
        device.faults.fail_read.store(true, Ordering::Release);
        assert!(volume.write_file(file, 2000, b"abc").is_err());
        device.faults.fail_read.store(false, Ordering::Release);

        let info = volume.get_file_information(file)?;
        assert_eq!(info.size, 10);
        assert_eq!(info.allocation_size, 1024);
        assert_eq!(volume.superblock().free_blocks_count, free_blocks);
        volume.write_file(file, 2000, b"abc")?;
        let mut buf = [0u8; 3];
        volume.read_file(file, 2000, &mut buf)?;
        assert_eq!(&buf, b"abc");
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_concurrent_writers_and_readers_on_one_file() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("concurrent")?;
        let shared = ShareMode::READ | ShareMode::WRITE;
        let file = volume.create_file("/hot", &owner().share(shared))?;
        std::thread::scope(|s| -> FsResult<()> {
            let volume = &volume;
            let writers: Vec<_> = (0..4u8)
                .map(|writer| {
                    s.spawn(move || -> FsResult<()> {
                        let handle = volume.open_file("/hot", &owner().share(shared))?;
                        for round in 0..4u64 {
                            let offset = (round * 4 + writer as u64) * 1024;
                            volume.write_file(handle, offset, &[writer + 1; 1024])?;
                        }
                        volume.close_file(handle)
                    })
                })
                .collect();
            let reader = s.spawn(move || -> FsResult<()> {
                let mut buf = [0u8; 512];
                for offset in (0..16 * 1024).step_by(512) {
                    match volume.read_file(file, offset, &mut buf) {
                        Ok(_) | Err(FsError::EndOfFile) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            });
            for writer in writers {
                writer.join().unwrap()?;
            }
            reader.join().unwrap()
        })?;

        assert_eq!(volume.get_file_information(file)?.size, 16 * 1024);
        let mut block = [0u8; 1024];
        for index in 0..16u64 {
            volume.read_file(file, index * 1024, &mut block)?;
            let expected = (index % 4) as u8 + 1;
            assert!(block.iter().all(|b| *b == expected), "block {index}");
        }
        volume.close_file(file)?;
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_rename_file() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("rename")?;
        let file = volume.create_file("/old", &owner())?;
        let taken = volume.create_file("/taken", &owner())?;
        volume.close_file(taken)?;
        assert!(matches!(
            volume.rename_file(file, "/taken"),
            Err(FsError::NameCollision(_))
        ));
        volume.rename_file(file, "/new")?;
        assert_eq!(volume.get_file_information(file)?.path, "/new");
        assert!(volume.lookup("/old").is_err());
        assert_eq!(volume.lookup("/new")?, volume.get_file_information(file)?.inode);
        Ok(())
    }

    #[test]
    fn test_operations_are_counted() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("counted")?;
        let before = volume.stats.snapshot();
        let file = volume.create_file("/c", &owner())?;
        volume.write_file(file, 0, b"abc")?;
        let mut buf = [0u8; 3];
        volume.read_file(file, 0, &mut buf)?;
        volume.close_file(file)?;
        let after = volume.stats.snapshot();
        assert_eq!(after.creates - before.creates, 1);
        assert_eq!(after.opens - before.opens, 1);
        assert_eq!(after.closes - before.closes, 1);
        assert_eq!(after.bytes_written - before.bytes_written, 3);
        assert_eq!(after.bytes_read - before.bytes_read, 3);
        assert!(after.journal_ops > before.journal_ops);
        Ok(())
    }
}
