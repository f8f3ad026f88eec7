use log::{debug, info};

use crate::{
    cache::BlockCache,
    error::{FsError, FsResult},
    fs::{DirectoryEntry, ExtentFlags, FileKind},
    utils::{time_util::TimeDurationStruct, traits::SerializeAndDigest},
    volume::Volume,
};

use super::{AccessMask, Acl, Disposition, DirectoryHandle, FileAttributes, ObjectState, OpenHandle, OpenOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryInformation {
    pub handle: u64,
    pub inode: u64,
    pub name: String,
    pub path: String,
    pub entry_count: usize,
    pub state: ObjectState,
    pub open_count: usize,
    pub link_count: u32,
    pub attributes: FileAttributes,
    pub created_at: TimeDurationStruct,
    pub modified_at: TimeDurationStruct,
    pub accessed_at: TimeDurationStruct,
}

/// Entries of one directory in name order, fetched one at a time.
///
/// Every step looks the directory up again, so entries added or removed
/// meanwhile are seen or skipped as their names fall. A listing can be resumed
/// later from [ReadDir::position].
pub struct ReadDir<'a> {
    volume: &'a Volume,
    directory: u64,
    last: Option<String>,
}

impl ReadDir<'_> {
    /// name of the last entry returned
    pub fn position(&self) -> Option<&str> {
        self.last.as_deref()
    }
}

impl Iterator for ReadDir<'_> {
    type Item = DirectoryEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let mut entry = self
            .volume
            .directories
            .read()
            .get(&self.directory)?
            .next_after(self.last.as_deref())?
            .clone();
        if let Some(inode) = self.volume.inodes.read().get(entry.target) {
            entry.size = inode.file_size;
            entry.created_at = inode.created_at;
            entry.modified_at = inode.modified_at;
            entry.accessed_at = inode.accessed_at;
        }
        self.last = Some(entry.name.clone());
        Some(entry)
    }
}

impl Volume {
    fn directory_handle(&self, handle: DirectoryHandle) -> FsResult<OpenHandle> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.objects.handle(handle.id, FileKind::Directory)
    }

    pub fn create_directory(&self, path: &str, options: &OpenOptions) -> FsResult<DirectoryHandle> {
        self.open_directory(path, &options.disposition(Disposition::CreateNew))
    }

    pub fn open_directory(&self, path: &str, options: &OpenOptions) -> FsResult<DirectoryHandle> {
        if matches!(
            options.disposition,
            Disposition::TruncateExisting | Disposition::CreateAlways
        ) {
            return Err(FsError::InvalidArgument(format!(
                "{:?} does not apply to directories",
                options.disposition
            )));
        }
        let id = self.open_object(path, FileKind::Directory, options)?;
        Ok(DirectoryHandle {
            volume_id: self.id,
            id,
        })
    }

    pub fn close_directory(&self, handle: DirectoryHandle) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.close_object(handle.id, FileKind::Directory)
    }

    /// Only an empty directory can go, and never the root.
    pub fn delete_directory(&self, handle: DirectoryHandle) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.delete_object(handle.id, FileKind::Directory)
    }

    pub fn rename_directory(&self, handle: DirectoryHandle, new_path: &str) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.rename_object(handle.id, FileKind::Directory, new_path)
    }

    /// list entries whose names sort after `resume_after`
    pub fn read_directory(
        &self,
        handle: DirectoryHandle,
        resume_after: Option<&str>,
    ) -> FsResult<ReadDir<'_>> {
        let handle = self.directory_handle(handle)?;
        handle.require(AccessMask::READ)?;
        self.require_mounted()?;
        let directory = handle.object.inode;
        info!("volume {}: list directory {directory} after {resume_after:?}", self.name);
        if let Some(inode) = self.inodes.write().get_mut(directory) {
            inode.update_accessed_at(self.clock.now());
        }
        Ok(ReadDir {
            volume: self,
            directory,
            last: resume_after.map(str::to_string),
        })
    }

    pub fn get_directory_information(&self, handle: DirectoryHandle) -> FsResult<DirectoryInformation> {
        let id = handle.id;
        let handle = self.directory_handle(handle)?;
        handle.require(AccessMask::READ_ATTRIBUTES)?;
        let object = &handle.object;
        let location = object.location();
        let entry_count = self
            .directories
            .read()
            .get(&object.inode)
            .map_or(0, |dir| dir.len());
        let inodes = self.inodes.read();
        let inode = inodes.expect(object.inode)?;
        Ok(DirectoryInformation {
            handle: id,
            inode: object.inode,
            name: location.name,
            path: location.path,
            entry_count,
            state: object.state(),
            open_count: object.open_count(),
            link_count: inode.hard_links,
            attributes: FileAttributes::from_bits_truncate(inode.attributes),
            created_at: inode.created_at,
            modified_at: inode.modified_at,
            accessed_at: inode.accessed_at,
        })
    }

    pub fn get_directory_security(&self, handle: DirectoryHandle) -> FsResult<Acl> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.object_security(handle.id, FileKind::Directory)
    }

    pub fn set_directory_security(&self, handle: DirectoryHandle, acl: Acl) -> FsResult<()> {
        if handle.volume_id != self.id {
            return Err(FsError::InvalidHandle(handle.id));
        }
        self.set_object_security(handle.id, FileKind::Directory, acl)
    }

    /// Write a directory's entries into its own data blocks.
    ///
    /// Goes through the directory's cache when it is open, or `private` when given.
    pub(crate) fn persist_directory(&self, dir: u64, private: Option<&BlockCache>) -> FsResult<()> {
        let _writer = self
            .directory_writer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(mut snapshot) = self.directories.read().get(&dir).cloned() else {
            return Ok(());
        };
        let allocated = match self.inodes.read().get(dir) {
            Some(inode) => inode.allocation_size,
            None => return Ok(()),
        };
        if snapshot.is_empty() && allocated == 0 {
            return Ok(());
        }
        let mut bytes = SerializeAndDigest::serialize(&mut snapshot)?;
        let len = bytes.len() as u64;
        self.grow_allocation(dir, len, ExtentFlags::METADATA)?;
        let open = self.objects.by_inode(dir);
        let private = private.or(open.as_ref().map(|object| &object.cache));
        let bs = self.block_size as usize;
        bytes.resize(bytes.len().div_ceil(bs) * bs, 0);
        self.write_bytes(dir, 0, &bytes, private)?;
        if let Some(inode) = self.inodes.write().get_mut(dir) {
            inode.file_size = len;
        }
        debug!("volume {}: directory {dir} written, {len} bytes", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{Directory, ROOT_INODE},
        object::file::tests::owner,
        volume::manager::tests::mounted_volume,
    };

    #[test]
    fn test_listing_resumes_by_name() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("listing")?;
        for name in ["c", "a", "b"] {
            let file = volume.create_file(&format!("/{name}"), &owner())?;
            volume.write_file(file, 0, name.as_bytes())?;
            volume.close_file(file)?;
        }
        let sub = volume.create_directory("/d", &owner())?;
        volume.close_directory(sub)?;

        let root = volume.open_directory("/", &owner())?;
        let names: Vec<String> = volume.read_directory(root, None)?.map(|e| e.name).collect();
        assert_eq!(names, ["a", "b", "c", "d"]);

        let mut listing = volume.read_directory(root, None)?;
        let first = listing.next().map(|e| e.size);
        assert_eq!(first, Some(1));
        let resume = listing.position().map(str::to_string);
        let rest: Vec<(String, FileKind)> = volume
            .read_directory(root, resume.as_deref())?
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(rest.len(), 3);
        assert_eq!(rest[2], ("d".to_string(), FileKind::Directory));

        let info = volume.get_directory_information(root)?;
        assert_eq!(info.entry_count, 4);
        assert_eq!(info.link_count, 4);
        assert!(info.attributes.contains(FileAttributes::DIRECTORY));
        Ok(())
    }

    #[test]
    fn test_delete_requires_empty() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("rmdir")?;
        let dir = volume.create_directory("/full", &owner())?;
        let file = volume.create_file("/full/f", &owner())?;
        assert!(matches!(
            volume.delete_directory(dir),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        volume.delete_file(file)?;
        volume.delete_directory(dir)?;
        assert!(volume.lookup("/full").is_err());
        assert_eq!(volume.inodes.read().expect(ROOT_INODE)?.hard_links, 3);

        let root = volume.open_directory("/", &owner())?;
        assert!(matches!(
            volume.delete_directory(root),
            Err(FsError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rename_directory_moves_open_children() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("mvdir")?;
        let a = volume.create_directory("/a", &owner())?;
        let b = volume.create_directory("/a/b", &owner())?;
        let file = volume.create_file("/a/b/f", &owner())?;
        let target = volume.create_directory("/t", &owner())?;
        volume.close_directory(target)?;

        assert!(matches!(
            volume.rename_directory(a, "/a/b/a"),
            Err(FsError::InvalidArgument(_))
        ));
        volume.rename_directory(a, "/t/a2")?;
        assert_eq!(volume.get_file_information(file)?.path, "/t/a2/b/f");
        assert_eq!(volume.get_directory_information(b)?.path, "/t/a2/b");
        assert!(volume.lookup("/t/a2/b/f").is_ok());
        assert!(volume.lookup("/a").is_err());
        assert_eq!(volume.directories.read()[&volume.lookup("/t/a2")?].parent, volume.lookup("/t")?);
        assert!(volume.check(false)?.is_clean());
        Ok(())
    }

    #[test]
    fn test_paths_are_stored_normalized() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("spelling")?;
        let dir = volume.create_directory("/d", &owner())?;
        volume.close_directory(dir)?;
        let dir = volume.open_directory("/d/", &owner())?;
        let file = volume.create_file("/d//x", &owner())?;
        assert_eq!(volume.get_directory_information(dir)?.path, "/d");
        assert_eq!(volume.get_file_information(file)?.path, "/d/x");

        volume.rename_directory(dir, "/n/")?;
        assert_eq!(volume.get_directory_information(dir)?.path, "/n");
        assert_eq!(volume.get_file_information(file)?.path, "/n/x");
        assert!(volume.lookup("/n/x").is_ok());
        Ok(())
    }

    #[test]
    fn test_entries_reach_the_device() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("persisted")?;
        for i in 0..40 {
            let file = volume.create_file(&format!("/file-with-a-long-name-{i:03}"), &owner())?;
            volume.close_file(file)?;
        }
        let size = volume.inodes.read().expect(ROOT_INODE)?.file_size;
        assert!(size > 1024);

        volume.flush_cache(&volume.cache)?;
        volume.cache.invalidate_volume(volume.id);
        volume.global_cache.invalidate_volume(volume.id);
        let mut buf = vec![0u8; size as usize];
        volume.read_bytes(ROOT_INODE, 0, &mut buf, None)?;
        let (stored, _) = <Directory as SerializeAndDigest>::deserialize(&buf)?;
        assert_eq!(
            stored.entries,
            volume.directories.read()[&ROOT_INODE].entries
        );
        Ok(())
    }
}
