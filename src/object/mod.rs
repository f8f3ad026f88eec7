//! open files and directories of a volume
//!
//! An [FsObject] exists for every inode with at least one open handle. Handles
//! are plain ids resolved through the volume's [ObjectTable], so a closed
//! handle can never reach a freed object.
pub mod acl;
pub mod directory;
pub mod file;

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bitflags::bitflags;
use log::{debug, info, warn};
use serde::Serialize;
use spin::Mutex;

pub use acl::*;
pub use directory::{DirectoryInformation, ReadDir};
pub use file::FileInformation;

use crate::{
    cache::{BlockCache, CacheLevel},
    error::{FsError, FsResult},
    fs::{Directory, DirectoryEntry, FileKind, Inode, ROOT_INODE},
    journal::JournalPayload,
    volume::Volume,
};

/// longest name a directory entry may carry
pub const MAX_NAME_LEN: usize = 255;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct FileAttributes: u32 {
        const READ_ONLY = 0x1;
        const HIDDEN = 0x2;
        const SYSTEM = 0x4;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const NORMAL = 0x80;
        const TEMPORARY = 0x100;
    }
}

bitflags! {
    /// what other openers of the same object are still allowed to do
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ShareMode: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const DELETE = 1 << 2;
    }
}

/// what an open does when the path does or does not exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    #[default]
    OpenExisting,
    CreateNew,
    OpenAlways,
    TruncateExisting,
    CreateAlways,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Closed,
    Opening,
    Open,
    Reading,
    Writing,
    Closing,
    Deleting,
    Failed,
}

/// how to open a file or directory
#[derive(Debug, Clone, Copy)]
pub struct OpenOptions {
    pub access: AccessMask,
    pub share: ShareMode,
    pub disposition: Disposition,
    pub attributes: FileAttributes,
    pub credentials: Credentials,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            access: AccessMask::GENERIC_READ | AccessMask::GENERIC_WRITE,
            share: ShareMode::READ,
            disposition: Disposition::OpenExisting,
            attributes: FileAttributes::NORMAL,
            credentials: Credentials::current(),
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access(mut self, access: AccessMask) -> Self {
        self.access = access;
        self
    }

    pub fn share(mut self, share: ShareMode) -> Self {
        self.share = share;
        self
    }

    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn attributes(mut self, attributes: FileAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub volume_id: u64,
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryHandle {
    pub volume_id: u64,
    pub id: u64,
}

#[derive(Debug)]
pub(crate) struct ObjectStatus {
    pub(crate) state: ObjectState,
    /// access and share mode of every open handle
    pub(crate) opens: HashMap<u64, (AccessMask, ShareMode)>,
    pub(crate) active_io: u32,
    pub(crate) delete_pending: bool,
}

/// the in-memory side of one open inode
#[derive(Debug)]
pub struct FsObject {
    pub(crate) inode: u64,
    pub(crate) kind: FileKind,
    /// absolute path, parent inode and name at the time of the last open or rename
    pub(crate) location: Mutex<Location>,
    pub(crate) status: Mutex<ObjectStatus>,
    pub(crate) cache: BlockCache,
    /// serializes extend-then-write sequences
    pub(crate) write_lock: std::sync::Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Location {
    pub(crate) path: String,
    pub(crate) parent: u64,
    pub(crate) name: String,
}

impl FsObject {
    pub(crate) fn state(&self) -> ObjectState {
        self.status.lock().state
    }

    pub(crate) fn open_count(&self) -> usize {
        self.status.lock().opens.len()
    }

    pub(crate) fn location(&self) -> Location {
        self.location.lock().clone()
    }

    /// enter a read or write, the object must be open
    pub(crate) fn begin_io(&self, state: ObjectState) -> FsResult<()> {
        let mut status = self.status.lock();
        match status.state {
            ObjectState::Open | ObjectState::Reading | ObjectState::Writing => {
                status.state = state;
                status.active_io += 1;
                Ok(())
            }
            other => Err(FsError::InvalidDeviceState(format!(
                "inode {} is {other:?}",
                self.inode
            ))),
        }
    }

    pub(crate) fn end_io(&self) {
        let mut status = self.status.lock();
        status.active_io = status.active_io.saturating_sub(1);
        if status.active_io == 0
            && matches!(status.state, ObjectState::Reading | ObjectState::Writing)
        {
            status.state = ObjectState::Open;
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OpenHandle {
    pub(crate) object: Arc<FsObject>,
    pub(crate) access: AccessMask,
    pub(crate) credentials: Credentials,
}

impl OpenHandle {
    pub(crate) fn require(&self, access: AccessMask) -> FsResult<()> {
        if self.access.contains(access) {
            Ok(())
        } else {
            Err(FsError::AccessDenied(format!(
                "handle was not opened for {:?}",
                access - self.access
            )))
        }
    }
}

/// open objects by inode and open handles by id
#[derive(Debug, Default)]
pub struct ObjectTable {
    next_id: AtomicU64,
    objects: Mutex<HashMap<u64, Arc<FsObject>>>,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl ObjectTable {
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub(crate) fn by_inode(&self, inode: u64) -> Option<Arc<FsObject>> {
        self.objects.lock().get(&inode).cloned()
    }

    /// inodes already unbound by a delete, waiting for their last close
    pub(crate) fn delete_pending(&self) -> HashSet<u64> {
        self.objects
            .lock()
            .values()
            .filter(|object| object.status.lock().delete_pending)
            .map(|object| object.inode)
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn handle(&self, id: u64, kind: FileKind) -> FsResult<OpenHandle> {
        match self.handles.lock().get(&id) {
            Some(handle) if kind_matches(handle.object.kind, kind) => Ok(handle.clone()),
            _ => Err(FsError::InvalidHandle(id)),
        }
    }

    fn take_handle(&self, id: u64, kind: FileKind) -> FsResult<OpenHandle> {
        let mut handles = self.handles.lock();
        match handles.get(&id) {
            Some(handle) if kind_matches(handle.object.kind, kind) => {
                handles.remove(&id).ok_or(FsError::InvalidHandle(id))
            }
            _ => Err(FsError::InvalidHandle(id)),
        }
    }

    /// open objects whose path lies under `prefix`
    fn under(&self, prefix: &str) -> Vec<Arc<FsObject>> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        self.objects
            .lock()
            .values()
            .filter(|object| object.location.lock().path.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

/// files are everything that is not a directory
fn kind_matches(actual: FileKind, wanted: FileKind) -> bool {
    (actual == FileKind::Directory) == (wanted == FileKind::Directory)
}

/// two opens coexist when each one's access is allowed by the other's share mode
fn shares_with(access: AccessMask, share: ShareMode, other: (AccessMask, ShareMode)) -> bool {
    let allowed = |access: AccessMask, share: ShareMode| {
        (!access.intersects(AccessMask::READ | AccessMask::EXECUTE) || share.contains(ShareMode::READ))
            && (!access.contains(AccessMask::WRITE) || share.contains(ShareMode::WRITE))
            && (!access.contains(AccessMask::DELETE) || share.contains(ShareMode::DELETE))
    };
    allowed(access, other.1) && allowed(other.0, share)
}

pub(crate) fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.contains(['/', '\0'])
        || name == "."
        || name == ".."
    {
        return Err(FsError::InvalidArgument(format!("bad name {name:?}")));
    }
    Ok(())
}

/// the path spelled with single separators and no trailing one
pub(crate) fn normalize(path: &str) -> FsResult<String> {
    Ok(format!("/{}", components(path)?.join("/")))
}

/// split an absolute path into its components
pub(crate) fn components(path: &str) -> FsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!("{path:?} is not absolute")));
    }
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    for part in &parts {
        validate_name(part)?;
    }
    Ok(parts)
}

/// This block is about path resolution
impl Volume {
    /// inode of the object at `path`
    pub fn lookup(&self, path: &str) -> FsResult<u64> {
        let parts = components(path)?;
        let directories = self.directories.read();
        let mut current = ROOT_INODE;
        for part in parts {
            current = directories
                .get(&current)
                .and_then(|dir| dir.entry(part))
                .map(|entry| entry.target)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// the directory that holds `path` and the last component
    pub(crate) fn split_parent(&self, path: &str) -> FsResult<(u64, String)> {
        let parts = components(path)?;
        let Some((name, dirs)) = parts.split_last() else {
            return Err(FsError::InvalidArgument("the root has no parent".into()));
        };
        let parent_path = format!("/{}", dirs.join("/"));
        let parent = self.lookup(&parent_path)?;
        if !self.directories.read().contains_key(&parent) {
            return Err(FsError::NotFound(format!("{parent_path} is not a directory")));
        }
        Ok((parent, name.to_string()))
    }

    pub(crate) fn acl_of(&self, inode: u64) -> FsResult<Acl> {
        if let Some(acl) = self.acls.read().get(&inode) {
            return Ok(acl.clone());
        }
        let inodes = self.inodes.read();
        let inode = inodes.expect(inode)?;
        Ok(Acl::default_for(Credentials::new(inode.user_id, inode.group_id)))
    }
}

/// This block is about the lifecycle shared by files and directories
impl Volume {
    /// Allocate an inode and bind it under its parent.
    ///
    /// Nothing stays allocated when an error is returned.
    pub(crate) fn create_object(
        &self,
        path: &str,
        kind: FileKind,
        attributes: FileAttributes,
        credentials: Credentials,
    ) -> FsResult<u64> {
        info!("volume {}: create {kind:?} {path}", self.name);
        self.require_mounted()?;
        let (parent, name) = self.split_parent(path)?;
        self.acl_of(parent)?.check(credentials, AccessMask::WRITE)?;
        if self
            .directories
            .read()
            .get(&parent)
            .is_some_and(|dir| dir.contains(&name))
        {
            return Err(FsError::NameCollision(path.to_string()));
        }

        let ino = self.allocate_inode()?;
        let now = self.clock.now();
        let permissions = if kind == FileKind::Directory { 0o755 } else { 0o644 };
        let mut inode = Inode::new(ino, kind, permissions, (credentials.uid, credentials.gid), now);
        inode.attributes = if kind == FileKind::Directory {
            (attributes | FileAttributes::DIRECTORY).bits()
        } else {
            (attributes - FileAttributes::DIRECTORY).bits()
        };
        let entry = DirectoryEntry {
            name: name.clone(),
            kind,
            target: ino,
            size: 0,
            created_at: now,
            modified_at: now,
            accessed_at: now,
        };
        if let Err(e) = self.inodes.write().insert(inode) {
            let _ = self.free_inode(ino);
            return Err(e);
        }
        self.acls.write().insert(ino, Acl::default_for(credentials));

        let sequence = self.journal_append(JournalPayload::Create {
            parent,
            name: name.clone(),
            inode: ino,
            kind,
        });
        let inserted = {
            let mut directories = self.directories.write();
            match directories.get_mut(&parent) {
                Some(dir) => match dir.insert(entry) {
                    Ok(()) => {
                        if kind == FileKind::Directory {
                            directories.insert(ino, Directory::new(parent));
                        }
                        Ok(())
                    }
                    Err(_) => Err(FsError::NameCollision(path.to_string())),
                },
                None => Err(FsError::NotFound(path.to_string())),
            }
        };
        let bound = inserted.and_then(|()| self.persist_directory(parent, None));
        if let Err(e) = bound {
            self.journal_discard(sequence);
            if let Some(dir) = self.directories.write().get_mut(&parent) {
                if dir.entry(&name).is_some_and(|e| e.target == ino) {
                    dir.remove(&name);
                }
            }
            if let Err(undo) = self.release_inode(ino) {
                warn!("volume {}: releasing inode {ino}: {undo}", self.name);
            }
            return Err(e);
        }
        if kind == FileKind::Directory {
            if let Some(parent) = self.inodes.write().get_mut(parent) {
                parent.hard_links += 1;
                parent.update_changed_at(now);
            }
        }
        if let Some(parent) = self.inodes.write().get_mut(parent) {
            parent.update_modified_at(now);
        }
        self.journal_commit(sequence);
        self.stats.inc_creates();
        Ok(ino)
    }

    /// Open `path` under `options.disposition`, returning the new handle id.
    pub(crate) fn open_object(
        &self,
        path: &str,
        kind: FileKind,
        options: &OpenOptions,
    ) -> FsResult<u64> {
        info!(
            "volume {}: open {path} {:?} {:?}",
            self.name, options.access, options.disposition
        );
        self.require_mounted()?;
        let (ino, created) = match (self.lookup(path), options.disposition) {
            (Ok(_), Disposition::CreateNew) => {
                return Err(FsError::NameCollision(path.to_string()))
            }
            (Ok(ino), _) => (ino, false),
            (Err(FsError::NotFound(_)), Disposition::CreateNew)
            | (Err(FsError::NotFound(_)), Disposition::OpenAlways)
            | (Err(FsError::NotFound(_)), Disposition::CreateAlways) => (
                self.create_object(path, kind, options.attributes, options.credentials)?,
                true,
            ),
            (Err(e), _) => return Err(e),
        };
        let actual = self.inodes.read().expect(ino)?.file_kind;
        if !kind_matches(actual, kind) {
            return Err(FsError::InvalidArgument(format!(
                "{path} is a {actual:?}, not a {kind:?}"
            )));
        }
        if !created {
            self.acl_of(ino)?.check(options.credentials, options.access)?;
        }
        let (parent, name) = if ino == ROOT_INODE {
            (ROOT_INODE, String::new())
        } else {
            self.split_parent(path)?
        };
        let normalized = normalize(path)?;

        let id = self.objects.next_id();
        let object = {
            let mut objects = self.objects.objects.lock();
            let object = objects
                .entry(ino)
                .or_insert_with(|| {
                    let (level, lines) = if actual == FileKind::Directory {
                        (CacheLevel::Directory, self.params.directory_cache_lines)
                    } else {
                        (CacheLevel::File, self.params.file_cache_lines)
                    };
                    Arc::new(FsObject {
                        inode: ino,
                        kind: actual,
                        location: Mutex::new(Location {
                            path: normalized,
                            parent,
                            name,
                        }),
                        status: Mutex::new(ObjectStatus {
                            state: ObjectState::Opening,
                            opens: HashMap::new(),
                            active_io: 0,
                            delete_pending: false,
                        }),
                        cache: BlockCache::new(level, lines.max(1), self.stats.clone()),
                        write_lock: std::sync::Mutex::new(()),
                    })
                })
                .clone();
            let mut status = object.status.lock();
            if status.delete_pending {
                return Err(FsError::NotFound(path.to_string()));
            }
            if status.state == ObjectState::Failed {
                return Err(FsError::InvalidDeviceState(format!("{path} has failed")));
            }
            if let Some(other) = status
                .opens
                .values()
                .find(|other| !shares_with(options.access, options.share, **other))
            {
                return Err(FsError::SharingViolation(format!(
                    "{path} is open for {:?} sharing {:?}",
                    other.0, other.1
                )));
            }
            status.opens.insert(id, (options.access, options.share));
            if status.active_io == 0 {
                status.state = ObjectState::Open;
            }
            drop(status);
            object
        };
        self.objects.handles.lock().insert(
            id,
            OpenHandle {
                object,
                access: options.access,
                credentials: options.credentials,
            },
        );
        if let Some(inode) = self.inodes.write().get_mut(ino) {
            inode.update_accessed_at(self.clock.now());
        }
        self.stats.inc_opens();
        debug!("volume {}: handle {id} -> inode {ino}", self.name);
        Ok(id)
    }

    /// Drop one handle; the last one releases the object and finishes a pending delete.
    pub(crate) fn close_object(&self, id: u64, kind: FileKind) -> FsResult<()> {
        let handle = self.objects.take_handle(id, kind)?;
        self.stats.inc_closes();
        let object = handle.object;
        let flushed = self.flush_cache(&object.cache);
        if let Err(e) = &flushed {
            warn!("volume {}: flushing inode {}: {e}", self.name, object.inode);
        }
        let finalize = {
            let mut objects = self.objects.objects.lock();
            let mut status = object.status.lock();
            status.opens.remove(&id);
            if status.opens.is_empty() {
                if objects
                    .get(&object.inode)
                    .is_some_and(|o| Arc::ptr_eq(o, &object))
                {
                    objects.remove(&object.inode);
                }
                let finalize = status.delete_pending;
                status.state = ObjectState::Closed;
                finalize
            } else {
                false
            }
        };
        if finalize {
            object.cache.invalidate_volume(self.id);
            debug!("volume {}: freeing deleted inode {}", self.name, object.inode);
            self.release_inode(object.inode)?;
        }
        flushed
    }

    /// Unbind the object from its parent; the inode goes away with the last handle.
    pub(crate) fn delete_object(&self, id: u64, kind: FileKind) -> FsResult<()> {
        let handle = self.objects.handle(id, kind)?;
        let object = handle.object.clone();
        self.require_mounted()?;
        if object.inode == ROOT_INODE {
            return Err(FsError::InvalidArgument("the root cannot be deleted".into()));
        }
        let location = object.location();
        info!("volume {}: delete {}", self.name, location.path);
        self.acl_of(object.inode)?
            .check(handle.credentials, AccessMask::DELETE)?;
        {
            let mut status = object.status.lock();
            if status.delete_pending {
                return Err(FsError::NotFound(location.path));
            }
            if status.active_io > 0 {
                return Err(FsError::SharingViolation(format!(
                    "{} has I/O in flight",
                    location.path
                )));
            }
            status.state = ObjectState::Deleting;
        }

        let sequence = self.journal_append(JournalPayload::Delete {
            parent: location.parent,
            name: location.name.clone(),
            inode: object.inode,
        });
        let removed = {
            let mut directories = self.directories.write();
            let not_empty = directories
                .get(&object.inode)
                .is_some_and(|dir| !dir.is_empty());
            if not_empty {
                Err(FsError::DirectoryNotEmpty(location.path.clone()))
            } else {
                match directories.get_mut(&location.parent) {
                    Some(dir) if dir.entry(&location.name).is_some_and(|e| e.target == object.inode) => {
                        dir.remove(&location.name);
                        Ok(())
                    }
                    _ => Err(FsError::NotFound(location.path.clone())),
                }
            }
        };
        if let Err(e) = removed {
            self.journal_discard(sequence);
            let mut status = object.status.lock();
            if status.state == ObjectState::Deleting {
                status.state = ObjectState::Open;
            }
            return Err(e);
        }
        {
            let mut status = object.status.lock();
            status.delete_pending = true;
            status.state = ObjectState::Open;
        }
        let now = self.clock.now();
        if let Some(parent) = self.inodes.write().get_mut(location.parent) {
            if kind == FileKind::Directory {
                parent.hard_links = parent.hard_links.saturating_sub(1);
            }
            parent.update_modified_at(now);
        }
        if let Some(inode) = self.inodes.write().get_mut(object.inode) {
            inode.hard_links = inode.hard_links.saturating_sub(1);
            inode.update_changed_at(now);
        }
        let persisted = self.persist_directory(location.parent, None);
        self.journal_commit(sequence);
        self.stats.inc_deletes();
        let closed = self.close_object(id, kind);
        persisted.and(closed)
    }

    /// Move the object to `new_path` in one journaled step.
    pub(crate) fn rename_object(&self, id: u64, kind: FileKind, new_path: &str) -> FsResult<()> {
        let handle = self.objects.handle(id, kind)?;
        let object = handle.object.clone();
        self.require_mounted()?;
        let old = object.location();
        info!("volume {}: rename {} -> {new_path}", self.name, old.path);
        if object.inode == ROOT_INODE {
            return Err(FsError::InvalidArgument("the root cannot be renamed".into()));
        }
        let (new_parent, new_name) = self.split_parent(new_path)?;
        if old.parent == new_parent && old.name == new_name {
            return Ok(());
        }
        self.acl_of(new_parent)?
            .check(handle.credentials, AccessMask::WRITE)?;
        if kind == FileKind::Directory {
            let directories = self.directories.read();
            let mut ancestor = new_parent;
            loop {
                if ancestor == object.inode {
                    return Err(FsError::InvalidArgument(format!(
                        "cannot move {} under itself",
                        old.path
                    )));
                }
                match directories.get(&ancestor) {
                    Some(dir) if ancestor != ROOT_INODE => ancestor = dir.parent,
                    _ => break,
                }
            }
        }

        let sequence = self.journal_append(JournalPayload::Rename {
            inode: object.inode,
            old_parent: old.parent,
            old_name: old.name.clone(),
            new_parent,
            new_name: new_name.clone(),
        });
        let moved = {
            let mut directories = self.directories.write();
            if directories
                .get(&new_parent)
                .is_some_and(|dir| dir.contains(&new_name))
            {
                Err(FsError::NameCollision(new_path.to_string()))
            } else {
                let entry = directories.get_mut(&old.parent).and_then(|dir| {
                    match dir.entry(&old.name) {
                        Some(e) if e.target == object.inode => dir.remove(&old.name),
                        _ => None,
                    }
                });
                match (entry, directories.get_mut(&new_parent)) {
                    (Some(mut entry), Some(dir)) => {
                        entry.name = new_name.clone();
                        // the name was checked free under this lock
                        let _ = dir.insert(entry);
                        if let Some(moved) = directories.get_mut(&object.inode) {
                            moved.parent = new_parent;
                        }
                        Ok(())
                    }
                    (Some(entry), None) => {
                        if let Some(dir) = directories.get_mut(&old.parent) {
                            let _ = dir.insert(entry);
                        }
                        Err(FsError::NotFound(new_path.to_string()))
                    }
                    (None, _) => Err(FsError::NotFound(old.path.clone())),
                }
            }
        };
        if let Err(e) = moved {
            self.journal_discard(sequence);
            return Err(e);
        }
        let now = self.clock.now();
        {
            let mut inodes = self.inodes.write();
            if kind == FileKind::Directory && old.parent != new_parent {
                if let Some(parent) = inodes.get_mut(old.parent) {
                    parent.hard_links = parent.hard_links.saturating_sub(1);
                }
                if let Some(parent) = inodes.get_mut(new_parent) {
                    parent.hard_links += 1;
                }
            }
            for parent in [old.parent, new_parent] {
                if let Some(parent) = inodes.get_mut(parent) {
                    parent.update_modified_at(now);
                }
            }
            if let Some(inode) = inodes.get_mut(object.inode) {
                inode.update_changed_at(now);
            }
        }
        let mut persisted = self.persist_directory(old.parent, None);
        if new_parent != old.parent {
            persisted = persisted.and(self.persist_directory(new_parent, None));
        }
        self.journal_commit(sequence);

        let new_path = normalize(new_path)?;
        for descendant in self.objects.under(&old.path) {
            let mut location = descendant.location.lock();
            location.path = format!("{new_path}{}", &location.path[old.path.len()..]);
        }
        *object.location.lock() = Location {
            path: new_path,
            parent: new_parent,
            name: new_name,
        };
        self.stats.inc_renames();
        persisted
    }

    /// the ACL of the object behind an open handle
    pub(crate) fn object_security(&self, id: u64, kind: FileKind) -> FsResult<Acl> {
        let handle = self.objects.handle(id, kind)?;
        handle.require(AccessMask::READ_CONTROL)?;
        self.acl_of(handle.object.inode)
    }

    pub(crate) fn set_object_security(&self, id: u64, kind: FileKind, acl: Acl) -> FsResult<()> {
        let handle = self.objects.handle(id, kind)?;
        self.require_mounted()?;
        self.acl_of(handle.object.inode)?
            .check(handle.credentials, AccessMask::WRITE_CONTROL)?;
        info!(
            "volume {}: {} ACL entries on inode {}",
            self.name,
            acl.entries.len(),
            handle.object.inode
        );
        self.acls.write().insert(handle.object.inode, acl);
        if let Some(inode) = self.inodes.write().get_mut(handle.object.inode) {
            inode.update_changed_at(self.clock.now());
        }
        Ok(())
    }

    /// Close every handle, as on unmount. Deletes still pending are finished.
    pub(crate) fn close_all_objects(&self) -> FsResult<()> {
        let ids: Vec<(u64, FileKind)> = self
            .objects
            .handles
            .lock()
            .iter()
            .map(|(id, handle)| (*id, handle.object.kind))
            .collect();
        if !ids.is_empty() {
            info!("volume {}: closing {} open handles", self.name, ids.len());
        }
        let mut first_error = None;
        for (id, kind) in ids {
            match self.close_object(id, kind) {
                Ok(()) | Err(FsError::InvalidHandle(_)) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_modes() {
        let rw = AccessMask::READ | AccessMask::WRITE;
        assert!(shares_with(
            AccessMask::READ,
            ShareMode::READ,
            (AccessMask::READ, ShareMode::READ)
        ));
        assert!(!shares_with(
            rw,
            ShareMode::READ,
            (AccessMask::READ, ShareMode::READ)
        ));
        assert!(shares_with(
            rw,
            ShareMode::READ | ShareMode::WRITE,
            (rw, ShareMode::READ | ShareMode::WRITE)
        ));
        // the new opener refuses to share what the existing one already does
        assert!(!shares_with(
            AccessMask::READ,
            ShareMode::empty(),
            (AccessMask::READ, ShareMode::READ)
        ));
    }

    #[test]
    fn test_path_components() {
        assert_eq!(components("/").unwrap(), Vec::<&str>::new());
        assert_eq!(components("/a//b/").unwrap(), vec!["a", "b"]);
        assert!(components("a/b").is_err());
        assert!(components("/a/../b").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
