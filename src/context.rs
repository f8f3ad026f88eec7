//! one filesystem instance: its volumes, devices, caches and coordinator
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{error, info, warn};
use spin::RwLock;

use crate::{
    cache::{BlockCache, CacheLevel},
    config::FsConfig,
    coordinator::{Coordinator, LockInfo, LockMode, LockType},
    device::{BlockDevice, DevicePool, DeviceRegistry},
    error::{FsError, FsResult},
    object::{
        Acl, Credentials, DirectoryHandle, DirectoryInformation, FileAttributes, FileHandle,
        FileInformation, OpenOptions,
    },
    stats::{Statistics, StatisticsSnapshot},
    utils::time_util::Clock,
    volume::{CheckReport, Volume, VolumeEnv, VolumeInfo, VolumeParams, VolumeState, VolumeType},
};

/// Everything one running filesystem owns.
///
/// Instances share nothing, so several can live side by side in one process.
#[derive(Debug)]
pub struct DslsFs {
    config: FsConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<Statistics>,
    global_cache: Arc<BlockCache>,
    coordinator: Coordinator,
    devices: DeviceRegistry,
    volumes: RwLock<HashMap<u64, Arc<Volume>>>,
    next_volume_id: AtomicU64,
    /// serializes volume creation and deletion, holds device path -> volume
    admin: std::sync::Mutex<HashMap<String, u64>>,
}

impl DslsFs {
    pub fn initialize(config: FsConfig, clock: Arc<dyn Clock>) -> FsResult<Self> {
        config.validate()?;
        info!(
            "initializing dslsfs on node {} with block size {}",
            config.node_id, config.block_size
        );
        let stats = Arc::new(Statistics::default());
        let global_cache = Arc::new(BlockCache::new(
            CacheLevel::Global,
            config.global_cache_lines,
            stats.clone(),
        ));
        let coordinator = Coordinator::new(&config, clock.clone(), stats.clone());
        Ok(DslsFs {
            config,
            clock,
            stats,
            global_cache,
            coordinator,
            devices: DeviceRegistry::default(),
            volumes: RwLock::new(HashMap::new()),
            next_volume_id: AtomicU64::new(1),
            admin: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Unmount every mounted volume and leave the cluster.
    ///
    /// Keeps going past failures and reports the first one.
    pub fn shutdown(&self) -> FsResult<()> {
        info!("shutting down node {}", self.config.node_id);
        let volumes: Vec<Arc<Volume>> = self.volumes.read().values().cloned().collect();
        let mut first_error = None;
        for volume in volumes {
            if volume.state() != VolumeState::Mounted {
                continue;
            }
            if let Err(e) = volume.unmount(&self.coordinator) {
                error!("unmounting {} at shutdown failed: {e}", volume.name());
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.coordinator.leave_node(self.coordinator.local_node()) {
            warn!("leaving the cluster: {e}");
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn get_statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    pub fn register_device(&self, path: &str, device: Arc<dyn BlockDevice>) -> FsResult<()> {
        self.devices.register(path, device)
    }

    fn volume_params(&self) -> VolumeParams {
        VolumeParams {
            block_size: self.config.block_size,
            cluster_size: self.config.cluster_size,
            journal_enabled: self.config.journal_enabled,
            journal_size: self.config.journal_size,
            volume_cache_lines: self.config.volume_cache_lines,
            file_cache_lines: self.config.file_cache_lines,
            directory_cache_lines: self.config.directory_cache_lines,
            replication_factor: self.config.default_replication_factor,
        }
    }
}

/// This block is about the volume registry
impl DslsFs {
    pub fn create_volume(
        &self,
        name: &str,
        size: u64,
        volume_type: VolumeType,
        device_paths: &[&str],
    ) -> FsResult<u64> {
        info!("create volume {name}: {size} bytes, {volume_type:?}, devices {device_paths:?}");
        let mut claims = self.admin.lock().unwrap_or_else(|e| e.into_inner());
        if self.volumes.read().values().any(|v| v.name() == name) {
            return Err(FsError::NameCollision(format!("volume {name}")));
        }
        let mut devices = Vec::with_capacity(device_paths.len());
        for path in device_paths {
            if let Some(owner) = claims.get(*path) {
                return Err(FsError::InvalidDeviceState(format!(
                    "device {path} belongs to volume {owner}"
                )));
            }
            devices.push((path.to_string(), self.devices.get(path)?));
        }
        let pool = DevicePool::new(self.config.block_size, devices)?;
        let id = self.next_volume_id.fetch_add(1, Ordering::Relaxed);
        let volume = Volume::format(
            id,
            name,
            volume_type,
            size,
            pool,
            self.volume_params(),
            Credentials::current(),
            VolumeEnv {
                global_cache: self.global_cache.clone(),
                stats: self.stats.clone(),
                clock: self.clock.clone(),
            },
        )?;
        for path in device_paths {
            claims.insert(path.to_string(), id);
        }
        self.volumes.write().insert(id, Arc::new(volume));
        Ok(id)
    }

    pub fn volume(&self, id: u64) -> FsResult<Arc<Volume>> {
        self.volumes
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("volume {id}")))
    }

    pub fn volume_by_name(&self, name: &str) -> FsResult<Arc<Volume>> {
        self.volumes
            .read()
            .values()
            .find(|v| v.name() == name)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("volume {name}")))
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn list_volumes(&self) -> Vec<VolumeInfo> {
        let mut infos: Vec<VolumeInfo> = self.volumes.read().values().map(|v| v.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn mount_volume(&self, id: u64) -> FsResult<()> {
        self.volume(id)?.mount(&self.coordinator)
    }

    pub fn unmount_volume(&self, id: u64) -> FsResult<()> {
        self.volume(id)?.unmount(&self.coordinator)
    }

    pub fn check_volume(&self, id: u64, repair: bool) -> FsResult<CheckReport> {
        self.volume(id)?.check(repair)
    }

    pub fn repair_volume(&self, id: u64) -> FsResult<CheckReport> {
        self.volume(id)?.repair()
    }

    /// Unmount the volume if needed, then forget it and free its devices.
    pub fn delete_volume(&self, id: u64) -> FsResult<()> {
        info!("delete volume {id}");
        let mut claims = self.admin.lock().unwrap_or_else(|e| e.into_inner());
        let volume = self.volume(id)?;
        match volume.state() {
            VolumeState::Mounted => volume.unmount(&self.coordinator)?,
            VolumeState::Unmounted | VolumeState::Failed => {}
            state => {
                return Err(FsError::InvalidDeviceState(format!(
                    "volume {} is {state:?}",
                    volume.name()
                )))
            }
        }
        self.volumes.write().remove(&id);
        volume.release(&self.coordinator);
        claims.retain(|_, owner| *owner != id);
        Ok(())
    }
}

/// This block is about file and directory calls routed by handle
impl DslsFs {
    pub fn create_file(&self, volume: u64, path: &str, options: &OpenOptions) -> FsResult<FileHandle> {
        self.volume(volume)?.create_file(path, options)
    }

    pub fn open_file(&self, volume: u64, path: &str, options: &OpenOptions) -> FsResult<FileHandle> {
        self.volume(volume)?.open_file(path, options)
    }

    pub fn close_file(&self, handle: FileHandle) -> FsResult<()> {
        self.volume(handle.volume_id)?.close_file(handle)
    }

    pub fn read_file(&self, handle: FileHandle, offset: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.volume(handle.volume_id)?.read_file(handle, offset, buf)
    }

    pub fn write_file(&self, handle: FileHandle, offset: u64, data: &[u8]) -> FsResult<usize> {
        self.volume(handle.volume_id)?.write_file(handle, offset, data)
    }

    pub fn extend_file(&self, handle: FileHandle, new_size: u64) -> FsResult<()> {
        self.volume(handle.volume_id)?.extend_file(handle, new_size)
    }

    pub fn truncate_file(&self, handle: FileHandle, new_size: u64) -> FsResult<()> {
        self.volume(handle.volume_id)?.truncate_file(handle, new_size)
    }

    pub fn flush_file(&self, handle: FileHandle) -> FsResult<()> {
        self.volume(handle.volume_id)?.flush_file(handle)
    }

    pub fn delete_file(&self, handle: FileHandle) -> FsResult<()> {
        self.volume(handle.volume_id)?.delete_file(handle)
    }

    pub fn rename_file(&self, handle: FileHandle, new_path: &str) -> FsResult<()> {
        self.volume(handle.volume_id)?.rename_file(handle, new_path)
    }

    pub fn set_file_attributes(&self, handle: FileHandle, attributes: FileAttributes) -> FsResult<()> {
        self.volume(handle.volume_id)?
            .set_file_attributes(handle, attributes)
    }

    pub fn get_file_information(&self, handle: FileHandle) -> FsResult<FileInformation> {
        self.volume(handle.volume_id)?.get_file_information(handle)
    }

    pub fn get_file_security(&self, handle: FileHandle) -> FsResult<Acl> {
        self.volume(handle.volume_id)?.get_file_security(handle)
    }

    pub fn set_file_security(&self, handle: FileHandle, acl: Acl) -> FsResult<()> {
        self.volume(handle.volume_id)?.set_file_security(handle, acl)
    }

    pub fn create_directory(
        &self,
        volume: u64,
        path: &str,
        options: &OpenOptions,
    ) -> FsResult<DirectoryHandle> {
        self.volume(volume)?.create_directory(path, options)
    }

    pub fn open_directory(
        &self,
        volume: u64,
        path: &str,
        options: &OpenOptions,
    ) -> FsResult<DirectoryHandle> {
        self.volume(volume)?.open_directory(path, options)
    }

    pub fn close_directory(&self, handle: DirectoryHandle) -> FsResult<()> {
        self.volume(handle.volume_id)?.close_directory(handle)
    }

    pub fn delete_directory(&self, handle: DirectoryHandle) -> FsResult<()> {
        self.volume(handle.volume_id)?.delete_directory(handle)
    }

    pub fn rename_directory(&self, handle: DirectoryHandle, new_path: &str) -> FsResult<()> {
        self.volume(handle.volume_id)?
            .rename_directory(handle, new_path)
    }

    /// Names after `resume_after`, collected; iterate [Volume::read_directory]
    /// directly to stream them.
    pub fn read_directory(
        &self,
        handle: DirectoryHandle,
        resume_after: Option<&str>,
    ) -> FsResult<Vec<crate::fs::DirectoryEntry>> {
        let volume = self.volume(handle.volume_id)?;
        let entries = volume.read_directory(handle, resume_after)?.collect();
        Ok(entries)
    }

    pub fn get_directory_information(&self, handle: DirectoryHandle) -> FsResult<DirectoryInformation> {
        self.volume(handle.volume_id)?
            .get_directory_information(handle)
    }

    pub fn get_directory_security(&self, handle: DirectoryHandle) -> FsResult<Acl> {
        self.volume(handle.volume_id)?.get_directory_security(handle)
    }

    pub fn set_directory_security(&self, handle: DirectoryHandle, acl: Acl) -> FsResult<()> {
        self.volume(handle.volume_id)?
            .set_directory_security(handle, acl)
    }
}

/// This block is about locks taken by the local node
impl DslsFs {
    pub fn acquire_lock(
        &self,
        name: &str,
        lock_type: LockType,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> FsResult<()> {
        self.coordinator
            .acquire_lock(self.coordinator.local_node(), name, lock_type, mode, timeout)
    }

    pub fn release_lock(&self, name: &str) -> FsResult<()> {
        self.coordinator
            .release_lock(self.coordinator.local_node(), name)
    }

    pub fn lock_info(&self, name: &str) -> Option<LockInfo> {
        self.coordinator.lock_info(name)
    }
}
