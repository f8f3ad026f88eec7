//! block devices consumed by the storage engine
//!
//! A volume sees all of its devices as one flat pool of volume-sized blocks,
//! the devices laid end to end in the order they were attached.
use std::{
    collections::HashMap,
    fmt::Debug,
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use memmap2::MmapMut;
use serde::Serialize;
use spin::{Mutex, RwLock};

use crate::error::{FsError, FsResult};

/// zeroing is issued in chunks of this many blocks
const ZERO_CHUNK_BLOCKS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Memory,
    ImageFile,
}

/// a device that moves whole native blocks
pub trait BlockDevice: Send + Sync + Debug {
    fn device_type(&self) -> DeviceType;
    /// native block size in bytes
    fn block_size(&self) -> u32;
    fn capacity_blocks(&self) -> u64;
    fn read_blocks(&self, start: u64, count: u64) -> FsResult<Vec<u8>>;
    fn write_blocks(&self, start: u64, count: u64, data: &[u8]) -> FsResult<()>;
    fn flush(&self) -> FsResult<()> {
        Ok(())
    }
    fn mount(&self) -> FsResult<()>;
    fn unmount(&self) -> FsResult<()>;
    fn is_mounted(&self) -> bool;

    fn capacity_bytes(&self) -> u64 {
        self.capacity_blocks() * self.block_size() as u64
    }
}

/// shared range and length checks of the provided devices
fn check_io(
    name: &str,
    start: u64,
    count: u64,
    capacity: u64,
    block_size: u32,
    data_len: Option<usize>,
) -> FsResult<(usize, usize)> {
    let end = start
        .checked_add(count)
        .filter(|end| *end <= capacity)
        .ok_or_else(|| {
            FsError::InvalidArgument(format!(
                "{name}: blocks {start}+{count} past capacity {capacity}"
            ))
        })?;
    let from = (start * block_size as u64) as usize;
    let to = (end * block_size as u64) as usize;
    if let Some(len) = data_len {
        if len != to - from {
            return Err(FsError::InvalidArgument(format!(
                "{name}: {len} bytes for {count} blocks of {block_size}"
            )));
        }
    }
    Ok((from, to))
}

/// toggles that make a device fail on purpose
#[derive(Debug, Default)]
pub struct FaultInjection {
    pub fail_mount: AtomicBool,
    pub fail_unmount: AtomicBool,
    pub fail_io: AtomicBool,
    pub fail_read: AtomicBool,
}

impl FaultInjection {
    fn check(&self, flag: &AtomicBool, what: &str) -> FsResult<()> {
        if flag.load(Ordering::Acquire) {
            return Err(FsError::Io(std::io::Error::other(format!(
                "injected {what} failure"
            ))));
        }
        Ok(())
    }
}

/// a device backed by heap memory
#[derive(Debug)]
pub struct MemoryDevice {
    name: String,
    block_size: u32,
    data: Mutex<Vec<u8>>,
    mounted: AtomicBool,
    pub faults: FaultInjection,
}

impl MemoryDevice {
    pub fn new(name: &str, capacity_bytes: u64, block_size: u32) -> Self {
        let blocks = capacity_bytes / block_size as u64;
        MemoryDevice {
            name: name.to_string(),
            block_size,
            data: Mutex::new(vec![0u8; (blocks * block_size as u64) as usize]),
            mounted: AtomicBool::new(false),
            faults: FaultInjection::default(),
        }
    }
}

impl BlockDevice for MemoryDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::Memory
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity_blocks(&self) -> u64 {
        self.data.lock().len() as u64 / self.block_size as u64
    }

    fn read_blocks(&self, start: u64, count: u64) -> FsResult<Vec<u8>> {
        self.faults.check(&self.faults.fail_io, "read")?;
        self.faults.check(&self.faults.fail_read, "read")?;
        let data = self.data.lock();
        let capacity = data.len() as u64 / self.block_size as u64;
        let (from, to) = check_io(&self.name, start, count, capacity, self.block_size, None)?;
        Ok(data[from..to].to_vec())
    }

    fn write_blocks(&self, start: u64, count: u64, bytes: &[u8]) -> FsResult<()> {
        self.faults.check(&self.faults.fail_io, "write")?;
        let mut data = self.data.lock();
        let capacity = data.len() as u64 / self.block_size as u64;
        let (from, to) = check_io(
            &self.name,
            start,
            count,
            capacity,
            self.block_size,
            Some(bytes.len()),
        )?;
        data[from..to].copy_from_slice(bytes);
        Ok(())
    }

    fn mount(&self) -> FsResult<()> {
        self.faults.check(&self.faults.fail_mount, "mount")?;
        if self.mounted.swap(true, Ordering::AcqRel) {
            return Err(FsError::InvalidDeviceState(format!(
                "{} is already mounted",
                self.name
            )));
        }
        Ok(())
    }

    fn unmount(&self) -> FsResult<()> {
        self.faults.check(&self.faults.fail_unmount, "unmount")?;
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return Err(FsError::InvalidDeviceState(format!(
                "{} is not mounted",
                self.name
            )));
        }
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }
}

/// a device backed by a regular image file, accessed through a memory map
#[derive(Debug)]
pub struct ImageFileDevice {
    path: PathBuf,
    block_size: u32,
    image_file_mmap: Mutex<MmapMut>,
    mounted: AtomicBool,
}

impl ImageFileDevice {
    /// create (or grow) the image file to `size` bytes, then open it
    pub fn create<P>(path: P, size: u64, block_size: u32) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        // align file size to block size
        file.set_len(size - size % block_size as u64)?;
        drop(file);
        Self::open(path, block_size)
    }

    pub fn open<P>(path: P, block_size: u32) -> anyhow::Result<Self>
    where
        P: AsRef<Path>,
    {
        // open the "device" for read and write
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        // Safety
        // the image file is owned by this device for its whole lifetime;
        // concurrent modification by another process is undefined behaviour of the mapping.
        // from https://docs.rs/memmap2/0.5.10/memmap2/struct.MmapMut.html
        let image_file_mmap = unsafe { MmapMut::map_mut(&file)? };
        info!(
            "opened image {:?}: {} bytes",
            path.as_ref(),
            image_file_mmap.len()
        );
        Ok(ImageFileDevice {
            path: path.as_ref().to_path_buf(),
            block_size,
            image_file_mmap: Mutex::new(image_file_mmap),
            mounted: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for ImageFileDevice {
    fn device_type(&self) -> DeviceType {
        DeviceType::ImageFile
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn capacity_blocks(&self) -> u64 {
        self.image_file_mmap.lock().len() as u64 / self.block_size as u64
    }

    fn read_blocks(&self, start: u64, count: u64) -> FsResult<Vec<u8>> {
        let mmap = self.image_file_mmap.lock();
        let capacity = mmap.len() as u64 / self.block_size as u64;
        let name = self.path.to_string_lossy();
        let (from, to) = check_io(&name, start, count, capacity, self.block_size, None)?;
        Ok(mmap[from..to].to_vec())
    }

    fn write_blocks(&self, start: u64, count: u64, data: &[u8]) -> FsResult<()> {
        let mut mmap = self.image_file_mmap.lock();
        let capacity = mmap.len() as u64 / self.block_size as u64;
        let name = self.path.to_string_lossy();
        let (from, to) = check_io(
            &name,
            start,
            count,
            capacity,
            self.block_size,
            Some(data.len()),
        )?;
        mmap[from..to].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(self.image_file_mmap.lock().flush()?)
    }

    fn mount(&self) -> FsResult<()> {
        if self.mounted.swap(true, Ordering::AcqRel) {
            return Err(FsError::InvalidDeviceState(format!(
                "{:?} is already mounted",
                self.path
            )));
        }
        Ok(())
    }

    fn unmount(&self) -> FsResult<()> {
        self.flush()?;
        if !self.mounted.swap(false, Ordering::AcqRel) {
            return Err(FsError::InvalidDeviceState(format!(
                "{:?} is not mounted",
                self.path
            )));
        }
        Ok(())
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }
}

/// devices known to this instance, by path
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Arc<dyn BlockDevice>>>,
}

impl DeviceRegistry {
    pub fn register(&self, path: &str, device: Arc<dyn BlockDevice>) -> FsResult<()> {
        let mut devices = self.devices.write();
        if devices.contains_key(path) {
            return Err(FsError::NameCollision(path.to_string()));
        }
        info!(
            "registered device {path}: {:?}, {} bytes",
            device.device_type(),
            device.capacity_bytes()
        );
        devices.insert(path.to_string(), device);
        Ok(())
    }

    pub fn get(&self, path: &str) -> FsResult<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NoSuchDevice(path.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Attached,
    Mounted,
    Failed,
}

/// A backing device contributing capacity to one volume
#[derive(Debug)]
pub struct VolumeDevice {
    pub path: String,
    pub device_type: DeviceType,
    /// bytes this device contributes to the pool
    pub size_share: u64,
    pub block_size: u32,
    /// first pool block served by this device
    pub first_block: u64,
    pub blocks: u64,
    state: Mutex<DeviceState>,
    device: Arc<dyn BlockDevice>,
}

impl VolumeDevice {
    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    /// native blocks per pool block
    fn ratio(&self, pool_block_size: u32) -> u64 {
        (pool_block_size / self.block_size) as u64
    }
}

/// the devices of one volume as a flat array of `block_size` blocks
#[derive(Debug)]
pub struct DevicePool {
    block_size: u32,
    devices: Vec<VolumeDevice>,
    capacity_blocks: u64,
}

impl DevicePool {
    pub fn new(block_size: u32, devices: Vec<(String, Arc<dyn BlockDevice>)>) -> FsResult<Self> {
        if devices.is_empty() {
            return Err(FsError::InvalidArgument("a volume needs at least one device".into()));
        }
        let mut attached = Vec::with_capacity(devices.len());
        let mut next = 0;
        for (path, device) in devices {
            let native = device.block_size();
            if native == 0 || block_size % native != 0 {
                return Err(FsError::InvalidArgument(format!(
                    "{path}: device block size {native} does not divide {block_size}"
                )));
            }
            let blocks = device.capacity_bytes() / block_size as u64;
            attached.push(VolumeDevice {
                path,
                device_type: device.device_type(),
                size_share: blocks * block_size as u64,
                block_size: native,
                first_block: next,
                blocks,
                state: Mutex::new(DeviceState::Attached),
                device,
            });
            next += blocks;
        }
        Ok(DevicePool {
            block_size,
            devices: attached,
            capacity_blocks: next,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn capacity_blocks(&self) -> u64 {
        self.capacity_blocks
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_blocks * self.block_size as u64
    }

    pub fn devices(&self) -> &[VolumeDevice] {
        &self.devices
    }

    /// split `start..start + count` into per-device runs
    fn runs(&self, start: u64, count: u64) -> FsResult<Vec<(&VolumeDevice, u64, u64)>> {
        let end = start
            .checked_add(count)
            .filter(|end| *end <= self.capacity_blocks)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!(
                    "pool blocks {start}+{count} past capacity {}",
                    self.capacity_blocks
                ))
            })?;
        let mut runs = Vec::new();
        let mut block = start;
        for device in &self.devices {
            if block >= end {
                break;
            }
            let device_end = device.first_block + device.blocks;
            if block >= device_end {
                continue;
            }
            let run = end.min(device_end) - block;
            runs.push((device, block - device.first_block, run));
            block += run;
        }
        Ok(runs)
    }

    pub fn read_blocks(&self, start: u64, count: u64) -> FsResult<Vec<u8>> {
        let mut data = Vec::with_capacity((count * self.block_size as u64) as usize);
        for (device, offset, run) in self.runs(start, count)? {
            let ratio = device.ratio(self.block_size);
            data.extend(device.device.read_blocks(offset * ratio, run * ratio)?);
        }
        Ok(data)
    }

    pub fn write_blocks(&self, start: u64, count: u64, data: &[u8]) -> FsResult<()> {
        if data.len() as u64 != count * self.block_size as u64 {
            return Err(FsError::InvalidArgument(format!(
                "{} bytes for {count} blocks of {}",
                data.len(),
                self.block_size
            )));
        }
        let mut consumed = 0;
        for (device, offset, run) in self.runs(start, count)? {
            let ratio = device.ratio(self.block_size);
            let len = (run * self.block_size as u64) as usize;
            device
                .device
                .write_blocks(offset * ratio, run * ratio, &data[consumed..consumed + len])?;
            consumed += len;
        }
        Ok(())
    }

    pub fn zero_blocks(&self, start: u64, count: u64) -> FsResult<()> {
        debug!("zeroing pool blocks {start}+{count}");
        let mut done = 0;
        while done < count {
            let chunk = (count - done).min(ZERO_CHUNK_BLOCKS);
            let zeros = vec![0u8; (chunk * self.block_size as u64) as usize];
            self.write_blocks(start + done, chunk, &zeros)?;
            done += chunk;
        }
        Ok(())
    }

    pub fn flush(&self) -> FsResult<()> {
        for device in &self.devices {
            device.device.flush()?;
        }
        Ok(())
    }

    /// mount every device, undoing the ones already mounted on the first failure
    pub fn mount_all(&self) -> FsResult<()> {
        for (index, device) in self.devices.iter().enumerate() {
            if let Err(e) = device.device.mount() {
                warn!("mounting {} failed: {e}", device.path);
                *device.state.lock() = DeviceState::Failed;
                for mounted in &self.devices[..index] {
                    if let Err(undo) = mounted.device.unmount() {
                        warn!("rolling back mount of {} failed: {undo}", mounted.path);
                    }
                    *mounted.state.lock() = DeviceState::Attached;
                }
                return Err(e);
            }
            *device.state.lock() = DeviceState::Mounted;
        }
        Ok(())
    }

    /// mount whatever is not mounted yet, leaving the rest alone
    pub fn ensure_mounted(&self) -> FsResult<()> {
        for device in &self.devices {
            if !device.device.is_mounted() {
                device.device.mount()?;
                *device.state.lock() = DeviceState::Mounted;
            }
        }
        Ok(())
    }

    /// unmount every device, reporting the first failure after trying them all
    pub fn unmount_all(&self) -> FsResult<()> {
        let mut first_error = None;
        for device in &self.devices {
            match device.device.unmount() {
                Ok(()) => *device.state.lock() = DeviceState::Attached,
                Err(e) => {
                    warn!("unmounting {} failed: {e}", device.path);
                    *device.state.lock() = DeviceState::Failed;
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

    fn pool_of(sizes: &[u64]) -> (DevicePool, Vec<Arc<MemoryDevice>>) {
        let devices: Vec<Arc<MemoryDevice>> = sizes
            .iter()
            .enumerate()
            .map(|(i, size)| Arc::new(MemoryDevice::new(&format!("/dev/m{i}"), *size, 512)))
            .collect();
        let pool = DevicePool::new(
            1024,
            devices
                .iter()
                .enumerate()
                .map(|(i, d)| (format!("/dev/m{i}"), d.clone() as Arc<dyn BlockDevice>))
                .collect(),
        )
        .unwrap();
        (pool, devices)
    }

    #[test]
    fn test_pool_spans_devices() {
        let (pool, devices) = pool_of(&[4 * 1024, 4 * 1024 + 512]);
        // the trailing half block of the second device is unusable
        assert_eq!(pool.capacity_blocks(), 8);
        let data: Vec<u8> = (0..3 * 1024).map(|i| (i % 251) as u8).collect();
        pool.write_blocks(3, 3, &data).unwrap();
        assert_eq!(pool.read_blocks(3, 3).unwrap(), data);
        // pool block 4 is the first block of the second device
        assert_eq!(devices[1].read_blocks(0, 2).unwrap(), data[1024..2048]);
        assert!(pool.read_blocks(7, 2).is_err());
        pool.zero_blocks(3, 3).unwrap();
        assert!(pool.read_blocks(3, 3).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mount_rolls_back_on_failure() {
        let (pool, devices) = pool_of(&[4096, 4096]);
        devices[1].faults.fail_mount.store(true, Ordering::Release);
        assert!(pool.mount_all().is_err());
        assert!(!devices[0].is_mounted());
        assert_eq!(pool.devices()[1].state(), DeviceState::Failed);

        devices[1].faults.fail_mount.store(false, Ordering::Release);
        pool.mount_all().unwrap();
        assert!(devices.iter().all(|d| d.is_mounted()));
        pool.unmount_all().unwrap();
        assert!(pool.unmount_all().is_err());
    }

    #[test]
    fn test_registry() {
        let registry = DeviceRegistry::default();
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new("/dev/a", 4096, 512));
        registry.register("/dev/a", device.clone()).unwrap();
        assert!(matches!(
            registry.register("/dev/a", device),
            Err(FsError::NameCollision(_))
        ));
        assert!(registry.get("/dev/a").is_ok());
        assert!(matches!(registry.get("/dev/b"), Err(FsError::NoSuchDevice(_))));
    }

    #[test]
    fn test_image_file_device() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let device = ImageFileDevice::create(&path, 8 * 1024 + 100, 1024)?;
        assert_eq!(device.capacity_blocks(), 8);
        device.write_blocks(2, 1, &[7u8; 1024])?;
        device.flush()?;
        drop(device);
        let device = ImageFileDevice::open(&path, 1024)?;
        assert_eq!(device.read_blocks(2, 1)?, vec![7u8; 1024]);
        Ok(())
    }
}
