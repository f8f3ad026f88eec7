//! create our filesystem inside an image file
use std::{path::Path, sync::Arc};

use anyhow::anyhow;
use byte_unit::{Byte, ByteUnit};
use log::info;

use crate::{
    cache::{BlockCache, CacheLevel},
    config::FsConfig,
    device::{BlockDevice, DevicePool, ImageFileDevice},
    fs::{Layout, BLOCKS_PER_INODE},
    object::Credentials,
    stats::Statistics,
    utils::time_util::SystemClock,
    volume::{Volume, VolumeEnv, VolumeInfo, VolumeParams, VolumeType},
};

/// sector size image files are addressed in
pub const IMAGE_SECTOR_SIZE: u32 = 512;

/// create a new filesystem, given the path of the image file, the volume size and name
/// # Params
/// - `image_file_path`: the path of the image file, which must not exist yet
/// - `size`: usable bytes of the volume; the image also holds the metadata header
/// - `name`: the volume name
/// - `config`: block size, cluster size and journal settings
///
/// # Return
/// a description of the formatted volume
pub fn mkfs<P>(image_file_path: P, size: u64, name: &str, config: &FsConfig) -> anyhow::Result<VolumeInfo>
where
    P: AsRef<Path>,
{
    config.validate()?;
    let image_file_path = image_file_path.as_ref();
    if image_file_path.exists() {
        return Err(anyhow!("{image_file_path:?} already exists"));
    }
    let block_size = config.block_size;
    let block_count = size / block_size as u64;
    let journal_size = if config.journal_enabled {
        config.journal_size
    } else {
        0
    };
    let layout = Layout::compute(
        block_count,
        block_count / BLOCKS_PER_INODE,
        block_size,
        journal_size,
    );
    let image_size = layout.header_bytes(block_size) + block_count * block_size as u64;
    info!(
        "creating image {image_file_path:?} of {} for a {} volume",
        Byte::from_bytes(image_size as _).get_appropriate_unit(true),
        Byte::from_bytes(size as _).get_adjusted_unit(ByteUnit::MiB)
    );

    let device = Arc::new(ImageFileDevice::create(image_file_path, image_size, IMAGE_SECTOR_SIZE)?);
    let path = image_file_path.to_string_lossy().to_string();
    let pool = DevicePool::new(block_size, vec![(path, device as Arc<dyn BlockDevice>)])?;
    let stats = Arc::new(Statistics::default());
    let env = VolumeEnv {
        global_cache: Arc::new(BlockCache::new(
            CacheLevel::Global,
            config.global_cache_lines,
            stats.clone(),
        )),
        stats,
        clock: Arc::new(SystemClock::default()),
    };
    let params = VolumeParams {
        block_size,
        cluster_size: config.cluster_size,
        journal_enabled: config.journal_enabled,
        journal_size: config.journal_size,
        volume_cache_lines: config.volume_cache_lines,
        file_cache_lines: config.file_cache_lines,
        directory_cache_lines: config.directory_cache_lines,
        replication_factor: config.default_replication_factor,
    };
    let volume = match Volume::format(
        1,
        name,
        VolumeType::Local,
        size,
        pool,
        params,
        Credentials::current(),
        env,
    ) {
        Ok(volume) => volume,
        Err(e) => {
            // a half written image is worth nothing
            let _ = std::fs::remove_file(image_file_path);
            return Err(e.into());
        }
    };
    volume.pool().flush()?;
    Ok(volume.info())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fs::{RESERVED_BLOCKS, RESERVED_INODES},
        inspect::inspect,
    };

    fn small_config() -> FsConfig {
        FsConfig {
            block_size: 1024,
            journal_size: 64 * 1024,
            ..FsConfig::default()
        }
    }

    #[test]
    fn test_mkfs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("new_fs.img");
        let info = mkfs(&image, 2 << 20, "V1", &small_config())?;
        assert_eq!(info.size, 2 << 20);
        assert_eq!(info.block_size, 1024);
        assert_eq!(info.free_space, (2048 - RESERVED_BLOCKS) * 1024);

        // test if superblock is written correctly
        let summary = inspect(&image)?;
        assert!(summary.problems.is_empty(), "{:?}", summary.problems);
        assert_eq!(summary.name, "V1");
        assert_eq!(summary.block_count, 2048);
        assert_eq!(summary.free_blocks, 2048 - RESERVED_BLOCKS);
        assert_eq!(summary.free_inodes, 512 - RESERVED_INODES - 1);
        // only the root inode carries a record
        assert_eq!(summary.inodes, 1);
        assert_eq!(summary.journal_slots, 64);
        assert_eq!(summary.pending_journal_entries, 0);
        Ok(())
    }

    #[test]
    fn test_mkfs_without_journal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("plain.img");
        let config = FsConfig {
            journal_enabled: false,
            ..small_config()
        };
        mkfs(&image, 1 << 20, "plain", &config)?;
        let summary = inspect(&image)?;
        assert_eq!(summary.journal_slots, 0);
        assert!(summary.problems.is_empty());
        Ok(())
    }

    #[test]
    fn test_mkfs_refuses_existing_image() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("taken.img");
        std::fs::write(&image, b"keep me")?;
        assert!(mkfs(&image, 2 << 20, "V1", &small_config()).is_err());
        assert_eq!(std::fs::read(&image)?, b"keep me");
        Ok(())
    }

    #[test]
    fn test_mkfs_removes_image_on_bad_name() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("bad.img");
        assert!(mkfs(&image, 2 << 20, "a/b", &small_config()).is_err());
        assert!(!image.exists());
        Ok(())
    }
}
