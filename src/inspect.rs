//! offline look at the metadata header of an image file
use std::{path::Path, sync::Arc};

use byte_unit::Byte;
use serde::Serialize;

use crate::{
    device::{BlockDevice, ImageFileDevice},
    mkfs::IMAGE_SECTOR_SIZE,
    utils::time_util::TimeDurationStruct,
    volume::Volume,
};

/// What `dslsfs inspect` reports about an image
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ImageSummary {
    pub volume_id: u64,
    pub name: String,
    pub version: u32,
    pub block_size: u32,
    pub cluster_size: u32,
    pub block_count: u64,
    pub free_blocks: u64,
    pub inode_count: u64,
    pub free_inodes: u64,
    pub header_blocks: u64,
    /// inode records found in the inode table
    pub inodes: usize,
    pub journal_slots: u64,
    pub pending_journal_entries: usize,
    pub created_at: TimeDurationStruct,
    pub last_mounted_at: Option<TimeDurationStruct>,
    pub last_checked_at: Option<TimeDurationStruct>,
    pub error_flag: bool,
    pub error_count: u64,
    pub problems: Vec<String>,
}

pub fn inspect<P>(image_file_path: P) -> anyhow::Result<ImageSummary>
where
    P: AsRef<Path>,
{
    let path = image_file_path.as_ref();
    let device = Arc::new(ImageFileDevice::open(path, IMAGE_SECTOR_SIZE)?);
    let image = Volume::read_metadata(vec![(
        path.to_string_lossy().to_string(),
        device as Arc<dyn BlockDevice>,
    )])?;
    let sb = &image.superblock;
    Ok(ImageSummary {
        volume_id: sb.volume_id,
        name: sb.volume_name.clone(),
        version: sb.version,
        block_size: sb.block_size,
        cluster_size: sb.cluster_size,
        block_count: sb.block_count,
        free_blocks: sb.free_blocks_count,
        inode_count: sb.inode_count,
        free_inodes: sb.free_inodes,
        header_blocks: sb.layout.header_blocks,
        inodes: image.inodes.len(),
        journal_slots: sb.layout.journal.blocks,
        pending_journal_entries: image.pending_journal_entries(),
        created_at: sb.created_at,
        last_mounted_at: sb.last_mounted_at,
        last_checked_at: sb.last_checked_at,
        error_flag: sb.error_flag,
        error_count: sb.error_count,
        problems: image.problems(),
    })
}

impl ImageSummary {
    /// the plain text form printed without `--json`
    pub fn render(&self) -> String {
        let size = |blocks: u64| {
            Byte::from_bytes((blocks * self.block_size as u64) as _)
                .get_appropriate_unit(true)
                .to_string()
        };
        let mut out = format!(
            "volume {} (id {}, version {:#x})\n\
             blocks: {} of {} bytes, {} free ({} of {})\n\
             inodes: {} total, {} free, {} records\n\
             header: {} blocks, journal: {} slots, {} pending\n\
             errors: {} (flag {})\n",
            self.name,
            self.volume_id,
            self.version,
            self.block_count,
            self.block_size,
            self.free_blocks,
            size(self.free_blocks),
            size(self.block_count),
            self.inode_count,
            self.free_inodes,
            self.inodes,
            self.header_blocks,
            self.journal_slots,
            self.pending_journal_entries,
            self.error_count,
            self.error_flag,
        );
        if self.problems.is_empty() {
            out.push_str("no problems found\n");
        }
        for problem in &self.problems {
            out.push_str(&format!("problem: {problem}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::FsConfig, mkfs::mkfs};

    #[test]
    fn test_inspect_reports_damage() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("damaged.img");
        let config = FsConfig {
            block_size: 1024,
            journal_size: 8 * 1024,
            ..FsConfig::default()
        };
        mkfs(&image, 1 << 20, "damaged", &config)?;
        let clean = inspect(&image)?;
        assert!(clean.render().contains("no problems found"));

        // flip every bit of the block bitmap's first word
        let mut bytes = std::fs::read(&image)?;
        let bitmap = 1024 * (1 + 1) as usize;
        for byte in &mut bytes[bitmap..bitmap + 4] {
            *byte = !*byte;
        }
        std::fs::write(&image, bytes)?;

        let summary = inspect(&image)?;
        assert_eq!(summary.problems.len(), 1, "{:?}", summary.problems);
        assert!(summary.render().contains("problem: block bitmap"));
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&summary)?)?;
        assert_eq!(json["name"], "damaged");
        Ok(())
    }

    #[test]
    fn test_inspect_rejects_foreign_files() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let image = dir.path().join("zeros.img");
        std::fs::write(&image, vec![0u8; 64 * 1024])?;
        assert!(inspect(&image).is_err());
        Ok(())
    }
}
