//! the data path: file → volume → global cache, then the device pool
use log::{debug, warn};

use crate::{
    cache::{BlockCache, Writeback},
    error::{FsError, FsResult},
    fs::ExtentFlags,
    utils::fs_size_calculator::blocks_for,
};

use super::Volume;

impl Volume {
    fn write_back(&self, writeback: Writeback) -> FsResult<()> {
        self.pool.write_blocks(
            self.layout.device_block(writeback.block),
            1,
            &writeback.data,
        )?;
        self.cache
            .mark_clean((self.id, writeback.block), &writeback.data);
        Ok(())
    }

    fn fill(&self, cache: &BlockCache, block: u64, data: Vec<u8>, dirty: bool) -> FsResult<()> {
        match cache.insert((self.id, block), data, dirty) {
            Some(writeback) => self.write_back(writeback),
            None => Ok(()),
        }
    }

    /// one data block, looked up level by level and filled into every level on the way back
    pub(crate) fn read_block(&self, block: u64, private: Option<&BlockCache>) -> FsResult<Vec<u8>> {
        let key = (self.id, block);
        if let Some(data) = private.and_then(|cache| cache.get(key)) {
            return Ok(data);
        }
        let (data, found_in_volume, found_in_global) = match self.cache.get(key) {
            Some(data) => (data, true, true),
            None => match self.global_cache.get(key) {
                Some(data) => (data, false, true),
                None => (
                    self.pool.read_blocks(self.layout.device_block(block), 1)?,
                    false,
                    false,
                ),
            },
        };
        if !found_in_global {
            self.fill(&self.global_cache, block, data.clone(), false)?;
        }
        if !found_in_volume {
            self.fill(&self.cache, block, data.clone(), false)?;
        }
        if let Some(cache) = private {
            self.fill(cache, block, data.clone(), false)?;
        }
        Ok(data)
    }

    /// write-back: dirty in the private and volume caches, clean in the global one
    pub(crate) fn write_block(
        &self,
        block: u64,
        data: Vec<u8>,
        private: Option<&BlockCache>,
    ) -> FsResult<()> {
        if let Some(cache) = private {
            self.fill(cache, block, data.clone(), true)?;
        }
        self.fill(&self.cache, block, data.clone(), true)?;
        self.fill(&self.global_cache, block, data, false)
    }

    /// write every dirty line of `cache` to the device
    pub(crate) fn flush_cache(&self, cache: &BlockCache) -> FsResult<()> {
        let dirty = cache.take_dirty_of_volume(self.id);
        if !dirty.is_empty() {
            debug!(
                "volume {}: flushing {} {:?} lines",
                self.name,
                dirty.len(),
                cache.level()
            );
        }
        for writeback in dirty {
            self.write_back(writeback)?;
        }
        Ok(())
    }

    /// physical blocks backing `offset..offset + len` of an inode
    fn map_range(&self, inode: u64, offset: u64, len: u64) -> FsResult<Vec<u64>> {
        let bs = self.block_size as u64;
        let inodes = self.inodes.read();
        let inode = inodes.expect(inode)?;
        (offset / bs..(offset + len).div_ceil(bs))
            .map(|index| {
                inode.extents.lookup(index, self.block_size).ok_or_else(|| {
                    FsError::DiskCorrupt(format!(
                        "inode {} has no block at index {index}",
                        inode.inode_number
                    ))
                })
            })
            .collect()
    }

    /// copy `buf.len()` bytes at `offset` of an inode's data, the range must be allocated
    pub(crate) fn read_bytes(
        &self,
        inode: u64,
        offset: u64,
        buf: &mut [u8],
        private: Option<&BlockCache>,
    ) -> FsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let bs = self.block_size as u64;
        let blocks = self.map_range(inode, offset, buf.len() as u64)?;
        let mut done = 0;
        let mut position = offset;
        for block in blocks {
            let within = (position % bs) as usize;
            let chunk = (bs as usize - within).min(buf.len() - done);
            let data = self.read_block(block, private)?;
            buf[done..done + chunk].copy_from_slice(&data[within..within + chunk]);
            done += chunk;
            position += chunk as u64;
        }
        Ok(())
    }

    /// store `data` at `offset` of an inode's data, the range must be allocated
    pub(crate) fn write_bytes(
        &self,
        inode: u64,
        offset: u64,
        data: &[u8],
        private: Option<&BlockCache>,
    ) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let bs = self.block_size as usize;
        let blocks = self.map_range(inode, offset, data.len() as u64)?;
        let mut done = 0;
        let mut position = offset;
        for block in blocks {
            let within = (position % bs as u64) as usize;
            let chunk = (bs - within).min(data.len() - done);
            if chunk == bs {
                self.write_block(block, data[done..done + chunk].to_vec(), private)?;
            } else {
                // the merged block must not lose its volume line between read and write
                let mut existing = self.read_block(block, private)?;
                let key = (self.id, block);
                let pinned = self.cache.pin(key);
                existing[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
                let written = self.write_block(block, existing, private);
                if pinned {
                    self.cache.unpin(key);
                }
                written?;
            }
            done += chunk;
            position += chunk as u64;
        }
        Ok(())
    }

    /// grow an inode's allocation to cover `bytes`, all or nothing.
    ///
    /// New blocks are zeroed on the device before they join the extent map.
    pub(crate) fn grow_allocation(&self, inode: u64, bytes: u64, flags: ExtentFlags) -> FsResult<()> {
        let current = self.inodes.read().expect(inode)?.allocated_blocks(self.block_size);
        let wanted = blocks_for(bytes, self.block_size);
        if wanted <= current {
            return Ok(());
        }
        let blocks = self.allocate_blocks(wanted - current)?;
        if let Err(e) = self.zero_runs(&blocks) {
            let _ = self.free_blocks(&blocks);
            return Err(e);
        }
        let appended = self.inodes.write().expect_mut(inode).map(|inode| {
            for block in &blocks {
                inode.append_block(*block, self.block_size, flags);
            }
        });
        if let Err(e) = appended {
            warn!("volume {}: inode vanished while growing", self.name);
            let _ = self.free_blocks(&blocks);
            return Err(e);
        }
        Ok(())
    }

    /// zero freshly allocated blocks, one device write per contiguous run
    fn zero_runs(&self, blocks: &[u64]) -> FsResult<()> {
        let mut run_start = 0;
        for i in 1..=blocks.len() {
            if i == blocks.len() || blocks[i] != blocks[i - 1] + 1 {
                let start = blocks[run_start];
                self.pool
                    .zero_blocks(self.layout.device_block(start), (i - run_start) as u64)?;
                run_start = i;
            }
        }
        Ok(())
    }

    /// drop the allocation past `keep_bytes`, zeroing the tail of the last kept block
    pub(crate) fn shrink_allocation(
        &self,
        inode: u64,
        keep_bytes: u64,
        private: Option<&BlockCache>,
    ) -> FsResult<()> {
        let bs = self.block_size as u64;
        let tail = keep_bytes % bs;
        if tail != 0 {
            let mapped = self.inodes.read().expect(inode)?.allocation_size > keep_bytes;
            if mapped {
                let zeros = vec![0u8; (bs - tail) as usize];
                self.write_bytes(inode, keep_bytes, &zeros, private)?;
            }
        }
        let released = self
            .inodes
            .write()
            .expect_mut(inode)?
            .truncate_blocks(blocks_for(keep_bytes, self.block_size), self.block_size);
        for block in &released {
            let key = (self.id, *block);
            if let Some(cache) = private {
                cache.invalidate(key);
            }
            self.cache.invalidate(key);
            self.global_cache.invalidate(key);
        }
        self.free_blocks(&released)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        fs::{ExtentFlags, FileKind, Inode},
        volume::manager::tests::mounted_volume,
    };

    #[test]
    fn test_bytes_cross_block_boundaries() -> anyhow::Result<()> {
        let (volume, _) = mounted_volume("io")?;
        let ino = volume.allocate_inode()?;
        volume.inodes.write().insert(Inode::new(
            ino,
            FileKind::RegularFile,
            0o644,
            (0, 0),
            volume.now(),
        ))?;
        volume.grow_allocation(ino, 3000, ExtentFlags::ZEROED)?;
        assert_eq!(volume.inodes.read().expect(ino)?.allocation_size, 3 * 1024);

        let data: Vec<u8> = (0..2000).map(|i| (i % 200) as u8).collect();
        volume.write_bytes(ino, 500, &data, None)?;
        let mut buf = vec![0u8; 2000];
        volume.read_bytes(ino, 500, &mut buf, None)?;
        assert_eq!(buf, data);

        // fresh blocks read back as zeros
        let mut head = vec![0xffu8; 500];
        volume.read_bytes(ino, 0, &mut head, None)?;
        assert!(head.iter().all(|b| *b == 0));

        // everything reaches the device after a flush
        volume.flush_cache(&volume.cache)?;
        assert_eq!(volume.cache.stats().dirty, 0);
        volume.cache.invalidate_volume(volume.id);
        volume.global_cache.invalidate_volume(volume.id);
        volume.read_bytes(ino, 500, &mut buf, None)?;
        assert_eq!(buf, data);

        let free = volume.superblock().free_blocks_count;
        volume.shrink_allocation(ino, 1100, None)?;
        assert_eq!(volume.superblock().free_blocks_count, free + 1);
        let mut tail = vec![0xffu8; 1024 - 76];
        volume.read_bytes(ino, 1100, &mut tail, None)?;
        assert!(tail.iter().all(|b| *b == 0));
        Ok(())
    }
}
