use crate::error::{FsError, FsResult};

use super::Inode;

/// Per-volume array of inode records, indexed by inode number
#[derive(Debug, Clone, Default)]
pub struct InodeTable {
    slots: Vec<Option<Inode>>,
    allocated: usize,
}

impl InodeTable {
    pub fn new(inode_count: u64) -> Self {
        InodeTable {
            slots: vec![None; inode_count as usize],
            allocated: 0,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn get(&self, index: u64) -> Option<&Inode> {
        self.slots.get(index as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, index: u64) -> Option<&mut Inode> {
        self.slots.get_mut(index as usize)?.as_mut()
    }

    /// look up an inode that must exist
    pub fn expect(&self, index: u64) -> FsResult<&Inode> {
        self.get(index)
            .ok_or_else(|| FsError::NotFound(format!("inode {index}")))
    }

    pub fn expect_mut(&mut self, index: u64) -> FsResult<&mut Inode> {
        self.get_mut(index)
            .ok_or_else(|| FsError::NotFound(format!("inode {index}")))
    }

    /// store a freshly allocated inode in its slot
    pub fn insert(&mut self, inode: Inode) -> FsResult<()> {
        let index = inode.inode_number;
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or_else(|| FsError::InvalidArgument(format!("inode {index} out of range")))?;
        if slot.is_some() {
            return Err(FsError::DiskCorrupt(format!(
                "inode {index} is already in use"
            )));
        }
        *slot = Some(inode);
        self.allocated += 1;
        Ok(())
    }

    pub fn remove(&mut self, index: u64) -> Option<Inode> {
        let removed = self.slots.get_mut(index as usize)?.take();
        if removed.is_some() {
            self.allocated -= 1;
        }
        removed
    }

    /// every allocated inode with its slot number
    pub fn iter(&self) -> impl Iterator<Item = (u64, &Inode)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inode| (i as u64, inode)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut Inode)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|inode| (i as u64, inode)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fs::FileKind, utils::time_util::TimeDurationStruct};

    fn inode(index: u64) -> Inode {
        Inode::new(
            index,
            FileKind::RegularFile,
            0o644,
            (0, 0),
            TimeDurationStruct::default(),
        )
    }

    #[test]
    fn test_insert_get_remove() {
        let mut table = InodeTable::new(16);
        table.insert(inode(3)).unwrap();
        table.insert(inode(7)).unwrap();
        assert_eq!(table.allocated(), 2);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_none());
        assert!(table.get(100).is_none());
        assert!(table.insert(inode(3)).is_err());
        assert!(table.insert(inode(16)).is_err());
        assert_eq!(table.iter().map(|(i, _)| i).collect::<Vec<_>>(), vec![3, 7]);
        assert!(table.remove(3).is_some());
        assert!(table.remove(3).is_none());
        assert_eq!(table.allocated(), 1);
        assert!(matches!(table.expect(3), Err(FsError::NotFound(_))));
    }
}
