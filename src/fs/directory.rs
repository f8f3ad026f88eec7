use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;

use crate::utils::{
    time_util::TimeDurationStruct,
    traits::{DigestInSelf, SerializeAndDigest},
};

use super::FileKind;

/// One (name → object) binding inside a directory
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: FileKind,
    /// inode number of the target
    pub target: u64,
    pub size: u64,
    pub created_at: TimeDurationStruct,
    pub modified_at: TimeDurationStruct,
    pub accessed_at: TimeDurationStruct,
}

/// the entries of one directory, `.` and `..` are implied and never stored
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Directory {
    /// inode number of the parent, the root is its own parent
    pub parent: u64,
    pub entries: BTreeMap<String, DirectoryEntry>,
    pub digest: [u8; 32],
}

impl Directory {
    pub fn new(parent: u64) -> Self {
        Directory {
            parent,
            ..Default::default()
        }
    }

    pub fn entry(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.get(name)
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// bind `entry`, returning it back if the name is taken
    pub fn insert(&mut self, entry: DirectoryEntry) -> Result<(), DirectoryEntry> {
        if self.entries.contains_key(&entry.name) {
            return Err(entry);
        }
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<DirectoryEntry> {
        self.entries.remove(name)
    }

    /// the entry to resume a listing at, counting from zero
    pub fn next_after(&self, last: Option<&str>) -> Option<&DirectoryEntry> {
        use std::ops::Bound::{Excluded, Unbounded};
        match last {
            None => self.entries.values().next(),
            Some(last) => self
                .entries
                .range::<str, _>((Excluded(last), Unbounded))
                .next()
                .map(|(_, entry)| entry),
        }
    }
}

impl DigestInSelf for Directory {
    fn digest_field(&mut self) -> &mut [u8; 32] {
        &mut self.digest
    }
}
impl SerializeAndDigest for Directory {}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, target: u64) -> DirectoryEntry {
        DirectoryEntry {
            name: name.to_string(),
            kind: FileKind::RegularFile,
            target,
            size: 0,
            created_at: TimeDurationStruct::default(),
            modified_at: TimeDurationStruct::default(),
            accessed_at: TimeDurationStruct::default(),
        }
    }

    #[test]
    fn test_directory_serialization_and_deserialization() -> anyhow::Result<()> {
        let mut dir = Directory::new(2);
        dir.insert(entry("test1.txt", 11)).unwrap();
        dir.insert(entry("test2.txt", 12)).unwrap();
        let buf = SerializeAndDigest::serialize(&mut dir)?;
        let (deserialized, _) = <Directory as SerializeAndDigest>::deserialize(&buf)?;
        assert_eq!(deserialized.entries.len(), 2);
        assert_eq!(deserialized.parent, 2);

        let mut iter = deserialized.entries.values();
        assert_eq!(iter.next().map(|e| e.target), Some(11));
        assert_eq!(iter.next().map(|e| e.target), Some(12));

        Ok(())
    }

    #[test]
    fn test_directory_entry() {
        let mut dir = Directory::new(2);
        dir.insert(entry("test1.txt", 11)).unwrap();
        dir.insert(entry("test2.txt", 12)).unwrap();
        assert!(dir.insert(entry("test1.txt", 13)).is_err());

        assert_eq!(dir.entry("test1.txt").map(|e| e.target), Some(11));
        assert_eq!(dir.entry("test2.txt").map(|e| e.target), Some(12));
        assert!(dir.entry("test3.txt").is_none());
    }

    #[test]
    fn test_resume_after_name() {
        let mut dir = Directory::new(2);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            dir.insert(entry(name, 20 + i as u64)).unwrap();
        }
        assert_eq!(dir.next_after(None).unwrap().name, "a");
        assert_eq!(dir.next_after(Some("a")).unwrap().name, "b");
        assert_eq!(dir.next_after(Some("b")).unwrap().name, "c");
        assert!(dir.next_after(Some("c")).is_none());
        // a removed name still resumes in order
        dir.remove("b");
        assert_eq!(dir.next_after(Some("b")).unwrap().name, "c");
    }
}
