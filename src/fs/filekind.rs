use serde::{Deserialize, Serialize};

/// an enum to describe the type of a file
#[derive(Serialize, Deserialize, Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// an regular file
    RegularFile,
    /// a directory
    Directory,
    /// a symbolic link
    SymbolicLink,
    /// Unknown, never valid for an allocated inode
    #[default]
    Unknown,
}

impl FileKind {
    /// the `S_IFMT` bits matching this kind
    pub fn mode_bits(self) -> u16 {
        match self {
            FileKind::RegularFile => libc::S_IFREG as u16,
            FileKind::Directory => libc::S_IFDIR as u16,
            FileKind::SymbolicLink => libc::S_IFLNK as u16,
            FileKind::Unknown => 0,
        }
    }

    pub fn is_valid(self) -> bool {
        self != FileKind::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bits() {
        assert_eq!(FileKind::Directory.mode_bits() as u32, libc::S_IFDIR as u32);
        assert_eq!(FileKind::RegularFile.mode_bits() as u32, libc::S_IFREG as u32);
        assert!(!FileKind::Unknown.is_valid());
    }
}
