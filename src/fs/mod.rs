//! on-disk structures of a DslsFS volume
pub mod bitmap;
pub mod directory;
pub mod extent;
pub mod filekind;
pub mod inode;
pub mod inode_table;
pub mod layout;
pub mod superblock;

pub use bitmap::*;
pub use directory::*;
pub use extent::*;
pub use filekind::*;
pub use inode::*;
pub use inode_table::*;
pub use layout::*;
pub use superblock::*;

pub const FS_MAGIC: u32 = 0x4453_4C53;
pub const FS_VERSION: u32 = 0x0001_0000;
pub const ROOT_INODE: u64 = 2;
/// bytes reserved for every inode record in the inode table
pub const INODE_RECORD_SIZE: u32 = 256;
pub const DIRECT_POINTERS: usize = 12;
/// leading blocks kept back for filesystem metadata
pub const RESERVED_BLOCKS: u64 = 100;
/// leading inodes kept back besides the root directory
pub const RESERVED_INODES: u64 = 10;
/// one inode per this many blocks
pub const BLOCKS_PER_INODE: u64 = 4;
