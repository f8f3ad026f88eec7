pub mod cache;
pub mod cli_interface;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod fs;
pub mod inspect;
pub mod journal;
pub mod mkfs;
pub mod object;
pub mod stats;
pub mod utils;
pub mod volume;

pub use config::FsConfig;
pub use context::DslsFs;
pub use error::{ErrorKind, FsError, FsResult};
