use thiserror::Error;

/// Every failure a filesystem operation can report
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("name already exists: {0}")]
    NameCollision(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("sharing violation: {0}")]
    SharingViolation(String),

    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    #[error("no space left on volume {0}")]
    DiskFull(String),

    #[error("on-disk structure is corrupt: {0}")]
    DiskCorrupt(String),

    #[error("not a valid volume: {0}")]
    InvalidVolume(String),

    #[error("operation not allowed in state {0}")]
    InvalidDeviceState(String),

    #[error("no such device: {0}")]
    NoSuchDevice(String),

    #[error("end of file")]
    EndOfFile,

    #[error("media is write protected: {0}")]
    MediaWriteProtected(String),

    #[error("invalid handle {0}")]
    InvalidHandle(u64),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("journal is full")]
    JournalFull,

    #[error("lock {0} is held in a conflicting mode")]
    LockConflict(String),

    #[error("node {node} does not hold lock {lock}")]
    NotOwner { node: u64, lock: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("pending request cancelled: {0}")]
    Cancelled(String),

    #[error("no quorum: {online} online nodes, {required} required")]
    NoQuorum { online: usize, required: usize },

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] anyhow::Error),
}

/// Fieldless discriminant of [FsError], handy for matching in callers and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NameCollision,
    NotFound,
    AccessDenied,
    SharingViolation,
    InsufficientResources,
    DiskFull,
    DiskCorrupt,
    InvalidVolume,
    InvalidDeviceState,
    NoSuchDevice,
    EndOfFile,
    MediaWriteProtected,
    InvalidHandle,
    DirectoryNotEmpty,
    JournalFull,
    LockConflict,
    NotOwner,
    Timeout,
    Cancelled,
    NoQuorum,
    NotImplemented,
    Io,
    Codec,
}

impl FsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FsError::NameCollision(_) => ErrorKind::NameCollision,
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AccessDenied(_) => ErrorKind::AccessDenied,
            FsError::SharingViolation(_) => ErrorKind::SharingViolation,
            FsError::InsufficientResources(_) => ErrorKind::InsufficientResources,
            FsError::DiskFull(_) => ErrorKind::DiskFull,
            FsError::DiskCorrupt(_) => ErrorKind::DiskCorrupt,
            FsError::InvalidVolume(_) => ErrorKind::InvalidVolume,
            FsError::InvalidDeviceState(_) => ErrorKind::InvalidDeviceState,
            FsError::NoSuchDevice(_) => ErrorKind::NoSuchDevice,
            FsError::EndOfFile => ErrorKind::EndOfFile,
            FsError::MediaWriteProtected(_) => ErrorKind::MediaWriteProtected,
            FsError::InvalidHandle(_) => ErrorKind::InvalidHandle,
            FsError::DirectoryNotEmpty(_) => ErrorKind::DirectoryNotEmpty,
            FsError::JournalFull => ErrorKind::JournalFull,
            FsError::LockConflict(_) => ErrorKind::LockConflict,
            FsError::NotOwner { .. } => ErrorKind::NotOwner,
            FsError::Timeout(_) => ErrorKind::Timeout,
            FsError::Cancelled(_) => ErrorKind::Cancelled,
            FsError::NoQuorum { .. } => ErrorKind::NoQuorum,
            FsError::NotImplemented(_) => ErrorKind::NotImplemented,
            FsError::Io(_) => ErrorKind::Io,
            FsError::Codec(_) => ErrorKind::Codec,
        }
    }

    /// corruption found while validating on-disk structures
    pub fn is_corruption(&self) -> bool {
        matches!(self.kind(), ErrorKind::DiskCorrupt | ErrorKind::InvalidVolume)
    }
}

pub type FsResult<T> = Result<T, FsError>;
