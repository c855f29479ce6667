use thiserror::Error;

/// Everything an engine operation can fail with. None of these are fatal to the server;
/// the on-disk structures, locks and free pool stay usable after any of them.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("found no file at path")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("path runs through a file")]
    PathThroughFile,
    #[error("requester does not own the entry")]
    PermissionDenied,
    #[error("an entry with that name already exists")]
    AlreadyExists,
    #[error("directory cannot hold another entry table")]
    DirectoryFull,
    #[error("no free blocks left on disk")]
    DiskFull,
    #[error("file has reached its maximum number of blocks")]
    FileFull,
    #[error("block index out of range")]
    OutOfRange,
    #[error("write would leave a gap in the file")]
    Gap,
    #[error("data blocks can only be written to files")]
    InvalidTarget,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corrupted file system: {0}")]
    Corrupted(String),
    #[error("block device error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;
