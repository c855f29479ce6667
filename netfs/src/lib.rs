//! A small hierarchical file store served straight out of a fixed array of blocks.
//!
//! Files and directories are described by one-block inodes; directories list their
//! children in one-block entry tables. [`FileServer`] resolves paths with per-block
//! locks and is meant to be shared by many connection threads at once.

mod alloc;
mod error;
mod fs;
pub mod io;
pub mod layout;
mod locks;
mod path;
mod request;

pub use crate::alloc::{Bitmap, FreeBlocks, State};
pub use crate::error::{FsError, Result};
pub use crate::fs::FileServer;
pub use crate::layout::{
    Block, BlockId, EntryKind, BLOCK_SIZE, DIR_ENTRIES, DISK_SIZE, MAX_FILENAME,
    MAX_FILE_BLOCKS, MAX_PATHNAME, MAX_USERNAME, ROOT_BLOCK,
};
pub use crate::locks::{BlockLock, LockRegistry};
pub use crate::path::{check_username, FsPath};
pub use crate::request::{Access, Request, Response};
