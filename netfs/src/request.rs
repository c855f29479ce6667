use std::fmt;

use crate::layout::{Block, EntryKind};
use crate::path::FsPath;

/// One request against the file store, independent of how it arrived.
#[derive(Clone, PartialEq, Eq)]
pub enum Request {
    Read {
        path: FsPath,
        block: usize,
    },
    Write {
        path: FsPath,
        block: usize,
        data: Box<Block>,
    },
    Create {
        path: FsPath,
        kind: EntryKind,
    },
    Delete {
        path: FsPath,
    },
}

impl Request {
    pub fn path(&self) -> &FsPath {
        match self {
            Request::Read { path, .. }
            | Request::Write { path, .. }
            | Request::Create { path, .. }
            | Request::Delete { path } => path,
        }
    }

    pub fn access(&self) -> Access {
        match self {
            Request::Read { .. } => Access::Read,
            Request::Write { .. } => Access::Write,
            Request::Create { .. } => Access::Create,
            Request::Delete { .. } => Access::Delete,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Read { path, block } => write!(f, "read {} block {}", path, block),
            Request::Write { path, block, .. } => write!(f, "write {} block {}", path, block),
            Request::Create { path, kind } => write!(f, "create {} ({})", path, kind),
            Request::Delete { path } => write!(f, "delete {}", path),
        }
    }
}

/// What a path walk is for. Creates and deletes stop at the parent directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Create,
    Delete,
}

impl Access {
    pub fn targets_parent(self) -> bool {
        matches!(self, Access::Create | Access::Delete)
    }
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Done,
    Data(Box<Block>),
}
