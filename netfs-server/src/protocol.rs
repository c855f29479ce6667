//! Text request headers.
//!
//! ```text
//! FS_READBLOCK <user> <path> <block>\0
//! FS_WRITEBLOCK <user> <path> <block>\0<BLOCK_SIZE bytes>
//! FS_CREATE <user> <path> <f|d>\0
//! FS_DELETE <user> <path>\0
//! ```
//!
//! A successful response echoes the header and its NUL, followed by the block for reads.
//! Failures get no response at all; the connection is simply closed.

use std::fmt;

use netfs::{check_username, Block, EntryKind, FsPath, Request, Response, MAX_FILE_BLOCKS};

use crate::error::ServerError;

/// Longest header accepted, excluding its NUL terminator.
pub const MAX_MESSAGE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ReadBlock { block: usize },
    WriteBlock { block: usize },
    Create { kind: EntryKind },
    Delete,
}

/// A parsed request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub user: String,
    pub path: FsPath,
    pub command: Command,
}

impl Header {
    /// Parses a header without its NUL terminator. The text must be exactly the canonical
    /// form: single spaces, no padding, no leading zeros.
    pub fn parse(raw: &[u8]) -> Result<Self, ServerError> {
        let text = std::str::from_utf8(raw).map_err(|_| malformed("header is not utf-8"))?;
        let fields: Vec<&str> = text.split(' ').collect();

        let (user, path) = match fields.as_slice() {
            [_, user, path, ..] => (*user, *path),
            _ => return Err(malformed("too few fields")),
        };
        let command = match (fields[0], &fields[3..]) {
            ("FS_READBLOCK", [block]) => Command::ReadBlock {
                block: parse_block(block)?,
            },
            ("FS_WRITEBLOCK", [block]) => Command::WriteBlock {
                block: parse_block(block)?,
            },
            ("FS_CREATE", [kind]) => Command::Create {
                kind: parse_kind(kind)?,
            },
            ("FS_DELETE", []) => Command::Delete,
            (command, _) => return Err(malformed(format!("bad {} request", command))),
        };

        check_username(user)?;
        let header = Header {
            user: user.to_string(),
            path: FsPath::parse(path)?,
            command,
        };

        if header.to_string() != text {
            return Err(malformed("header is not in canonical form"));
        }
        Ok(header)
    }

    /// Whether a data block follows the header on the wire.
    pub fn expects_data(&self) -> bool {
        matches!(self.command, Command::WriteBlock { .. })
    }

    /// Builds the engine request. `data` is the block that followed a write header.
    pub fn into_request(self, data: Option<Box<Block>>) -> Result<Request, ServerError> {
        let path = self.path;
        Ok(match self.command {
            Command::ReadBlock { block } => Request::Read { path, block },
            Command::WriteBlock { block } => Request::Write {
                path,
                block,
                data: data.ok_or_else(|| malformed("write without data"))?,
            },
            Command::Create { kind } => Request::Create { path, kind },
            Command::Delete => Request::Delete { path },
        })
    }

    /// The bytes sent back for a successful request.
    pub fn response(&self, outcome: &Response) -> Vec<u8> {
        let mut out = self.to_string().into_bytes();
        out.push(0);
        if let Response::Data(block) = outcome {
            out.extend_from_slice(&block[..]);
        }
        out
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.command {
            Command::ReadBlock { block } => {
                write!(f, "FS_READBLOCK {} {} {}", self.user, self.path, block)
            }
            Command::WriteBlock { block } => {
                write!(f, "FS_WRITEBLOCK {} {} {}", self.user, self.path, block)
            }
            Command::Create { kind } => write!(f, "FS_CREATE {} {} {}", self.user, self.path, kind),
            Command::Delete => write!(f, "FS_DELETE {} {}", self.user, self.path),
        }
    }
}

fn malformed<S: Into<String>>(reason: S) -> ServerError {
    ServerError::Malformed(reason.into())
}

fn parse_block(field: &str) -> Result<usize, ServerError> {
    let block: usize = field
        .parse()
        .map_err(|_| malformed(format!("bad block number {:?}", field)))?;
    if block >= MAX_FILE_BLOCKS {
        return Err(malformed(format!("block {} out of range", block)));
    }
    Ok(block)
}

fn parse_kind(field: &str) -> Result<EntryKind, ServerError> {
    let mut chars = field.chars();
    match (chars.next().and_then(EntryKind::from_tag), chars.next()) {
        (Some(kind), None) => Ok(kind),
        _ => Err(malformed(format!("bad entry type {:?}", field))),
    }
}
