//! On-disk structures.
//!
//! The disk has no superblock. Block 0 always holds the root directory [`Inode`]; every
//! other block is either an inode, a directory entry table ([`DirTable`]), a file data
//! block or free, and its role is known only through whoever references it.
//!
//! # Layout
//! ===================================================================
//! | Inode: type (1) | owner (11) | size (4) | blocks (124 * 4)        |
//! ===================================================================
//! | DirTable: 8 * ( name (60) | inode block (4) )                     |
//! ===================================================================

use std::borrow::Cow;
use std::fmt;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Bytes per block.
pub const BLOCK_SIZE: usize = 512;
/// Default number of blocks on a disk.
pub const DISK_SIZE: usize = 4096;
/// Longest owner or requester name, in bytes.
pub const MAX_USERNAME: usize = 10;
/// Longest path component, in bytes.
pub const MAX_FILENAME: usize = 59;
/// Longest full path, in bytes.
pub const MAX_PATHNAME: usize = 128;
/// Capacity of an inode's block array.
pub const MAX_FILE_BLOCKS: usize = 124;
/// Entries held by one directory entry table.
pub const DIR_ENTRIES: usize = BLOCK_SIZE / std::mem::size_of::<DirEntry>();

/// Index of a block on the device.
pub type BlockId = u32;
/// Block holding the root directory inode.
pub const ROOT_BLOCK: BlockId = 0;

/// Raw contents of one block.
pub type Block = [u8; BLOCK_SIZE];

const FILE_TAG: u8 = b'f';
const DIR_TAG: u8 = b'd';

const _: () = assert!(std::mem::size_of::<Inode>() == BLOCK_SIZE);
const _: () = assert!(std::mem::size_of::<DirTable>() == BLOCK_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    /// Parses the single character tag used on disk and on the wire.
    pub fn from_tag(tag: char) -> Option<Self> {
        match tag {
            'f' => Some(EntryKind::File),
            'd' => Some(EntryKind::Directory),
            _ => None,
        }
    }

    pub fn tag(self) -> char {
        match self {
            EntryKind::File => FILE_TAG as char,
            EntryKind::Directory => DIR_TAG as char,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Copies `src` into a NUL padded fixed buffer, truncating if it does not fit.
fn fill_name<const N: usize>(src: &str) -> [u8; N] {
    let mut buf = [0; N];
    let len = src.len().min(N - 1);
    buf[..len].copy_from_slice(&src.as_bytes()[..len]);
    buf
}

fn trim_name(buf: &[u8]) -> &[u8] {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    &buf[..len]
}

/// Metadata for one file or directory. Occupies exactly one block.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inode {
    /// `b'f'` or `b'd'`.
    kind: u8,
    /// NUL terminated owner name.
    owner: [u8; MAX_USERNAME + 1],
    /// Number of valid entries in `blocks`.
    size: u32,
    /// Data blocks in offset order for files, entry tables for directories.
    blocks: [u32; MAX_FILE_BLOCKS],
}

impl Inode {
    pub fn new(kind: EntryKind, owner: &str) -> Self {
        Self {
            kind: kind.tag() as u8,
            owner: fill_name(owner),
            size: 0,
            blocks: [0; MAX_FILE_BLOCKS],
        }
    }

    /// The root directory belongs to nobody.
    pub fn root() -> Self {
        Self::new(EntryKind::Directory, "")
    }

    pub fn parse(buf: &Block) -> Self {
        // Sizes match, checked at compile time above.
        Self::read_from(&buf[..]).unwrap_or_else(Self::new_zeroed)
    }

    pub fn kind(&self) -> Option<EntryKind> {
        match self.kind {
            FILE_TAG => Some(EntryKind::File),
            DIR_TAG => Some(EntryKind::Directory),
            _ => None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == DIR_TAG
    }

    pub fn is_file(&self) -> bool {
        self.kind == FILE_TAG
    }

    pub fn owned_by(&self, user: &str) -> bool {
        trim_name(&self.owner) == user.as_bytes()
    }

    /// Raw size field as stored, which may exceed the block array on a damaged disk.
    pub fn raw_size(&self) -> u32 {
        self.size
    }

    pub fn size(&self) -> usize {
        (self.size as usize).min(MAX_FILE_BLOCKS)
    }

    pub fn is_full(&self) -> bool {
        self.size() >= MAX_FILE_BLOCKS
    }

    /// The valid prefix of the block array.
    pub fn blocks(&self) -> &[BlockId] {
        &self.blocks[..self.size()]
    }

    /// Appends a block. Callers check [`Inode::is_full`] first.
    pub fn push_block(&mut self, block: BlockId) {
        let size = self.size();
        debug_assert!(size < MAX_FILE_BLOCKS, "push onto a full inode");
        self.blocks[size] = block;
        self.size = size as u32 + 1;
    }

    /// Removes the block at `index`, shifting every later block one slot left.
    pub fn remove_block(&mut self, index: usize) -> BlockId {
        let size = self.size();
        let removed = self.blocks[index];
        self.blocks.copy_within(index + 1..size, index);
        self.blocks[size - 1] = 0;
        self.size = size as u32 - 1;
        removed
    }

    /// Empties the block array, handing back what it held.
    pub fn take_blocks(&mut self) -> Vec<BlockId> {
        let taken = self.blocks().to_vec();
        self.blocks = [0; MAX_FILE_BLOCKS];
        self.size = 0;
        taken
    }
}

/// One name to inode mapping inside a [`DirTable`]. A zero `inode_block` marks a free slot.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    name: [u8; MAX_FILENAME + 1],
    inode_block: u32,
}

impl DirEntry {
    pub fn new(name: &str, inode_block: BlockId) -> Self {
        Self {
            name: fill_name(name),
            inode_block,
        }
    }

    pub fn name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(trim_name(&self.name))
    }

    pub fn inode_block(&self) -> BlockId {
        self.inode_block
    }

    /// Block 0 is the root and can never be a child, so it doubles as "empty".
    pub fn is_live(&self) -> bool {
        self.inode_block != 0
    }

    pub fn matches(&self, name: &str) -> bool {
        self.is_live() && trim_name(&self.name) == name.as_bytes()
    }
}

/// A directory entry table. Occupies exactly one block.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirTable {
    entries: [DirEntry; DIR_ENTRIES],
}

impl DirTable {
    /// A fresh table whose first slot holds `name` and every other slot is empty.
    pub fn with_entry(name: &str, inode_block: BlockId) -> Self {
        let mut table = Self::new_zeroed();
        table.entries[0] = DirEntry::new(name, inode_block);
        table
    }

    pub fn parse(buf: &Block) -> Self {
        Self::read_from(&buf[..]).unwrap_or_else(Self::new_zeroed)
    }

    pub fn entry(&self, slot: usize) -> &DirEntry {
        &self.entries[slot]
    }

    /// Slot of the first live entry called `name`.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.matches(name))
    }

    pub fn first_free(&self) -> Option<usize> {
        self.entries.iter().position(|e| !e.is_live())
    }

    pub fn set(&mut self, slot: usize, name: &str, inode_block: BlockId) {
        self.entries[slot] = DirEntry::new(name, inode_block);
    }

    /// Frees the slot. Only the child reference is cleared; the stale name stays on disk.
    pub fn clear(&mut self, slot: usize) {
        self.entries[slot].inode_block = 0;
    }

    /// True when no slot references a child.
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(DirEntry::is_live)
    }

    pub fn live(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.iter().filter(|e| e.is_live())
    }
}
