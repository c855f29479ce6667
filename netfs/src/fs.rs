use std::cmp::Ordering;
use std::collections::VecDeque;

use log::{debug, info};
use zerocopy::AsBytes;

use crate::alloc::{Bitmap, FreeBlocks, State};
use crate::error::{FsError, Result};
use crate::io::BlockStorage;
use crate::layout::{
    Block, BlockId, DirTable, EntryKind, Inode, BLOCK_SIZE, MAX_FILE_BLOCKS, ROOT_BLOCK,
};
use crate::locks::{BlockLock, LockRegistry};
use crate::path::{check_username, FsPath};
use crate::request::{Access, Request, Response};

/// A hierarchical file store laid out directly over a fixed array of blocks.
///
/// Block 0 holds the root directory. Every request locks the root first and walks down
/// the tree hand over hand, so at most two inode locks are held by a walker at a time and
/// independent subtrees are served concurrently. The free block pool is rebuilt on
/// [`FileServer::mount`] by scanning everything reachable from the root.
pub struct FileServer<T: BlockStorage> {
    dev: T,
    free: FreeBlocks,
    locks: LockRegistry,
}

/// End of a path walk: the inode found and the lock guarding its block.
struct Target<'a> {
    lock: BlockLock<'a>,
    inode: Inode,
}

impl Target<'_> {
    fn block(&self) -> BlockId {
        self.lock.block()
    }
}

/// Where a directory entry lives.
struct EntrySlot {
    /// Position of the table in the directory's block array.
    index: usize,
    table_block: BlockId,
    table: DirTable,
    slot: usize,
}

impl<T: BlockStorage> FileServer<T> {
    /// Writes an empty root directory to block 0 and mounts the device. Whatever else the
    /// device held becomes free space.
    pub fn format(dev: T) -> Result<Self> {
        info!("formatting device of {} blocks", dev.block_count());
        dev.write_block(ROOT_BLOCK as usize, Inode::root().as_bytes())?;
        dev.sync_disk()?;
        Self::mount(dev)
    }

    /// Opens a formatted device. Every block not reachable from the root is free.
    pub fn mount(dev: T) -> Result<Self> {
        let count = dev.block_count();
        if count == 0 || count > BlockId::MAX as usize {
            return Err(FsError::InvalidArgument(format!(
                "cannot mount a device of {} blocks",
                count
            )));
        }

        let reached = scan(&dev)?;
        let free = FreeBlocks::from_bitmap(&reached);
        info!(
            "mounted {} blocks: {} in use, {} free",
            count,
            reached.used_count(),
            free.available()
        );

        Ok(FileServer {
            dev,
            free,
            locks: LockRegistry::new(count),
        })
    }

    pub fn device(&self) -> &T {
        &self.dev
    }

    pub fn into_device(self) -> T {
        self.dev
    }

    pub fn free_blocks(&self) -> &FreeBlocks {
        &self.free
    }

    pub fn sync(&self) -> Result<()> {
        Ok(self.dev.sync_disk()?)
    }

    /// Runs one request on behalf of `user`.
    pub fn execute(&self, user: &str, request: &Request) -> Result<Response> {
        debug!("{} requests {:?}", user, request);
        check_username(user)?;
        let path = request.path();
        let mut target = self.resolve(user, path, request.access())?;
        let target_block = target.block();

        match request {
            Request::Read { block, .. } => {
                self.read_block(&target.inode, *block).map(Response::Data)
            }
            Request::Write { block, data, .. } => self
                .write_block(&mut target.inode, target_block, *block, data)
                .map(|_| Response::Done),
            Request::Create { kind, .. } => self
                .create_path(&mut target.inode, target_block, path.name(), user, *kind)
                .map(|_| Response::Done),
            Request::Delete { .. } => self
                .delete_path(&mut target.inode, target_block, path.name(), user)
                .map(|_| Response::Done),
        }
    }

    /// Reads data block `block` of the file at `path`.
    pub fn read(&self, user: &str, path: &FsPath, block: usize) -> Result<Box<Block>> {
        check_username(user)?;
        let target = self.resolve(user, path, Access::Read)?;
        self.read_block(&target.inode, block)
    }

    /// Overwrites data block `block` of the file at `path`, or appends it when `block`
    /// equals the current size.
    pub fn write(&self, user: &str, path: &FsPath, block: usize, data: &Block) -> Result<()> {
        check_username(user)?;
        let mut target = self.resolve(user, path, Access::Write)?;
        let inode_block = target.block();
        self.write_block(&mut target.inode, inode_block, block, data)
    }

    /// Creates an empty file or directory owned by `user`, returning its inode block.
    pub fn create(&self, user: &str, path: &FsPath, kind: EntryKind) -> Result<BlockId> {
        check_username(user)?;
        let mut target = self.resolve(user, path, Access::Create)?;
        let parent_block = target.block();
        self.create_path(&mut target.inode, parent_block, path.name(), user, kind)
    }

    /// Removes a file, or a directory that has no entry tables left.
    pub fn delete(&self, user: &str, path: &FsPath) -> Result<()> {
        check_username(user)?;
        let mut target = self.resolve(user, path, Access::Delete)?;
        let parent_block = target.block();
        self.delete_path(&mut target.inode, parent_block, path.name(), user)
    }

    /// Walks `path` from the root. Reads and writes resolve the whole path, creates and
    /// deletes stop at the parent directory. The returned target still holds its lock.
    fn resolve<'a>(&'a self, user: &str, path: &FsPath, access: Access) -> Result<Target<'a>> {
        let mut lock = self.locks.lock(ROOT_BLOCK);
        let mut inode = self.read_inode(ROOT_BLOCK)?;

        let walk = if access.targets_parent() {
            path.parent()
        } else {
            path.components()
        };
        for (depth, name) in walk.iter().enumerate() {
            if !inode.is_dir() {
                return Err(FsError::PathThroughFile);
            }
            let child = self.lookup(&inode, name)?.ok_or(FsError::NotFound)?;
            lock = lock.hand_over(child);
            inode = self.read_inode(child)?;

            // Only entries directly under the root are owner checked.
            if depth == 0 && !inode.owned_by(user) {
                return Err(FsError::PermissionDenied);
            }
        }

        if access.targets_parent() && !inode.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(Target { lock, inode })
    }

    /// Inode block of the first live entry called `name`.
    fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<BlockId>> {
        Ok(self
            .find_entry(dir, name)?
            .map(|found| found.table.entry(found.slot).inode_block()))
    }

    /// First live entry called `name`, in table order and then slot order.
    fn find_entry(&self, dir: &Inode, name: &str) -> Result<Option<EntrySlot>> {
        for (index, &table_block) in dir.blocks().iter().enumerate() {
            let table = self.read_table(table_block)?;
            if let Some(slot) = table.find(name) {
                return Ok(Some(EntrySlot {
                    index,
                    table_block,
                    table,
                    slot,
                }));
            }
        }
        Ok(None)
    }

    fn read_block(&self, inode: &Inode, index: usize) -> Result<Box<Block>> {
        if !inode.is_file() || index >= inode.size() {
            return Err(FsError::OutOfRange);
        }
        Ok(Box::new(self.read_raw(inode.blocks()[index])?))
    }

    fn write_block(
        &self,
        inode: &mut Inode,
        inode_block: BlockId,
        index: usize,
        data: &Block,
    ) -> Result<()> {
        if !inode.is_file() {
            return Err(FsError::InvalidTarget);
        }

        match index.cmp(&inode.size()) {
            Ordering::Less => self.write_raw(inode.blocks()[index], data),
            Ordering::Equal => {
                if inode.is_full() {
                    return Err(FsError::FileFull);
                }
                let block = self.free.allocate()?;
                if let Err(err) = self.write_raw(block, data) {
                    self.free.restore([block]);
                    return Err(err);
                }
                inode.push_block(block);
                if let Err(err) = self.write_inode(inode_block, inode) {
                    inode.remove_block(inode.size() - 1);
                    self.free.restore([block]);
                    return Err(err);
                }
                debug!(
                    "inode {} grew to {} blocks with block {}",
                    inode_block,
                    inode.size(),
                    block
                );
                Ok(())
            }
            Ordering::Greater => Err(FsError::Gap),
        }
    }

    fn create_path(
        &self,
        parent: &mut Inode,
        parent_block: BlockId,
        name: &str,
        owner: &str,
        kind: EntryKind,
    ) -> Result<BlockId> {
        // Remember the first free slot but keep looking for a name clash in every table.
        let mut free_slot = None;
        for &table_block in parent.blocks() {
            let table = self.read_table(table_block)?;
            if table.find(name).is_some() {
                return Err(FsError::AlreadyExists);
            }
            if free_slot.is_none() {
                free_slot = table.first_free().map(|slot| (table_block, table, slot));
            }
        }

        let node = Inode::new(kind, owner);
        let child = match free_slot {
            Some((table_block, mut table, slot)) => {
                let child = self.free.allocate()?;
                table.set(slot, name, child);
                let written = self
                    .write_inode(child, &node)
                    .and_then(|_| self.write_table(table_block, &table));
                if let Err(err) = written {
                    self.free.restore([child]);
                    return Err(err);
                }
                child
            }
            None => {
                if parent.is_full() {
                    return Err(FsError::DirectoryFull);
                }
                let blocks = self.free.allocate_many(2)?;
                let (child, table_block) = (blocks[0], blocks[1]);
                let table = DirTable::with_entry(name, child);
                parent.push_block(table_block);
                let written = self
                    .write_inode(child, &node)
                    .and_then(|_| self.write_table(table_block, &table))
                    .and_then(|_| self.write_inode(parent_block, parent));
                if let Err(err) = written {
                    parent.remove_block(parent.size() - 1);
                    self.free.restore(blocks);
                    return Err(err);
                }
                debug!(
                    "directory {} grew to {} entry tables",
                    parent_block,
                    parent.size()
                );
                child
            }
        };

        debug!(
            "created {} ({}) at block {} under {}",
            name, kind, child, parent_block
        );
        Ok(child)
    }

    fn delete_path(
        &self,
        parent: &mut Inode,
        parent_block: BlockId,
        name: &str,
        requester: &str,
    ) -> Result<()> {
        let EntrySlot {
            index,
            table_block,
            mut table,
            slot,
        } = self.find_entry(parent, name)?.ok_or(FsError::NotFound)?;
        let victim_block = table.entry(slot).inode_block();

        // Victim before allocator, always.
        let _victim_lock = self.locks.lock(victim_block);
        let mut victim = self.read_inode(victim_block)?;
        if !victim.owned_by(requester) {
            return Err(FsError::PermissionDenied);
        }

        let mut released = match victim.kind() {
            Some(EntryKind::File) => delete_file(&mut victim),
            Some(EntryKind::Directory) if victim.size() > 0 => return Err(FsError::NotEmpty),
            Some(EntryKind::Directory) => Vec::new(),
            None => {
                return Err(FsError::Corrupted(format!(
                    "entry {} points at block {} which holds no inode",
                    name, victim_block
                )))
            }
        };
        released.push(victim_block);

        table.clear(slot);
        if table.is_empty() {
            parent.remove_block(index);
            self.write_inode(parent_block, parent)?;
            released.push(table_block);
            debug!(
                "directory {} dropped entry table {}",
                parent_block, table_block
            );
        } else {
            self.write_table(table_block, &table)?;
        }

        debug!(
            "deleted {} at block {}, releasing {} blocks",
            name,
            victim_block,
            released.len()
        );
        self.free.release_all(released);
        Ok(())
    }

    /// Checks that the blocks reachable from the root and the free pool together cover the
    /// disk exactly once. Only meaningful while no request is in flight.
    pub fn verify(&self) -> Result<()> {
        let _root = self.locks.lock(ROOT_BLOCK);
        let mut seen = scan(&self.dev)?;
        for block in self.free.snapshot() {
            if seen.get(block as usize) == State::Used {
                return Err(FsError::Corrupted(format!(
                    "block {} is free but already accounted for",
                    block
                )));
            }
            seen.set_reserved(block as usize);
        }
        if let Some(block) = seen.free_blocks().next() {
            return Err(FsError::Corrupted(format!(
                "block {} is neither reachable nor free",
                block
            )));
        }
        Ok(())
    }

    fn read_raw(&self, block: BlockId) -> Result<Block> {
        read_raw(&self.dev, block)
    }

    fn write_raw(&self, block: BlockId, data: &Block) -> Result<()> {
        Ok(self.dev.write_block(block as usize, data)?)
    }

    fn read_inode(&self, block: BlockId) -> Result<Inode> {
        read_inode(&self.dev, block)
    }

    fn write_inode(&self, block: BlockId, inode: &Inode) -> Result<()> {
        Ok(self.dev.write_block(block as usize, inode.as_bytes())?)
    }

    fn read_table(&self, block: BlockId) -> Result<DirTable> {
        read_table(&self.dev, block)
    }

    fn write_table(&self, block: BlockId, table: &DirTable) -> Result<()> {
        Ok(self.dev.write_block(block as usize, table.as_bytes())?)
    }
}

/// Empties a file inode and hands back its data blocks. Takes no locks, the caller already
/// holds the file's. The data blocks themselves are not zeroed.
fn delete_file(file: &mut Inode) -> Vec<BlockId> {
    file.take_blocks()
}

fn read_raw<T: BlockStorage>(dev: &T, block: BlockId) -> Result<Block> {
    let mut buf = [0; BLOCK_SIZE];
    dev.read_block(block as usize, &mut buf)?;
    Ok(buf)
}

fn read_inode<T: BlockStorage>(dev: &T, block: BlockId) -> Result<Inode> {
    Ok(Inode::parse(&read_raw(dev, block)?))
}

fn read_table<T: BlockStorage>(dev: &T, block: BlockId) -> Result<DirTable> {
    Ok(DirTable::parse(&read_raw(dev, block)?))
}

/// Walks the block tree breadth first from the root and marks every block it reaches.
fn scan<T: BlockStorage>(dev: &T) -> Result<Bitmap> {
    let mut reached = Bitmap::new(dev.block_count());
    reached.set_reserved(ROOT_BLOCK as usize);

    if !read_inode(dev, ROOT_BLOCK)?.is_dir() {
        return Err(FsError::Corrupted(
            "block 0 does not hold a directory inode".to_string(),
        ));
    }

    let mut queue = VecDeque::from([ROOT_BLOCK]);
    while let Some(block) = queue.pop_front() {
        let inode = read_inode(dev, block)?;
        if inode.raw_size() as usize > MAX_FILE_BLOCKS {
            return Err(FsError::Corrupted(format!(
                "inode {} claims {} blocks",
                block,
                inode.raw_size()
            )));
        }

        match inode.kind() {
            Some(EntryKind::File) => {
                for &data in inode.blocks() {
                    claim(&mut reached, data, block)?;
                }
            }
            Some(EntryKind::Directory) => {
                for &table_block in inode.blocks() {
                    claim(&mut reached, table_block, block)?;
                    for entry in read_table(dev, table_block)?.live() {
                        claim(&mut reached, entry.inode_block(), table_block)?;
                        queue.push_back(entry.inode_block());
                    }
                }
            }
            None => {
                return Err(FsError::Corrupted(format!(
                    "block {} is referenced as an inode but holds none",
                    block
                )))
            }
        }
    }

    Ok(reached)
}

fn claim(reached: &mut Bitmap, block: BlockId, from: BlockId) -> Result<()> {
    if block == ROOT_BLOCK || block as usize >= reached.len() {
        return Err(FsError::Corrupted(format!(
            "block {} references invalid block {}",
            from, block
        )));
    }
    if reached.get(block as usize) == State::Used {
        return Err(FsError::Corrupted(format!(
            "block {} is referenced more than once",
            block
        )));
    }
    reached.set_reserved(block as usize);
    Ok(())
}
