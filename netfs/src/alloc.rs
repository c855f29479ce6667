use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use crate::error::{FsError, Result};
use crate::layout::BlockId;

#[derive(Debug, PartialEq)]
pub enum State {
    Free,
    Used,
}

/// One bit per block on the device. Used while scanning the block tree at mount time.
#[derive(Clone)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// A bitmap tracking `len` blocks, all of them free.
    pub fn new(len: usize) -> Self {
        Self {
            bitmap: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        // Grab the u64 containing the significant bit.
        let outer_offset = self.bitmap[blocknr / 64];

        let inner_offset = blocknr % 64;
        let mask = 0b01_u64 << inner_offset;
        match (outer_offset & mask) >> inner_offset {
            0 => State::Free,
            1 => State::Used,
            _ => unreachable!("Block state returned a non 0 or 1 value. This likely indicates an error with bitmasking"),
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} outside bitmap", blocknr);
        self.bitmap[blocknr / 64] |= 0b01_u64 << (blocknr % 64);
    }

    /// Free blocks in ascending order.
    pub fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&b| self.get(b) == State::Free)
    }

    pub fn used_count(&self) -> usize {
        self.bitmap.iter().map(|word| word.count_ones() as usize).sum()
    }
}

/// The pool of unused blocks.
///
/// Blocks are handed out first-in first-out: the block freed longest ago is reused
/// first. A single lock guards the queue and is only held for the bookkeeping of one
/// call, never across device I/O.
pub struct FreeBlocks {
    queue: Mutex<VecDeque<BlockId>>,
}

impl FreeBlocks {
    pub fn new<I: IntoIterator<Item = BlockId>>(blocks: I) -> Self {
        Self {
            queue: Mutex::new(blocks.into_iter().collect()),
        }
    }

    /// Every block the bitmap marks free, in ascending order.
    pub fn from_bitmap(bitmap: &Bitmap) -> Self {
        Self::new(bitmap.free_blocks().map(|b| b as BlockId))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<BlockId>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes the oldest free block.
    ///
    /// # Errors
    ///
    /// [`FsError::DiskFull`] when nothing is free.
    pub fn allocate(&self) -> Result<BlockId> {
        let block = self.lock().pop_front().ok_or(FsError::DiskFull)?;
        trace!("allocated block {}", block);
        Ok(block)
    }

    /// Takes `n` blocks at once, or none at all if fewer than `n` are free.
    pub fn allocate_many(&self, n: usize) -> Result<Vec<BlockId>> {
        let mut queue = self.lock();
        if queue.len() < n {
            debug!("wanted {} blocks but only {} are free", n, queue.len());
            return Err(FsError::DiskFull);
        }
        let blocks: Vec<BlockId> = queue.drain(..n).collect();
        trace!("allocated blocks {:?}", blocks);
        Ok(blocks)
    }

    pub fn free(&self, block: BlockId) {
        trace!("freeing block {}", block);
        self.lock().push_back(block);
    }

    /// Returns several blocks to the pool in one critical section, in iteration order.
    pub fn release_all<I: IntoIterator<Item = BlockId>>(&self, blocks: I) {
        let mut queue = self.lock();
        for block in blocks {
            trace!("freeing block {}", block);
            queue.push_back(block);
        }
    }

    /// Puts blocks that were allocated but never used back at the head of the queue, so
    /// the next allocation sees the same order it would have without them being taken.
    pub fn restore<I>(&self, blocks: I)
    where
        I: IntoIterator<Item = BlockId>,
        I::IntoIter: DoubleEndedIterator,
    {
        let mut queue = self.lock();
        for block in blocks.into_iter().rev() {
            trace!("restoring block {}", block);
            queue.push_front(block);
        }
    }

    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot of the queue, oldest first.
    pub fn snapshot(&self) -> Vec<BlockId> {
        self.lock().iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_read_and_write_values_to_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(2);

        assert_eq!(bmp.get(0), State::Free);
        assert_eq!(bmp.get(2), State::Used);
    }

    #[test]
    fn can_set_values_at_ends_of_bitmap() {
        let mut bmp = Bitmap::new(4096);

        bmp.set_reserved(0);
        bmp.set_reserved(4095);

        assert_eq!(bmp.get(0), State::Used);
        assert_eq!(bmp.get(4095), State::Used);
        assert_eq!(bmp.used_count(), 2);
    }

    #[test]
    fn free_blocks_are_listed_in_ascending_order() {
        let mut bmp = Bitmap::new(70);
        for b in 0..70 {
            if b != 3 && b != 65 && b != 69 {
                bmp.set_reserved(b);
            }
        }
        assert_eq!(bmp.free_blocks().collect::<Vec<_>>(), vec![3, 65, 69]);
    }

    #[test]
    #[should_panic(expected = "outside bitmap")]
    fn reading_past_the_end_panics() {
        Bitmap::new(8).get(8);
    }

    #[test]
    fn allocation_is_first_in_first_out() {
        let pool = FreeBlocks::new(vec![4, 5, 6]);
        assert_eq!(pool.allocate().unwrap(), 4);

        pool.free(1);
        assert_eq!(pool.allocate().unwrap(), 5);
        assert_eq!(pool.allocate().unwrap(), 6);
        assert_eq!(pool.allocate().unwrap(), 1);
    }

    #[test]
    fn empty_pool_reports_disk_full() {
        let pool = FreeBlocks::new(vec![]);
        assert!(matches!(pool.allocate(), Err(FsError::DiskFull)));
        // Still usable afterwards.
        pool.free(9);
        assert_eq!(pool.allocate().unwrap(), 9);
    }

    #[test]
    fn allocate_many_is_all_or_nothing() {
        let pool = FreeBlocks::new(vec![1]);
        assert!(matches!(pool.allocate_many(2), Err(FsError::DiskFull)));
        assert_eq!(pool.available(), 1);

        pool.free(2);
        assert_eq!(pool.allocate_many(2).unwrap(), vec![1, 2]);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn release_all_keeps_order() {
        let pool = FreeBlocks::new(vec![8]);
        pool.release_all(vec![3, 2, 1]);
        assert_eq!(pool.snapshot(), vec![8, 3, 2, 1]);
    }

    #[test]
    fn restored_blocks_are_handed_out_again_first() {
        let pool = FreeBlocks::new(vec![1, 2, 3, 4]);
        let taken = pool.allocate_many(2).unwrap();
        pool.restore(taken);
        assert_eq!(pool.snapshot(), vec![1, 2, 3, 4]);

        let single = pool.allocate().unwrap();
        pool.restore([single]);
        assert_eq!(pool.allocate().unwrap(), 1);
    }

    #[test]
    fn pool_from_bitmap_skips_used_blocks() {
        let mut bmp = Bitmap::new(6);
        bmp.set_reserved(0);
        bmp.set_reserved(3);
        let pool = FreeBlocks::from_bitmap(&bmp);
        assert_eq!(pool.snapshot(), vec![1, 2, 4, 5]);
    }
}
