//! Per-block locks.
//!
//! Every inode and entry table is read or written only while the lock for its block is
//! held. Requests always take the root lock first and then walk downwards hand over hand,
//! so locks are acquired in tree order and cannot form a cycle.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::trace;

use crate::layout::BlockId;

/// One exclusive lock per block, created up front for the whole device.
pub struct LockRegistry {
    locks: Vec<Mutex<()>>,
}

impl LockRegistry {
    pub fn new(block_count: usize) -> Self {
        Self {
            locks: (0..block_count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Blocks until the lock for `block` is free.
    pub fn lock(&self, block: BlockId) -> BlockLock<'_> {
        // The guarded value is (), a panicking holder cannot leave it inconsistent.
        let guard = self.locks[block as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        trace!("locked block {}", block);
        BlockLock {
            block,
            registry: self,
            _guard: guard,
        }
    }
}

/// Proof that the caller holds the lock for one block. Dropping it releases the lock.
#[must_use = "the block is unlocked as soon as this guard is dropped"]
pub struct BlockLock<'a> {
    block: BlockId,
    registry: &'a LockRegistry,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> BlockLock<'a> {
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Locks `child`, then releases this lock.
    pub fn hand_over(self, child: BlockId) -> BlockLock<'a> {
        let next = self.registry.lock(child);
        drop(self);
        next
    }
}

impl Drop for BlockLock<'_> {
    fn drop(&mut self) {
        trace!("unlocked block {}", self.block);
    }
}

impl fmt::Debug for BlockLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockLock").field("block", &self.block).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn registry_is_presized() {
        assert_eq!(LockRegistry::new(16).len(), 16);
    }

    #[test]
    fn locks_on_different_blocks_are_independent() {
        let registry = LockRegistry::new(4);
        let a = registry.lock(1);
        let b = registry.lock(2);
        assert_eq!((a.block(), b.block()), (1, 2));
    }

    #[test]
    fn hand_over_holds_the_child() {
        let registry = LockRegistry::new(4);
        let held = registry.lock(0).hand_over(3);
        assert_eq!(held.block(), 3);
        // The parent is free again.
        let _root = registry.lock(0);
    }

    #[test]
    fn second_locker_waits_for_release() {
        let registry = &LockRegistry::new(2);
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            let held = registry.lock(1);
            s.spawn(move || {
                let _lock = registry.lock(1);
                tx.send(()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
            drop(held);
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });
    }

    #[test]
    fn hand_over_acquires_child_before_releasing_parent() {
        let registry = &LockRegistry::new(3);
        let (tx, rx) = mpsc::channel();

        thread::scope(|s| {
            let child = registry.lock(2);
            s.spawn(move || {
                let held = registry.lock(1).hand_over(2);
                tx.send(held.block()).unwrap();
            });

            // Wait until the walker owns block 1.
            while registry.locks[1].try_lock().is_ok() {
                thread::yield_now();
            }
            // It keeps block 1 while stuck on block 2.
            thread::sleep(Duration::from_millis(50));
            assert!(rx.try_recv().is_err());
            assert!(registry.locks[1].try_lock().is_err());

            drop(child);
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
        });
    }
}
