//! Fixed-block buffer pool shared by the worker threads.
//!
//! Every block is allocated once when the pool is created. Workers check a
//! block out for the duration of one task and hand it back afterwards, so the
//! receive/echo path never touches the general allocator.
//!
//! The free list is a stack of block indices (LIFO for cache locality). A
//! checked-out [`Block`] carries its own index, which makes release O(1).

use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{error, info, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// Error returned when a pool cannot be built.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("block pool {0} must be greater than zero")]
    ZeroSized(&'static str),
    #[error("failed to allocate block {index} of {block_size} bytes")]
    Alloc { index: usize, block_size: usize },
}

/// A buffer checked out of a [`BlockPool`].
///
/// Dereferences to the full `block_size` byte slice. Must be handed back
/// with [`BlockPool::release`]; holding on to it keeps the block out of
/// circulation.
#[derive(Debug)]
pub struct Block {
    pool_id: u64,
    index: usize,
    data: Box<[u8]>,
}

impl Block {
    /// Slot index of this block inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct Slot {
    /// Storage while the block is free; `None` while checked out.
    data: Option<Box<[u8]>>,
    in_use: bool,
}

struct PoolState {
    slots: Vec<Slot>,
    /// Stack of free slot indices.
    free_list: Vec<usize>,
}

/// Thread-safe pool of fixed-size blocks.
pub struct BlockPool {
    id: u64,
    state: Mutex<PoolState>,
    block_size: usize,
    capacity: usize,
}

impl BlockPool {
    /// Create a new pool of `capacity` blocks, each `block_size` bytes.
    ///
    /// Fails without leaving any partial pool behind if an allocation fails.
    pub fn new(block_size: usize, capacity: usize) -> Result<Self, PoolError> {
        if block_size == 0 {
            return Err(PoolError::ZeroSized("block size"));
        }
        if capacity == 0 {
            return Err(PoolError::ZeroSized("capacity"));
        }

        let mut slots: Vec<Slot> = Vec::new();
        let mut free_list: Vec<usize> = Vec::new();
        if slots.try_reserve_exact(capacity).is_err()
            || free_list.try_reserve_exact(capacity).is_err()
        {
            error!(capacity, "Failed to create block pool");
            return Err(PoolError::Alloc {
                index: 0,
                block_size,
            });
        }

        for index in 0..capacity {
            let data = alloc_block(block_size).ok_or_else(|| {
                error!(index, block_size, "Failed to allocate pool block");
                PoolError::Alloc { index, block_size }
            })?;
            slots.push(Slot {
                data: Some(data),
                in_use: false,
            });
        }
        // Reverse so the first pop hands out block 0.
        free_list.extend((0..capacity).rev());

        info!(blocks = capacity, block_size, "Block pool created");

        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState { slots, free_list }),
            block_size,
            capacity,
        })
    }

    /// Check a block out of the pool.
    ///
    /// Returns `None` if every block is in use.
    pub fn acquire(&self) -> Option<Block> {
        let mut state = self.state.lock();
        let popped = state.free_list.pop();
        let index = match popped {
            Some(index) => index,
            None => {
                drop(state);
                error!(capacity = self.capacity, "Block pool exhausted");
                return None;
            }
        };

        // Free slots always hold their storage.
        let slot = &mut state.slots[index];
        slot.in_use = true;
        let data = slot.data.take()?;
        Some(Block {
            pool_id: self.id,
            index,
            data,
        })
    }

    /// Return a block to the pool.
    ///
    /// Blocks from another pool, or slots that are not checked out, are
    /// ignored.
    pub fn release(&self, block: Block) {
        if block.pool_id != self.id || block.index >= self.capacity {
            warn!(index = block.index, "Released block does not belong to this pool");
            return;
        }

        let mut state = self.state.lock();
        let slot = &mut state.slots[block.index];
        if !slot.in_use {
            return;
        }
        slot.in_use = false;
        slot.data = Some(block.data);
        state.free_list.push(block.index);
    }

    /// Size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Total number of blocks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of blocks on the free list.
    pub fn available(&self) -> usize {
        self.state.lock().free_list.len()
    }

    /// Number of blocks currently checked out.
    pub fn in_use(&self) -> usize {
        let state = self.state.lock();
        state.slots.iter().filter(|slot| slot.in_use).count()
    }

    /// Tear the pool down.
    ///
    /// Callers must have released every block first. Blocks still checked
    /// out are reported and simply freed when their holder drops them.
    pub fn destroy(self) {
        let outstanding = self.in_use();
        if outstanding > 0 {
            error!(outstanding, "Block pool destroyed with blocks checked out");
        }
        info!("Block pool destroyed");
    }
}

fn alloc_block(block_size: usize) -> Option<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(block_size).ok()?;
    data.resize(block_size, 0u8);
    Some(data.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn assert_conserved(pool: &BlockPool) {
        assert_eq!(pool.available() + pool.in_use(), pool.capacity());
    }

    #[test]
    fn test_block_pool_basic() {
        let pool = BlockPool::new(1024, 4).unwrap();
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.block_size(), 1024);

        let b1 = pool.acquire().unwrap();
        let b2 = pool.acquire().unwrap();
        assert_eq!(b1.len(), 1024);
        assert_ne!(b1.index(), b2.index());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.in_use(), 2);

        pool.release(b1);
        assert_eq!(pool.available(), 3);
        pool.release(b2);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_block_pool_exhaustion() {
        let pool = BlockPool::new(64, 2).unwrap();
        let b1 = pool.acquire().unwrap();
        let b2 = pool.acquire().unwrap();

        assert!(pool.acquire().is_none());
        assert_conserved(&pool);

        pool.release(b2);
        let b3 = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());

        pool.release(b1);
        pool.release(b3);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_block_data_survives_round_trip() {
        let pool = BlockPool::new(16, 1).unwrap();
        let mut block = pool.acquire().unwrap();
        block[..5].copy_from_slice(b"hello");
        let index = block.index();
        pool.release(block);

        // Single block, so the same storage comes back.
        let block = pool.acquire().unwrap();
        assert_eq!(block.index(), index);
        assert_eq!(&block[..5], b"hello");
        pool.release(block);
    }

    #[test]
    fn test_release_foreign_block_is_ignored() {
        let pool_a = BlockPool::new(32, 2).unwrap();
        let pool_b = BlockPool::new(32, 2).unwrap();

        let foreign = pool_b.acquire().unwrap();
        pool_a.release(foreign);

        assert_eq!(pool_a.available(), 2);
        assert_eq!(pool_a.in_use(), 0);
        assert_eq!(pool_b.in_use(), 1);
        assert_conserved(&pool_a);
        assert_conserved(&pool_b);
    }

    #[test]
    fn test_zero_sized_pool_rejected() {
        assert_eq!(
            BlockPool::new(0, 4).err(),
            Some(PoolError::ZeroSized("block size"))
        );
        assert_eq!(
            BlockPool::new(64, 0).err(),
            Some(PoolError::ZeroSized("capacity"))
        );
    }

    #[test]
    fn test_conservation_under_interleaving() {
        let pool = BlockPool::new(8, 5).unwrap();
        let mut held = Vec::new();

        for step in 0..40 {
            if step % 3 == 2 {
                if let Some(block) = held.pop() {
                    pool.release(block);
                }
            } else if let Some(block) = pool.acquire() {
                held.push(block);
            }
            assert_conserved(&pool);
            assert_eq!(pool.in_use(), held.len());
        }

        for block in held.drain(..) {
            pool.release(block);
        }
        assert_eq!(pool.available(), 5);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(BlockPool::new(128, 4).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..500 {
                        if let Some(mut block) = pool.acquire() {
                            block[0] = 1;
                            assert!(pool.in_use() <= pool.capacity());
                            pool.release(block);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_use(), 0);
    }
}
