//! Node pool: fixed-capacity block allocator serving all node memory.
//!
//! The pool is a buddy allocator over one preallocated region. Block sizes are
//! powers of two starting at [`MIN_BLOCK_SIZE`]. Free blocks are kept in one
//! doubly linked list per size class, and the list links live inside the free
//! blocks themselves, so allocate and free never touch the system allocator and
//! run in O(number of size classes).
//!
//! The pool is not synchronized. It is shared through [`SharedPool`]
//! (`Rc<RefCell<_>>`), which keeps every owner on a single thread.

#![forbid(unsafe_code)]

use crate::error::GraphError;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::rc::Rc;

/// Default pool capacity: 1 MiB.
pub const DEFAULT_POOL_CAPACITY: usize = 1024 * 1024;

const MIN_BLOCK_SHIFT: u32 = 4;

/// Smallest block the pool serves, in bytes. Large enough to hold the two
/// free-list links.
pub const MIN_BLOCK_SIZE: usize = 1 << MIN_BLOCK_SHIFT;

const NUM_CLASSES: usize = (usize::BITS - MIN_BLOCK_SHIFT) as usize;
const NIL: u64 = u64::MAX;
const PREV: usize = 0;
const NEXT: usize = 1;
const TAG_FREE: u8 = 0x80;

/// A block served by a [`NodePool`].
///
/// Blocks are move-only: returning one to the pool consumes it, so a block
/// cannot be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct Block {
    offset: usize,
    class: u8,
}

impl Block {
    /// Offset of the block inside the pool region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Usable size of the block in bytes (the request rounded up to its class).
    pub fn size(&self) -> usize {
        class_size(self.class as usize)
    }
}

/// Fixed-capacity buddy allocator.
pub struct NodePool {
    memory: Box<[u8]>,
    tags: Box<[u8]>,
    free_heads: Vec<Option<usize>>,
    max_size: usize,
    in_use: usize,
    live_blocks: usize,
}

impl NodePool {
    /// Create a pool of `capacity` bytes, rounded down to a multiple of
    /// [`MIN_BLOCK_SIZE`].
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity & !(MIN_BLOCK_SIZE - 1);
        let mut pool = Self {
            memory: vec![0u8; capacity].into_boxed_slice(),
            tags: vec![0u8; capacity >> MIN_BLOCK_SHIFT].into_boxed_slice(),
            free_heads: vec![None; NUM_CLASSES],
            max_size: 0,
            in_use: 0,
            live_blocks: 0,
        };

        // Carve the region into its binary decomposition. Each top-level block
        // is aligned to its own size and its buddy never fits in the region,
        // so top-level blocks never coalesce with each other.
        let mut offset = 0;
        let mut remaining = capacity;
        while remaining >= MIN_BLOCK_SIZE {
            let size = prev_power_of_two(remaining);
            let class = (size.trailing_zeros() - MIN_BLOCK_SHIFT) as usize;
            pool.push_free(offset, class);
            pool.max_size = pool.max_size.max(size);
            offset += size;
            remaining -= size;
        }
        pool
    }

    /// Total bytes managed by the pool.
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Largest block the pool can ever serve.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Bytes currently handed out, counted at block granularity.
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Bytes not currently handed out. Fragmentation may keep a request of
    /// this size from succeeding.
    pub fn available(&self) -> usize {
        self.capacity() - self.in_use
    }

    /// Number of outstanding blocks.
    pub fn live_blocks(&self) -> usize {
        self.live_blocks
    }

    /// Serve a block of at least `size` bytes.
    ///
    /// Fails with [`GraphError::OutOfMemory`] when `size > max_size()` or no
    /// free block of a sufficient class remains. A failed call does not change
    /// the pool.
    pub fn allocate(&mut self, size: usize) -> Result<Block, GraphError> {
        if size > self.max_size {
            return Err(GraphError::OutOfMemory { requested: size });
        }
        let class = size_class(size);
        let mut found = (class..NUM_CLASSES)
            .find(|&c| self.free_heads[c].is_some())
            .ok_or(GraphError::OutOfMemory { requested: size })?;
        let offset = self.free_heads[found].ok_or(GraphError::OutOfMemory { requested: size })?;
        self.unlink_free(offset, found);

        // Split down to the requested class, returning upper halves.
        while found > class {
            found -= 1;
            self.push_free(offset + class_size(found), found);
        }

        self.tags[offset >> MIN_BLOCK_SHIFT] = class as u8 + 1;
        self.in_use += class_size(class);
        self.live_blocks += 1;
        Ok(Block {
            offset,
            class: class as u8,
        })
    }

    /// Return a block to the pool, merging it with free buddies.
    pub fn free(&mut self, block: Block) {
        let Block { mut offset, class } = block;
        let mut class = class as usize;
        assert_eq!(
            self.tags.get(offset >> MIN_BLOCK_SHIFT).copied(),
            Some(class as u8 + 1),
            "block at offset {} was not served by this pool",
            offset
        );
        self.tags[offset >> MIN_BLOCK_SHIFT] = 0;
        self.in_use -= class_size(class);
        self.live_blocks -= 1;

        while class + 1 < NUM_CLASSES {
            let size = class_size(class);
            let buddy = offset ^ size;
            if buddy + size > self.capacity()
                || self.tags[buddy >> MIN_BLOCK_SHIFT] != TAG_FREE | (class as u8 + 1)
            {
                break;
            }
            self.unlink_free(buddy, class);
            offset = offset.min(buddy);
            class += 1;
        }
        self.push_free(offset, class);
    }

    fn push_free(&mut self, offset: usize, class: usize) {
        let head = self.free_heads[class];
        self.write_link(offset, PREV, None);
        self.write_link(offset, NEXT, head);
        if let Some(head) = head {
            self.write_link(head, PREV, Some(offset));
        }
        self.free_heads[class] = Some(offset);
        self.tags[offset >> MIN_BLOCK_SHIFT] = TAG_FREE | (class as u8 + 1);
    }

    fn unlink_free(&mut self, offset: usize, class: usize) {
        let prev = self.read_link(offset, PREV);
        let next = self.read_link(offset, NEXT);
        match prev {
            Some(prev) => self.write_link(prev, NEXT, next),
            None => self.free_heads[class] = next,
        }
        if let Some(next) = next {
            self.write_link(next, PREV, prev);
        }
        self.tags[offset >> MIN_BLOCK_SHIFT] = 0;
    }

    fn read_link(&self, offset: usize, slot: usize) -> Option<usize> {
        let start = offset + slot * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.memory[start..start + 8]);
        match u64::from_le_bytes(raw) {
            NIL => None,
            link => Some(link as usize),
        }
    }

    fn write_link(&mut self, offset: usize, slot: usize, link: Option<usize>) {
        let start = offset + slot * 8;
        let raw = link.map_or(NIL, |l| l as u64).to_le_bytes();
        self.memory[start..start + 8].copy_from_slice(&raw);
    }
}

impl fmt::Debug for NodePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodePool")
            .field("capacity", &self.capacity())
            .field("max_size", &self.max_size)
            .field("in_use", &self.in_use)
            .field("live_blocks", &self.live_blocks)
            .finish()
    }
}

fn class_size(class: usize) -> usize {
    MIN_BLOCK_SIZE << class
}

fn size_class(size: usize) -> usize {
    let rounded = size.max(MIN_BLOCK_SIZE).next_power_of_two();
    (rounded.trailing_zeros() - MIN_BLOCK_SHIFT) as usize
}

fn prev_power_of_two(value: usize) -> usize {
    1 << (usize::BITS - 1 - value.leading_zeros())
}

/// A pool shared by every allocator adapter bound to it.
pub type SharedPool = Rc<RefCell<NodePool>>;

/// Create a shared pool of `capacity` bytes.
pub fn shared_pool(capacity: usize) -> SharedPool {
    Rc::new(RefCell::new(NodePool::new(capacity)))
}

/// Typed allocator adapter forwarding to a shared [`NodePool`].
///
/// Adapters are interchangeable when they are bound to the same pool: they
/// compare equal regardless of element type, and `!=` is the negation of `==`.
pub struct NodeAllocator<T> {
    pool: SharedPool,
    marker: PhantomData<fn() -> T>,
}

impl<T> NodeAllocator<T> {
    /// Bind an adapter to `pool`.
    pub fn new(pool: SharedPool) -> Self {
        Self {
            pool,
            marker: PhantomData,
        }
    }

    /// An adapter for another element type over the same pool.
    pub fn rebind<U>(&self) -> NodeAllocator<U> {
        NodeAllocator::new(Rc::clone(&self.pool))
    }

    /// Reserve room for `count` values of `T`.
    pub fn allocate(&self, count: usize) -> Result<Block, GraphError> {
        let bytes = count
            .checked_mul(mem::size_of::<T>())
            .ok_or(GraphError::OutOfMemory {
                requested: usize::MAX,
            })?;
        self.pool.borrow_mut().allocate(bytes)
    }

    /// Return a block obtained from [`NodeAllocator::allocate`].
    pub fn deallocate(&self, block: Block) {
        self.pool.borrow_mut().free(block);
    }

    /// Largest number of `T` a single allocation can hold.
    pub fn max_size(&self) -> usize {
        self.pool.borrow().max_size() / mem::size_of::<T>().max(1)
    }

    /// The pool this adapter draws from.
    pub fn pool(&self) -> &SharedPool {
        &self.pool
    }
}

impl<T> Clone for NodeAllocator<T> {
    fn clone(&self) -> Self {
        Self::new(Rc::clone(&self.pool))
    }
}

impl<T, U> PartialEq<NodeAllocator<U>> for NodeAllocator<T> {
    fn eq(&self, other: &NodeAllocator<U>) -> bool {
        Rc::ptr_eq(&self.pool, &other.pool)
    }
}

impl<T> Eq for NodeAllocator<T> {}

impl<T> fmt::Debug for NodeAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeAllocator")
            .field("element", &std::any::type_name::<T>())
            .field("pool", &*self.pool.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_default_capacity_serves_whole_region() {
        let pool = NodePool::new(DEFAULT_POOL_CAPACITY);
        assert_eq!(pool.capacity(), DEFAULT_POOL_CAPACITY);
        assert_eq!(pool.max_size(), DEFAULT_POOL_CAPACITY);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn pool_rejects_oversized_request_without_change() {
        let mut pool = NodePool::new(4096);
        let held = pool.allocate(100).unwrap();
        let before = (pool.in_use(), pool.live_blocks());
        assert_eq!(
            pool.allocate(4097),
            Err(GraphError::OutOfMemory { requested: 4097 })
        );
        assert_eq!((pool.in_use(), pool.live_blocks()), before);
        pool.free(held);
    }

    #[test]
    fn pool_rounds_to_size_class() {
        let mut pool = NodePool::new(1024);
        let block = pool.allocate(17).unwrap();
        assert_eq!(block.size(), 32);
        assert_eq!(pool.in_use(), 32);
        let tiny = pool.allocate(0).unwrap();
        assert_eq!(tiny.size(), MIN_BLOCK_SIZE);
        pool.free(block);
        pool.free(tiny);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn pool_exhausts_then_recovers() {
        let mut pool = NodePool::new(256);
        let blocks: Vec<Block> = (0..4).map(|_| pool.allocate(64).unwrap()).collect();
        assert!(matches!(
            pool.allocate(1),
            Err(GraphError::OutOfMemory { .. })
        ));
        for block in blocks {
            pool.free(block);
        }
        // Buddies coalesced back into one block spanning the region.
        let whole = pool.allocate(256).unwrap();
        assert_eq!(whole.offset(), 0);
        pool.free(whole);
    }

    #[test]
    fn pool_non_power_of_two_capacity() {
        let mut pool = NodePool::new(3 * 64 + 7);
        assert_eq!(pool.capacity(), 192);
        assert_eq!(pool.max_size(), 128);
        let a = pool.allocate(128).unwrap();
        let b = pool.allocate(64).unwrap();
        assert!(pool.allocate(16).is_err());
        pool.free(a);
        pool.free(b);
        assert_eq!(pool.available(), 192);
    }

    #[test]
    fn pool_smaller_than_min_block_serves_nothing() {
        let mut pool = NodePool::new(MIN_BLOCK_SIZE - 1);
        assert_eq!(pool.max_size(), 0);
        assert!(pool.allocate(0).is_err());
    }

    #[test]
    fn adapters_over_same_pool_are_equal() {
        let pool = shared_pool(1024);
        let bytes: NodeAllocator<u8> = NodeAllocator::new(Rc::clone(&pool));
        let words: NodeAllocator<u64> = bytes.rebind();
        assert!(bytes == words);
        assert!(!(bytes != words));

        let other: NodeAllocator<u8> = NodeAllocator::new(shared_pool(1024));
        assert!(bytes != other);
    }

    #[test]
    fn adapters_share_accounting() {
        let pool = shared_pool(1024);
        let bytes: NodeAllocator<u8> = NodeAllocator::new(Rc::clone(&pool));
        let words: NodeAllocator<u64> = bytes.rebind();
        let block = words.allocate(8).unwrap();
        assert_eq!(block.size(), 64);
        assert_eq!(pool.borrow().in_use(), 64);
        bytes.deallocate(block);
        assert_eq!(pool.borrow().in_use(), 0);
        assert_eq!(words.max_size(), 1024 / 8);
    }
}
