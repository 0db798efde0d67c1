//! Fixed-block memory pool.
//!
//! One contiguous, zero-initialised arena is carved into `block_count` blocks of
//! `block_size` bytes. Blocks are handed out as opaque [`Block`] handles and
//! recycled through a LIFO free stack, so both `alloc` and `free` are O(1).
//!
//! The pool is not thread-safe by itself: every mutating method takes `&mut self`.
//! Callers sharing a pool across threads wrap it in a mutex.

use tracing::trace;

use crate::error::{ErrorKind, Result};

/// Handle to one block of a [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    offset: usize,
}

impl Block {
    /// Byte offset of the block inside its pool's arena.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// O(1) fixed-block allocator with a free stack.
pub struct MemoryPool {
    /// Backing arena of `block_size * block_count` bytes
    arena: Box<[u8]>,
    /// Size of every block
    block_size: usize,
    /// Number of blocks in the arena
    block_count: usize,
    /// Indices of free blocks; the top of the stack is handed out first
    free: Vec<usize>,
    /// Per-block in-use flag, used to reject duplicate frees
    in_use: Vec<bool>,
}

impl MemoryPool {
    /// Creates a pool of `block_count` blocks of `block_size` bytes each.
    pub fn new(block_size: usize, block_count: usize) -> Result<Self> {
        if block_size == 0 || block_count == 0 {
            return Err(ErrorKind::InvalidParameter("block size and count must be non-zero"));
        }
        let total = block_size.checked_mul(block_count).ok_or(ErrorKind::OutOfMemory)?;

        let mut arena = Vec::new();
        arena.try_reserve_exact(total).map_err(|_| ErrorKind::OutOfMemory)?;
        arena.resize(total, 0u8);

        let mut free = Vec::new();
        free.try_reserve_exact(block_count).map_err(|_| ErrorKind::OutOfMemory)?;
        // Lowest block on top so a fresh pool hands out blocks in address order.
        free.extend((0..block_count).rev());

        Ok(Self {
            arena: arena.into_boxed_slice(),
            block_size,
            block_count,
            free,
            in_use: vec![false; block_count],
        })
    }

    /// Pops a zeroed block, or returns `None` if the pool is exhausted.
    pub fn alloc(&mut self) -> Option<Block> {
        let index = self.free.pop()?;
        self.in_use[index] = true;
        let offset = index * self.block_size;
        self.arena[offset..offset + self.block_size].fill(0);
        Some(Block { offset })
    }

    /// Returns a block to the pool.
    ///
    /// Handles outside the arena, misaligned handles and duplicate frees are ignored.
    /// Returns true if the block was accepted.
    pub fn free(&mut self, block: Block) -> bool {
        match self.index_of(block) {
            Some(index) if self.in_use[index] => {
                self.in_use[index] = false;
                self.free.push(index);
                true
            }
            Some(_) => {
                trace!("ignoring duplicate free of block at offset {}", block.offset);
                false
            }
            None => {
                trace!("ignoring free of foreign block at offset {}", block.offset);
                false
            }
        }
    }

    /// Returns every block to the pool. Outstanding handles become invalid.
    pub fn reset(&mut self) {
        self.free.clear();
        self.free.extend((0..self.block_count).rev());
        self.in_use.iter_mut().for_each(|flag| *flag = false);
    }

    /// Borrows the bytes of an allocated block.
    pub fn get(&self, block: Block) -> Option<&[u8]> {
        let index = self.index_of(block)?;
        if !self.in_use[index] {
            return None;
        }
        Some(&self.arena[block.offset..block.offset + self.block_size])
    }

    /// Mutably borrows the bytes of an allocated block.
    pub fn get_mut(&mut self, block: Block) -> Option<&mut [u8]> {
        let index = self.index_of(block)?;
        if !self.in_use[index] {
            return None;
        }
        Some(&mut self.arena[block.offset..block.offset + self.block_size])
    }

    /// Returns the number of free blocks.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Returns the number of blocks currently handed out.
    pub fn allocated(&self) -> usize {
        self.block_count - self.free.len()
    }

    /// Returns the total number of blocks.
    pub fn capacity(&self) -> usize {
        self.block_count
    }

    /// Returns the size of each block in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn index_of(&self, block: Block) -> Option<usize> {
        if block.offset >= self.arena.len() || block.offset % self.block_size != 0 {
            return None;
        }
        Some(block.offset / self.block_size)
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("available", &self.available())
            .finish()
    }
}
