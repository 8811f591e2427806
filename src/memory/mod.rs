//! Memory management for trie nodes
//!
//! Nodes live in a single [`Arena`] of 4-byte words that is reserved once and never moves.
//! On top of the arena sit two pool flavours, selected by the trie's concurrency level:
//!
//! - [`FixedCapacityPool`] for levels with at most one writer
//! - [`ThreadCachePool`] for multi-writer tries, one per writer
//!
//! The arena is backed by anonymous memory (optionally on huge pages, see [`hugepage`]) or by
//! a memory-mapped file (see [`mmap`]).

pub mod arena;
pub mod fixed_capacity_pool;
pub mod hugepage;
pub mod mmap;
pub mod threadlocal_pool;

pub use arena::{Arena, Backing};
pub use fixed_capacity_pool::{ExhaustionPolicy, FixedCapacityPool, FreeLists, PoolStats};
pub use hugepage::{AnonRegion, HUGEPAGE_SIZE_2MB};
pub use mmap::FileRegion;
pub use threadlocal_pool::ThreadCachePool;

/// A node allocator as seen by the insert engine.
#[derive(Debug)]
pub enum NodePool {
    /// Single-writer free-list pool
    Fixed(FixedCapacityPool),
    /// Multi-writer thread cache
    ThreadCache(ThreadCachePool),
}

impl NodePool {
    /// Allocate `size` bytes; `None` means the arena is exhausted.
    #[inline]
    pub fn alloc(&mut self, arena: &Arena, size: usize) -> Option<u32> {
        match self {
            Self::Fixed(pool) => pool.alloc(arena, size),
            Self::ThreadCache(pool) => pool.alloc(arena, size),
        }
    }

    /// Free `size` bytes at `id`.
    #[inline]
    pub fn free(&mut self, id: u32, size: usize) {
        match self {
            Self::Fixed(pool) => pool.free(id, size),
            Self::ThreadCache(pool) => pool.free(id, size),
        }
    }

    /// Grow a block; the single-writer pool extends it in place when it ends the arena.
    pub fn realloc(&mut self, arena: &Arena, id: u32, old_size: usize, new_size: usize) -> Option<u32> {
        match self {
            Self::Fixed(pool) => pool.realloc(arena, id, old_size, new_size),
            Self::ThreadCache(pool) => {
                let new_id = pool.alloc(arena, new_size)?;
                arena.copy_words(id, new_id, old_size.min(new_size) / 4);
                pool.free(id, old_size);
                Some(new_id)
            }
        }
    }

    /// Bytes held in free lists and hot areas.
    pub fn frag_size(&self) -> usize {
        match self {
            Self::Fixed(pool) => pool.frag_size(),
            Self::ThreadCache(pool) => pool.frag_size(),
        }
    }

    /// Allocation counters.
    pub fn stats(&self) -> PoolStats {
        match self {
            Self::Fixed(pool) => pool.stats(),
            Self::ThreadCache(pool) => pool.stats(),
        }
    }
}
