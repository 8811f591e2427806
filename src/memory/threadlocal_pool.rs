//! Thread-caching pool for the multi-writer level
//!
//! Every writer owns one [`ThreadCachePool`]. Small requests are carved from a private hot
//! area that is refilled a whole slab (`chunk_size` bytes) at a time from the shared arena,
//! so the shared bump pointer is touched once per slab instead of once per node. Spans freed
//! by a writer land in that writer's own free lists, whichever writer allocated them.
//!
//! # Architecture
//!
//! - **Hot area**: `[hot_pos, hot_end)` inside the current slab
//! - **Free lists**: exact-size bins shared with [`FixedCapacityPool`](super::FixedCapacityPool)
//! - **Large requests**: anything over half a slab goes straight to the arena
//! - **Bounded backing**: a failed refill falls back to an exact-size request and then
//!   reports `None`; it never panics

use crate::memory::arena::Arena;
use crate::memory::fixed_capacity_pool::{FreeLists, PoolStats};

/// Per-writer slab cache.
#[derive(Debug)]
pub struct ThreadCachePool {
    chunk_size: usize,
    hot_pos: usize,
    hot_end: usize,
    lists: FreeLists,
    stats: PoolStats,
    slabs: u64,
}

impl ThreadCachePool {
    /// Create an empty cache that refills `chunk_size` bytes at a time.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size & !3,
            hot_pos: 0,
            hot_end: 0,
            lists: FreeLists::new(),
            stats: PoolStats::default(),
            slabs: 0,
        }
    }

    /// Allocate `size` bytes (a multiple of 4).
    pub fn alloc(&mut self, arena: &Arena, size: usize) -> Option<u32> {
        if let Some(id) = self.lists.pop(size) {
            self.stats.reused += 1;
            return Some(id);
        }
        if self.hot_end - self.hot_pos >= size {
            let id = (self.hot_pos / 4) as u32;
            self.hot_pos += size;
            self.stats.fresh += 1;
            return Some(id);
        }
        self.alloc_slow_path(arena, size)
    }

    fn alloc_slow_path(&mut self, arena: &Arena, size: usize) -> Option<u32> {
        if size * 2 <= self.chunk_size {
            if let Some(slab) = arena.bump(self.chunk_size) {
                self.retire_hot_area();
                self.slabs += 1;
                self.hot_pos = slab as usize * 4 + size;
                self.hot_end = slab as usize * 4 + self.chunk_size;
                self.stats.fresh += 1;
                log::trace!("thread cache took slab #{} at word {}", self.slabs, slab);
                return Some(slab);
            }
        }
        match arena.bump(size) {
            Some(id) => {
                self.stats.fresh += 1;
                Some(id)
            }
            None => {
                self.stats.failed += 1;
                log::debug!(
                    "thread cache could not get {} bytes: arena {} / {} used",
                    size,
                    arena.used(),
                    arena.capacity()
                );
                None
            }
        }
    }

    /// The tail of the current slab becomes an ordinary free span.
    fn retire_hot_area(&mut self) {
        let rest = self.hot_end - self.hot_pos;
        if rest > 0 {
            self.lists.push((self.hot_pos / 4) as u32, rest);
        }
        self.hot_pos = 0;
        self.hot_end = 0;
    }

    /// Return a span to this cache.
    pub fn free(&mut self, id: u32, size: usize) {
        self.stats.freed += 1;
        let start = id as usize * 4;
        if start + size == self.hot_pos {
            self.hot_pos = start;
        } else {
            self.lists.push(id, size);
        }
    }

    /// Free bytes owned by this cache, including the unused hot area.
    pub fn frag_size(&self) -> usize {
        self.lists.frag_size() + (self.hot_end - self.hot_pos)
    }

    /// Slab size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Slabs taken from the arena so far.
    pub fn slabs(&self) -> u64 {
        self.slabs
    }

    /// Allocation counters.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HugePageMode;

    fn arena(cap: usize) -> Arena {
        Arena::anonymous(cap, HugePageMode::None, false).unwrap()
    }

    #[test]
    fn test_hot_area_serves_small_requests() {
        let arena = arena(64 * 1024);
        let mut pool = ThreadCachePool::new(4096);
        let a = pool.alloc(&arena, 16).unwrap();
        let b = pool.alloc(&arena, 16).unwrap();
        assert_eq!(b, a + 4);
        assert_eq!(arena.used(), 4096);
        assert_eq!(pool.slabs(), 1);
        assert_eq!(pool.frag_size(), 4096 - 32);
    }

    #[test]
    fn test_free_tail_rewinds_hot_area() {
        let arena = arena(64 * 1024);
        let mut pool = ThreadCachePool::new(4096);
        let a = pool.alloc(&arena, 16).unwrap();
        let b = pool.alloc(&arena, 16).unwrap();
        pool.free(b, 16);
        assert_eq!(pool.alloc(&arena, 16), Some(b));
        pool.free(a, 16);
        assert_eq!(pool.alloc(&arena, 16), Some(a));
    }

    #[test]
    fn test_large_requests_bypass_slab() {
        let arena = arena(64 * 1024);
        let mut pool = ThreadCachePool::new(4096);
        let id = pool.alloc(&arena, 3000).unwrap();
        assert_eq!(id, 0);
        assert_eq!(arena.used(), 3000);
        assert_eq!(pool.slabs(), 0);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let arena = arena(8192);
        let mut pool = ThreadCachePool::new(4096);
        assert!(pool.alloc(&arena, 2048).is_some());
        assert!(pool.alloc(&arena, 2048).is_some());
        assert!(pool.alloc(&arena, 2048).is_some());
        assert!(pool.alloc(&arena, 2048).is_some());
        assert!(pool.alloc(&arena, 2048).is_none());
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    fn test_refill_keeps_slab_tail() {
        let arena = arena(64 * 1024);
        let mut pool = ThreadCachePool::new(4096);
        pool.alloc(&arena, 2000).unwrap();
        pool.alloc(&arena, 2000).unwrap();
        // 96 bytes left in the first slab; this forces a refill.
        pool.alloc(&arena, 1000).unwrap();
        assert_eq!(pool.slabs(), 2);
        assert!(pool.alloc(&arena, 96).is_some());
        assert_eq!(arena.used(), 8192);
    }
}
