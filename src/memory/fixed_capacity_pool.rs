//! Free-list pool for the single-writer concurrency levels
//!
//! Freed node spans are kept in exact-size bins and reused before the arena's bump pointer
//! is advanced. The same pool serves two levels that differ only in what exhaustion means:
//!
//! - **SingleThreadStrict / SingleThreadShared** ([`ExhaustionPolicy::Fatal`]): the arena is
//!   a large lazily committed reservation, so running out of it is a sizing mistake and the
//!   process panics.
//! - **OneWriteMultiRead** ([`ExhaustionPolicy::Fail`]): the arena is bounded and `alloc`
//!   returns `None`, which the insert engine turns into a recoverable failure.

use crate::memory::arena::Arena;
use std::collections::BTreeMap;

/// Largest span kept in the direct-indexed bins; bigger spans go to an ordered map.
pub const FAST_BIN_LIMIT: usize = 2048;

/// What happens when the arena cannot satisfy a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Log and panic
    Fatal,
    /// Report the failure to the caller
    Fail,
}

/// Exact-size free lists of arena spans.
#[derive(Debug, Default)]
pub struct FreeLists {
    fastbins: Vec<Vec<u32>>,
    huge: BTreeMap<usize, Vec<u32>>,
    frag_size: usize,
    frag_cnt: usize,
}

impl FreeLists {
    /// Empty free lists.
    pub fn new() -> Self {
        Self {
            fastbins: vec![Vec::new(); FAST_BIN_LIMIT / 4 + 1],
            huge: BTreeMap::new(),
            frag_size: 0,
            frag_cnt: 0,
        }
    }

    /// Pop a span of exactly `size` bytes.
    pub fn pop(&mut self, size: usize) -> Option<u32> {
        let id = if size <= FAST_BIN_LIMIT {
            self.fastbins.get_mut(size / 4)?.pop()?
        } else {
            let bin = self.huge.get_mut(&size)?;
            let id = bin.pop()?;
            if bin.is_empty() {
                self.huge.remove(&size);
            }
            id
        };
        self.frag_size -= size;
        self.frag_cnt -= 1;
        Some(id)
    }

    /// Push a span of `size` bytes.
    pub fn push(&mut self, id: u32, size: usize) {
        if size <= FAST_BIN_LIMIT {
            if self.fastbins.is_empty() {
                self.fastbins = vec![Vec::new(); FAST_BIN_LIMIT / 4 + 1];
            }
            self.fastbins[size / 4].push(id);
        } else {
            self.huge.entry(size).or_default().push(id);
        }
        self.frag_size += size;
        self.frag_cnt += 1;
    }

    /// Bytes currently parked in the lists.
    #[inline]
    pub fn frag_size(&self) -> usize {
        self.frag_size
    }

    /// Number of parked spans.
    #[inline]
    pub fn frag_cnt(&self) -> usize {
        self.frag_cnt
    }
}

/// Allocation counters of one pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served from a free list
    pub reused: u64,
    /// Requests served by advancing the arena
    pub fresh: u64,
    /// Requests that could not be served
    pub failed: u64,
    /// Spans returned
    pub freed: u64,
}

/// Free-list pool over a shared arena for levels with at most one writer.
#[derive(Debug)]
pub struct FixedCapacityPool {
    lists: FreeLists,
    policy: ExhaustionPolicy,
    stats: PoolStats,
}

impl FixedCapacityPool {
    /// Create a pool with the given exhaustion policy.
    pub fn new(policy: ExhaustionPolicy) -> Self {
        Self {
            lists: FreeLists::new(),
            policy,
            stats: PoolStats::default(),
        }
    }

    /// Allocate `size` bytes (a multiple of 4).
    pub fn alloc(&mut self, arena: &Arena, size: usize) -> Option<u32> {
        if let Some(id) = self.lists.pop(size) {
            self.stats.reused += 1;
            return Some(id);
        }
        match arena.bump(size) {
            Some(id) => {
                self.stats.fresh += 1;
                Some(id)
            }
            None => {
                self.stats.failed += 1;
                self.exhausted(arena, size)
            }
        }
    }

    /// Resize a block, extending it in place when it ends the arena.
    pub fn realloc(&mut self, arena: &Arena, id: u32, old_size: usize, new_size: usize) -> Option<u32> {
        if arena.try_extend(id, old_size, new_size) {
            self.stats.fresh += 1;
            return Some(id);
        }
        let new_id = self.alloc(arena, new_size)?;
        arena.copy_words(id, new_id, old_size.min(new_size) / 4);
        self.free(id, old_size);
        Some(new_id)
    }

    /// Return a span to the free lists.
    pub fn free(&mut self, id: u32, size: usize) {
        self.stats.freed += 1;
        self.lists.push(id, size);
    }

    /// Bytes parked in the free lists.
    pub fn frag_size(&self) -> usize {
        self.lists.frag_size()
    }

    /// Allocation counters.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// The exhaustion policy of this pool.
    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    fn exhausted(&self, arena: &Arena, size: usize) -> Option<u32> {
        match self.policy {
            ExhaustionPolicy::Fail => None,
            ExhaustionPolicy::Fatal => {
                log::error!(
                    "single-thread trie arena exhausted: {} of {} bytes used, {} requested",
                    arena.used(),
                    arena.capacity(),
                    size
                );
                panic!(
                    "trie arena exhausted ({} bytes); reserve a larger max_mem",
                    arena.capacity()
                );
            }
        }
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
    fn test_free_lists_exact_size() {
        let mut lists = FreeLists::new();
        lists.push(10, 16);
        lists.push(20, 4096);
        assert_eq!(lists.frag_size(), 16 + 4096);
        assert_eq!(lists.pop(12), None);
        assert_eq!(lists.pop(16), Some(10));
        assert_eq!(lists.pop(4096), Some(20));
        assert_eq!(lists.pop(4096), None);
        assert_eq!(lists.frag_size(), 0);
        assert_eq!(lists.frag_cnt(), 0);
    }

    #[test]
    fn test_reuse_before_bump() {
        let arena = arena(4096);
        let mut pool = FixedCapacityPool::new(ExhaustionPolicy::Fail);
        let a = pool.alloc(&arena, 32).unwrap();
        pool.free(a, 32);
        let used = arena.used();
        assert_eq!(pool.alloc(&arena, 32), Some(a));
        assert_eq!(arena.used(), used);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn test_fail_policy_returns_none() {
        let arena = arena(4096);
        let mut pool = FixedCapacityPool::new(ExhaustionPolicy::Fail);
        assert!(pool.alloc(&arena, 4096).is_some());
        assert!(pool.alloc(&arena, 4).is_none());
        assert_eq!(pool.stats().failed, 1);
    }

    #[test]
    #[should_panic(expected = "arena exhausted")]
    fn test_fatal_policy_panics() {
        let arena = arena(4096);
        let mut pool = FixedCapacityPool::new(ExhaustionPolicy::Fatal);
        pool.alloc(&arena, 8192);
    }

    #[test]
    fn test_realloc_in_place_and_moving() {
        let arena = arena(4096);
        let mut pool = FixedCapacityPool::new(ExhaustionPolicy::Fail);
        let a = pool.alloc(&arena, 8).unwrap();
        arena.store(a, 77);
        let a2 = pool.realloc(&arena, a, 8, 16).unwrap();
        assert_eq!(a, a2);

        let b = pool.alloc(&arena, 8).unwrap();
        let a3 = pool.realloc(&arena, a2, 16, 24).unwrap();
        assert_ne!(a3, a2);
        assert!(a3 > b);
        assert_eq!(arena.load(a3), 77);
        assert_eq!(pool.frag_size(), 16);
    }
}
