//! Deferred reclamation of retired trie nodes
//!
//! A writer that replaces a node cannot free it while a reader might still be walking it.
//! Instead the node goes to the writer's own [`LazyFreeList`], tagged with the version that
//! was current when it was unlinked. The list is ordered by that tag because tags only grow,
//! so reclamation pops from the front until it meets an entry that is still visible.
//!
//! Reclamation runs on the insert path in small batches; there is no background thread.

use std::collections::VecDeque;

/// Consecutive fruitless reclaim attempts between two warnings.
pub const REVOKE_FAIL_WARN_INTERVAL: u64 = 8192;

/// One retired node span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyFreeItem {
    /// Version at which the node was unlinked.
    pub age: u64,
    /// Node id.
    pub node: u32,
    /// Span size in bytes.
    pub size: u32,
}

impl LazyFreeItem {
    /// Creates a new lazy free item.
    pub fn new(age: u64, node: u32, size: u32) -> Self {
        Self { age, node, size }
    }

    /// Returns true if no live token can still reach this node.
    #[inline]
    pub fn can_free(&self, min_verseq: u64) -> bool {
        self.age < min_verseq
    }
}

/// Statistics of one lazy-free list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LazyFreeStats {
    /// Items ever deferred.
    pub items_added: u64,
    /// Items physically freed.
    pub items_reclaimed: u64,
    /// Reclaim attempts that freed nothing while items were pending.
    pub revoke_fail_cnt: u64,
}

/// Per-writer queue of retired nodes awaiting reclamation.
#[derive(Debug, Default)]
pub struct LazyFreeList {
    items: VecDeque<LazyFreeItem>,
    mem_size: usize,
    fail_streak: u64,
    stats: LazyFreeStats,
}

impl LazyFreeList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `node` of `size` bytes, retired at version `age`.
    pub fn defer_free(&mut self, node: u32, size: usize, age: u64) {
        debug_assert!(self.items.back().map_or(true, |last| last.age <= age));
        self.items.push_back(LazyFreeItem::new(age, node, size as u32));
        self.mem_size += size;
        self.stats.items_added += 1;
    }

    /// Free up to `batch` items whose age is below `min_verseq` through `free_fn`.
    ///
    /// Returns the number of items freed.
    pub fn reclaim_some<F>(&mut self, min_verseq: u64, batch: usize, mut free_fn: F) -> usize
    where
        F: FnMut(LazyFreeItem),
    {
        let mut freed = 0;
        while freed < batch {
            match self.items.front() {
                Some(front) if front.can_free(min_verseq) => {}
                _ => break,
            }
            let Some(item) = self.items.pop_front() else {
                break;
            };
            self.mem_size -= item.size as usize;
            free_fn(item);
            freed += 1;
        }
        self.stats.items_reclaimed += freed as u64;
        if freed == 0 && !self.items.is_empty() {
            self.stats.revoke_fail_cnt += 1;
            self.fail_streak += 1;
            if self.fail_streak % REVOKE_FAIL_WARN_INTERVAL == 0 {
                log::warn!(
                    "lazy free stuck for {} attempts: {} items ({} bytes) pending, oldest age {}, floor {}",
                    self.fail_streak,
                    self.items.len(),
                    self.mem_size,
                    self.items.front().map_or(0, |i| i.age),
                    min_verseq
                );
            }
        } else {
            self.fail_streak = 0;
        }
        freed
    }

    /// Free every item regardless of age; only valid when no reader can exist.
    pub fn drain_all<F>(&mut self, mut free_fn: F) -> usize
    where
        F: FnMut(LazyFreeItem),
    {
        let n = self.items.len();
        for item in self.items.drain(..) {
            free_fn(item);
        }
        self.mem_size = 0;
        self.stats.items_reclaimed += n as u64;
        n
    }

    /// Number of pending items.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing is pending.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes held by pending items.
    #[inline]
    pub fn mem_size(&self) -> usize {
        self.mem_size
    }

    /// Counters of this list.
    pub fn stats(&self) -> LazyFreeStats {
        self.stats
    }
}
