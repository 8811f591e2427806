//! Insert engine of the Patricia trie
//!
//! An insert first walks the trie and classifies where the key leaves it:
//!
//! - **AppendChild**: no edge for the next key byte; a suffix chain is hung below the node
//! - **Fork**: the key diverges inside a compressed path; the node becomes a two-way branch
//! - **Split**: the key ends inside a compressed path; a final prefix node is cut off
//! - **MarkFinal**: the key ends on a node boundary that is not yet final
//!
//! New node images are always built off to the side and published with a single child-slot
//! write, so readers see either the old subtree or the complete new one. The node that was
//! replaced is retired: freed at once in `SingleThreadStrict`, otherwise handed to the
//! writer's lazy-free list.
//!
//! # Multi-writer protocol
//!
//! With several writers the slot write becomes a small protocol over the meta-word flags:
//!
//! 1. lock the parent (`LOCK`, requires `LOCK` and `LAZY_FREE` clear)
//! 2. retire the replaced node (`LAZY_FREE`, same requirement)
//! 3. compare the replaced node's children with the copy the new image was built from
//! 4. swap the parent slot from the old id to the new one
//! 5. unlock the parent
//!
//! Any failure undoes the steps taken so far, frees the unpublished images and retries the
//! whole insert after a [`Backoff`] step. Fast nodes are never replaced: children are added
//! with a compare-and-swap on an empty slot and finalization goes through `SET_FINAL`.

use crate::error::{PatriciaError, Result};
use crate::fsa::node::{
    NodeImage, NodeInfo, BITMAP_NODE, FLAG_FINAL, FLAG_LAZY_FREE, FLAG_LOCK, FLAG_SET_FINAL,
    MAX_ZPATH, NIL_STATE, ROOT, TRANSIENT_FLAGS,
};
use crate::fsa::patricia_trie::PatriciaTrie;
use crate::fsa::token::{RaceStats, WorkerContext, WriterToken};
use crate::fsa::version_sync::ConcurrencyLevel;
use rand::Rng;
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InsertOutcome {
    /// The key was added.
    Inserted,
    /// The key was already present; its value is unchanged.
    AlreadyExists,
    /// The arena could not hold the new nodes; the trie is unchanged.
    AllocFailed,
}

impl InsertOutcome {
    /// Whether the key was added.
    #[inline]
    pub fn is_inserted(self) -> bool {
        self == Self::Inserted
    }
}

/// Where a key leaves the trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    AppendChild { pos: usize, kpos: usize },
    Fork { zidx: usize, kpos: usize },
    Split { zidx: usize },
    MarkFinal,
    Exists,
}

#[derive(Debug, Clone, Copy)]
struct Found {
    parent: u32,
    slot: u32,
    curr: NodeInfo,
    decision: Decision,
}

enum Attempt {
    Done(InsertOutcome, Option<usize>),
    Retry,
}

struct Chain {
    head: u32,
    value_pos: usize,
    nodes: usize,
    zpath_len: usize,
}

/// Retry pacing of the multi-writer protocol: spin, then yield, then sleep a random while.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    retries: u32,
}

/// Inserts a multi-writer batches before publishing its counters.
const STATS_SYNC_INTERVAL: u32 = 64;

const SPIN_LIMIT: u32 = 8;
const YIELD_LIMIT: u32 = 64;

impl Backoff {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self, race: &mut RaceStats) {
        self.retries += 1;
        race.retries += 1;
        if self.retries < SPIN_LIMIT {
            for _ in 0..(1u32 << self.retries) {
                std::hint::spin_loop();
            }
        } else if self.retries < YIELD_LIMIT {
            race.yields += 1;
            std::thread::yield_now();
        } else {
            if self.retries == YIELD_LIMIT {
                log::debug!("insert retried {} times, backing off with sleeps", self.retries);
            }
            race.sleeps += 1;
            let micros = rand::thread_rng().gen_range(1..=self.retries / 16 + 1);
            std::thread::sleep(Duration::from_micros(micros as u64));
        }
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries
    }

    pub(crate) fn finish(self, race: &mut RaceStats) {
        *race.histogram.entry(self.retries).or_default() += 1;
    }
}

impl PatriciaTrie {
    /// Insert `key` with `value`.
    ///
    /// Returns `true` if the key was added or if the arena was exhausted (the token then
    /// carries no value location), `false` if the key already existed. The token's value
    /// location points at the stored value in both of the other cases.
    ///
    /// # Panics
    ///
    /// Panics on a read-only trie, on a value of the wrong size, or if the token is not
    /// acquired on this trie.
    pub fn insert(&self, key: &[u8], value: &[u8], token: &mut WriterToken<'_>) -> bool {
        match self.try_insert(key, value, token) {
            Ok(InsertOutcome::AlreadyExists) => false,
            Ok(_) => true,
            Err(e) => panic!("insert rejected: {}", e),
        }
    }

    /// Insert `key` with `value`, reporting the outcome.
    pub fn try_insert(
        &self,
        key: &[u8],
        value: &[u8],
        token: &mut WriterToken<'_>,
    ) -> Result<InsertOutcome> {
        if self.is_readonly() {
            return Err(PatriciaError::read_only("insert"));
        }
        if value.len() != self.value_size() {
            return Err(PatriciaError::invalid_data(format!(
                "value is {} bytes, trie stores {}",
                value.len(),
                self.value_size()
            )));
        }
        token.reader.assert_usable(self);
        token.reader.value_pos = None;
        let Some(ctx) = token.ctx.as_mut() else {
            panic!("writer token has no worker context");
        };
        self.reclaim(ctx);

        let multi = self.writable_level().allows_concurrent_writers();
        let mut backoff = Backoff::new();
        let (outcome, value_pos) = loop {
            match self.attempt(key, value, ctx, multi) {
                Attempt::Done(outcome, pos) => break (outcome, pos),
                Attempt::Retry => backoff.snooze(&mut ctx.race),
            }
        };
        if multi {
            backoff.finish(&mut ctx.race);
        }
        token.reader.value_pos = value_pos;
        if outcome == InsertOutcome::Inserted {
            ctx.stats.n_words += 1;
            ctx.stats.max_word_len = ctx.stats.max_word_len.max(key.len());
        }

        ctx.stats.ops += 1;

        if self.writable_level().uses_lazy_cleanup()
            && ctx.lazy.mem_size() > self.config().lazy_free_rotate_bytes
            && token.reader.rotate_if_head()
        {
            log::trace!(
                "head writer rotated with {} bytes pending reclamation",
                ctx.lazy.mem_size()
            );
            self.sync_stats(ctx);
        } else if !multi || ctx.stats.ops >= STATS_SYNC_INTERVAL {
            self.sync_stats(ctx);
        }
        Ok(outcome)
    }

    fn reclaim(&self, ctx: &mut WorkerContext) {
        if !self.writable_level().uses_lazy_cleanup() || ctx.lazy.is_empty() {
            return;
        }
        let floor = self.queue().min_verseq();
        let WorkerContext { lazy, pool, .. } = ctx;
        lazy.reclaim_some(floor, self.config().reclaim_batch, |item| {
            pool.free(item.node, item.size as usize)
        });
    }

    fn search(&self, key: &[u8]) -> Found {
        let arena = self.arena();
        let (mut parent, mut slot, mut curr) = (NIL_STATE, NIL_STATE, ROOT);
        let mut pos = 0;
        loop {
            let info = NodeInfo::decode(arena, curr);
            let found = |decision| Found {
                parent,
                slot,
                curr: info,
                decision,
            };
            if info.zlen > 0 {
                let kkn = key.len() - pos;
                for zidx in 0..kkn.min(info.zlen) {
                    if key[pos + zidx] != info.zpath_byte(arena, zidx) {
                        return found(Decision::Fork {
                            zidx,
                            kpos: pos + zidx,
                        });
                    }
                }
                if kkn < info.zlen {
                    return found(Decision::Split { zidx: kkn });
                }
                pos += info.zlen;
            }
            if pos == key.len() {
                return found(if info.is_final() {
                    Decision::Exists
                } else {
                    Decision::MarkFinal
                });
            }
            match info.find_child(arena, key[pos]) {
                Ok(s) => {
                    parent = curr;
                    slot = s;
                    curr = arena.load_acquire(s);
                    pos += 1;
                }
                Err(insert_at) => {
                    return found(Decision::AppendChild {
                        pos: insert_at,
                        kpos: pos,
                    })
                }
            }
        }
    }

    fn attempt(&self, key: &[u8], value: &[u8], ctx: &mut WorkerContext, multi: bool) -> Attempt {
        let found = self.search(key);
        let curr = found.curr;
        match found.decision {
            Decision::Exists => Attempt::Done(InsertOutcome::AlreadyExists, Some(curr.value_offset())),
            Decision::MarkFinal if curr.is_fast() => self.mark_final_fast(curr, value, ctx, multi),
            Decision::MarkFinal if self.writable_level() == ConcurrencyLevel::SingleThreadStrict => {
                self.mark_final_in_place(&found, value, ctx)
            }
            Decision::MarkFinal => self.mark_final_copy(&found, value, ctx, multi),
            Decision::AppendChild { kpos, .. } if curr.is_fast() => {
                self.append_fast_child(curr, key, kpos, value, ctx, multi)
            }
            Decision::AppendChild { pos, kpos } => self.append_child(&found, key, pos, kpos, value, ctx, multi),
            Decision::Fork { zidx, kpos } => self.fork(&found, key, zidx, kpos, value, ctx, multi),
            Decision::Split { zidx } => self.split(&found, zidx, value, ctx, multi),
        }
    }

    fn append_fast_child(
        &self,
        curr: NodeInfo,
        key: &[u8],
        kpos: usize,
        value: &[u8],
        ctx: &mut WorkerContext,
        multi: bool,
    ) -> Attempt {
        let arena = self.arena();
        let mut allocated = Vec::new();
        let Some(chain) = self.build_chain(&key[kpos + 1..], value, ctx, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let slot = curr.child_slot(key[kpos] as usize);
        if multi {
            if arena.compare_exchange(slot, NIL_STATE, chain.head).is_err() {
                ctx.race.fast_slot_fail += 1;
                self.rollback(ctx, &allocated);
                return Attempt::Retry;
            }
        } else {
            arena.store_release(slot, chain.head);
        }
        arena.fetch_add(curr.id + 1, 1);
        ctx.stats.n_add_child += 1;
        ctx.stats.n_nodes += chain.nodes as i64;
        ctx.stats.total_zpath_len += chain.zpath_len as i64;
        Attempt::Done(InsertOutcome::Inserted, Some(chain.value_pos))
    }

    #[allow(clippy::too_many_arguments)]
    fn append_child(
        &self,
        found: &Found,
        key: &[u8],
        pos: usize,
        kpos: usize,
        value: &[u8],
        ctx: &mut WorkerContext,
        multi: bool,
    ) -> Attempt {
        let arena = self.arena();
        let valsize = self.value_size();
        let curr = found.curr;
        let backup = curr.children(arena);
        let zpath = curr.zpath(arena);
        let old_value = self.final_value(&curr);

        let mut allocated = Vec::new();
        let Some(chain) = self.build_chain(&key[kpos + 1..], value, ctx, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let mut children = backup.clone();
        children.insert(pos, (key[kpos], chain.head));
        let promote = curr.cnt_type == BITMAP_NODE
            && curr.zlen == 0
            && backup.len() >= self.config().max_dyna_children;
        let image = if promote {
            NodeImage::fast(&children, &zpath, curr.is_final(), &old_value)
        } else {
            NodeImage::new(&children, &zpath, curr.is_final(), &old_value)
        };
        let Some(new) = self.alloc_node(ctx, &image, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        if !self.replace(found, &backup, new, ctx, multi) {
            self.rollback(ctx, &allocated);
            return Attempt::Retry;
        }
        if promote {
            log::trace!("node {} promoted to a fast node at {}", curr.id, new);
        }
        debug_assert_eq!(image.size(valsize) % 4, 0);
        ctx.stats.n_add_child += 1;
        ctx.stats.n_nodes += chain.nodes as i64;
        ctx.stats.total_zpath_len += chain.zpath_len as i64;
        Attempt::Done(InsertOutcome::Inserted, Some(chain.value_pos))
    }

    #[allow(clippy::too_many_arguments)]
    fn fork(
        &self,
        found: &Found,
        key: &[u8],
        zidx: usize,
        kpos: usize,
        value: &[u8],
        ctx: &mut WorkerContext,
        multi: bool,
    ) -> Attempt {
        let arena = self.arena();
        let curr = found.curr;
        let backup = curr.children(arena);
        let zpath = curr.zpath(arena);
        let old_value = self.final_value(&curr);

        let mut allocated = Vec::new();
        let suffix = NodeImage::new(&backup, &zpath[zidx + 1..], curr.is_final(), &old_value);
        let Some(old_suffix) = self.alloc_node(ctx, &suffix, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let Some(chain) = self.build_chain(&key[kpos + 1..], value, ctx, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let mut pair = [(zpath[zidx], old_suffix), (key[kpos], chain.head)];
        pair.sort_unstable_by_key(|p| p.0);
        let branch = NodeImage::new(&pair, &zpath[..zidx], false, &[]);
        let Some(new) = self.alloc_node(ctx, &branch, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        if !self.replace(found, &backup, new, ctx, multi) {
            self.rollback(ctx, &allocated);
            return Attempt::Retry;
        }
        ctx.stats.n_fork += 1;
        ctx.stats.n_nodes += 1 + chain.nodes as i64;
        ctx.stats.total_zpath_len += chain.zpath_len as i64 - 1;
        Attempt::Done(InsertOutcome::Inserted, Some(chain.value_pos))
    }

    fn split(&self, found: &Found, zidx: usize, value: &[u8], ctx: &mut WorkerContext, multi: bool) -> Attempt {
        let arena = self.arena();
        let curr = found.curr;
        let backup = curr.children(arena);
        let zpath = curr.zpath(arena);
        let old_value = self.final_value(&curr);

        let mut allocated = Vec::new();
        let suffix = NodeImage::new(&backup, &zpath[zidx + 1..], curr.is_final(), &old_value);
        let Some(suffix_id) = self.alloc_node(ctx, &suffix, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let pair = [(zpath[zidx], suffix_id)];
        let prefix = NodeImage::new(&pair, &zpath[..zidx], true, value);
        let Some(new) = self.alloc_node(ctx, &prefix, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let value_pos = NodeInfo::decode(arena, new).value_offset();
        if !self.replace(found, &backup, new, ctx, multi) {
            self.rollback(ctx, &allocated);
            return Attempt::Retry;
        }
        ctx.stats.n_split += 1;
        ctx.stats.n_nodes += 1;
        ctx.stats.total_zpath_len -= 1;
        Attempt::Done(InsertOutcome::Inserted, Some(value_pos))
    }

    fn mark_final_copy(&self, found: &Found, value: &[u8], ctx: &mut WorkerContext, multi: bool) -> Attempt {
        let arena = self.arena();
        let curr = found.curr;
        let backup = curr.children(arena);
        let zpath = curr.zpath(arena);

        let mut allocated = Vec::new();
        let image = NodeImage::new(&backup, &zpath, true, value);
        let Some(new) = self.alloc_node(ctx, &image, &mut allocated) else {
            return self.alloc_failed(ctx, &allocated);
        };
        let value_pos = NodeInfo::decode(arena, new).value_offset();
        if !self.replace(found, &backup, new, ctx, multi) {
            self.rollback(ctx, &allocated);
            return Attempt::Retry;
        }
        ctx.stats.n_mark_final += 1;
        Attempt::Done(InsertOutcome::Inserted, Some(value_pos))
    }

    /// Strict single-thread finalization: grow the node in place when it ends the arena.
    fn mark_final_in_place(&self, found: &Found, value: &[u8], ctx: &mut WorkerContext) -> Attempt {
        let arena = self.arena();
        let valsize = self.value_size();
        let curr = found.curr;
        let old_size = curr.size(valsize);
        let Some(id) = ctx.pool.realloc(arena, curr.id, old_size, old_size + valsize) else {
            return Attempt::Done(InsertOutcome::AllocFailed, None);
        };
        let value_pos = 4 * id as usize + old_size;
        arena.write_bytes(value_pos, value);
        let meta = arena.load(id) & !TRANSIENT_FLAGS;
        arena.store_release(id, meta | FLAG_FINAL);
        if id != curr.id {
            arena.store_release(found.slot, id);
        }
        ctx.stats.n_mark_final += 1;
        Attempt::Done(InsertOutcome::Inserted, Some(value_pos))
    }

    /// Finalize a fast node in place; value space is always present.
    fn mark_final_fast(&self, curr: NodeInfo, value: &[u8], ctx: &mut WorkerContext, multi: bool) -> Attempt {
        let arena = self.arena();
        let value_pos = curr.value_offset();
        if multi {
            let prev = arena.fetch_or(curr.id, FLAG_SET_FINAL);
            if prev & FLAG_SET_FINAL != 0 {
                ctx.race.set_final_wait += 1;
                while arena.load_acquire(curr.id) & FLAG_FINAL == 0 {
                    std::hint::spin_loop();
                }
                return Attempt::Done(InsertOutcome::AlreadyExists, Some(value_pos));
            }
        }
        arena.write_bytes(value_pos, value);
        arena.fetch_or(curr.id, FLAG_FINAL);
        ctx.stats.n_mark_final += 1;
        Attempt::Done(InsertOutcome::Inserted, Some(value_pos))
    }

    /// Build the nodes that store `rest` below an edge: links of `MAX_ZPATH` path bytes
    /// and one label each, then a final node with the remainder and the value.
    fn build_chain(
        &self,
        rest: &[u8],
        value: &[u8],
        ctx: &mut WorkerContext,
        allocated: &mut Vec<(u32, usize)>,
    ) -> Option<Chain> {
        let mut links = Vec::new();
        let mut tail = rest;
        while tail.len() > MAX_ZPATH {
            links.push((&tail[..MAX_ZPATH], tail[MAX_ZPATH]));
            tail = &tail[MAX_ZPATH + 1..];
        }
        let leaf = NodeImage::new(&[], tail, true, value);
        let mut head = self.alloc_node(ctx, &leaf, allocated)?;
        let value_pos = NodeInfo::decode(self.arena(), head).value_offset();
        for &(zpath, label) in links.iter().rev() {
            let pair = [(label, head)];
            head = self.alloc_node(ctx, &NodeImage::new(&pair, zpath, false, &[]), allocated)?;
        }
        Some(Chain {
            head,
            value_pos,
            nodes: links.len() + 1,
            zpath_len: rest.len() - links.len(),
        })
    }

    fn alloc_node(
        &self,
        ctx: &mut WorkerContext,
        image: &NodeImage<'_>,
        allocated: &mut Vec<(u32, usize)>,
    ) -> Option<u32> {
        let size = image.size(self.value_size());
        let id = ctx.pool.alloc(self.arena(), size)?;
        image.write(self.arena(), id, self.value_size());
        allocated.push((id, size));
        Some(id)
    }

    fn rollback(&self, ctx: &mut WorkerContext, allocated: &[(u32, usize)]) {
        for &(id, size) in allocated.iter().rev() {
            ctx.pool.free(id, size);
        }
    }

    fn alloc_failed(&self, ctx: &mut WorkerContext, allocated: &[(u32, usize)]) -> Attempt {
        self.rollback(ctx, allocated);
        log::debug!(
            "insert failed: arena exhausted at {} of {} bytes",
            self.arena().used(),
            self.arena().capacity()
        );
        Attempt::Done(InsertOutcome::AllocFailed, None)
    }

    fn final_value(&self, curr: &NodeInfo) -> Vec<u8> {
        if curr.is_final() {
            curr.value(self.arena(), self.value_size())
        } else {
            Vec::new()
        }
    }

    /// Publish `new` in place of `found.curr` and retire the old node.
    fn replace(&self, found: &Found, backup: &[(u8, u32)], new: u32, ctx: &mut WorkerContext, multi: bool) -> bool {
        if multi {
            if !self.cas_publish(found, backup, new, &mut ctx.race) {
                return false;
            }
        } else {
            self.arena().store_release(found.slot, new);
        }
        self.retire(ctx, &found.curr);
        true
    }

    fn cas_publish(&self, found: &Found, backup: &[(u8, u32)], new: u32, race: &mut RaceStats) -> bool {
        let arena = self.arena();
        let busy = FLAG_LOCK | FLAG_LAZY_FREE;

        let parent_meta = arena.load_acquire(found.parent);
        if parent_meta & busy != 0
            || arena
                .compare_exchange(found.parent, parent_meta, parent_meta | FLAG_LOCK)
                .is_err()
        {
            race.lock_parent_fail += 1;
            return false;
        }
        let unlock_parent = || {
            arena.fetch_and(found.parent, !FLAG_LOCK);
        };

        let curr_id = found.curr.id;
        let curr_meta = arena.load_acquire(curr_id);
        if curr_meta & busy != 0
            || arena
                .compare_exchange(curr_id, curr_meta, curr_meta | FLAG_LAZY_FREE)
                .is_err()
        {
            unlock_parent();
            race.lazy_free_fail += 1;
            return false;
        }
        // The node was never unlinked, so taking LAZY_FREE back is safe.
        let unretire = || {
            arena.fetch_and(curr_id, !FLAG_LAZY_FREE);
        };

        if found.curr.children(arena) != backup {
            unretire();
            unlock_parent();
            race.children_changed += 1;
            return false;
        }

        if arena.compare_exchange(found.slot, curr_id, new).is_err() {
            unretire();
            unlock_parent();
            race.slot_cas_fail += 1;
            return false;
        }
        unlock_parent();
        true
    }

    fn retire(&self, ctx: &mut WorkerContext, curr: &NodeInfo) {
        let size = curr.size(self.value_size());
        if self.writable_level() == ConcurrencyLevel::SingleThreadStrict {
            ctx.pool.free(curr.id, size);
        } else {
            // Readers that enter after this point cannot reach the node.
            fence(Ordering::SeqCst);
            let age = self.queue().current_verseq();
            ctx.lazy.defer_free(curr.id, size, age);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatriciaTrieConfig;
    use crate::fsa::node::{FAST_NODE, SORTED_NODE};
    use crate::ReaderToken;

    fn trie(valsize: usize, max_mem: i64, level: ConcurrencyLevel) -> PatriciaTrie {
        PatriciaTrie::new(PatriciaTrieConfig::new(valsize, max_mem, level)).unwrap()
    }

    fn val(n: u32) -> [u8; 4] {
        n.to_le_bytes()
    }

    #[test]
    fn test_fork_and_split_decisions() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::SingleThreadStrict);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(trie.insert(b"apple", &val(1), &mut w));
        assert_eq!(trie.search(b"apply").decision, Decision::Fork { zidx: 3, kpos: 4 });
        assert_eq!(trie.search(b"app").decision, Decision::Split { zidx: 2 });
        assert_eq!(trie.search(b"apple").decision, Decision::Exists);
        assert_eq!(trie.search(b"b").decision, Decision::AppendChild { pos: b'b' as usize, kpos: 0 });
        assert_eq!(trie.search(b"").decision, Decision::MarkFinal);
        assert_eq!(trie.search(b"applesauce").decision, Decision::AppendChild { pos: 0, kpos: 5 });
    }

    #[test]
    fn test_fork_builds_branch() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::SingleThreadStrict);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(trie.insert(b"apple", &val(1), &mut w));
        assert!(trie.insert(b"apply", &val(2), &mut w));
        let stats = trie.stats();
        assert_eq!(stats.n_fork, 1);
        assert_eq!(stats.n_words, 2);
        // root -> "ppl" branch -> {"" final e, "" final y}
        assert_eq!(stats.n_nodes, 4);
        assert_eq!(stats.total_zpath_len, 3);

        let mut r = ReaderToken::new(&trie);
        r.acquire();
        assert!(trie.lookup(b"apple", &mut r));
        assert_eq!(r.value(), Some(val(1).to_vec()));
        assert!(trie.lookup(b"apply", &mut r));
        assert_eq!(r.value(), Some(val(2).to_vec()));
        assert!(!trie.lookup(b"appl", &mut r));
        assert!(!r.has_value());
    }

    #[test]
    fn test_split_builds_prefix() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::SingleThreadShared);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(trie.insert(b"hello", &val(1), &mut w));
        assert!(trie.insert(b"he", &val(2), &mut w));
        assert_eq!(trie.stats().n_split, 1);
        assert!(trie.contains(b"he"));
        assert!(trie.contains(b"hello"));
        assert!(!trie.contains(b"hel"));
        assert!(!trie.contains(b"h"));
    }

    #[test]
    fn test_duplicate_keeps_first_value() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::OneWriteMultiRead);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert_eq!(trie.try_insert(b"k", &val(1), &mut w).unwrap(), InsertOutcome::Inserted);
        assert_eq!(trie.try_insert(b"k", &val(2), &mut w).unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(w.value(), Some(val(1).to_vec()));
        assert_eq!(trie.num_words(), 1);
    }

    #[test]
    fn test_empty_key_marks_root_final() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::MultiWriteMultiRead);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(trie.insert(b"", &val(9), &mut w));
        assert!(!trie.insert(b"", &val(10), &mut w));
        assert_eq!(trie.get(b""), Some(val(9).to_vec()));
    }

    #[test]
    fn test_long_key_uses_link_chain() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::SingleThreadStrict);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        let key: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        assert!(trie.insert(&key, &val(5), &mut w));
        // first byte is a root edge, 699 bytes remain: two links and a leaf
        assert_eq!(trie.stats().n_nodes, 1 + 3);
        assert_eq!(trie.get(&key), Some(val(5).to_vec()));
        assert!(!trie.contains(&key[..500]));

        let mut other = key.clone();
        other[400] ^= 0xff;
        assert!(trie.insert(&other, &val(6), &mut w));
        assert_eq!(trie.get(&other), Some(val(6).to_vec()));
        assert_eq!(trie.get(&key), Some(val(5).to_vec()));
    }

    #[test]
    fn test_shape_growth_and_promotion() {
        let config = PatriciaTrieConfig::builder()
            .value_size(4)
            .max_mem(4 << 20)
            .concurrency_level(ConcurrencyLevel::SingleThreadShared)
            .max_dyna_children(20)
            .build()
            .unwrap();
        let trie = PatriciaTrie::new(config).unwrap();
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        trie.insert(b"x", &val(0), &mut w);
        let shape_of_x = |trie: &PatriciaTrie| {
            let arena = trie.arena();
            let root = NodeInfo::decode(arena, ROOT);
            let slot = root.find_child(arena, b'x').unwrap();
            NodeInfo::decode(arena, arena.load_acquire(slot)).cnt_type
        };
        for (i, ch) in (0u8..=255).enumerate() {
            trie.insert(&[b'x', ch], &val(i as u32), &mut w);
            let n = i + 1;
            let shape = shape_of_x(&trie);
            match n {
                1..=6 => assert_eq!(shape as usize, n),
                7..=16 => assert_eq!(shape, SORTED_NODE),
                17..=20 => assert_eq!(shape, BITMAP_NODE),
                _ => assert_eq!(shape, FAST_NODE),
            }
        }
        for ch in 0u8..=255 {
            assert_eq!(trie.get(&[b'x', ch]), Some(val(ch as u32).to_vec()));
        }
        assert_eq!(trie.get(b"x"), Some(val(0).to_vec()));
    }

    #[test]
    fn test_strict_mark_final_extends_in_place() {
        let trie = trie(8, 1 << 20, ConcurrencyLevel::SingleThreadStrict);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        trie.insert(b"abcdef", &[1; 8], &mut w);
        trie.insert(b"abcxyz", &[2; 8], &mut w);
        // the branch node "bc" is the last allocation
        let used = trie.arena().used();
        assert!(trie.insert(b"abc", &[3; 8], &mut w));
        assert_eq!(trie.arena().used(), used + 8);
        assert_eq!(trie.get(b"abc"), Some(vec![3; 8]));
        assert_eq!(trie.get(b"abcdef"), Some(vec![1; 8]));
        assert_eq!(trie.stats().n_mark_final, 1);
    }

    #[test]
    fn test_alloc_failed_leaves_trie_unchanged() {
        let trie = trie(4, 512 * 1024, ConcurrencyLevel::OneWriteMultiRead);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        let mut inserted = Vec::new();
        let mut failed = false;
        for i in 0..100_000u32 {
            let key = format!("key-{:08}-{}", i, "x".repeat(40));
            match trie.try_insert(key.as_bytes(), &val(i), &mut w).unwrap() {
                InsertOutcome::Inserted => inserted.push(key),
                InsertOutcome::AllocFailed => {
                    assert!(!w.has_value());
                    assert!(!trie.contains(key.as_bytes()));
                    failed = true;
                    break;
                }
                InsertOutcome::AlreadyExists => unreachable!(),
            }
        }
        assert!(failed);
        assert_eq!(trie.num_words(), inserted.len());
        for key in inserted.iter().step_by(97) {
            assert!(trie.contains(key.as_bytes()));
        }
    }

    #[test]
    fn test_wrong_value_size_is_rejected() {
        let trie = trie(4, 1 << 20, ConcurrencyLevel::SingleThreadStrict);
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        let err = trie.try_insert(b"a", &[1, 2], &mut w).unwrap_err();
        assert!(matches!(err, PatriciaError::InvalidData { .. }));
    }

    #[test]
    fn test_lazy_backlog_stays_bounded() {
        let config = PatriciaTrieConfig::builder()
            .value_size(4)
            .max_mem(4 << 20)
            .concurrency_level(ConcurrencyLevel::OneWriteMultiRead)
            .lazy_free_rotate_bytes(256)
            .build()
            .unwrap();
        let trie = PatriciaTrie::new(config).unwrap();
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        for i in 0..2000u32 {
            trie.insert(format!("k{}", i).as_bytes(), &val(i), &mut w);
        }
        let mem = trie.mem_stat();
        assert!(mem.lazy_free_cnt < 200, "backlog {}", mem.lazy_free_cnt);
        assert!(trie.min_verseq() > 1);
        w.release();
        assert_eq!(trie.num_words(), 2000);
    }

    #[test]
    fn test_backoff_escalates() {
        let mut race = RaceStats::default();
        let mut backoff = Backoff::new();
        for _ in 0..SPIN_LIMIT + 2 {
            backoff.snooze(&mut race);
        }
        assert_eq!(backoff.retries(), SPIN_LIMIT + 2);
        assert_eq!(race.retries, (SPIN_LIMIT + 2) as u64);
        assert_eq!(race.yields, 3);
        backoff.finish(&mut race);
        assert_eq!(race.histogram[&(SPIN_LIMIT + 2)], 1);
    }
}
