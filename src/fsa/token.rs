//! Reader and writer tokens of the Patricia trie
//!
//! A token is one thread's ticket into the trie. While a token is acquired, every node it
//! can reach stays allocated: superseded nodes are only reclaimed once the version queue's
//! floor has passed the version at which they were unlinked (see [`version_sync`]).
//!
//! # Lifecycle
//!
//! ```text
//! ReleaseDone --acquire--> AcquireDone --idle--> AcquireIdle --acquire--> AcquireDone
//!      ^                        |                     |
//!      +---------release--------+---------------------+
//! ```
//!
//! A [`WriterToken`] additionally owns a [`WorkerContext`]: the writer's node pool, its
//! lazy-free list and its statistics. Contexts are parked in the trie on release and handed
//! to the next writer, so free lists survive token churn.
//!
//! # Example Usage
//!
//! ```rust
//! use cspp_trie::{ConcurrencyLevel, PatriciaTrie, ReaderToken, WriterToken};
//! use cspp_trie::config::PatriciaTrieConfig;
//! # fn main() -> cspp_trie::Result<()> {
//! let trie = PatriciaTrie::new(PatriciaTrieConfig::new(4, 1 << 20, ConcurrencyLevel::OneWriteMultiRead))?;
//!
//! let mut writer = WriterToken::new(&trie);
//! writer.acquire()?;
//! assert!(trie.insert(b"key", &7u32.to_le_bytes(), &mut writer));
//! writer.release();
//!
//! let mut reader = ReaderToken::new(&trie);
//! reader.acquire();
//! assert!(trie.lookup(b"key", &mut reader));
//! assert_eq!(reader.value(), Some(7u32.to_le_bytes().to_vec()));
//! reader.release();
//! # Ok(())
//! # }
//! ```
//!
//! [`version_sync`]: crate::fsa::version_sync

use crate::error::{PatriciaError, Result};
use crate::fsa::lazy_free::LazyFreeList;
use crate::fsa::patricia_trie::PatriciaTrie;
use crate::fsa::version_sync::{TokenSlot, TokenState};
use crate::memory::NodePool;
use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

/// A read ticket: traversal rights plus the location of the last matched value.
pub struct ReaderToken<'a> {
    pub(crate) trie: &'a PatriciaTrie,
    state: TokenState,
    slot: Arc<TokenSlot>,
    link: Option<usize>,
    thread_id: ThreadId,
    pub(crate) value_pos: Option<usize>,
}

impl<'a> ReaderToken<'a> {
    /// A released token bound to `trie`.
    pub fn new(trie: &'a PatriciaTrie) -> Self {
        Self {
            trie,
            state: TokenState::ReleaseDone,
            slot: Arc::new(TokenSlot::new()),
            link: None,
            thread_id: std::thread::current().id(),
            value_pos: None,
        }
    }

    /// Enter the version queue, or resume from idle.
    ///
    /// Resuming rotates the token to the tail if it became the head while idle.
    ///
    /// # Panics
    ///
    /// Panics if the token is already acquired.
    pub fn acquire(&mut self) {
        match self.state {
            TokenState::AcquireDone => panic!("token acquired twice"),
            TokenState::ReleaseDone => {
                if self.trie.concurrency_level().uses_token_queue() {
                    self.link = Some(self.trie.queue().enqueue(&self.slot));
                }
            }
            TokenState::AcquireIdle => {
                // A token that became the head while idle would otherwise pin the floor at
                // its old version until it idles again.
                if let Some(link) = self.link {
                    self.trie.queue().maybe_rotate(link);
                }
            }
        }
        // Pairs with the fence a writer issues between unlinking a node and reading the
        // version it tags the node with.
        fence(Ordering::SeqCst);
        self.thread_id = std::thread::current().id();
        self.state = TokenState::AcquireDone;
    }

    /// Pause between operations without leaving the queue.
    ///
    /// A head token rotates to the tail so the visible floor can advance.
    pub fn idle(&mut self) {
        assert_eq!(
            self.state,
            TokenState::AcquireDone,
            "idle on a token that is not acquired"
        );
        self.value_pos = None;
        if let Some(link) = self.link {
            self.trie.queue().maybe_rotate(link);
        }
        self.state = TokenState::AcquireIdle;
    }

    /// Leave the queue.
    ///
    /// # Panics
    ///
    /// Panics if the token is already released.
    pub fn release(&mut self) {
        assert_ne!(self.state, TokenState::ReleaseDone, "token released twice");
        self.value_pos = None;
        if let Some(link) = self.link.take() {
            self.trie.queue().dequeue(link);
        }
        self.state = TokenState::ReleaseDone;
    }

    /// Rotate to the queue tail if this token is the head, even when it is alone.
    ///
    /// Only the head itself moves the head flag, so the check cannot go stale.
    pub(crate) fn rotate_if_head(&mut self) -> bool {
        match self.link {
            Some(link) if self.slot.is_head() => {
                self.trie.queue().rotate(link);
                fence(Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> TokenState {
        self.state
    }

    /// Whether the token may traverse the trie.
    #[inline]
    pub fn is_acquired(&self) -> bool {
        self.state == TokenState::AcquireDone
    }

    /// Version at which this token's view was established (0 if it never queued).
    pub fn verseq(&self) -> u64 {
        self.slot.verseq()
    }

    /// Whether this token is the oldest in the queue.
    pub fn is_head(&self) -> bool {
        self.link.is_some() && self.slot.is_head()
    }

    /// Thread that last acquired the token.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The trie this token belongs to.
    pub fn trie(&self) -> &'a PatriciaTrie {
        self.trie
    }

    /// Byte offset in the arena of the value found by the last lookup or insert.
    #[inline]
    pub fn value_pos(&self) -> Option<usize> {
        self.value_pos
    }

    /// Whether the last lookup or insert left a value location.
    #[inline]
    pub fn has_value(&self) -> bool {
        self.value_pos.is_some()
    }

    /// Copy of the value found by the last lookup or insert.
    pub fn value(&self) -> Option<Vec<u8>> {
        let pos = self.value_pos?;
        let mut buf = vec![0u8; self.trie.value_size()];
        self.trie.arena().read_bytes(pos, &mut buf);
        Some(buf)
    }

    pub(crate) fn assert_usable(&self, trie: &PatriciaTrie) {
        assert!(
            std::ptr::eq(self.trie, trie),
            "token belongs to a different trie"
        );
        assert_eq!(
            self.state,
            TokenState::AcquireDone,
            "token must be acquired before use"
        );
    }
}

impl Drop for ReaderToken<'_> {
    fn drop(&mut self) {
        if self.state != TokenState::ReleaseDone {
            self.release();
        }
    }
}

impl std::fmt::Debug for ReaderToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderToken")
            .field("state", &self.state)
            .field("verseq", &self.slot.verseq())
            .field("min_verseq", &self.slot.min_verseq())
            .field("is_head", &self.is_head())
            .field("thread_id", &self.thread_id)
            .field("value_pos", &self.value_pos)
            .finish()
    }
}

/// A write ticket: a reader token plus exclusive use of a [`WorkerContext`].
pub struct WriterToken<'a> {
    pub(crate) reader: ReaderToken<'a>,
    pub(crate) ctx: Option<WorkerContext>,
}

impl<'a> WriterToken<'a> {
    /// A released writer token bound to `trie`.
    pub fn new(trie: &'a PatriciaTrie) -> Self {
        Self {
            reader: ReaderToken::new(trie),
            ctx: None,
        }
    }

    /// Start writing.
    ///
    /// Fails with [`PatriciaError::ReadOnly`] on a read-only trie and with
    /// [`PatriciaError::ResourceBusy`] when another writer holds a single-writer trie.
    ///
    /// # Panics
    ///
    /// Panics if the token is already acquired.
    pub fn acquire(&mut self) -> Result<()> {
        if self.reader.state == TokenState::AcquireDone {
            panic!("token acquired twice");
        }
        if self.ctx.is_none() {
            let trie = self.reader.trie;
            if trie.is_readonly() {
                return Err(PatriciaError::read_only("acquire a writer token"));
            }
            trie.register_writer()?;
            self.ctx = Some(trie.checkout_context());
        }
        self.reader.acquire();
        Ok(())
    }

    /// Pause between operations; statistics are published to the trie.
    pub fn idle(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            self.reader.trie.sync_stats(ctx);
        }
        self.reader.idle();
    }

    /// Stop writing and hand the context back to the trie.
    pub fn release(&mut self) {
        self.return_context();
        self.reader.release();
    }

    fn return_context(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let trie = self.reader.trie;
            trie.checkin_context(ctx);
            trie.unregister_writer();
        }
    }
}

impl<'a> Deref for WriterToken<'a> {
    type Target = ReaderToken<'a>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl DerefMut for WriterToken<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

impl Drop for WriterToken<'_> {
    fn drop(&mut self) {
        self.return_context();
    }
}

impl std::fmt::Debug for WriterToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterToken")
            .field("reader", &self.reader)
            .field("has_context", &self.ctx.is_some())
            .finish()
    }
}

/// Structural counters a writer accumulates before publishing them to the trie.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LocalStats {
    pub n_fork: u64,
    pub n_split: u64,
    pub n_mark_final: u64,
    pub n_add_child: u64,
    pub n_words: u64,
    pub n_nodes: i64,
    pub total_zpath_len: i64,
    pub max_word_len: usize,
    pub ops: u32,
}

/// Contention diagnostics of the multi-writer protocol.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RaceStats {
    /// Insert attempts that had to start over
    pub retries: u64,
    /// Backoff steps that yielded the thread
    pub yields: u64,
    /// Backoff steps that slept
    pub sleeps: u64,
    /// The parent was locked or retired
    pub lock_parent_fail: u64,
    /// The replaced node was locked or already retired
    pub lazy_free_fail: u64,
    /// A child of the replaced node changed after it was copied
    pub children_changed: u64,
    /// The parent slot no longer pointed at the replaced node
    pub slot_cas_fail: u64,
    /// Another writer filled the same fast-node slot first
    pub fast_slot_fail: u64,
    /// Waits for a concurrent in-place finalization
    pub set_final_wait: u64,
    /// Number of inserts per retry count
    pub histogram: BTreeMap<u32, u64>,
}

impl RaceStats {
    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &RaceStats) {
        self.retries += other.retries;
        self.yields += other.yields;
        self.sleeps += other.sleeps;
        self.lock_parent_fail += other.lock_parent_fail;
        self.lazy_free_fail += other.lazy_free_fail;
        self.children_changed += other.children_changed;
        self.slot_cas_fail += other.slot_cas_fail;
        self.fast_slot_fail += other.fast_slot_fail;
        self.set_final_wait += other.set_final_wait;
        for (&retries, &count) in &other.histogram {
            *self.histogram.entry(retries).or_default() += count;
        }
    }

    /// Sum of all failure reasons.
    pub fn total_failures(&self) -> u64 {
        self.lock_parent_fail
            + self.lazy_free_fail
            + self.children_changed
            + self.slot_cas_fail
            + self.fast_slot_fail
    }

    /// Largest retry count seen by a single insert.
    pub fn max_retries(&self) -> u32 {
        self.histogram.keys().next_back().copied().unwrap_or(0)
    }
}

/// Everything a writer owns exclusively while its token is acquired.
#[derive(Debug)]
pub(crate) struct WorkerContext {
    pub pool: NodePool,
    pub lazy: LazyFreeList,
    pub stats: LocalStats,
    pub race: RaceStats,
    pub synced_frag: usize,
    pub synced_lazy_cnt: usize,
    pub synced_lazy_sum: usize,
}

impl WorkerContext {
    pub fn new(pool: NodePool) -> Self {
        Self {
            pool,
            lazy: LazyFreeList::new(),
            stats: LocalStats::default(),
            race: RaceStats::default(),
            synced_frag: 0,
            synced_lazy_cnt: 0,
            synced_lazy_sum: 0,
        }
    }
}

/// Run `f` with a freshly acquired reader token.
pub fn with_reader_token<R, F>(trie: &PatriciaTrie, f: F) -> R
where
    F: FnOnce(&mut ReaderToken<'_>) -> R,
{
    let mut token = ReaderToken::new(trie);
    token.acquire();
    let result = f(&mut token);
    token.release();
    result
}

/// Run `f` with a freshly acquired writer token.
pub fn with_writer_token<R, F>(trie: &PatriciaTrie, f: F) -> Result<R>
where
    F: FnOnce(&mut WriterToken<'_>) -> R,
{
    let mut token = WriterToken::new(trie);
    token.acquire()?;
    let result = f(&mut token);
    token.release();
    Ok(result)
}
