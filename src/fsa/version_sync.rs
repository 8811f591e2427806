//! Version-Based Synchronization for the Patricia trie
//!
//! Readers traverse nodes without locks. What keeps a node alive while a reader may still be
//! looking at it is the version queue: every live token sits in one epoch-ordered,
//! doubly-linked list and carries the version (`verseq`) at which its view was established.
//! A retired node is tagged with the version current at its retirement and reclaimed only
//! once the queue's visible floor (`min_verseq`) has moved past that tag.
//!
//! # Concurrency Levels
//!
//! | Level | Writers | Readers | Token queue | Frees |
//! |---|---|---|---|---|
//! | `NoWriteReadOnly` | 0 | any | no | never |
//! | `SingleThreadStrict` | 1 | same thread | no | immediate |
//! | `SingleThreadShared` | 1 | same thread | yes | lazy |
//! | `OneWriteMultiRead` | 1 | any | yes | lazy |
//! | `MultiWriteMultiRead` | any | any | yes | lazy |
//!
//! # Queue Protocol
//!
//! - **enqueue**: a releasing token re-enters at the tail with a fresh `verseq`; it is the
//!   head iff the queue was empty.
//! - **rotate**: a token moves from its position to the tail and takes a fresh `verseq`; the
//!   queue floor becomes the token's former `verseq`.
//! - **dequeue**: a leaving head hands the head flag to its successor and raises the floor to
//!   its own `verseq`.
//!
//! All three run under one short mutex; the traversal path never takes it.

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Graduated concurrency levels of a trie, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConcurrencyLevel {
    /// Frozen image; lookups only.
    NoWriteReadOnly = 0,

    /// One thread; superseded nodes are freed on the spot.
    SingleThreadStrict = 1,

    /// One thread; superseded nodes go through the lazy-free queue.
    SingleThreadShared = 2,

    /// One writer with concurrent lock-free readers.
    OneWriteMultiRead = 3,

    /// Concurrent writers and readers; structural changes use the CAS protocol.
    MultiWriteMultiRead = 4,
}

impl ConcurrencyLevel {
    /// Decode a numeric level.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NoWriteReadOnly),
            1 => Some(Self::SingleThreadStrict),
            2 => Some(Self::SingleThreadShared),
            3 => Some(Self::OneWriteMultiRead),
            4 => Some(Self::MultiWriteMultiRead),
            _ => None,
        }
    }

    /// Returns true if readers may run on other threads than the writer.
    #[inline]
    pub const fn allows_concurrent_readers(self) -> bool {
        matches!(self, Self::OneWriteMultiRead | Self::MultiWriteMultiRead)
    }

    /// Returns true if several writers may be active at once.
    #[inline]
    pub const fn allows_concurrent_writers(self) -> bool {
        matches!(self, Self::MultiWriteMultiRead)
    }

    /// Returns true for the two single-thread levels.
    #[inline]
    pub const fn is_single_thread(self) -> bool {
        matches!(self, Self::SingleThreadStrict | Self::SingleThreadShared)
    }

    /// Returns true if tokens take part in the version queue.
    #[inline]
    pub const fn uses_token_queue(self) -> bool {
        matches!(
            self,
            Self::SingleThreadShared | Self::OneWriteMultiRead | Self::MultiWriteMultiRead
        )
    }

    /// Returns true if superseded nodes are reclaimed lazily.
    #[inline]
    pub const fn uses_lazy_cleanup(self) -> bool {
        self.uses_token_queue()
    }

    /// Maximum number of simultaneously acquired writer tokens.
    pub const fn max_concurrent_writers(self) -> Option<usize> {
        match self {
            Self::NoWriteReadOnly => Some(0),
            Self::SingleThreadStrict | Self::SingleThreadShared | Self::OneWriteMultiRead => {
                Some(1)
            }
            Self::MultiWriteMultiRead => None,
        }
    }
}

impl Default for ConcurrencyLevel {
    fn default() -> Self {
        Self::SingleThreadStrict
    }
}

impl std::fmt::Display for ConcurrencyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoWriteReadOnly => write!(f, "NoWriteReadOnly"),
            Self::SingleThreadStrict => write!(f, "SingleThreadStrict"),
            Self::SingleThreadShared => write!(f, "SingleThreadShared"),
            Self::OneWriteMultiRead => write!(f, "OneWriteMultiRead"),
            Self::MultiWriteMultiRead => write!(f, "MultiWriteMultiRead"),
        }
    }
}

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// In the queue and allowed to traverse.
    AcquireDone,
    /// In the queue but between operations.
    AcquireIdle,
    /// Out of the queue.
    ReleaseDone,
}

/// Per-token data the queue updates on behalf of other threads.
#[derive(Debug)]
pub struct TokenSlot {
    verseq: AtomicU64,
    min_verseq: AtomicU64,
    is_head: AtomicBool,
}

impl TokenSlot {
    /// A slot that has never been queued.
    pub fn new() -> Self {
        Self {
            verseq: AtomicU64::new(0),
            min_verseq: AtomicU64::new(0),
            is_head: AtomicBool::new(false),
        }
    }

    /// Version at which the owner's view was established.
    #[inline]
    pub fn verseq(&self) -> u64 {
        self.verseq.load(Ordering::Acquire)
    }

    /// Floor observed by the owner at its last enqueue or rotation.
    #[inline]
    pub fn min_verseq(&self) -> u64 {
        self.min_verseq.load(Ordering::Acquire)
    }

    /// Whether the owner is currently the oldest token in the queue.
    #[inline]
    pub fn is_head(&self) -> bool {
        self.is_head.load(Ordering::Acquire)
    }
}

impl Default for TokenSlot {
    fn default() -> Self {
        Self::new()
    }
}

const SENTINEL: usize = 0;
const NO_LINK: usize = usize::MAX;

#[derive(Debug)]
struct Link {
    prev: usize,
    next: usize,
    slot: Option<Arc<TokenSlot>>,
}

#[derive(Debug)]
struct Links {
    nodes: Vec<Link>,
    free: Vec<usize>,
}

impl Links {
    fn new() -> Self {
        Self {
            nodes: vec![Link {
                prev: SENTINEL,
                next: SENTINEL,
                slot: None,
            }],
            free: Vec::new(),
        }
    }

    fn push_back(&mut self, idx: usize) {
        let tail = self.nodes[SENTINEL].prev;
        self.nodes[idx].prev = tail;
        self.nodes[idx].next = SENTINEL;
        self.nodes[tail].next = idx;
        self.nodes[SENTINEL].prev = idx;
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].prev = NO_LINK;
        self.nodes[idx].next = NO_LINK;
    }

    fn head(&self) -> usize {
        self.nodes[SENTINEL].next
    }

    fn slot(&self, idx: usize) -> &Arc<TokenSlot> {
        match &self.nodes[idx].slot {
            Some(slot) => slot,
            None => panic!("token queue link {} has no token", idx),
        }
    }
}

/// The epoch-ordered queue of live tokens.
#[derive(Debug)]
pub struct TokenQueue {
    links: Mutex<Links>,
    next_verseq: CachePadded<AtomicU64>,
    min_verseq: CachePadded<AtomicU64>,
    qlen: AtomicUsize,
}

impl TokenQueue {
    /// Empty queue; versions start at 1.
    pub fn new() -> Self {
        Self {
            links: Mutex::new(Links::new()),
            next_verseq: CachePadded::new(AtomicU64::new(1)),
            min_verseq: CachePadded::new(AtomicU64::new(1)),
            qlen: AtomicUsize::new(0),
        }
    }

    /// Append a token at the tail with a fresh version; returns its link index.
    pub fn enqueue(&self, slot: &Arc<TokenSlot>) -> usize {
        let mut links = self.links.lock();
        let idx = match links.free.pop() {
            Some(idx) => {
                links.nodes[idx].slot = Some(Arc::clone(slot));
                idx
            }
            None => {
                links.nodes.push(Link {
                    prev: NO_LINK,
                    next: NO_LINK,
                    slot: Some(Arc::clone(slot)),
                });
                links.nodes.len() - 1
            }
        };
        let was_empty = self.qlen.fetch_add(1, Ordering::AcqRel) == 0;
        slot.is_head.store(was_empty, Ordering::Release);
        slot.min_verseq
            .store(self.min_verseq.load(Ordering::Acquire), Ordering::Release);
        slot.verseq.store(
            self.next_verseq.fetch_add(1, Ordering::SeqCst),
            Ordering::Release,
        );
        links.push_back(idx);
        idx
    }

    /// Rotate the token at `idx` to the tail if it is the head of a queue with other tokens.
    pub fn maybe_rotate(&self, idx: usize) -> bool {
        let mut links = self.links.lock();
        let slot = Arc::clone(links.slot(idx));
        if slot.is_head() && self.qlen.load(Ordering::Acquire) > 1 {
            self.rotate_locked(&mut links, idx, &slot);
            true
        } else {
            false
        }
    }

    /// Move the token at `idx` to the tail unconditionally.
    pub fn rotate(&self, idx: usize) {
        let mut links = self.links.lock();
        let slot = Arc::clone(links.slot(idx));
        self.rotate_locked(&mut links, idx, &slot);
    }

    fn rotate_locked(&self, links: &mut Links, idx: usize, slot: &Arc<TokenSlot>) {
        let was_head = slot.is_head();
        links.unlink(idx);
        links.push_back(idx);
        if was_head {
            let old = slot.verseq();
            self.min_verseq.store(old, Ordering::SeqCst);
            slot.min_verseq.store(old, Ordering::Release);
            slot.is_head.store(false, Ordering::Release);
            let head = links.head();
            links.slot(head).is_head.store(true, Ordering::Release);
        } else {
            slot.min_verseq
                .store(self.min_verseq.load(Ordering::Acquire), Ordering::Release);
        }
        slot.verseq.store(
            self.next_verseq.fetch_add(1, Ordering::SeqCst),
            Ordering::Release,
        );
    }

    /// Remove the token at `idx`.
    pub fn dequeue(&self, idx: usize) {
        let mut links = self.links.lock();
        let slot = Arc::clone(links.slot(idx));
        if slot.is_head() {
            let next = links.nodes[idx].next;
            if next != SENTINEL {
                links.slot(next).is_head.store(true, Ordering::Release);
            }
            self.min_verseq.store(slot.verseq(), Ordering::SeqCst);
            slot.is_head.store(false, Ordering::Release);
        }
        links.unlink(idx);
        links.nodes[idx].slot = None;
        links.free.push(idx);
        self.qlen.fetch_sub(1, Ordering::AcqRel);
    }

    /// The version the next enqueue or rotation will hand out.
    #[inline]
    pub fn current_verseq(&self) -> u64 {
        self.next_verseq.load(Ordering::SeqCst)
    }

    /// The visible floor: nodes retired at a version below it are unreachable.
    #[inline]
    pub fn min_verseq(&self) -> u64 {
        self.min_verseq.load(Ordering::SeqCst)
    }

    /// Number of queued tokens.
    #[inline]
    pub fn qlen(&self) -> usize {
        self.qlen.load(Ordering::Acquire)
    }
}

impl Default for TokenQueue {
    fn default() -> Self {
        Self::new()
    }
}
