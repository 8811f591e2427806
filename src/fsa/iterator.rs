//! Ordered iteration over a Patricia trie
//!
//! [`PatriciaIter`] keeps the path from the root to its current node as a stack of frames
//! together with the key bytes spelled by that path. Moving to a neighbour only unwinds the
//! frames that change, so `incr`/`decr` never restart from the root.
//!
//! Keys are visited in lexicographic byte order: a final node's own key precedes every key
//! below it, and children follow in label order.
//!
//! The iterator owns a reader token that stays acquired while it is positioned, which keeps
//! the reclamation floor at or below the token's version. A long-lived iterator should call
//! [`PatriciaIter::idle`] between scans; the next seek resumes the token. Under
//! `SingleThreadStrict` superseded nodes are freed at once, so an iterator must not be used
//! across inserts at that level.
//!
//! # Example Usage
//!
//! ```rust
//! use cspp_trie::{ConcurrencyLevel, PatriciaTrie, WriterToken};
//! use cspp_trie::config::PatriciaTrieConfig;
//! # fn main() -> cspp_trie::Result<()> {
//! let trie = PatriciaTrie::new(PatriciaTrieConfig::new(0, 1 << 20, ConcurrencyLevel::SingleThreadShared))?;
//! let mut w = WriterToken::new(&trie);
//! w.acquire()?;
//! for key in ["b", "a", "ab", "c"] {
//!     trie.insert(key.as_bytes(), &[], &mut w);
//! }
//! w.release();
//!
//! let mut it = trie.new_iter();
//! assert!(it.seek_lower_bound(b"aa"));
//! assert_eq!(it.key(), b"ab");
//! assert!(it.incr());
//! assert_eq!(it.key(), b"b");
//! assert!(it.seek_max_prefix(b"abc"));
//! assert_eq!(it.key(), b"ab");
//! # Ok(())
//! # }
//! ```

use crate::fsa::node::{NodeInfo, ROOT};
use crate::fsa::patricia_trie::PatriciaTrie;
use crate::fsa::token::ReaderToken;
use crate::fsa::version_sync::TokenState;

/// `nth` of a frame positioned on the node itself.
const AT_NODE: usize = usize::MAX;

#[derive(Debug, Clone, Copy)]
struct Frame {
    node: u32,
    /// Child taken below this node, or `AT_NODE`.
    nth: usize,
    /// Key length before this node's compressed path.
    key_len: usize,
}

/// A bidirectional cursor over the keys of a trie.
pub struct PatriciaIter<'a> {
    trie: &'a PatriciaTrie,
    token: ReaderToken<'a>,
    stack: Vec<Frame>,
    key: Vec<u8>,
    max_prefix_len: usize,
}

impl<'a> PatriciaIter<'a> {
    /// An unpositioned iterator.
    pub fn new(trie: &'a PatriciaTrie) -> Self {
        let mut token = ReaderToken::new(trie);
        token.acquire();
        Self {
            trie,
            token,
            stack: Vec::with_capacity(16),
            key: Vec::with_capacity(64),
            max_prefix_len: 0,
        }
    }

    /// Whether the iterator is positioned on a key.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Current key (empty when not positioned).
    #[inline]
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Value of the current key.
    pub fn value(&self) -> Option<Vec<u8>> {
        self.token.value()
    }

    /// Number of probe bytes matched by the last `seek_max_prefix`.
    pub fn max_prefix_len(&self) -> usize {
        self.max_prefix_len
    }

    /// Position on the smallest key.
    pub fn seek_begin(&mut self) -> bool {
        self.reset();
        self.push_node(ROOT);
        self.settle_min()
    }

    /// Position on the largest key.
    pub fn seek_end(&mut self) -> bool {
        self.reset();
        self.push_node(ROOT);
        self.settle_max()
    }

    /// Position on the smallest key `>= target`.
    pub fn seek_lower_bound(&mut self, target: &[u8]) -> bool {
        self.reset();
        let arena = self.trie.arena();
        let mut node = ROOT;
        let mut pos = 0;
        loop {
            self.push_node(node);
            let info = NodeInfo::decode(arena, node);
            for i in 0..info.zlen {
                if pos + i == target.len() {
                    return self.settle_min();
                }
                let (want, have) = (target[pos + i], info.zpath_byte(arena, i));
                if want < have {
                    return self.settle_min();
                }
                if want > have {
                    return self.advance_past_top();
                }
            }
            pos += info.zlen;
            if pos == target.len() {
                return self.settle_min();
            }
            let ch = target[pos];
            let Some(nth) = info.lower_bound(arena, ch) else {
                return self.advance_past_top();
            };
            let label = info.label(arena, nth);
            let child = self.enter_child(nth);
            if label != ch {
                self.push_node(child);
                return self.settle_min();
            }
            node = child;
            pos += 1;
        }
    }

    /// Position on the longest stored key that is a prefix of `target`.
    ///
    /// [`max_prefix_len`](Self::max_prefix_len) reports how many bytes of `target` the walk
    /// matched, whether or not a stored prefix was found.
    pub fn seek_max_prefix(&mut self, target: &[u8]) -> bool {
        self.reset();
        let arena = self.trie.arena();
        let mut node = ROOT;
        let mut pos = 0;
        let mut best = None;
        let matched = loop {
            self.push_node(node);
            let info = NodeInfo::decode(arena, node);
            let mut i = 0;
            while i < info.zlen && pos + i < target.len() && target[pos + i] == info.zpath_byte(arena, i) {
                i += 1;
            }
            if i < info.zlen {
                break pos + i;
            }
            pos += info.zlen;
            if info.is_final() {
                best = Some((self.stack.len(), self.key.len()));
            }
            if pos == target.len() {
                break pos;
            }
            match info.find_child(arena, target[pos]) {
                Ok(slot) => {
                    let nth = (slot - info.child_slot(0)) as usize;
                    node = self.enter_child(nth);
                    pos += 1;
                }
                Err(_) => break pos,
            }
        };
        self.max_prefix_len = matched;
        match best {
            Some((depth, key_len)) => {
                self.stack.truncate(depth);
                self.key.truncate(key_len);
                self.settle_here();
                true
            }
            None => {
                self.reset();
                false
            }
        }
    }

    /// Drop the current position and idle the token so writers can reclaim behind it.
    ///
    /// `incr` and `decr` return false until one of the seeks repositions the iterator.
    pub fn idle(&mut self) {
        self.clear();
        if self.token.is_acquired() {
            self.token.idle();
        }
    }

    /// Move to the next key.
    pub fn incr(&mut self) -> bool {
        let Some(top) = self.stack.last().copied() else {
            return false;
        };
        let info = NodeInfo::decode(self.trie.arena(), top.node);
        match info.first_child(self.trie.arena()) {
            Some(nth) => {
                let child = self.enter_child(nth);
                self.push_node(child);
                self.settle_min()
            }
            None => self.advance_past_top(),
        }
    }

    /// Move to the previous key.
    pub fn decr(&mut self) -> bool {
        let arena = self.trie.arena();
        loop {
            let Some(parent) = self.pop_to_parent() else {
                self.clear();
                return false;
            };
            let info = NodeInfo::decode(arena, parent.node);
            if let Some(prev) = info.prev_child(arena, parent.nth) {
                let child = self.enter_child(prev);
                self.push_node(child);
                return self.settle_max();
            }
            if info.is_final() {
                self.settle_here();
                return true;
            }
        }
    }

    /// Unposition the iterator, resuming an idle token.
    fn reset(&mut self) {
        if self.token.state() == TokenState::AcquireIdle {
            self.token.acquire();
        }
        self.clear();
    }

    fn clear(&mut self) {
        self.stack.clear();
        self.key.clear();
        self.token.value_pos = None;
    }

    fn push_node(&mut self, node: u32) {
        let info = NodeInfo::decode(self.trie.arena(), node);
        let key_len = self.key.len();
        self.key.resize(key_len + info.zlen, 0);
        self.trie
            .arena()
            .read_bytes(info.zpath_offset(), &mut self.key[key_len..]);
        self.stack.push(Frame {
            node,
            nth: AT_NODE,
            key_len,
        });
    }

    /// Descend from the top frame through child `nth`; returns the child id.
    fn enter_child(&mut self, nth: usize) -> u32 {
        let arena = self.trie.arena();
        let Some(top) = self.stack.last_mut() else {
            return ROOT;
        };
        let info = NodeInfo::decode(arena, top.node);
        top.nth = nth;
        self.key.push(info.label(arena, nth));
        info.child(arena, nth)
    }

    /// Drop the top frame and its key bytes; returns the new top.
    fn pop_to_parent(&mut self) -> Option<Frame> {
        let frame = self.stack.pop()?;
        self.key.truncate(frame.key_len);
        let parent = *self.stack.last()?;
        self.key.pop();
        Some(parent)
    }

    /// Position on the top frame's node, which must be final.
    fn settle_here(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.nth = AT_NODE;
            let info = NodeInfo::decode(self.trie.arena(), top.node);
            self.token.value_pos = Some(info.value_offset());
        }
    }

    /// Smallest key in the subtree of the top frame.
    fn settle_min(&mut self) -> bool {
        let arena = self.trie.arena();
        while let Some(top) = self.stack.last().copied() {
            let info = NodeInfo::decode(arena, top.node);
            if info.is_final() {
                self.settle_here();
                return true;
            }
            match info.first_child(arena) {
                Some(nth) => {
                    let child = self.enter_child(nth);
                    self.push_node(child);
                }
                None => break,
            }
        }
        self.reset();
        false
    }

    /// Largest key in the subtree of the top frame.
    fn settle_max(&mut self) -> bool {
        let arena = self.trie.arena();
        while let Some(top) = self.stack.last().copied() {
            let info = NodeInfo::decode(arena, top.node);
            match info.last_child(arena) {
                Some(nth) => {
                    let child = self.enter_child(nth);
                    self.push_node(child);
                }
                None if info.is_final() => {
                    self.settle_here();
                    return true;
                }
                None => break,
            }
        }
        self.reset();
        false
    }

    /// Smallest key after the whole subtree of the top frame.
    fn advance_past_top(&mut self) -> bool {
        let arena = self.trie.arena();
        loop {
            let Some(parent) = self.pop_to_parent() else {
                self.clear();
                return false;
            };
            let info = NodeInfo::decode(arena, parent.node);
            if let Some(next) = info.next_child(arena, parent.nth) {
                let child = self.enter_child(next);
                self.push_node(child);
                return self.settle_min();
            }
        }
    }
}

impl std::fmt::Debug for PatriciaIter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatriciaIter")
            .field("depth", &self.stack.len())
            .field("key", &self.key)
            .field("max_prefix_len", &self.max_prefix_len)
            .finish()
    }
}

/// Owned `(key, value)` pairs in key order.
#[derive(Debug)]
pub struct Iter<'a> {
    inner: PatriciaIter<'a>,
    started: bool,
}

impl<'a> Iter<'a> {
    pub(crate) fn new(trie: &'a PatriciaTrie) -> Self {
        Self {
            inner: PatriciaIter::new(trie),
            started: false,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let found = if self.started {
            self.inner.incr()
        } else {
            self.started = true;
            self.inner.seek_begin()
        };
        if !found {
            return None;
        }
        Some((self.inner.key().to_vec(), self.inner.value().unwrap_or_default()))
    }
}

impl PatriciaTrie {
    /// A new unpositioned cursor.
    pub fn new_iter(&self) -> PatriciaIter<'_> {
        PatriciaIter::new(self)
    }

    /// All `(key, value)` pairs in key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self)
    }
}
