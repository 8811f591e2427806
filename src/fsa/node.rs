//! Node codec of the Patricia trie
//!
//! A node is a run of 4-byte words in the [`Arena`]. Its first word (the *meta word*) holds
//! the shape discriminator, the state flags, the compressed path length and, depending on
//! the shape, either the first child labels or the child count. The shape alone fixes where
//! every other field lives, so a reader never looks past the node's computed size.
//!
//! # Layout
//!
//! ```text
//! meta word:  byte 0 = cnt_type (low 4 bits) | FINAL | LAZY_FREE | SET_FINAL | LOCK
//!             byte 1 = zlen
//!             bytes 2..4 = labels (cnt_type 1..=6) or child count (7, 8, 15)
//!
//! cnt_type  children  labels                        child slots start at word
//! 0..=2     0..=2     bytes 2..4                    1
//! 3..=6     3..=6     bytes 2..8                    2
//! 7         7..=16    bytes 4..20, sorted           5
//! 8         17..=256  rank bytes + 256-bit bitmap   10
//! 15        256 slots direct index, NIL if absent   2
//! ```
//!
//! After the child slots come `zlen` compressed path bytes, then (from the next word
//! boundary) the value. Fast nodes (cnt_type 15) always carry value space; other shapes only
//! when final.
//!
//! # Flags
//!
//! `LOCK` and `LAZY_FREE` are only used by the multi-writer protocol: `LOCK` marks a node
//! whose child slots are being swapped, `LAZY_FREE` marks a node that has been retired and
//! is permanent. `SET_FINAL` is the first half of the in-place finalization of fast nodes.

use crate::memory::Arena;

/// Null node id.
pub const NIL_STATE: u32 = u32::MAX;
/// Id of the root, always a fast node.
pub const ROOT: u32 = 0;
/// Longest compressed path stored in one node.
pub const MAX_ZPATH: usize = 254;

/// Mask of the shape discriminator in the meta word.
pub const CNT_MASK: u32 = 0x0f;
/// The node terminates a key.
pub const FLAG_FINAL: u32 = 0x10;
/// The node has been retired.
pub const FLAG_LAZY_FREE: u32 = 0x20;
/// A writer is finalizing this fast node in place.
pub const FLAG_SET_FINAL: u32 = 0x40;
/// A writer is swapping one of this node's child slots.
pub const FLAG_LOCK: u32 = 0x80;
/// Flags that describe transient writer state and never survive a copy.
pub const TRANSIENT_FLAGS: u32 = FLAG_LOCK | FLAG_LAZY_FREE | FLAG_SET_FINAL;

/// Sorted-array shape.
pub const SORTED_NODE: u8 = 7;
/// Bitmap-with-rank shape.
pub const BITMAP_NODE: u8 = 8;
/// Direct 256-slot shape.
pub const FAST_NODE: u8 = 15;
/// Number of child slots of a fast node.
pub const FAST_SLOTS: usize = 256;

/// Round up to a multiple of four.
#[inline]
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Number of header words before the first child slot.
#[inline]
pub const fn skip_slots(cnt_type: u8) -> usize {
    match cnt_type {
        0..=2 => 1,
        3..=6 => 2,
        SORTED_NODE => 5,
        BITMAP_NODE => 10,
        _ => 2,
    }
}

/// The shape a node with `n` children is built with.
#[inline]
pub const fn shape_for(n: usize) -> u8 {
    match n {
        0..=6 => n as u8,
        7..=16 => SORTED_NODE,
        _ => BITMAP_NODE,
    }
}

/// Byte size of a node image.
#[inline]
pub const fn node_size(cnt_type: u8, n_slots: usize, zlen: usize, is_final: bool, valsize: usize) -> usize {
    let value = if is_final || cnt_type == FAST_NODE { valsize } else { 0 };
    4 * (skip_slots(cnt_type) + n_slots) + align4(zlen) + value
}

/// A decoded view of a node's meta word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node id.
    pub id: u32,
    /// The meta word as loaded.
    pub meta: u32,
    /// Shape discriminator.
    pub cnt_type: u8,
    /// Compressed path length.
    pub zlen: usize,
    /// Number of child slots (256 for a fast node).
    pub n_slots: usize,
}

impl NodeInfo {
    /// Decode the node at `id` (acquire load of the meta word).
    #[inline]
    pub fn decode(arena: &Arena, id: u32) -> Self {
        Self::from_meta(id, arena.load_acquire(id))
    }

    /// Decode from an already loaded meta word.
    #[inline]
    pub fn from_meta(id: u32, meta: u32) -> Self {
        let cnt_type = (meta & CNT_MASK) as u8;
        let n_slots = match cnt_type {
            0..=6 => cnt_type as usize,
            FAST_NODE => FAST_SLOTS,
            _ => (meta >> 16) as usize,
        };
        Self {
            id,
            meta,
            cnt_type,
            zlen: ((meta >> 8) & 0xff) as usize,
            n_slots,
        }
    }

    /// Whether the node terminates a key.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.meta & FLAG_FINAL != 0
    }

    /// Whether the node is a fast node.
    #[inline]
    pub fn is_fast(&self) -> bool {
        self.cnt_type == FAST_NODE
    }

    /// Whether the node has been retired.
    #[inline]
    pub fn is_lazy_free(&self) -> bool {
        self.meta & FLAG_LAZY_FREE != 0
    }

    /// Header words before the child slots.
    #[inline]
    pub fn skip(&self) -> usize {
        skip_slots(self.cnt_type)
    }

    /// Word index of child slot `nth` (for fast nodes `nth` is the label).
    #[inline]
    pub fn child_slot(&self, nth: usize) -> u32 {
        self.id + (self.skip() + nth) as u32
    }

    /// Byte offset of the compressed path from the arena start.
    #[inline]
    pub fn zpath_offset(&self) -> usize {
        4 * (self.id as usize + self.skip() + self.n_slots)
    }

    /// Byte offset of the value from the arena start.
    #[inline]
    pub fn value_offset(&self) -> usize {
        self.zpath_offset() + align4(self.zlen)
    }

    /// Whether the node carries value space.
    #[inline]
    pub fn has_value_space(&self) -> bool {
        self.is_final() || self.is_fast()
    }

    /// Byte size of the node.
    #[inline]
    pub fn size(&self, valsize: usize) -> usize {
        node_size(self.cnt_type, self.n_slots, self.zlen, self.is_final(), valsize)
    }

    /// Byte `i` of the compressed path.
    #[inline]
    pub fn zpath_byte(&self, arena: &Arena, i: usize) -> u8 {
        arena.byte(self.zpath_offset() + i)
    }

    /// The compressed path, copied out.
    pub fn zpath(&self, arena: &Arena) -> Vec<u8> {
        let mut buf = vec![0u8; self.zlen];
        arena.read_bytes(self.zpath_offset(), &mut buf);
        buf
    }

    /// The value, copied out.
    pub fn value(&self, arena: &Arena, valsize: usize) -> Vec<u8> {
        let mut buf = vec![0u8; valsize];
        arena.read_bytes(self.value_offset(), &mut buf);
        buf
    }

    /// Real number of children.
    pub fn n_children(&self, arena: &Arena) -> usize {
        if self.is_fast() {
            (arena.load_acquire(self.id + 1) & 0xffff) as usize
        } else {
            self.n_slots
        }
    }

    /// Child id in slot `nth` (acquire).
    #[inline]
    pub fn child(&self, arena: &Arena, nth: usize) -> u32 {
        arena.load_acquire(self.child_slot(nth))
    }

    /// Label of child `nth`.
    pub fn label(&self, arena: &Arena, nth: usize) -> u8 {
        match self.cnt_type {
            0..=6 => arena.byte(4 * self.id as usize + 2 + nth),
            SORTED_NODE => arena.byte(4 * self.id as usize + 4 + nth),
            BITMAP_NODE => self.bitmap_select(arena, nth),
            _ => nth as u8,
        }
    }

    fn bitmap_block(&self, arena: &Arena, b: usize) -> u64 {
        let lo = arena.load(self.id + 2 + 2 * b as u32) as u64;
        let hi = arena.load(self.id + 3 + 2 * b as u32) as u64;
        lo | (hi << 32)
    }

    fn bitmap_rank(&self, arena: &Arena, b: usize) -> usize {
        ((arena.load(self.id + 1) >> (8 * b)) & 0xff) as usize
    }

    fn bitmap_select(&self, arena: &Arena, nth: usize) -> u8 {
        let mut b = 3;
        while b > 0 && self.bitmap_rank(arena, b) > nth {
            b -= 1;
        }
        let mut block = self.bitmap_block(arena, b);
        for _ in 0..nth - self.bitmap_rank(arena, b) {
            block &= block - 1;
        }
        (b * 64 + block.trailing_zeros() as usize) as u8
    }

    /// Children with labels below `ch` in a bitmap node.
    fn bitmap_rank_of(&self, arena: &Arena, ch: u8) -> (usize, bool) {
        let b = ch as usize / 64;
        let bit = ch as usize % 64;
        let block = self.bitmap_block(arena, b);
        let below = block & ((1u64 << bit) - 1);
        (
            self.bitmap_rank(arena, b) + below.count_ones() as usize,
            block >> bit & 1 != 0,
        )
    }

    /// Locate the child labelled `ch`.
    ///
    /// `Ok(slot)` is the word index of the child slot; `Err(pos)` is the index at which a
    /// child labelled `ch` would be inserted (the label itself for fast nodes).
    pub fn find_child(&self, arena: &Arena, ch: u8) -> Result<u32, usize> {
        match self.cnt_type {
            FAST_NODE => {
                let slot = self.child_slot(ch as usize);
                if arena.load_acquire(slot) != NIL_STATE {
                    Ok(slot)
                } else {
                    Err(ch as usize)
                }
            }
            BITMAP_NODE => match self.bitmap_rank_of(arena, ch) {
                (rank, true) => Ok(self.child_slot(rank)),
                (rank, false) => Err(rank),
            },
            _ => {
                let (mut lo, mut hi) = (0, self.n_slots);
                while lo < hi {
                    let mid = (lo + hi) / 2;
                    let label = self.label(arena, mid);
                    if label < ch {
                        lo = mid + 1;
                    } else if label > ch {
                        hi = mid;
                    } else {
                        return Ok(self.child_slot(mid));
                    }
                }
                Err(lo)
            }
        }
    }

    /// First child whose label is `>= ch`.
    pub fn lower_bound(&self, arena: &Arena, ch: u8) -> Option<usize> {
        match self.cnt_type {
            FAST_NODE => self.fast_scan_up(arena, ch as usize),
            BITMAP_NODE => {
                let (rank, _) = self.bitmap_rank_of(arena, ch);
                (rank < self.n_slots).then_some(rank)
            }
            _ => (0..self.n_slots).find(|&i| self.label(arena, i) >= ch),
        }
    }

    fn fast_scan_up(&self, arena: &Arena, from: usize) -> Option<usize> {
        (from..FAST_SLOTS).find(|&i| self.child(arena, i) != NIL_STATE)
    }

    fn fast_scan_down(&self, arena: &Arena, from: usize) -> Option<usize> {
        (0..=from).rev().find(|&i| self.child(arena, i) != NIL_STATE)
    }

    /// Index of the first child.
    pub fn first_child(&self, arena: &Arena) -> Option<usize> {
        if self.is_fast() {
            self.fast_scan_up(arena, 0)
        } else {
            (self.n_slots > 0).then_some(0)
        }
    }

    /// Index of the last child.
    pub fn last_child(&self, arena: &Arena) -> Option<usize> {
        if self.is_fast() {
            self.fast_scan_down(arena, FAST_SLOTS - 1)
        } else {
            self.n_slots.checked_sub(1)
        }
    }

    /// Index of the child after `nth`.
    pub fn next_child(&self, arena: &Arena, nth: usize) -> Option<usize> {
        if self.is_fast() {
            self.fast_scan_up(arena, nth + 1)
        } else {
            (nth + 1 < self.n_slots).then_some(nth + 1)
        }
    }

    /// Index of the child before `nth`.
    pub fn prev_child(&self, arena: &Arena, nth: usize) -> Option<usize> {
        if nth == 0 {
            None
        } else if self.is_fast() {
            self.fast_scan_down(arena, nth - 1)
        } else {
            Some(nth - 1)
        }
    }

    /// Snapshot of all `(label, child)` pairs in label order.
    pub fn children(&self, arena: &Arena) -> Vec<(u8, u32)> {
        if self.is_fast() {
            (0..FAST_SLOTS)
                .filter_map(|i| {
                    let child = self.child(arena, i);
                    (child != NIL_STATE).then_some((i as u8, child))
                })
                .collect()
        } else {
            (0..self.n_slots)
                .map(|i| (self.label(arena, i), self.child(arena, i)))
                .collect()
        }
    }
}

/// A node to be written into unpublished arena space.
#[derive(Debug, Clone, Copy)]
pub struct NodeImage<'a> {
    /// Shape discriminator.
    pub cnt_type: u8,
    /// Whether the node terminates a key.
    pub is_final: bool,
    /// `(label, child)` pairs sorted by label.
    pub children: &'a [(u8, u32)],
    /// Compressed path.
    pub zpath: &'a [u8],
    /// Value bytes, written when the node has value space.
    pub value: &'a [u8],
}

impl<'a> NodeImage<'a> {
    /// An image using the smallest shape for its child count.
    pub fn new(children: &'a [(u8, u32)], zpath: &'a [u8], is_final: bool, value: &'a [u8]) -> Self {
        Self {
            cnt_type: shape_for(children.len()),
            is_final,
            children,
            zpath,
            value,
        }
    }

    /// A fast-node image.
    pub fn fast(children: &'a [(u8, u32)], zpath: &'a [u8], is_final: bool, value: &'a [u8]) -> Self {
        Self {
            cnt_type: FAST_NODE,
            is_final,
            children,
            zpath,
            value,
        }
    }

    fn n_slots(&self) -> usize {
        if self.cnt_type == FAST_NODE {
            FAST_SLOTS
        } else {
            self.children.len()
        }
    }

    /// Byte size of the image.
    pub fn size(&self, valsize: usize) -> usize {
        node_size(self.cnt_type, self.n_slots(), self.zpath.len(), self.is_final, valsize)
    }

    /// Write the image at `id`, which must own at least `self.size(valsize)` bytes.
    pub fn write(&self, arena: &Arena, id: u32, valsize: usize) {
        debug_assert!(self.zpath.len() <= MAX_ZPATH);
        debug_assert!(self.children.windows(2).all(|w| w[0].0 < w[1].0));
        let size = self.size(valsize);
        let n = self.children.len();
        let skip = skip_slots(self.cnt_type);
        let mut meta = self.cnt_type as u32 | ((self.zpath.len() as u32) << 8);
        if self.is_final {
            meta |= FLAG_FINAL;
        }
        arena.fill_words(id, size / 4, 0);
        let base = 4 * id as usize;
        match self.cnt_type {
            0..=6 => {
                arena.store(id, meta);
                let labels: Vec<u8> = self.children.iter().map(|c| c.0).collect();
                arena.write_bytes(base + 2, &labels);
            }
            SORTED_NODE => {
                arena.store(id, meta | ((n as u32) << 16));
                let labels: Vec<u8> = self.children.iter().map(|c| c.0).collect();
                arena.write_bytes(base + 4, &labels);
            }
            BITMAP_NODE => {
                arena.store(id, meta | ((n as u32) << 16));
                let mut blocks = [0u64; 4];
                for &(label, _) in self.children {
                    blocks[label as usize / 64] |= 1u64 << (label % 64);
                }
                let mut ranks = 0u32;
                let mut acc = 0u32;
                for (b, block) in blocks.iter().enumerate() {
                    ranks |= acc << (8 * b);
                    acc += block.count_ones();
                    arena.store(id + 2 + 2 * b as u32, *block as u32);
                    arena.store(id + 3 + 2 * b as u32, (*block >> 32) as u32);
                }
                arena.store(id + 1, ranks);
            }
            _ => {
                arena.store(id, meta | ((FAST_SLOTS as u32) << 16));
                arena.store(id + 1, n as u32);
                arena.fill_words(id + skip as u32, FAST_SLOTS, NIL_STATE);
                for &(label, child) in self.children {
                    arena.store(id + skip as u32 + label as u32, child);
                }
            }
        }
        if self.cnt_type != FAST_NODE {
            for (i, &(_, child)) in self.children.iter().enumerate() {
                arena.store(id + (skip + i) as u32, child);
            }
        }
        let zpath_offset = base + 4 * (skip + self.n_slots());
        arena.write_bytes(zpath_offset, self.zpath);
        if self.is_final && valsize > 0 {
            let len = self.value.len().min(valsize);
            arena.write_bytes(zpath_offset + align4(self.zpath.len()), &self.value[..len]);
        }
    }
}

/// Number of nodes in the suffix chain that stores `rest_len` key bytes.
pub const fn chain_len(rest_len: usize) -> usize {
    if rest_len <= MAX_ZPATH {
        1
    } else {
        1 + (rest_len - MAX_ZPATH - 1) / (MAX_ZPATH + 1) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HugePageMode;

    fn arena() -> Arena {
        Arena::anonymous(1 << 20, HugePageMode::None, false).unwrap()
    }

    fn put(arena: &Arena, image: &NodeImage<'_>, valsize: usize) -> NodeInfo {
        let id = arena.bump(image.size(valsize)).unwrap();
        image.write(arena, id, valsize);
        NodeInfo::decode(arena, id)
    }

    fn pairs(labels: &[u8]) -> Vec<(u8, u32)> {
        labels.iter().map(|&l| (l, 1000 + l as u32)).collect()
    }

    #[test]
    fn test_shape_progression() {
        assert_eq!(shape_for(0), 0);
        assert_eq!(shape_for(6), 6);
        assert_eq!(shape_for(7), SORTED_NODE);
        assert_eq!(shape_for(16), SORTED_NODE);
        assert_eq!(shape_for(17), BITMAP_NODE);
        assert_eq!(shape_for(256), BITMAP_NODE);
    }

    #[test]
    fn test_node_size() {
        assert_eq!(node_size(0, 0, 0, false, 8), 4);
        assert_eq!(node_size(0, 0, 3, true, 8), 4 + 4 + 8);
        assert_eq!(node_size(3, 3, 0, false, 8), 4 * 5);
        assert_eq!(node_size(SORTED_NODE, 10, 5, false, 0), 4 * 15 + 8);
        assert_eq!(node_size(BITMAP_NODE, 20, 0, false, 4), 4 * 30);
        assert_eq!(node_size(FAST_NODE, FAST_SLOTS, 0, false, 4), 4 * 258 + 4);
    }

    #[test]
    fn test_inline_node_roundtrip() {
        let arena = arena();
        for n in 0..=6usize {
            let kids = pairs(&b"bdfhjl"[..n]);
            let info = put(&arena, &NodeImage::new(&kids, b"xyz", true, &[1, 2, 3, 4]), 4);
            assert_eq!(info.cnt_type as usize, n);
            assert_eq!(info.n_slots, n);
            assert!(info.is_final());
            assert_eq!(info.zpath(&arena), b"xyz");
            assert_eq!(info.value(&arena, 4), vec![1, 2, 3, 4]);
            assert_eq!(info.children(&arena), kids);
            for (i, &(label, child)) in kids.iter().enumerate() {
                let slot = info.find_child(&arena, label).unwrap();
                assert_eq!(arena.load(slot), child);
                assert_eq!(info.label(&arena, i), label);
            }
            if n > 0 {
                assert_eq!(info.find_child(&arena, b'c'), Err(1));
                assert_eq!(info.find_child(&arena, b'a'), Err(0));
            }
        }
    }

    #[test]
    fn test_sorted_node() {
        let arena = arena();
        let labels: Vec<u8> = (0..12).map(|i| 10 + i * 3).collect();
        let kids = pairs(&labels);
        let info = put(&arena, &NodeImage::new(&kids, b"", false, &[]), 0);
        assert_eq!(info.cnt_type, SORTED_NODE);
        assert_eq!(info.n_slots, 12);
        assert_eq!(info.children(&arena), kids);
        assert_eq!(info.find_child(&arena, 11), Err(1));
        assert_eq!(info.lower_bound(&arena, 11), Some(1));
        assert_eq!(info.lower_bound(&arena, 200), None);
    }

    #[test]
    fn test_bitmap_node_rank_select() {
        let arena = arena();
        let labels: Vec<u8> = (0..=255u8).filter(|b| b % 5 == 0).collect();
        let kids = pairs(&labels);
        let info = put(&arena, &NodeImage::new(&kids, b"zz", true, &[9; 8]), 8);
        assert_eq!(info.cnt_type, BITMAP_NODE);
        assert_eq!(info.n_slots, labels.len());
        for (i, &label) in labels.iter().enumerate() {
            assert_eq!(info.label(&arena, i), label);
            let slot = info.find_child(&arena, label).unwrap();
            assert_eq!(slot, info.child_slot(i));
            assert_eq!(arena.load(slot), 1000 + label as u32);
        }
        assert_eq!(info.find_child(&arena, 1), Err(1));
        assert_eq!(info.find_child(&arena, 254), Err(labels.len() - 1));
        assert_eq!(info.lower_bound(&arena, 71), Some(15));
        assert_eq!(info.zpath(&arena), b"zz");
        assert_eq!(info.value(&arena, 8), vec![9; 8]);
    }

    #[test]
    fn test_fast_node() {
        let arena = arena();
        let kids = pairs(b"az");
        let info = put(&arena, &NodeImage::fast(&kids, b"", false, &[]), 4);
        assert!(info.is_fast());
        assert_eq!(info.n_children(&arena), 2);
        assert!(info.has_value_space());
        assert_eq!(info.find_child(&arena, b'a'), Ok(info.child_slot(b'a' as usize)));
        assert_eq!(info.find_child(&arena, b'b'), Err(b'b' as usize));
        assert_eq!(info.first_child(&arena), Some(b'a' as usize));
        assert_eq!(info.last_child(&arena), Some(b'z' as usize));
        assert_eq!(info.next_child(&arena, b'a' as usize), Some(b'z' as usize));
        assert_eq!(info.prev_child(&arena, b'a' as usize), None);
        assert_eq!(info.lower_bound(&arena, b'b'), Some(b'z' as usize));
        assert_eq!(info.size(4), 4 * 258 + 4);
    }

    #[test]
    fn test_reused_space_is_cleared() {
        let arena = arena();
        let id = arena.bump(64).unwrap();
        arena.fill_words(id, 16, 0xffff_ffff);
        let image = NodeImage::new(&[], b"ab", false, &[]);
        image.write(&arena, id, 0);
        let info = NodeInfo::decode(&arena, id);
        assert_eq!(info.cnt_type, 0);
        assert!(!info.is_final());
        assert_eq!(info.zpath(&arena), b"ab");
    }

    #[test]
    fn test_chain_len() {
        assert_eq!(chain_len(0), 1);
        assert_eq!(chain_len(MAX_ZPATH), 1);
        assert_eq!(chain_len(MAX_ZPATH + 1), 2);
        assert_eq!(chain_len(MAX_ZPATH + 1 + MAX_ZPATH), 2);
        assert_eq!(chain_len(2 * (MAX_ZPATH + 1)), 3);
        assert_eq!(chain_len(2 * (MAX_ZPATH + 1) + MAX_ZPATH), 3);
    }
}
