//! Word-addressed node arena
//!
//! The arena is one contiguous region viewed as a slice of `AtomicU32`. A node id is the
//! index of the node's first word, so `id * 4` is its byte offset. All bytes stored in the
//! arena (labels, compressed paths, values) are packed little-endian into words and read
//! through word loads; there is no byte pointer that outlives a call.
//!
//! The region is reserved at full capacity up front and never moves. Space is handed out by
//! an atomic bump pointer; the pools in [`crate::memory`] layer free lists on top of it.

use crate::config::HugePageMode;
use crate::error::{PatriciaError, Result};
use crate::memory::hugepage::{align_up, AnonRegion, PAGE_SIZE};
use crate::memory::mmap::FileRegion;
use crossbeam_utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Largest number of addressable words; id `u32::MAX` is reserved as the null link.
pub const MAX_ARENA_WORDS: usize = u32::MAX as usize;

/// Words of a `cap_bytes` region that may hold nodes.
#[inline]
fn addressable_words(cap_bytes: usize) -> usize {
    (cap_bytes / 4).min(MAX_ARENA_WORDS)
}

/// Memory behind an arena.
#[derive(Debug)]
pub enum Backing {
    /// Anonymous memory, optionally on huge pages
    Anon(AnonRegion),
    /// A file mapping; the arena starts after the image header
    File(FileRegion),
}

/// Shared node arena.
pub struct Arena {
    base: NonNull<AtomicU32>,
    cap_words: usize,
    used: CachePadded<AtomicUsize>,
    committed: AtomicUsize,
    explicit_commit: bool,
    backing: Backing,
}

// SAFETY: the region is only reachable as `&[AtomicU32]`, which is Sync.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Reserve an anonymous arena of `capacity` bytes.
    pub fn anonymous(capacity: usize, hugepage: HugePageMode, explicit_commit: bool) -> Result<Self> {
        let region = AnonRegion::reserve(capacity, hugepage)?;
        let base = NonNull::new(region.as_ptr() as *mut AtomicU32)
            .ok_or_else(|| PatriciaError::out_of_memory(capacity))?;
        Ok(Self::with_backing(
            base,
            addressable_words(capacity),
            0,
            explicit_commit,
            Backing::Anon(region),
        ))
    }

    /// Arena living inside a file mapping, starting `offset` bytes into it.
    pub fn in_file(region: FileRegion, offset: usize, used: usize, explicit_commit: bool) -> Result<Self> {
        if offset % 4 != 0 || offset > region.len() || used > region.len() - offset {
            return Err(PatriciaError::corrupted_image(format!(
                "arena [{}, +{}) does not fit a {} byte mapping",
                offset,
                used,
                region.len()
            )));
        }
        // SAFETY: offset is within the mapping and 4-aligned relative to a page-aligned base.
        let ptr = unsafe { region.as_ptr().add(offset) };
        let base = NonNull::new(ptr as *mut AtomicU32)
            .ok_or_else(|| PatriciaError::io_error("null file mapping"))?;
        let cap_words = addressable_words(region.len() - offset);
        Ok(Self::with_backing(
            base,
            cap_words,
            used,
            explicit_commit,
            Backing::File(region),
        ))
    }

    fn with_backing(
        base: NonNull<AtomicU32>,
        cap_words: usize,
        used: usize,
        explicit_commit: bool,
        backing: Backing,
    ) -> Self {
        Self {
            base,
            cap_words,
            used: CachePadded::new(AtomicUsize::new(used)),
            committed: AtomicUsize::new(align_up(used, PAGE_SIZE)),
            explicit_commit,
            backing,
        }
    }

    /// The whole arena as atomic words.
    #[inline]
    pub fn words(&self) -> &[AtomicU32] {
        // SAFETY: base points to cap_words zero-initialized (or mapped) words that live as
        // long as `backing`, and AtomicU32 has the same layout as u32.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.cap_words) }
    }

    /// Relaxed load of one word.
    #[inline]
    pub fn load(&self, id: u32) -> u32 {
        self.words()[id as usize].load(Ordering::Relaxed)
    }

    /// Acquire load of one word; used for child slots and flag words.
    #[inline]
    pub fn load_acquire(&self, id: u32) -> u32 {
        self.words()[id as usize].load(Ordering::Acquire)
    }

    /// Relaxed store, for node images that are not yet published.
    #[inline]
    pub fn store(&self, id: u32, value: u32) {
        self.words()[id as usize].store(value, Ordering::Relaxed)
    }

    /// Release store; publishes everything written before it.
    #[inline]
    pub fn store_release(&self, id: u32, value: u32) {
        self.words()[id as usize].store(value, Ordering::Release)
    }

    /// Strong compare-and-swap of one word.
    #[inline]
    pub fn compare_exchange(&self, id: u32, current: u32, new: u32) -> std::result::Result<u32, u32> {
        self.words()[id as usize].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Atomic OR on one word, returning the previous value.
    #[inline]
    pub fn fetch_or(&self, id: u32, bits: u32) -> u32 {
        self.words()[id as usize].fetch_or(bits, Ordering::AcqRel)
    }

    /// Atomic AND on one word, returning the previous value.
    #[inline]
    pub fn fetch_and(&self, id: u32, bits: u32) -> u32 {
        self.words()[id as usize].fetch_and(bits, Ordering::AcqRel)
    }

    /// Atomic add on one word, returning the previous value.
    #[inline]
    pub fn fetch_add(&self, id: u32, delta: u32) -> u32 {
        self.words()[id as usize].fetch_add(delta, Ordering::AcqRel)
    }

    /// Byte at `byte_off` from the arena start.
    #[inline]
    pub fn byte(&self, byte_off: usize) -> u8 {
        let word = self.load((byte_off / 4) as u32);
        (word >> (8 * (byte_off % 4))) as u8
    }

    /// Copy `dst.len()` bytes starting at `byte_off` into `dst`.
    pub fn read_bytes(&self, byte_off: usize, dst: &mut [u8]) {
        for (i, b) in dst.iter_mut().enumerate() {
            *b = self.byte(byte_off + i);
        }
    }

    /// Write `src` at `byte_off`; the covered words must belong to an unpublished node.
    pub fn write_bytes(&self, byte_off: usize, src: &[u8]) {
        let mut off = byte_off;
        let mut rest = src;
        while !rest.is_empty() {
            let id = (off / 4) as u32;
            let shift = off % 4;
            let take = (4 - shift).min(rest.len());
            let mut word = if shift == 0 && take == 4 { 0 } else { self.load(id) };
            for (i, &b) in rest[..take].iter().enumerate() {
                let bit = 8 * (shift + i);
                word = (word & !(0xff << bit)) | ((b as u32) << bit);
            }
            self.store(id, word);
            off += take;
            rest = &rest[take..];
        }
    }

    /// Copy `n_words` words from `from` to `to` (relaxed, for unpublished targets).
    pub fn copy_words(&self, from: u32, to: u32, n_words: usize) {
        for i in 0..n_words as u32 {
            self.store(to + i, self.load(from + i));
        }
    }

    /// Fill `n_words` words starting at `id` with `value`.
    pub fn fill_words(&self, id: u32, n_words: usize, value: u32) {
        for i in 0..n_words as u32 {
            self.store(id + i, value);
        }
    }

    /// Take `size` bytes (a multiple of 4) from the end of the arena.
    pub fn bump(&self, size: usize) -> Option<u32> {
        debug_assert_eq!(size % 4, 0);
        let cap = self.capacity();
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let end = used.checked_add(size)?;
            if end > cap {
                return None;
            }
            match self
                .used
                .compare_exchange(used, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.commit_to(end);
                    return Some((used / 4) as u32);
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Grow the block at `id` from `old_size` to `new_size` bytes when it ends the arena.
    pub fn try_extend(&self, id: u32, old_size: usize, new_size: usize) -> bool {
        let end = id as usize * 4 + old_size;
        let new_end = id as usize * 4 + new_size;
        if new_end > self.capacity() {
            return false;
        }
        let ok = self
            .used
            .compare_exchange(end, new_end, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if ok {
            self.commit_to(new_end);
        }
        ok
    }

    fn commit_to(&self, end: usize) {
        if !self.explicit_commit {
            return;
        }
        let target = align_up(end, PAGE_SIZE).min(self.capacity());
        let prev = self.committed.fetch_max(target, Ordering::AcqRel);
        let mut page = prev;
        while page < target {
            // A write fault commits the page; the word is already zero.
            self.words()[page / 4].fetch_add(0, Ordering::Relaxed);
            page += PAGE_SIZE;
        }
    }

    /// Bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Total bytes the arena can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap_words * 4
    }

    /// Whether pages are touched eagerly as the arena grows.
    pub fn explicit_commit(&self) -> bool {
        self.explicit_commit
    }

    /// The memory behind this arena.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The backing file mapping, if any.
    pub fn file(&self) -> Option<&FileRegion> {
        match &self.backing {
            Backing::File(region) => Some(region),
            Backing::Anon(_) => None,
        }
    }

    /// Append the used part of the arena to `out` in native word order.
    pub fn write_used_to<W: std::io::Write>(&self, out: &mut W) -> Result<()> {
        let used_words = self.used() / 4;
        let mut buf = Vec::with_capacity(4096);
        for chunk in self.words()[..used_words].chunks(1024) {
            buf.clear();
            for w in chunk {
                buf.extend_from_slice(&w.load(Ordering::Relaxed).to_ne_bytes());
            }
            out.write_all(&buf)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("used", &self.used())
            .field("capacity", &self.capacity())
            .field("explicit_commit", &self.explicit_commit)
            .field("backing", &self.backing)
            .finish()
    }
}
