//! Concurrent Patricia trie
//!
//! [`PatriciaTrie`] maps byte-string keys to fixed-size values. Nodes live in a shared
//! word arena and are never modified once published, except for the few atomic updates the
//! insert engine documents (fast-node slots, finalization flags, in-place growth at the
//! strict level). What this module adds on top of the engine:
//!
//! - construction from a [`PatriciaTrieConfig`], anonymous or file-backed
//! - writer registration and the parked [`WorkerContext`]s of released writers
//! - trie-wide statistics folded in from the writers' local counters
//! - application data, `set_readonly` and image save/load
//!
//! # Concurrency levels
//!
//! | level | writers | readers | superseded nodes |
//! |---|---|---|---|
//! | `SingleThreadStrict` | 1 | same thread | freed at once |
//! | `SingleThreadShared` | 1 | same thread | lazily freed |
//! | `OneWriteMultiRead` | 1 | any thread | lazily freed |
//! | `MultiWriteMultiRead` | any | any | lazily freed, CAS protocol |
//! | `NoWriteReadOnly` | 0 | any thread | none |
//!
//! # Example Usage
//!
//! ```rust
//! use cspp_trie::{ConcurrencyLevel, PatriciaTrie, WriterToken};
//! use cspp_trie::config::PatriciaTrieConfig;
//! # fn main() -> cspp_trie::Result<()> {
//! let trie = PatriciaTrie::new(PatriciaTrieConfig::new(4, 16 << 20, ConcurrencyLevel::MultiWriteMultiRead))?;
//! std::thread::scope(|s| {
//!     for t in 0..4u32 {
//!         let trie = &trie;
//!         s.spawn(move || {
//!             let mut w = WriterToken::new(trie);
//!             w.acquire().unwrap();
//!             for i in 0..100u32 {
//!                 trie.insert(format!("{}-{}", t, i).as_bytes(), &i.to_le_bytes(), &mut w);
//!             }
//!         });
//!     }
//! });
//! assert_eq!(trie.num_words(), 400);
//! assert_eq!(trie.get(b"2-42"), Some(42u32.to_le_bytes().to_vec()));
//! # Ok(())
//! # }
//! ```

use crate::config::{Config, PatriciaTrieConfig};
use crate::error::{PatriciaError, Result};
use crate::fsa::image::{ImageHeader, HEADER_SIZE, NO_APPDATA};
use crate::fsa::node::{align4, NodeImage, NodeInfo, ROOT};
use crate::fsa::token::{RaceStats, WorkerContext};
use crate::fsa::version_sync::{ConcurrencyLevel, TokenQueue};
use crate::memory::{Arena, ExhaustionPolicy, FileRegion, FixedCapacityPool, NodePool, ThreadCachePool};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Structural counters of a trie.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrieStats {
    /// Compressed paths split into a two-way branch
    pub n_fork: u64,
    /// Compressed paths cut because a key ended inside them
    pub n_split: u64,
    /// Existing nodes turned final
    pub n_mark_final: u64,
    /// Children added to existing nodes
    pub n_add_child: u64,
    /// Keys stored
    pub n_words: u64,
    /// Reachable nodes, including the root
    pub n_nodes: u64,
    /// Longest key stored
    pub max_word_len: usize,
    /// Sum of compressed path lengths of all reachable nodes
    pub total_zpath_len: u64,
}

/// Memory usage of a trie.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStat {
    /// Arena bytes handed out
    pub used_size: usize,
    /// Arena capacity
    pub capacity: usize,
    /// Bytes parked in writer free lists
    pub frag_size: usize,
    /// Retired nodes awaiting reclamation
    pub lazy_free_cnt: usize,
    /// Bytes of retired nodes awaiting reclamation
    pub lazy_free_sum: usize,
    /// Acquired tokens
    pub token_qlen: usize,
}

#[derive(Debug, Default)]
struct SharedStats {
    n_fork: AtomicU64,
    n_split: AtomicU64,
    n_mark_final: AtomicU64,
    n_add_child: AtomicU64,
    n_words: AtomicU64,
    n_nodes: AtomicI64,
    total_zpath_len: AtomicI64,
    max_word_len: AtomicUsize,
    frag_size: AtomicI64,
    lazy_free_cnt: AtomicI64,
    lazy_free_sum: AtomicI64,
}

impl SharedStats {
    fn from_header(header: &ImageHeader) -> Self {
        let stats = Self::default();
        stats.n_words.store(header.n_words, Ordering::Relaxed);
        stats.n_nodes.store(header.n_nodes as i64, Ordering::Relaxed);
        stats
            .total_zpath_len
            .store(header.total_zpath_len as i64, Ordering::Relaxed);
        stats
            .max_word_len
            .store(header.max_word_len as usize, Ordering::Relaxed);
        stats.frag_size.store(header.frag_size as i64, Ordering::Relaxed);
        stats
    }
}

/// Location of the application data block inside the arena.
#[derive(Debug, Clone, Copy)]
struct AppData {
    offset: usize,
    len: usize,
}

/// A concurrent Patricia trie over a word arena.
pub struct PatriciaTrie {
    arena: Arena,
    config: PatriciaTrieConfig,
    level: AtomicU8,
    writable_level: ConcurrencyLevel,
    queue: TokenQueue,
    active_writers: AtomicUsize,
    contexts: Mutex<Vec<WorkerContext>>,
    stats: SharedStats,
    race: Mutex<RaceStats>,
    appdata: Mutex<Option<AppData>>,
    finished: AtomicBool,
}

impl PatriciaTrie {
    /// Create an empty trie, or load an image when the level is `NoWriteReadOnly`.
    pub fn new(config: PatriciaTrieConfig) -> Result<Self> {
        config.validate()?;
        let level = config.concurrency_level;
        if level == ConcurrencyLevel::NoWriteReadOnly {
            let path = config
                .file_path
                .clone()
                .ok_or_else(|| PatriciaError::configuration("read-only trie needs a file_path"))?;
            return Self::load_image(path);
        }

        let capacity = config.effective_capacity();
        let arena = match &config.file_path {
            Some(path) => {
                let region = FileRegion::create(path, HEADER_SIZE + capacity)?;
                Arena::in_file(region, HEADER_SIZE, 0, config.vm_explicit_commit)?
            }
            None => Arena::anonymous(capacity, config.hugepage, config.vm_explicit_commit)?,
        };

        let root = NodeImage::fast(&[], &[], false, &[]);
        let root_size = root.size(config.value_size);
        match arena.bump(root_size) {
            Some(ROOT) => root.write(&arena, ROOT, config.value_size),
            _ => return Err(PatriciaError::out_of_memory(root_size)),
        }
        log::debug!(
            "created {} trie: value size {}, capacity {} bytes, backing {}",
            level,
            config.value_size,
            arena.capacity(),
            config
                .file_path
                .as_ref()
                .map_or_else(|| "anonymous".to_string(), |p| p.display().to_string())
        );

        let stats = SharedStats::default();
        stats.n_nodes.store(1, Ordering::Relaxed);
        Ok(Self::assemble(arena, config, level, stats, None))
    }

    fn assemble(
        arena: Arena,
        config: PatriciaTrieConfig,
        level: ConcurrencyLevel,
        stats: SharedStats,
        appdata: Option<AppData>,
    ) -> Self {
        Self {
            arena,
            level: AtomicU8::new(level as u8),
            writable_level: level,
            config,
            queue: TokenQueue::new(),
            active_writers: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            stats,
            race: Mutex::new(RaceStats::default()),
            appdata: Mutex::new(appdata),
            finished: AtomicBool::new(false),
        }
    }

    /// Map an image written by [`save_image`](Self::save_image) or by a file-backed trie.
    ///
    /// The mapping is copy-on-write and the trie is `NoWriteReadOnly`.
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let region = FileRegion::open_image(path)?;
        let header = ImageHeader::decode(region.prefix(HEADER_SIZE))?;
        header.validate(region.len())?;

        let valsize = header.valsize as usize;
        let root_size = NodeImage::fast(&[], &[], false, &[]).size(valsize);
        if (header.block_length as usize) < root_size {
            return Err(PatriciaError::corrupted_image(format!(
                "arena of {} bytes cannot hold the root",
                header.block_length
            )));
        }
        let arena = Arena::in_file(
            region,
            header.block_offset as usize,
            header.block_length as usize,
            false,
        )?;
        if !NodeInfo::decode(&arena, ROOT).is_fast() {
            return Err(PatriciaError::corrupted_image("root is not a fast node"));
        }

        let config = PatriciaTrieConfig {
            value_size: valsize,
            max_mem: header.block_length as i64,
            concurrency_level: ConcurrencyLevel::NoWriteReadOnly,
            file_path: Some(path.to_path_buf()),
            ..PatriciaTrieConfig::default()
        };
        let appdata = (header.appdata_offset != NO_APPDATA).then(|| AppData {
            offset: header.appdata_offset as usize,
            len: header.appdata_length as usize,
        });
        log::info!(
            "loaded trie image {}: {} keys, {} nodes, {} arena bytes",
            path.display(),
            header.n_words,
            header.n_nodes,
            header.block_length
        );
        Ok(Self::assemble(
            arena,
            config,
            ConcurrencyLevel::NoWriteReadOnly,
            SharedStats::from_header(&header),
            appdata,
        ))
    }

    /// Bytes stored with every key.
    #[inline]
    pub fn value_size(&self) -> usize {
        self.config.value_size
    }

    /// Current concurrency level; `NoWriteReadOnly` after [`set_readonly`](Self::set_readonly).
    #[inline]
    pub fn concurrency_level(&self) -> ConcurrencyLevel {
        ConcurrencyLevel::from_u8(self.level.load(Ordering::SeqCst))
            .unwrap_or(ConcurrencyLevel::NoWriteReadOnly)
    }

    /// Whether inserts are rejected.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.concurrency_level() == ConcurrencyLevel::NoWriteReadOnly
    }

    /// The configuration the trie was built with.
    pub fn config(&self) -> &PatriciaTrieConfig {
        &self.config
    }

    /// The level the insert engine works at.
    #[inline]
    pub(crate) fn writable_level(&self) -> ConcurrencyLevel {
        self.writable_level
    }

    #[inline]
    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }

    #[inline]
    pub(crate) fn queue(&self) -> &TokenQueue {
        &self.queue
    }

    pub(crate) fn register_writer(&self) -> Result<()> {
        if self.writable_level.allows_concurrent_writers() {
            self.active_writers.fetch_add(1, Ordering::SeqCst);
        } else if self
            .active_writers
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PatriciaError::resource_busy(format!(
                "{} trie already has an active writer",
                self.writable_level
            )));
        }
        // set_readonly stores the level before it counts writers, so one side always sees
        // the other.
        if self.is_readonly() {
            self.active_writers.fetch_sub(1, Ordering::SeqCst);
            return Err(PatriciaError::read_only("acquire a writer token"));
        }
        Ok(())
    }

    pub(crate) fn unregister_writer(&self) {
        self.active_writers.fetch_sub(1, Ordering::SeqCst);
    }

    /// A parked context, or a fresh one with the pool this level needs.
    pub(crate) fn checkout_context(&self) -> WorkerContext {
        if let Some(ctx) = self.contexts.lock().pop() {
            return ctx;
        }
        let pool = match self.writable_level {
            ConcurrencyLevel::MultiWriteMultiRead => {
                NodePool::ThreadCache(ThreadCachePool::new(self.config.chunk_size))
            }
            ConcurrencyLevel::OneWriteMultiRead => {
                NodePool::Fixed(FixedCapacityPool::new(ExhaustionPolicy::Fail))
            }
            _ => NodePool::Fixed(FixedCapacityPool::new(ExhaustionPolicy::Fatal)),
        };
        WorkerContext::new(pool)
    }

    pub(crate) fn checkin_context(&self, mut ctx: WorkerContext) {
        self.sync_stats(&mut ctx);
        self.race.lock().merge(&std::mem::take(&mut ctx.race));
        self.contexts.lock().push(ctx);
    }

    /// Publish a writer's local counters into the trie-wide statistics.
    pub(crate) fn sync_stats(&self, ctx: &mut WorkerContext) {
        let local = std::mem::take(&mut ctx.stats);
        let s = &self.stats;
        s.n_fork.fetch_add(local.n_fork, Ordering::Relaxed);
        s.n_split.fetch_add(local.n_split, Ordering::Relaxed);
        s.n_mark_final.fetch_add(local.n_mark_final, Ordering::Relaxed);
        s.n_add_child.fetch_add(local.n_add_child, Ordering::Relaxed);
        s.n_words.fetch_add(local.n_words, Ordering::Relaxed);
        s.n_nodes.fetch_add(local.n_nodes, Ordering::Relaxed);
        s.total_zpath_len
            .fetch_add(local.total_zpath_len, Ordering::Relaxed);
        s.max_word_len.fetch_max(local.max_word_len, Ordering::Relaxed);

        let frag = ctx.pool.frag_size();
        let lazy_cnt = ctx.lazy.len();
        let lazy_sum = ctx.lazy.mem_size();
        s.frag_size
            .fetch_add(frag as i64 - ctx.synced_frag as i64, Ordering::Relaxed);
        s.lazy_free_cnt
            .fetch_add(lazy_cnt as i64 - ctx.synced_lazy_cnt as i64, Ordering::Relaxed);
        s.lazy_free_sum
            .fetch_add(lazy_sum as i64 - ctx.synced_lazy_sum as i64, Ordering::Relaxed);
        ctx.synced_frag = frag;
        ctx.synced_lazy_cnt = lazy_cnt;
        ctx.synced_lazy_sum = lazy_sum;
    }

    /// Contexts of released writers waiting for reuse.
    pub fn parked_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Structural counters, as of the writers' last synchronization.
    pub fn stats(&self) -> TrieStats {
        let s = &self.stats;
        TrieStats {
            n_fork: s.n_fork.load(Ordering::Relaxed),
            n_split: s.n_split.load(Ordering::Relaxed),
            n_mark_final: s.n_mark_final.load(Ordering::Relaxed),
            n_add_child: s.n_add_child.load(Ordering::Relaxed),
            n_words: s.n_words.load(Ordering::Relaxed),
            n_nodes: s.n_nodes.load(Ordering::Relaxed).max(0) as u64,
            max_word_len: s.max_word_len.load(Ordering::Relaxed),
            total_zpath_len: s.total_zpath_len.load(Ordering::Relaxed).max(0) as u64,
        }
    }

    /// Number of stored keys.
    pub fn num_words(&self) -> usize {
        self.stats.n_words.load(Ordering::Relaxed) as usize
    }

    /// Memory usage, as of the writers' last synchronization.
    pub fn mem_stat(&self) -> MemStat {
        let s = &self.stats;
        MemStat {
            used_size: self.arena.used(),
            capacity: self.arena.capacity(),
            frag_size: s.frag_size.load(Ordering::Relaxed).max(0) as usize,
            lazy_free_cnt: s.lazy_free_cnt.load(Ordering::Relaxed).max(0) as usize,
            lazy_free_sum: s.lazy_free_sum.load(Ordering::Relaxed).max(0) as usize,
            token_qlen: self.queue.qlen(),
        }
    }

    /// Contention counters merged from released writers.
    pub fn race_stats(&self) -> RaceStats {
        self.race.lock().clone()
    }

    /// Acquired tokens in the version queue.
    pub fn token_qlen(&self) -> usize {
        self.queue.qlen()
    }

    /// Oldest version still visible to an acquired token.
    pub fn min_verseq(&self) -> u64 {
        self.queue.min_verseq()
    }

    /// Reserve `len` bytes of application data in the arena; only one block per trie.
    pub fn alloc_appdata(&self, len: usize) -> Result<()> {
        if self.is_readonly() {
            return Err(PatriciaError::read_only("allocate appdata"));
        }
        let mut appdata = self.appdata.lock();
        if appdata.is_some() {
            return Err(PatriciaError::invalid_data("appdata is already allocated"));
        }
        let size = align4(len.max(1));
        let id = self
            .arena
            .bump(size)
            .ok_or_else(|| PatriciaError::out_of_memory(size))?;
        *appdata = Some(AppData {
            offset: id as usize * 4,
            len,
        });
        Ok(())
    }

    /// Copy `data` into the application data at `offset`.
    pub fn write_appdata(&self, offset: usize, data: &[u8]) -> Result<()> {
        if self.is_readonly() {
            return Err(PatriciaError::read_only("write appdata"));
        }
        let appdata = *self.appdata.lock();
        let Some(block) = appdata else {
            return Err(PatriciaError::invalid_data("no appdata allocated"));
        };
        if offset.checked_add(data.len()).map_or(true, |end| end > block.len) {
            return Err(PatriciaError::invalid_data(format!(
                "appdata write [{}, +{}) exceeds {} bytes",
                offset,
                data.len(),
                block.len
            )));
        }
        self.arena.write_bytes(block.offset + offset, data);
        Ok(())
    }

    /// Copy of the application data.
    pub fn appdata(&self) -> Option<Vec<u8>> {
        let block = (*self.appdata.lock())?;
        let mut buf = vec![0u8; block.len];
        self.arena.read_bytes(block.offset, &mut buf);
        Some(buf)
    }

    /// Freeze the trie; a file-backed trie writes its header and shrinks its file.
    ///
    /// Fails with [`PatriciaError::ResourceBusy`] while a writer token is acquired.
    pub fn set_readonly(&self) -> Result<()> {
        if self.is_readonly() {
            return Ok(());
        }
        if self.active_writers.load(Ordering::SeqCst) != 0 {
            return Err(PatriciaError::resource_busy("writer tokens are still acquired"));
        }
        let prev = self
            .level
            .swap(ConcurrencyLevel::NoWriteReadOnly as u8, Ordering::SeqCst);
        if self.active_writers.load(Ordering::SeqCst) != 0 {
            self.level.store(prev, Ordering::SeqCst);
            return Err(PatriciaError::resource_busy("writer tokens are still acquired"));
        }

        if self.queue.qlen() == 0 {
            let mut contexts = self.contexts.lock();
            for ctx in contexts.iter_mut() {
                let WorkerContext { lazy, pool, .. } = ctx;
                lazy.drain_all(|item| pool.free(item.node, item.size as usize));
                self.sync_stats(ctx);
            }
        }
        if self.arena.file().is_some() {
            self.finish_file()?;
        }
        log::info!(
            "trie is now read-only: {} keys, {} arena bytes",
            self.num_words(),
            self.arena.used()
        );
        Ok(())
    }

    fn header(&self) -> ImageHeader {
        let stats = self.stats();
        let mem = self.mem_stat();
        let mut header = ImageHeader::new(self.value_size(), mem.used_size);
        header.n_nodes = stats.n_nodes;
        header.n_words = stats.n_words;
        header.max_word_len = stats.max_word_len as u64;
        header.total_zpath_len = stats.total_zpath_len;
        header.frag_size = mem.frag_size as u64;
        if let Some(block) = *self.appdata.lock() {
            header.appdata_offset = block.offset as u64;
            header.appdata_length = block.len as u64;
        }
        header
    }

    fn finish_file(&self) -> Result<()> {
        let Some(region) = self.arena.file() else {
            return Ok(());
        };
        if self.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let header = self.header();
        region.finish(&header.encode(), HEADER_SIZE + self.arena.used())
    }

    /// Write a loadable image of the trie to `path`.
    ///
    /// Fails with [`PatriciaError::ResourceBusy`] while a writer token is acquired.
    pub fn save_image<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if self.active_writers.load(Ordering::SeqCst) != 0 {
            return Err(PatriciaError::resource_busy("writer tokens are still acquired"));
        }
        let path = path.as_ref();
        let header = self.header();
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&header.encode())?;
        self.arena.write_used_to(&mut out)?;
        out.flush()?;
        log::info!(
            "saved trie image {}: {} keys, {} bytes",
            path.display(),
            header.n_words,
            HEADER_SIZE as u64 + header.block_length
        );
        Ok(())
    }
}

impl Drop for PatriciaTrie {
    fn drop(&mut self) {
        if self.writable_level != ConcurrencyLevel::NoWriteReadOnly && self.arena.file().is_some() {
            if let Err(e) = self.finish_file() {
                log::warn!("failed to finish trie file: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for PatriciaTrie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatriciaTrie")
            .field("level", &self.concurrency_level())
            .field("value_size", &self.value_size())
            .field("stats", &self.stats())
            .field("mem", &self.mem_stat())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsa::token::{with_writer_token, WriterToken};

    fn trie(valsize: usize, level: ConcurrencyLevel) -> PatriciaTrie {
        PatriciaTrie::new(PatriciaTrieConfig::new(valsize, 1 << 20, level)).unwrap()
    }

    #[test]
    fn test_new_trie_has_fast_root() {
        let trie = trie(8, ConcurrencyLevel::OneWriteMultiRead);
        let root = NodeInfo::decode(trie.arena(), ROOT);
        assert!(root.is_fast());
        assert!(!root.is_final());
        assert_eq!(trie.stats().n_nodes, 1);
        assert_eq!(trie.num_words(), 0);
        assert_eq!(trie.mem_stat().used_size, root.size(8));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = PatriciaTrie::new(PatriciaTrieConfig::new(3, 1 << 20, ConcurrencyLevel::SingleThreadStrict))
            .unwrap_err();
        assert!(matches!(err, PatriciaError::Configuration { .. }));
    }

    #[test]
    fn test_readonly_rejects_writers() {
        let trie = trie(4, ConcurrencyLevel::OneWriteMultiRead);
        with_writer_token(&trie, |w| trie.insert(b"a", &[0; 4], w)).unwrap();

        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(matches!(trie.set_readonly(), Err(PatriciaError::ResourceBusy { .. })));
        w.release();

        trie.set_readonly().unwrap();
        assert!(trie.is_readonly());
        assert!(matches!(w.acquire(), Err(PatriciaError::ReadOnly { .. })));
        assert!(trie.contains(b"a"));
    }

    #[test]
    fn test_appdata() {
        let trie = trie(4, ConcurrencyLevel::SingleThreadShared);
        assert_eq!(trie.appdata(), None);
        assert!(trie.write_appdata(0, b"x").is_err());
        trie.alloc_appdata(6).unwrap();
        assert!(trie.alloc_appdata(6).is_err());
        trie.write_appdata(1, b"hello").unwrap();
        assert!(trie.write_appdata(2, b"hello").is_err());
        assert_eq!(trie.appdata(), Some(b"\0hello".to_vec()));
    }

    #[test]
    fn test_stats_merge_across_writers() {
        let trie = trie(4, ConcurrencyLevel::MultiWriteMultiRead);
        std::thread::scope(|s| {
            for t in 0..3u8 {
                let trie = &trie;
                s.spawn(move || {
                    with_writer_token(trie, |w| {
                        for i in 0..50u8 {
                            trie.insert(&[t, i], &[t, i, 0, 0], w);
                        }
                    })
                    .unwrap();
                });
            }
        });
        assert_eq!(trie.num_words(), 150);
        assert_eq!(trie.stats().max_word_len, 2);
        assert_eq!(trie.race_stats().histogram.values().sum::<u64>(), 150);
        assert!(trie.parked_contexts() >= 1);
    }

    #[test]
    fn test_save_and_load_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("words.img");
        let trie = trie(4, ConcurrencyLevel::SingleThreadStrict);
        with_writer_token(&trie, |w| {
            for (i, key) in ["one", "two", "three", "thirty"].iter().enumerate() {
                trie.insert(key.as_bytes(), &(i as u32).to_le_bytes(), w);
            }
        })
        .unwrap();
        trie.alloc_appdata(4).unwrap();
        trie.write_appdata(0, b"meta").unwrap();
        trie.save_image(&path).unwrap();

        let loaded = PatriciaTrie::load_image(&path).unwrap();
        assert!(loaded.is_readonly());
        assert_eq!(loaded.value_size(), 4);
        assert_eq!(loaded.num_words(), 4);
        assert_eq!(loaded.stats().n_nodes, trie.stats().n_nodes);
        assert_eq!(loaded.stats().total_zpath_len, trie.stats().total_zpath_len);
        assert_eq!(loaded.get(b"thirty"), Some(3u32.to_le_bytes().to_vec()));
        assert_eq!(loaded.get(b"thirt"), None);
        assert_eq!(loaded.appdata(), Some(b"meta".to_vec()));
        assert!(matches!(
            WriterToken::new(&loaded).acquire(),
            Err(PatriciaError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_load_rejects_truncated_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.img");
        let trie = trie(0, ConcurrencyLevel::SingleThreadStrict);
        trie.save_image(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        assert!(matches!(
            PatriciaTrie::load_image(&path),
            Err(PatriciaError::CorruptedImage { .. })
        ));
    }
}
