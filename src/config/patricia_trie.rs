//! Configuration for the concurrent Patricia trie.
//!
//! The construction parameters of a trie are the value size, the memory budget, the
//! concurrency level and an optional backing file. The backing file may also be given as a
//! configuration string:
//!
//! ```text
//! ?hugepage=2&chunk_size=128K&vm_explicit_commit=true&file_path=/data/words.trie
//! ```
//!
//! `file_path` must come last; everything after `file_path=` is taken verbatim as the path.

use super::{parse_bool_str, parse_env_bool, parse_env_var, Config, ValidationError};
use crate::error::{PatriciaError, Result};
use crate::fsa::version_sync::ConcurrencyLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Largest value size accepted by `MultiWriteMultiRead` tries.
pub const MAX_VALUE_SIZE_MULTI_WRITER: usize = 128;
/// Lower clamp for a non-negative memory budget.
pub const MIN_MAX_MEM: usize = 512 * 1024;
/// Upper clamp for any memory budget; node ids are 32-bit word indices.
pub const MAX_MAX_MEM: usize = 16 << 30;
/// Minimum size of a file-backed arena.
pub const MIN_FILE_MEM: usize = 2 << 20;
/// Address space reserved by single-thread levels so the arena never has to move.
pub const SINGLE_THREAD_RESERVE: usize = 256 << 20;
/// Smallest accepted thread-cache slab.
pub const MIN_CHUNK_SIZE: usize = 4096;

const MAX_MEM_ALIGN: usize = 16 * 1024;
const VIRTUAL_MEM_ALIGN: usize = 2 << 20;

/// How the anonymous arena region is backed by huge pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HugePageMode {
    /// Regular pages
    None = 0,
    /// Explicit `MAP_HUGETLB` mapping, falling back to regular pages when the pool is empty
    Mmap = 1,
    /// Transparent huge pages requested with `madvise`
    Transparent = 2,
}

impl HugePageMode {
    /// Decode the numeric option value used by configuration strings.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Mmap),
            2 => Some(Self::Transparent),
            _ => None,
        }
    }
}

impl Default for HugePageMode {
    fn default() -> Self {
        Self::None
    }
}

/// Construction parameters of a [`crate::PatriciaTrie`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatriciaTrieConfig {
    /// Bytes stored with every key; 0 turns the trie into a set
    pub value_size: usize,

    /// Memory budget in bytes; negative values reserve virtual memory of that size
    pub max_mem: i64,

    /// Concurrency level, fixed for the lifetime of the trie
    pub concurrency_level: ConcurrencyLevel,

    /// Optional backing file for the arena
    pub file_path: Option<PathBuf>,

    /// Huge page policy for anonymous arenas
    pub hugepage: HugePageMode,

    /// Slab size handed to each multi-writer worker cache
    pub chunk_size: usize,

    /// Touch every page as soon as the arena grows into it
    pub vm_explicit_commit: bool,

    /// Child count at which a bitmap node without zpath becomes a fast node
    pub max_dyna_children: usize,

    /// Lazy-free backlog in bytes that makes a head writer rotate after an insert
    pub lazy_free_rotate_bytes: usize,

    /// Maximum number of nodes reclaimed per insert
    pub reclaim_batch: usize,
}

impl Default for PatriciaTrieConfig {
    fn default() -> Self {
        Self {
            value_size: 0,
            max_mem: 256 << 20,
            concurrency_level: ConcurrencyLevel::default(),
            file_path: None,
            hugepage: HugePageMode::None,
            chunk_size: 64 * 1024,
            vm_explicit_commit: false,
            max_dyna_children: 64,
            lazy_free_rotate_bytes: 32 * 1024,
            reclaim_batch: 8,
        }
    }
}

impl PatriciaTrieConfig {
    /// Configuration with the three mandatory construction parameters.
    pub fn new(value_size: usize, max_mem: i64, concurrency_level: ConcurrencyLevel) -> Self {
        Self {
            value_size,
            max_mem,
            concurrency_level,
            ..Self::default()
        }
    }

    /// Create a new configuration builder.
    pub fn builder() -> PatriciaTrieConfigBuilder {
        PatriciaTrieConfigBuilder::new()
    }

    /// Apply a backing path that is either a plain file path or a `?k=v&...` string.
    pub fn apply_path_string(&mut self, options: &str) -> Result<()> {
        let Some(mut rest) = options.strip_prefix('?') else {
            if !options.is_empty() {
                self.file_path = Some(PathBuf::from(options));
            }
            return Ok(());
        };
        while !rest.is_empty() {
            if let Some(path) = rest.strip_prefix("file_path=") {
                if path.is_empty() {
                    return Err(PatriciaError::configuration("file_path is empty"));
                }
                self.file_path = Some(PathBuf::from(path));
                break;
            }
            let (item, tail) = match rest.find('&') {
                Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                None => (rest, ""),
            };
            let (key, value) = item.split_once('=').ok_or_else(|| {
                PatriciaError::configuration(format!("malformed option '{}'", item))
            })?;
            match key {
                "hugepage" => {
                    self.hugepage = value
                        .parse::<u8>()
                        .ok()
                        .and_then(HugePageMode::from_u8)
                        .ok_or_else(|| {
                            PatriciaError::configuration(format!(
                                "hugepage must be 0, 1 or 2, got '{}'",
                                value
                            ))
                        })?;
                }
                "chunk_size" => self.chunk_size = parse_size(value)?,
                "vm_explicit_commit" => {
                    self.vm_explicit_commit = parse_bool_str(value).ok_or_else(|| {
                        PatriciaError::configuration(format!(
                            "vm_explicit_commit must be a boolean, got '{}'",
                            value
                        ))
                    })?;
                }
                _ => {
                    return Err(PatriciaError::configuration(format!(
                        "unknown option '{}'",
                        key
                    )))
                }
            }
            rest = tail;
        }
        Ok(())
    }

    /// Parse a path string on top of the default configuration.
    pub fn from_path_string(options: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply_path_string(options)?;
        Ok(config)
    }

    /// Size in bytes of the arena region that will be reserved.
    pub fn effective_capacity(&self) -> usize {
        let requested = self.max_mem.unsigned_abs() as usize;
        let capacity = if self.file_path.is_some() {
            align_up(requested.max(MIN_FILE_MEM), MAX_MEM_ALIGN)
        } else if self.max_mem < 0 {
            align_up(requested, VIRTUAL_MEM_ALIGN)
        } else {
            align_up(requested, MAX_MEM_ALIGN).clamp(MIN_MAX_MEM, MAX_MAX_MEM)
        };
        let capacity = if self.concurrency_level.is_single_thread() && self.file_path.is_none() {
            capacity.max(SINGLE_THREAD_RESERVE)
        } else {
            capacity
        };
        capacity.min(MAX_MAX_MEM)
    }
}

fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

fn parse_size(text: &str) -> Result<usize> {
    let (digits, shift) = match text.as_bytes().last() {
        Some(b'K' | b'k') => (&text[..text.len() - 1], 10),
        Some(b'M' | b'm') => (&text[..text.len() - 1], 20),
        Some(b'G' | b'g') => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };
    digits
        .parse::<usize>()
        .map(|n| n << shift)
        .map_err(|_| PatriciaError::configuration(format!("invalid size '{}'", text)))
}

impl Config for PatriciaTrieConfig {
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.value_size % 4 != 0 {
            errors.push(
                ValidationError::new(
                    "value_size",
                    &self.value_size.to_string(),
                    "value size must be a multiple of 4",
                )
                .with_suggestion("0, 4, 8, 16"),
            );
        }
        if self.concurrency_level == ConcurrencyLevel::MultiWriteMultiRead
            && self.value_size > MAX_VALUE_SIZE_MULTI_WRITER
        {
            errors.push(ValidationError::new(
                "value_size",
                &self.value_size.to_string(),
                "multi-writer tries store at most 128 value bytes",
            ));
        }
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size % 4 != 0 {
            errors.push(
                ValidationError::new(
                    "chunk_size",
                    &self.chunk_size.to_string(),
                    "chunk size must be a multiple of 4 and at least 4096",
                )
                .with_suggestion("64K"),
            );
        }
        if !(17..=256).contains(&self.max_dyna_children) {
            errors.push(ValidationError::new(
                "max_dyna_children",
                &self.max_dyna_children.to_string(),
                "promotion threshold must lie in 17..=256",
            ));
        }
        if self.reclaim_batch == 0 {
            errors.push(ValidationError::new(
                "reclaim_batch",
                "0",
                "at least one node must be reclaimable per insert",
            ));
        }
        if self.concurrency_level == ConcurrencyLevel::NoWriteReadOnly && self.file_path.is_none()
        {
            errors.push(ValidationError::new(
                "concurrency_level",
                "NoWriteReadOnly",
                "a read-only trie must be loaded from a file_path",
            ));
        }

        if !errors.is_empty() {
            return Err(PatriciaError::configuration(format!(
                "trie configuration validation failed: {}",
                errors
                    .into_iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ")
            )));
        }
        Ok(())
    }

    fn from_env_with_prefix(prefix: &str) -> Result<Self> {
        let mut config = Self::default();

        config.value_size = parse_env_var(&format!("{}TRIE_VALUE_SIZE", prefix), config.value_size);
        config.max_mem = parse_env_var(&format!("{}TRIE_MAX_MEM", prefix), config.max_mem);
        config.chunk_size = parse_env_var(&format!("{}TRIE_CHUNK_SIZE", prefix), config.chunk_size);
        config.vm_explicit_commit = parse_env_bool(
            &format!("{}TRIE_VM_EXPLICIT_COMMIT", prefix),
            config.vm_explicit_commit,
        );
        config.max_dyna_children = parse_env_var(
            &format!("{}TRIE_MAX_DYNA_CHILDREN", prefix),
            config.max_dyna_children,
        );
        config.lazy_free_rotate_bytes = parse_env_var(
            &format!("{}TRIE_LAZY_FREE_ROTATE_BYTES", prefix),
            config.lazy_free_rotate_bytes,
        );
        config.reclaim_batch =
            parse_env_var(&format!("{}TRIE_RECLAIM_BATCH", prefix), config.reclaim_batch);

        let level: u8 = parse_env_var(
            &format!("{}TRIE_CONCURRENCY_LEVEL", prefix),
            config.concurrency_level as u8,
        );
        config.concurrency_level = ConcurrencyLevel::from_u8(level).ok_or_else(|| {
            PatriciaError::configuration(format!("concurrency level {} out of range", level))
        })?;
        let hugepage: u8 = parse_env_var(&format!("{}TRIE_HUGEPAGE", prefix), 0u8);
        config.hugepage = HugePageMode::from_u8(hugepage).ok_or_else(|| {
            PatriciaError::configuration(format!("hugepage mode {} out of range", hugepage))
        })?;
        if let Ok(path) = std::env::var(format!("{}TRIE_FILE_PATH", prefix)) {
            config.apply_path_string(&path)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn performance_preset() -> Self {
        Self {
            max_mem: 1 << 30,
            concurrency_level: ConcurrencyLevel::MultiWriteMultiRead,
            hugepage: HugePageMode::Transparent,
            chunk_size: 256 * 1024,
            lazy_free_rotate_bytes: 128 * 1024,
            reclaim_batch: 16,
            ..Self::default()
        }
    }

    fn memory_preset() -> Self {
        Self {
            max_mem: MIN_MAX_MEM as i64,
            concurrency_level: ConcurrencyLevel::SingleThreadStrict,
            chunk_size: MIN_CHUNK_SIZE,
            max_dyna_children: 256,
            ..Self::default()
        }
    }

    fn realtime_preset() -> Self {
        Self {
            max_mem: 128 << 20,
            concurrency_level: ConcurrencyLevel::OneWriteMultiRead,
            vm_explicit_commit: true,
            lazy_free_rotate_bytes: 8 * 1024,
            reclaim_batch: 4,
            ..Self::default()
        }
    }

    fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self).map_err(|e| {
            PatriciaError::configuration(format!("failed to serialize trie config: {}", e))
        })?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PatriciaError::configuration(format!("failed to parse trie config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Builder for [`PatriciaTrieConfig`].
#[derive(Debug, Clone)]
pub struct PatriciaTrieConfigBuilder {
    config: PatriciaTrieConfig,
}

impl PatriciaTrieConfigBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: PatriciaTrieConfig::default(),
        }
    }

    /// Set the value size.
    pub fn value_size(mut self, size: usize) -> Self {
        self.config.value_size = size;
        self
    }

    /// Set the memory budget.
    pub fn max_mem(mut self, max_mem: i64) -> Self {
        self.config.max_mem = max_mem;
        self
    }

    /// Set the concurrency level.
    pub fn concurrency_level(mut self, level: ConcurrencyLevel) -> Self {
        self.config.concurrency_level = level;
        self
    }

    /// Set a plain backing file path.
    pub fn file_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.file_path = Some(path.into());
        self
    }

    /// Set the huge page policy.
    pub fn hugepage(mut self, mode: HugePageMode) -> Self {
        self.config.hugepage = mode;
        self
    }

    /// Set the thread-cache slab size.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Enable eager page commit.
    pub fn vm_explicit_commit(mut self, enabled: bool) -> Self {
        self.config.vm_explicit_commit = enabled;
        self
    }

    /// Set the fast node promotion threshold.
    pub fn max_dyna_children(mut self, n: usize) -> Self {
        self.config.max_dyna_children = n;
        self
    }

    /// Set the lazy-free backlog that triggers writer rotation.
    pub fn lazy_free_rotate_bytes(mut self, bytes: usize) -> Self {
        self.config.lazy_free_rotate_bytes = bytes;
        self
    }

    /// Set the per-insert reclamation batch.
    pub fn reclaim_batch(mut self, n: usize) -> Self {
        self.config.reclaim_batch = n;
        self
    }

    /// Apply a `?k=v&...&file_path=` string.
    pub fn path_string(mut self, options: &str) -> Result<Self> {
        self.config.apply_path_string(options)?;
        Ok(self)
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<PatriciaTrieConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for PatriciaTrieConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
