//! Concurrent Patricia trie
//!
//! This module provides the trie itself and the machinery it is built from: the node codec,
//! the version queue that keeps retired nodes alive for in-flight readers, the per-writer
//! lazy-free lists, the insert engine with its multi-writer CAS protocol, lookups, ordered
//! iteration and the persisted image header.

pub mod image;
pub mod insert;
pub mod iterator;
pub mod lazy_free;
pub mod lookup;
pub mod node;
pub mod patricia_trie;
pub mod token;
pub mod version_sync;

// Re-export core types
pub use image::ImageHeader;
pub use insert::InsertOutcome;
pub use iterator::{Iter, PatriciaIter};
pub use lazy_free::{LazyFreeList, LazyFreeStats};
pub use patricia_trie::{MemStat, PatriciaTrie, TrieStats};
pub use token::{with_reader_token, with_writer_token, RaceStats, ReaderToken, WriterToken};
pub use version_sync::{ConcurrencyLevel, TokenState};
