//! # cspp-trie: Concurrent Patricia Trie Storage Engine
//!
//! This crate provides an in-memory (optionally file-backed) Patricia trie mapping byte-string
//! keys to fixed-size values, designed for many concurrent readers and, at the highest
//! concurrency level, many concurrent writers.
//!
//! ## Key Features
//!
//! - **Compact nodes**: five physical node shapes chosen by child count, with compressed paths
//! - **Graduated concurrency**: from single-thread strict to multi-writer multi-reader
//! - **Safe reclamation**: retired nodes are freed only once no reader token can reach them
//! - **Ordered iteration**: bidirectional cursor with lower-bound and longest-prefix seeks
//! - **Persistence**: file-backed arenas and read-only images mapped without copying
//!
//! ## Quick Start
//!
//! ```rust
//! use cspp_trie::{ConcurrencyLevel, PatriciaTrie, PatriciaTrieConfig, ReaderToken, WriterToken};
//! # fn main() -> cspp_trie::Result<()> {
//! let trie = PatriciaTrie::new(PatriciaTrieConfig::new(4, 64 << 20, ConcurrencyLevel::OneWriteMultiRead))?;
//!
//! let mut writer = WriterToken::new(&trie);
//! writer.acquire()?;
//! assert!(trie.insert(b"apple", &1u32.to_le_bytes(), &mut writer));
//! assert!(trie.insert(b"apply", &2u32.to_le_bytes(), &mut writer));
//! assert!(!trie.insert(b"apple", &3u32.to_le_bytes(), &mut writer));
//! writer.release();
//!
//! let mut reader = ReaderToken::new(&trie);
//! reader.acquire();
//! assert!(trie.lookup(b"apply", &mut reader));
//! assert_eq!(reader.value(), Some(2u32.to_le_bytes().to_vec()));
//! assert!(!trie.lookup(b"appl", &mut reader));
//! reader.release();
//!
//! let keys: Vec<Vec<u8>> = trie.iter().map(|(k, _)| k).collect();
//! assert_eq!(keys, vec![b"apple".to_vec(), b"apply".to_vec()]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod fsa;
pub mod memory;

// Re-export core types
pub use config::{HugePageMode, PatriciaTrieConfig};
pub use error::{PatriciaError, Result};
pub use fsa::{
    ConcurrencyLevel, InsertOutcome, MemStat, PatriciaIter, PatriciaTrie, RaceStats,
    ReaderToken, TrieStats, WriterToken,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
