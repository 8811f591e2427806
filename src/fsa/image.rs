//! Persisted trie image header
//!
//! An image is a 256-byte header followed by the used part of the arena:
//!
//! ```text
//! offset  size  field
//!      0     8  magic "CSPPTRIE"
//!      8     4  format version
//!     12     4  header size (256)
//!     16     4  arena word size (4)
//!     20     4  value size
//!     24     8  number of arena blocks (1)
//!     32     8  block offset
//!     40     8  block length
//!     48     8  n_nodes
//!     56     8  n_words
//!     64     8  max_word_len
//!     72     8  total_zpath_len
//!     80     8  frag_size
//!     88     8  appdata offset inside the block (u64::MAX when absent)
//!     96     8  appdata length
//!    104     4  word order probe
//! ```
//!
//! Header fields are little-endian. Arena words are stored in the writer's native order, so
//! the word order probe rejects images produced on a machine of the other endianness.

use crate::error::{PatriciaError, Result};

/// Bytes reserved for the header in front of the arena.
pub const HEADER_SIZE: usize = 256;
/// Image magic.
pub const MAGIC: &[u8; 8] = b"CSPPTRIE";
/// Current image format version.
pub const FORMAT_VERSION: u32 = 1;
/// Sentinel for "no application data".
pub const NO_APPDATA: u64 = u64::MAX;

const WORD_SIZE: u32 = 4;

fn word_order_probe() -> u32 {
    u32::from_ne_bytes([1, 2, 3, 4])
}

/// Decoded image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Format version
    pub version: u32,
    /// Value size of the trie
    pub valsize: u32,
    /// Number of arena blocks
    pub num_blocks: u64,
    /// File offset of the arena
    pub block_offset: u64,
    /// Used arena bytes
    pub block_length: u64,
    /// Node count
    pub n_nodes: u64,
    /// Key count
    pub n_words: u64,
    /// Longest key
    pub max_word_len: u64,
    /// Sum of compressed path lengths
    pub total_zpath_len: u64,
    /// Bytes held in free lists when the image was written
    pub frag_size: u64,
    /// Arena byte offset of the application data, or [`NO_APPDATA`]
    pub appdata_offset: u64,
    /// Length of the application data
    pub appdata_length: u64,
    word_order: u32,
}

impl ImageHeader {
    /// Header for an arena of `block_length` bytes placed right after the header.
    pub fn new(valsize: usize, block_length: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            valsize: valsize as u32,
            num_blocks: 1,
            block_offset: HEADER_SIZE as u64,
            block_length: block_length as u64,
            n_nodes: 0,
            n_words: 0,
            max_word_len: 0,
            total_zpath_len: 0,
            frag_size: 0,
            appdata_offset: NO_APPDATA,
            appdata_length: 0,
            word_order: word_order_probe(),
        }
    }

    /// Serialize into the fixed 256-byte layout.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&WORD_SIZE.to_le_bytes());
        buf[20..24].copy_from_slice(&self.valsize.to_le_bytes());
        let fields = [
            self.num_blocks,
            self.block_offset,
            self.block_length,
            self.n_nodes,
            self.n_words,
            self.max_word_len,
            self.total_zpath_len,
            self.frag_size,
            self.appdata_offset,
            self.appdata_length,
        ];
        for (i, field) in fields.iter().enumerate() {
            let at = 24 + 8 * i;
            buf[at..at + 8].copy_from_slice(&field.to_le_bytes());
        }
        buf[104..108].copy_from_slice(&self.word_order.to_le_bytes());
        buf
    }

    /// Parse a header; only the fixed fields are checked here.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(PatriciaError::corrupted_image(format!(
                "image has {} bytes, header needs {}",
                bytes.len(),
                HEADER_SIZE
            )));
        }
        if &bytes[0..8] != MAGIC {
            return Err(PatriciaError::corrupted_image("bad magic"));
        }
        let u32_at = |at: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[at..at + 4]);
            u32::from_le_bytes(b)
        };
        let u64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[at..at + 8]);
            u64::from_le_bytes(b)
        };
        let header_size = u32_at(12);
        if header_size as usize != HEADER_SIZE {
            return Err(PatriciaError::corrupted_image(format!(
                "header size {} != {}",
                header_size, HEADER_SIZE
            )));
        }
        let word_size = u32_at(16);
        if word_size != WORD_SIZE {
            return Err(PatriciaError::corrupted_image(format!(
                "arena word size {} != {}",
                word_size, WORD_SIZE
            )));
        }
        Ok(Self {
            version: u32_at(8),
            valsize: u32_at(20),
            num_blocks: u64_at(24),
            block_offset: u64_at(32),
            block_length: u64_at(40),
            n_nodes: u64_at(48),
            n_words: u64_at(56),
            max_word_len: u64_at(64),
            total_zpath_len: u64_at(72),
            frag_size: u64_at(80),
            appdata_offset: u64_at(88),
            appdata_length: u64_at(96),
            word_order: u32_at(104),
        })
    }

    /// Check the header against an image file of `file_len` bytes.
    pub fn validate(&self, file_len: usize) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(PatriciaError::corrupted_image(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        if self.word_order != word_order_probe() {
            return Err(PatriciaError::corrupted_image(
                "image was written with a different byte order",
            ));
        }
        if self.num_blocks != 1 {
            return Err(PatriciaError::corrupted_image(format!(
                "expected 1 arena block, found {}",
                self.num_blocks
            )));
        }
        if self.block_offset != HEADER_SIZE as u64 {
            return Err(PatriciaError::corrupted_image(format!(
                "arena block starts at {}, expected {}",
                self.block_offset, HEADER_SIZE
            )));
        }
        if self.block_length % 4 != 0 || self.valsize % 4 != 0 {
            return Err(PatriciaError::corrupted_image(format!(
                "block length {} and value size {} must be multiples of 4",
                self.block_length, self.valsize
            )));
        }
        let end = self.block_offset.checked_add(self.block_length);
        if end.map_or(true, |end| end > file_len as u64) {
            return Err(PatriciaError::corrupted_image(format!(
                "arena block [{}, +{}) exceeds file length {}",
                self.block_offset, self.block_length, file_len
            )));
        }
        if self.appdata_offset != NO_APPDATA {
            let end = self.appdata_offset.checked_add(self.appdata_length);
            if self.appdata_offset % 4 != 0 || end.map_or(true, |end| end > self.block_length) {
                return Err(PatriciaError::corrupted_image(format!(
                    "appdata [{}, +{}) lies outside the arena",
                    self.appdata_offset, self.appdata_length
                )));
            }
        }
        Ok(())
    }
}
