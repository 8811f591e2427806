//! Point lookup
//!
//! Lookups take no locks. Each step matches the node's compressed path, then follows the
//! edge for the next key byte through the shape-specific child search of the node codec.
//! The reader token only has to be acquired, which keeps every node it can reach alive.

use crate::fsa::node::{NodeInfo, ROOT};
use crate::fsa::patricia_trie::PatriciaTrie;
use crate::fsa::token::{with_reader_token, ReaderToken};

impl PatriciaTrie {
    /// Look up `key`; on success the token's value location points at the stored value.
    ///
    /// # Panics
    ///
    /// Panics if the token is not acquired on this trie.
    pub fn lookup(&self, key: &[u8], token: &mut ReaderToken<'_>) -> bool {
        token.assert_usable(self);
        token.value_pos = self.find_final(key).map(|node| node.value_offset());
        token.value_pos.is_some()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        with_reader_token(self, |token| {
            if self.lookup(key, token) {
                token.value()
            } else {
                None
            }
        })
    }

    /// Whether `key` is stored.
    pub fn contains(&self, key: &[u8]) -> bool {
        with_reader_token(self, |token| self.lookup(key, token))
    }

    /// The final node for `key`, if the key is stored.
    pub(crate) fn find_final(&self, key: &[u8]) -> Option<NodeInfo> {
        let arena = self.arena();
        let mut curr = ROOT;
        let mut pos = 0;
        loop {
            let info = NodeInfo::decode(arena, curr);
            if info.zlen > 0 {
                if key.len() - pos < info.zlen {
                    return None;
                }
                for i in 0..info.zlen {
                    if key[pos + i] != info.zpath_byte(arena, i) {
                        return None;
                    }
                }
                pos += info.zlen;
            }
            if pos == key.len() {
                return info.is_final().then_some(info);
            }
            let slot = info.find_child(arena, key[pos]).ok()?;
            curr = arena.load_acquire(slot);
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::PatriciaTrieConfig;
    use crate::{ConcurrencyLevel, PatriciaTrie, ReaderToken, WriterToken};

    #[test]
    fn test_lookup_sets_value_location() {
        let trie = PatriciaTrie::new(PatriciaTrieConfig::new(8, 1 << 20, ConcurrencyLevel::OneWriteMultiRead)).unwrap();
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        for (i, key) in ["car", "cart", "carbon", "dog"].iter().enumerate() {
            assert!(trie.insert(key.as_bytes(), &(i as u64).to_le_bytes(), &mut w));
        }
        w.release();

        let mut r = ReaderToken::new(&trie);
        r.acquire();
        assert!(trie.lookup(b"cart", &mut r));
        assert_eq!(r.value(), Some(1u64.to_le_bytes().to_vec()));
        assert!(!trie.lookup(b"ca", &mut r));
        assert_eq!(r.value(), None);
        assert!(!trie.lookup(b"carts", &mut r));
        assert!(!trie.lookup(b"", &mut r));
        assert!(trie.lookup(b"dog", &mut r));
    }

    #[test]
    fn test_set_semantics() {
        let trie = PatriciaTrie::new(PatriciaTrieConfig::new(0, 1 << 20, ConcurrencyLevel::SingleThreadStrict)).unwrap();
        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        assert!(trie.insert(b"alpha", &[], &mut w));
        assert!(!trie.insert(b"alpha", &[], &mut w));
        assert_eq!(trie.get(b"alpha"), Some(Vec::new()));
        assert_eq!(trie.get(b"beta"), None);
    }

    #[test]
    #[should_panic(expected = "acquired before use")]
    fn test_lookup_requires_acquired_token() {
        let trie = PatriciaTrie::new(PatriciaTrieConfig::new(4, 1 << 20, ConcurrencyLevel::OneWriteMultiRead)).unwrap();
        let mut r = ReaderToken::new(&trie);
        trie.lookup(b"x", &mut r);
    }
}
