//! Integration tests for the Patricia trie
//!
//! Covers round trips at every writable concurrency level, the fork and split scenarios,
//! statistics, configuration strings, file-backed tries and read-only images.

use cspp_trie::config::{Config, PatriciaTrieConfig};
use cspp_trie::fsa::{with_reader_token, with_writer_token};
use cspp_trie::{
    ConcurrencyLevel, InsertOutcome, PatriciaError, PatriciaTrie, ReaderToken, WriterToken,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

const WRITABLE_LEVELS: [ConcurrencyLevel; 4] = [
    ConcurrencyLevel::SingleThreadStrict,
    ConcurrencyLevel::SingleThreadShared,
    ConcurrencyLevel::OneWriteMultiRead,
    ConcurrencyLevel::MultiWriteMultiRead,
];

// =============================================================================
// TEST DATA GENERATORS
// =============================================================================

fn new_trie(valsize: usize, level: ConcurrencyLevel) -> PatriciaTrie {
    PatriciaTrie::new(PatriciaTrieConfig::new(valsize, 64 << 20, level)).unwrap()
}

fn random_keys(count: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(0..24);
            // a narrow alphabet produces long shared prefixes
            (0..len).map(|_| rng.gen_range(b'a'..=b'f')).collect()
        })
        .collect()
}

fn value_of(i: usize) -> [u8; 8] {
    (i as u64 * 2654435761).to_le_bytes()
}

// =============================================================================
// ROUND TRIP
// =============================================================================

#[test]
fn test_round_trip_all_levels() {
    for level in WRITABLE_LEVELS {
        let trie = new_trie(8, level);
        let keys = random_keys(5000, 7);
        let mut expected = BTreeMap::new();

        let mut w = WriterToken::new(&trie);
        w.acquire().unwrap();
        for (i, key) in keys.iter().enumerate() {
            let fresh = !expected.contains_key(key);
            assert_eq!(trie.insert(key, &value_of(i), &mut w), fresh, "{} {:?}", level, key);
            assert!(w.has_value());
            if fresh {
                expected.insert(key.clone(), value_of(i).to_vec());
            }
        }
        w.release();

        assert_eq!(trie.num_words(), expected.len(), "{}", level);
        let mut r = ReaderToken::new(&trie);
        r.acquire();
        for (key, value) in &expected {
            assert!(trie.lookup(key, &mut r), "{} missing {:?}", level, key);
            assert_eq!(r.value().as_ref(), Some(value));
        }
        for probe in random_keys(2000, 99) {
            assert_eq!(trie.lookup(&probe, &mut r), expected.contains_key(&probe));
        }
        r.release();

        let iterated: Vec<(Vec<u8>, Vec<u8>)> = trie.iter().collect();
        let sorted: Vec<(Vec<u8>, Vec<u8>)> = expected.into_iter().collect();
        assert_eq!(iterated, sorted, "{}", level);
    }
}

#[test]
fn test_binary_keys_with_every_byte() {
    let trie = new_trie(4, ConcurrencyLevel::OneWriteMultiRead);
    with_writer_token(&trie, |w| {
        for a in 0..=255u8 {
            for b in [0u8, 1, 127, 128, 255] {
                trie.insert(&[a, b], &[a, b, 0, 0], w);
            }
        }
    })
    .unwrap();
    assert_eq!(trie.num_words(), 256 * 5);
    for a in 0..=255u8 {
        assert_eq!(trie.get(&[a, 128]), Some(vec![a, 128, 0, 0]));
        assert!(!trie.contains(&[a, 2]));
        assert!(!trie.contains(&[a]));
    }
}

#[test]
fn test_set_semantics_with_zero_value_size() {
    let trie = new_trie(0, ConcurrencyLevel::SingleThreadShared);
    with_writer_token(&trie, |w| {
        for word in ["red", "green", "blue", "re", ""] {
            assert!(trie.insert(word.as_bytes(), &[], w));
        }
        assert!(!trie.insert(b"red", &[], w));
    })
    .unwrap();
    assert!(trie.contains(b""));
    assert!(trie.contains(b"re"));
    assert!(!trie.contains(b"r"));
    assert_eq!(trie.get(b"blue"), Some(Vec::new()));
}

// =============================================================================
// FORK / SPLIT SCENARIOS
// =============================================================================

#[test]
fn test_fork_scenario() {
    for level in WRITABLE_LEVELS {
        let trie = new_trie(4, level);
        with_writer_token(&trie, |w| {
            assert!(trie.insert(b"apple", &1u32.to_le_bytes(), w));
            assert!(trie.insert(b"apply", &2u32.to_le_bytes(), w));
        })
        .unwrap();
        assert_eq!(trie.num_words(), 2);
        assert_eq!(trie.stats().n_fork, 1);
        assert_eq!(trie.get(b"apple"), Some(1u32.to_le_bytes().to_vec()));
        assert_eq!(trie.get(b"apply"), Some(2u32.to_le_bytes().to_vec()));
        assert!(!trie.contains(b"appl"));
    }
}

#[test]
fn test_split_scenario() {
    for level in WRITABLE_LEVELS {
        let trie = new_trie(4, level);
        with_writer_token(&trie, |w| {
            assert!(trie.insert(b"hello", &1u32.to_le_bytes(), w));
            assert!(trie.insert(b"he", &2u32.to_le_bytes(), w));
        })
        .unwrap();
        assert_eq!(trie.stats().n_split, 1);
        assert!(trie.contains(b"he"));
        assert!(trie.contains(b"hello"));
        assert!(!trie.contains(b"hel"));
    }
}

#[test]
fn test_mark_final_on_branch() {
    let trie = new_trie(4, ConcurrencyLevel::OneWriteMultiRead);
    with_writer_token(&trie, |w| {
        trie.insert(b"carpet", &1u32.to_le_bytes(), w);
        trie.insert(b"carton", &2u32.to_le_bytes(), w);
        assert!(trie.insert(b"car", &3u32.to_le_bytes(), w));
    })
    .unwrap();
    let stats = trie.stats();
    assert_eq!(stats.n_fork, 1);
    assert_eq!(stats.n_mark_final, 1);
    assert_eq!(trie.get(b"car"), Some(3u32.to_le_bytes().to_vec()));
    assert_eq!(trie.get(b"carpet"), Some(1u32.to_le_bytes().to_vec()));
}

#[test]
fn test_stats_track_structure() {
    let trie = new_trie(4, ConcurrencyLevel::SingleThreadStrict);
    with_writer_token(&trie, |w| {
        for key in ["abcd", "abce", "ab", "x"] {
            trie.insert(key.as_bytes(), &[0; 4], w);
        }
    })
    .unwrap();
    let stats = trie.stats();
    assert_eq!(stats.n_words, 4);
    assert_eq!(stats.max_word_len, 4);
    assert_eq!(stats.n_fork, 1);
    assert_eq!(stats.n_split, 1);
    // "abcd" and "x" hang off the root
    assert_eq!(stats.n_add_child, 2);
    let mem = trie.mem_stat();
    assert!(mem.used_size > 0 && mem.used_size <= mem.capacity);
    assert_eq!(mem.token_qlen, 0);
}

// =============================================================================
// INSERT OUTCOMES
// =============================================================================

#[test]
fn test_try_insert_outcomes() {
    let trie = new_trie(4, ConcurrencyLevel::MultiWriteMultiRead);
    let mut w = WriterToken::new(&trie);
    w.acquire().unwrap();
    assert_eq!(trie.try_insert(b"k", &[1; 4], &mut w).unwrap(), InsertOutcome::Inserted);
    assert_eq!(trie.try_insert(b"k", &[2; 4], &mut w).unwrap(), InsertOutcome::AlreadyExists);
    assert_eq!(w.value(), Some(vec![1; 4]));
    assert!(matches!(
        trie.try_insert(b"k", &[1; 8], &mut w),
        Err(PatriciaError::InvalidData { .. })
    ));
}

#[test]
fn test_allocation_failure_is_recoverable() {
    let config = PatriciaTrieConfig::new(16, 512 * 1024, ConcurrencyLevel::MultiWriteMultiRead);
    let trie = PatriciaTrie::new(config).unwrap();
    let mut w = WriterToken::new(&trie);
    w.acquire().unwrap();
    let mut stored = 0usize;
    loop {
        let key = format!("{:010}-{}", stored, "payload".repeat(8));
        match trie.try_insert(key.as_bytes(), &[7; 16], &mut w).unwrap() {
            InsertOutcome::Inserted => stored += 1,
            InsertOutcome::AllocFailed => {
                assert!(!w.has_value());
                assert!(!trie.contains(key.as_bytes()));
                break;
            }
            InsertOutcome::AlreadyExists => unreachable!(),
        }
    }
    w.release();
    assert!(stored > 100);
    assert_eq!(trie.num_words(), stored);
    assert!(trie.contains(format!("{:010}-{}", 0, "payload".repeat(8)).as_bytes()));
}

#[test]
#[should_panic(expected = "insert rejected")]
fn test_insert_panics_on_readonly_trie() {
    let trie = new_trie(4, ConcurrencyLevel::OneWriteMultiRead);
    let mut w = WriterToken::new(&trie);
    w.acquire().unwrap();
    trie.insert(b"a", &[0; 4], &mut w);
    w.release();
    trie.set_readonly().unwrap();
    let mut w = WriterToken::new(&trie);
    let _ = w.acquire();
    trie.insert(b"b", &[0; 4], &mut w);
}

// =============================================================================
// CONFIGURATION
// =============================================================================

#[test]
fn test_config_string_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("words.trie");
    let options = format!("?hugepage=0&chunk_size=8K&vm_explicit_commit=true&file_path={}", file.display());
    let mut config = PatriciaTrieConfig::from_path_string(&options).unwrap();
    config.value_size = 4;
    config.concurrency_level = ConcurrencyLevel::OneWriteMultiRead;
    assert_eq!(config.chunk_size, 8 * 1024);
    assert!(config.vm_explicit_commit);
    assert_eq!(config.file_path.as_deref(), Some(file.as_path()));

    let json = dir.path().join("config.json");
    config.save_to_file(&json).unwrap();
    assert_eq!(PatriciaTrieConfig::load_from_file(&json).unwrap(), config);

    assert!(PatriciaTrieConfig::from_path_string("?bogus=1&file_path=x").is_err());
}

// =============================================================================
// PERSISTENCE
// =============================================================================

#[test]
fn test_file_backed_trie_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("words.trie");
    let keys = random_keys(3000, 3);
    {
        let config = PatriciaTrieConfig::builder()
            .value_size(8)
            .max_mem(8 << 20)
            .concurrency_level(ConcurrencyLevel::OneWriteMultiRead)
            .file_path(&path)
            .build()
            .unwrap();
        let trie = PatriciaTrie::new(config).unwrap();
        with_writer_token(&trie, |w| {
            for (i, key) in keys.iter().enumerate() {
                trie.insert(key, &value_of(i), w);
            }
        })
        .unwrap();
        trie.alloc_appdata(5).unwrap();
        trie.write_appdata(0, b"dict!").unwrap();
        trie.set_readonly().unwrap();
        let file_len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(file_len, 256 + trie.mem_stat().used_size);
    }

    let config = PatriciaTrieConfig {
        concurrency_level: ConcurrencyLevel::NoWriteReadOnly,
        file_path: Some(path.clone()),
        ..PatriciaTrieConfig::default()
    };
    let loaded = PatriciaTrie::new(config).unwrap();
    assert!(loaded.is_readonly());
    assert_eq!(loaded.value_size(), 8);
    assert_eq!(loaded.appdata(), Some(b"dict!".to_vec()));

    let mut first = BTreeMap::new();
    for (i, key) in keys.iter().enumerate() {
        first.entry(key.clone()).or_insert_with(|| value_of(i).to_vec());
    }
    assert_eq!(loaded.num_words(), first.len());
    with_reader_token(&loaded, |r| {
        for (key, value) in &first {
            assert!(loaded.lookup(key, r));
            assert_eq!(r.value().as_ref(), Some(value));
        }
    });
    assert_eq!(loaded.iter().count(), first.len());
}

#[test]
fn test_dropped_file_trie_is_loadable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropped.trie");
    {
        let config = PatriciaTrieConfig {
            value_size: 4,
            max_mem: 4 << 20,
            concurrency_level: ConcurrencyLevel::SingleThreadShared,
            file_path: Some(path.clone()),
            ..PatriciaTrieConfig::default()
        };
        let trie = PatriciaTrie::new(config).unwrap();
        with_writer_token(&trie, |w| {
            trie.insert(b"persist", &[9; 4], w);
        })
        .unwrap();
    }
    let loaded = PatriciaTrie::load_image(&path).unwrap();
    assert_eq!(loaded.get(b"persist"), Some(vec![9; 4]));
}

#[test]
fn test_saved_image_of_concurrent_trie() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mwmr.img");
    let trie = new_trie(4, ConcurrencyLevel::MultiWriteMultiRead);
    std::thread::scope(|s| {
        for t in 0..4u32 {
            let trie = &trie;
            s.spawn(move || {
                with_writer_token(trie, |w| {
                    for i in 0..500u32 {
                        trie.insert(format!("t{}/{}", t, i).as_bytes(), &i.to_le_bytes(), w);
                    }
                })
                .unwrap();
            });
        }
    });
    trie.save_image(&path).unwrap();
    let loaded = PatriciaTrie::load_image(&path).unwrap();
    assert_eq!(loaded.num_words(), 2000);
    assert_eq!(loaded.get(b"t3/499"), Some(499u32.to_le_bytes().to_vec()));
    let a: Vec<_> = trie.iter().collect();
    let b: Vec<_> = loaded.iter().collect();
    assert_eq!(a, b);
}

#[test]
fn test_load_rejects_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage.img");
    std::fs::write(&path, vec![0xAB; 4096]).unwrap();
    assert!(matches!(
        PatriciaTrie::load_image(&path),
        Err(PatriciaError::CorruptedImage { .. })
    ));
    assert!(PatriciaTrie::load_image(dir.path().join("missing.img")).is_err());
}
