//! End-to-end tests for the repository: persistence, dedup, reference
//! counting, similarity links and the action log.
//!
//! Run with:
//!   cargo test --test test_repository

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use memex::engine::{ActionType, SIMILAR_LINK, TransactionLog};
use memex::{EngineConfig, Hash256, Link, Meta, Repository, StoreError, Value};

// ── helpers ──────────────────────────────────────────────────────────────────

fn scratch() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().expect("tempdir");
    let path = tmp.path().join("t.mx");
    (tmp, path)
}

fn create(path: &PathBuf) -> Repository {
    Repository::create(path, EngineConfig::default()).expect("create store")
}

fn reopen(path: &PathBuf) -> Repository {
    Repository::open(path, EngineConfig::default()).expect("open store")
}

/// Deterministic xorshift64 byte stream.
fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

fn similar_links(links: &[Link]) -> Vec<&Link> {
    links.iter().filter(|l| l.kind == SIMILAR_LINK).collect()
}

// ── scenarios ────────────────────────────────────────────────────────────────

#[test]
fn fox_and_dog_scenario_survives_reopen() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let id1 = repo
        .add_node(b"The quick brown fox jumps over the lazy dog.", "file", Meta::new())
        .unwrap();
    let id2 = repo
        .add_node(b"The quick brown fox jumps over the lazy cat.", "file", Meta::new())
        .unwrap();

    let links = repo.get_links(&id1).unwrap();
    let similar = similar_links(&links);
    assert_eq!(similar.len(), 1);
    let link = similar[0];
    assert_eq!((link.source, link.target), (id2, id1));
    let score = link.meta.get("similarity").and_then(Value::as_f64).unwrap();
    assert!(score >= 0.8, "similarity {score}");
    assert_eq!(link.meta.get("shared").and_then(Value::as_i64), Some(8));

    let before = repo.get_node(&id1).unwrap();
    repo.close().unwrap();

    let repo = reopen(&path);
    let after = repo.get_node(&id1).unwrap();
    assert_eq!(after, before);
    assert_eq!(
        repo.get_content(&id1).unwrap(),
        b"The quick brown fox jumps over the lazy dog."
    );
    assert_eq!(similar_links(&repo.get_links(&id2).unwrap()).len(), 1);
    assert_eq!(repo.list(), vec![id1, id2]);
    assert!(repo.verify_history().unwrap());
}

#[test]
fn one_megabyte_of_noise_chunks_and_round_trips() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let data = pseudo_random(1 << 20, 0x9E37_79B9_7F4A_7C15);
    let id = repo.add_node(&data, "blob", Meta::new()).unwrap();

    let node = repo.get_node(&id).unwrap();
    let manifest = node.manifest().unwrap();
    assert!(manifest.len() >= 100, "only {} chunks", manifest.len());
    for hash in &manifest {
        let chunk = repo.get_chunk(hash).unwrap();
        assert!(
            (32..=64 * 1024).contains(&chunk.len()),
            "chunk of {} bytes",
            chunk.len()
        );
    }
    assert_eq!(repo.get_content(&id).unwrap(), data);
    assert_eq!(repo.reconstruct_content(&Hash256::digest(&data)).unwrap(), data);
}

#[test]
fn identical_content_is_stored_once() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let content = b"Deduplicated words stay deduplicated, always.";
    let a = repo.add_node(content, "file", Meta::new()).unwrap();
    let blobs = repo.stats().store.live_blobs;
    let bytes = repo.stats().chunks.stored_bytes;

    let b = repo.add_node(content, "file", Meta::new()).unwrap();
    let stats = repo.stats();
    assert_eq!(stats.store.live_blobs, blobs);
    assert_eq!(stats.chunks.stored_bytes, bytes);

    let ma = repo.get_node(&a).unwrap().manifest().unwrap();
    let mb = repo.get_node(&b).unwrap().manifest().unwrap();
    assert_eq!(ma, mb);
    assert!(ma.iter().all(|h| repo.chunk_ref_count(h) == 2));
}

#[test]
fn shared_chunk_outlives_first_owner() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let a = repo.add_node(b"shared alpha", "file", Meta::new()).unwrap();
    let b = repo.add_node(b"shared beta", "file", Meta::new()).unwrap();
    let x = Hash256::digest(b"shared ");
    assert_eq!(repo.chunk_ref_count(&x), 2);

    repo.delete_node(&a).unwrap();
    assert_eq!(repo.get_chunk(&x).unwrap(), b"shared ");
    assert_eq!(repo.get_content(&b).unwrap(), b"shared beta");

    repo.delete_node(&b).unwrap();
    assert!(matches!(repo.get_chunk(&x), Err(StoreError::ChunkNotFound(_))));
    assert_eq!(repo.stats().chunks.chunks, 0);
}

#[test]
fn shared_chunks_survive_reopen_after_partial_delete() {
    let (_tmp, path) = scratch();
    let (a, b) = {
        let repo = create(&path);
        let a = repo.add_node(b"common prefix one", "file", Meta::new()).unwrap();
        let b = repo.add_node(b"common prefix two", "file", Meta::new()).unwrap();
        repo.delete_node(&a).unwrap();
        repo.close().unwrap();
        (a, b)
    };
    let repo = reopen(&path);
    assert!(matches!(repo.get_node(&a), Err(StoreError::NotFound(_))));
    assert_eq!(repo.get_content(&b).unwrap(), b"common prefix two");
    assert_eq!(repo.chunk_ref_count(&Hash256::digest(b"common ")), 1);
    assert_eq!(repo.chunk_ref_count(&Hash256::digest(b"one")), 0);
}

#[test]
fn crash_after_delete_keeps_counts_consistent() {
    let (_tmp, path) = scratch();
    let (a, b) = {
        let repo = create(&path);
        let a = repo.add_node(b"shared alpha", "note", Meta::new()).unwrap();
        let b = repo.add_node(b"shared beta", "note", Meta::new()).unwrap();
        repo.sync().unwrap();
        repo.delete_node(&a).unwrap();
        // Crash: no flush, no drop.
        std::mem::forget(repo);
        (a, b)
    };

    // The unflushed delete is lost as a whole, counts included.
    let repo = reopen(&path);
    assert_eq!(repo.get_content(&a).unwrap(), b"shared alpha");
    assert_eq!(repo.chunk_ref_count(&Hash256::digest(b"shared ")), 2);

    repo.delete_node(&b).unwrap();
    assert_eq!(repo.get_content(&a).unwrap(), b"shared alpha");
    repo.delete_node(&a).unwrap();
    assert_eq!(repo.stats().chunks.chunks, 0);
}

#[test]
fn one_word_in_a_hundred_still_links() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let words: Vec<String> = (0..100).map(|i| format!("w{i}")).collect();
    let original = words.join(" ");
    let mut changed_words = words.clone();
    changed_words[50] = "changed".into();
    let changed = changed_words.join(" ");

    let a = repo.add_node(original.as_bytes(), "file", Meta::new()).unwrap();
    let b = repo.add_node(changed.as_bytes(), "file", Meta::new()).unwrap();

    let links = repo.get_links(&b).unwrap();
    let similar = similar_links(&links);
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].target, a);
    let score = similar[0].meta.get("similarity").and_then(Value::as_f64).unwrap();
    assert!(score >= 0.3, "similarity {score}");
}

#[test]
fn disjoint_documents_are_not_linked() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let a = repo.add_node(b"alpha beta gamma delta", "file", Meta::new()).unwrap();
    let b = repo.add_node(b"one two three four", "file", Meta::new()).unwrap();
    assert!(repo.get_links(&a).unwrap().is_empty());
    assert!(repo.get_links(&b).unwrap().is_empty());
}

#[test]
fn similarity_can_be_disabled() {
    let (_tmp, path) = scratch();
    let mut config = EngineConfig::default();
    config.similarity.enabled = false;
    let repo = Repository::create(&path, config).unwrap();
    let a = repo.add_node(b"same same words", "file", Meta::new()).unwrap();
    repo.add_node(b"same same words", "file", Meta::new()).unwrap();
    assert!(repo.get_links(&a).unwrap().is_empty());
}

#[test]
fn update_recomputes_similar_links() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let a = repo.add_node(b"red green blue", "file", Meta::new()).unwrap();
    let b = repo.add_node(b"red green yellow", "file", Meta::new()).unwrap();
    assert_eq!(similar_links(&repo.get_links(&a).unwrap()).len(), 1);

    repo.update_node(&b, b"cats and dogs", None).unwrap();
    assert!(similar_links(&repo.get_links(&a).unwrap()).is_empty());

    repo.update_node(&b, b"red green blue", None).unwrap();
    let links = repo.get_links(&a).unwrap();
    let similar = similar_links(&links);
    assert_eq!(similar.len(), 1);
    assert_eq!(similar[0].meta.get("similarity"), Some(&Value::Float(1.0)));
}

#[test]
fn user_links_survive_reopen() {
    let (_tmp, path) = scratch();
    let (a, b) = {
        let repo = create(&path);
        let a = repo.add_node(b"source doc", "file", Meta::new()).unwrap();
        let b = repo.add_node(b"target text", "file", Meta::new()).unwrap();
        let mut meta = Meta::new();
        meta.insert("order".into(), Value::Int(1));
        repo.add_link(&a, &b, "cites", meta).unwrap();
        repo.close().unwrap();
        (a, b)
    };
    let repo = reopen(&path);
    let links = repo.get_links(&a).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].target, b);
    assert_eq!(links[0].kind, "cites");

    repo.delete_link(&a, &b, "cites").unwrap();
    assert!(repo.get_links(&b).unwrap().is_empty());
}

#[test]
fn history_records_each_mutation_in_order() {
    let (_tmp, path) = scratch();
    let repo = create(&path);
    let a = repo.add_node(b"first", "file", Meta::new()).unwrap();
    let b = repo.add_node(b"second", "file", Meta::new()).unwrap();
    repo.add_link(&a, &b, "next", Meta::new()).unwrap();
    repo.delete_link(&a, &b, "next").unwrap();
    repo.update_node(&a, b"first again", None).unwrap();
    repo.delete_node(&b).unwrap();

    let kinds: Vec<ActionType> = repo.history().unwrap().iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            ActionType::AddNode,
            ActionType::AddNode,
            ActionType::AddLink,
            ActionType::DeleteLink,
            ActionType::UpdateNode,
            ActionType::DeleteNode,
        ]
    );
    assert!(repo.verify_history().unwrap());
    assert!(repo.verify_state().unwrap());
}

#[test]
fn tampered_log_fails_verification() {
    let (_tmp, path) = scratch();
    {
        let repo = create(&path);
        for text in ["one", "two", "three"] {
            repo.add_node(text.as_bytes(), "file", Meta::new()).unwrap();
        }
        assert!(repo.verify_history().unwrap());
        repo.close().unwrap();
    }

    let log_path = TransactionLog::path_for(&path);
    let mut data = std::fs::read(&log_path).unwrap();
    let needle = b"\"prev_hash\":\"";
    let first = data.windows(needle.len()).position(|w| w == needle).unwrap();
    let second = first
        + 1
        + data[first + 1..]
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
    let at = second + needle.len();
    data[at] = if data[at] == b'0' { b'1' } else { b'0' };
    std::fs::write(&log_path, &data).unwrap();

    let repo = reopen(&path);
    assert!(!repo.verify_history().unwrap());
    assert!(matches!(
        repo.check_history(),
        Err(StoreError::ChainBroken { index: 1 })
    ));
}

#[test]
fn foreign_and_truncated_files_are_rejected() {
    let (tmp, path) = scratch();
    std::fs::write(&path, vec![0x42u8; 512]).unwrap();
    assert!(matches!(
        Repository::open(&path, EngineConfig::default()),
        Err(StoreError::MagicMismatch { .. })
    ));

    let short = tmp.path().join("short.mx");
    std::fs::write(&short, b"MEMEX01").unwrap();
    assert!(matches!(
        Repository::open(&short, EngineConfig::default()),
        Err(StoreError::InvalidFormat(_))
    ));
}

#[test]
fn open_or_create_then_reopen() {
    let (_tmp, path) = scratch();
    let id = {
        let repo = Repository::open_or_create(&path, EngineConfig::default()).unwrap();
        let id = repo.add_node(b"persist me", "note", Meta::new()).unwrap();
        repo.close().unwrap();
        id
    };
    let repo = Repository::open_or_create(&path, EngineConfig::default()).unwrap();
    assert_eq!(repo.get_content(&id).unwrap(), b"persist me");
    assert_eq!(repo.stats().actions, 1);
}

#[test]
fn drop_without_close_flushes_indexes() {
    let (_tmp, path) = scratch();
    let id = {
        let repo = create(&path);
        repo.add_node(b"flushed on drop", "note", Meta::new()).unwrap()
    };
    let repo = reopen(&path);
    assert_eq!(repo.get_content(&id).unwrap(), b"flushed on drop");
}

#[test]
fn concurrent_writers_keep_the_chain_intact() {
    let (_tmp, path) = scratch();
    let repo = Arc::new(create(&path));
    std::thread::scope(|s| {
        for t in 0..4 {
            let repo = Arc::clone(&repo);
            s.spawn(move || {
                for i in 0..10 {
                    let text = format!("thread {t} item {i} payload");
                    let id = repo.add_node(text.as_bytes(), "file", Meta::new()).unwrap();
                    assert_eq!(repo.get_content(&id).unwrap(), text.as_bytes());
                }
            });
        }
    });
    assert_eq!(repo.list().len(), 40);
    assert_eq!(repo.stats().actions, 40);
    assert!(repo.verify_history().unwrap());
}
