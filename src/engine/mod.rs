//! Storage engine.
//!
//! ```text
//! Repository ── add/get/update/delete node, links, content
//!   ├── ChunkStore ──── ChunkEngine (split) + refcounted chunk records
//!   ├── SimilarityIndex  chunk → node inverted index, "similar" links
//!   ├── TransactionLog   <store>.log, hash-chained actions
//!   └── BinaryStore ──── header + nodes/edges/blobs index tables
//! ```
//!
//! Everything is synchronous. One process owns a store file for writing;
//! inside that process the repository is `Sync` and may be shared across
//! threads.

pub mod binary_store;
pub mod chunk_store;
pub mod chunker;
pub mod format;
pub mod repository;
pub mod similarity;
pub mod txlog;
pub mod types;

pub use binary_store::{BinaryStore, StoreStats};
pub use chunk_store::{ChunkStats, ChunkStore};
pub use chunker::ChunkEngine;
pub use format::{Header, IndexEntry, Table};
pub use repository::{ContentRef, RepoStats, Repository};
pub use similarity::{SIMILAR_LINK, SimilarMatch, SimilarityIndex};
pub use txlog::{Action, ActionType, StateView, TransactionLog};
pub use types::{ChunkHash, Hash256, Link, Meta, Node, NodeId, Value};

/// Chunk sizing. Defaults: ~256 B average, 32 B floor, 64 KiB ceiling,
/// tightened to ~4 KiB average and a 128 B floor above 1 MiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Below this size content takes the word/phrase splitting path.
    pub small_threshold: usize,
    pub min_size: usize,
    pub max_size: usize,
    /// Above this size the mask and floor are widened.
    pub large_content_threshold: usize,
    pub avg_mask_bits: u32,
    pub large_avg_mask_bits: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            small_threshold: 1024,
            min_size: 32,
            max_size: 64 * 1024,
            large_content_threshold: 1024 * 1024,
            avg_mask_bits: 8,
            large_avg_mask_bits: 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityConfig {
    pub enabled: bool,
    /// Minimum `shared / min(|a|, |b|)` for a `similar` link.
    pub threshold: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self { enabled: true, threshold: 0.3 }
    }
}

/// Input limits enforced before any mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Serialized size of caller metadata.
    pub max_meta_bytes: usize,
    pub max_content_bytes: usize,
    pub max_type_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_meta_bytes: 64 * 1024,
            max_content_bytes: 256 * 1024 * 1024,
            max_type_len: 256,
        }
    }
}

/// Everything the engine needs besides a path. Passed to
/// [`Repository::create`] / [`Repository::open`]; there is no global state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub similarity: SimilarityConfig,
    pub limits: Limits,
}
