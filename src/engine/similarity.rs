//! `SimilarityIndex`: finds nodes whose chunk sets overlap.
//!
//! Score is `shared / min(|a|, |b|)` over the sets of distinct chunk hashes,
//! so a document fully contained in another scores 1.0. Candidates come from
//! an inverted chunk → node index instead of a scan over every node; matches
//! are reported in node insertion order, the same order a full scan yields.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::types::{ChunkHash, NodeId};

/// Link type used for similarity links.
pub const SIMILAR_LINK: &str = "similar";

/// One node that cleared the threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarMatch {
    pub node: NodeId,
    pub similarity: f64,
    pub shared: usize,
}

#[derive(Debug)]
struct Registered {
    seq: u64,
    chunks: HashSet<ChunkHash>,
}

#[derive(Debug, Default)]
struct Inner {
    by_chunk: HashMap<ChunkHash, HashSet<NodeId>>,
    by_node: HashMap<NodeId, Registered>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct SimilarityIndex {
    threshold: f64,
    inner: RwLock<Inner>,
}

impl SimilarityIndex {
    pub fn new(threshold: f64) -> Self {
        Self { threshold, inner: RwLock::new(Inner::default()) }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register (or re-register) a node's manifest. A re-registered node
    /// keeps its original insertion position.
    pub fn insert(&self, node: NodeId, manifest: &[ChunkHash]) {
        let mut inner = self.inner.write();
        let seq = match unregister(&mut inner, &node) {
            Some(seq) => seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        let chunks: HashSet<ChunkHash> = manifest.iter().copied().collect();
        for hash in &chunks {
            inner.by_chunk.entry(*hash).or_default().insert(node);
        }
        inner.by_node.insert(node, Registered { seq, chunks });
    }

    pub fn remove(&self, node: &NodeId) {
        unregister(&mut self.inner.write(), node);
    }

    /// Nodes other than `node` whose score against `manifest` reaches the
    /// threshold, in insertion order.
    pub fn find_similar(&self, node: &NodeId, manifest: &[ChunkHash]) -> Vec<SimilarMatch> {
        let mine: HashSet<ChunkHash> = manifest.iter().copied().collect();
        if mine.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read();

        let mut shared: HashMap<NodeId, usize> = HashMap::new();
        for hash in &mine {
            if let Some(owners) = inner.by_chunk.get(hash) {
                for owner in owners.iter().filter(|o| *o != node) {
                    *shared.entry(*owner).or_default() += 1;
                }
            }
        }

        let mut matches: Vec<(u64, SimilarMatch)> = shared
            .into_iter()
            .filter_map(|(other, count)| {
                let reg = inner.by_node.get(&other)?;
                let similarity = score(count, mine.len(), reg.chunks.len());
                (similarity >= self.threshold).then(|| {
                    (reg.seq, SimilarMatch { node: other, similarity, shared: count })
                })
            })
            .collect();
        matches.sort_by_key(|(seq, _)| *seq);
        matches.into_iter().map(|(_, m)| m).collect()
    }
}

/// `shared / min(a, b)`; zero when either set is empty.
pub fn score(shared: usize, a: usize, b: usize) -> f64 {
    let smaller = a.min(b);
    if smaller == 0 { 0.0 } else { shared as f64 / smaller as f64 }
}

fn unregister(inner: &mut Inner, node: &NodeId) -> Option<u64> {
    let reg = inner.by_node.remove(node)?;
    for hash in &reg.chunks {
        if let Some(owners) = inner.by_chunk.get_mut(hash) {
            owners.remove(node);
            if owners.is_empty() {
                inner.by_chunk.remove(hash);
            }
        }
    }
    Some(reg.seq)
}
