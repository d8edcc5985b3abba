//! `Repository`: the node/link API over the engine components.
//!
//! Every mutation follows the same shape: validate, take the writer lock,
//! store chunks, write records and index entries, then record one composite
//! action in the transaction log. The action is written last, so a logged
//! action always describes index writes that succeeded.
//!
//! `update_node` is in place: the node keeps its id, `version` goes up and
//! the new record replaces the old one in the node index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;

use super::EngineConfig;
use super::binary_store::{BinaryStore, StoreStats};
use super::chunk_store::{ChunkStats, ChunkStore};
use super::chunker::ChunkEngine;
use super::format::{FLAG_MODIFIED, IndexEntry, Table};
use super::similarity::{SIMILAR_LINK, SimilarityIndex};
use super::txlog::{Action, ActionType, StateView, TransactionLog, keys};
use super::types::{
    ChunkHash, Hash256, Link, META_CHUNKS, META_CONTENT, Meta, Node, NodeId, Value, link_key,
    now_unix,
};

/// Standalone content stored outside any node. The caller keeps the
/// manifest; the repository only holds the chunk references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    pub hash: Hash256,
    pub chunks: Vec<ChunkHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub store: StoreStats,
    pub chunks: ChunkStats,
    pub actions: usize,
}

/// Derived lookups rebuilt from the node and edge tables on open.
#[derive(Debug, Default)]
struct GraphIndex {
    /// Node → keys of links where it is source or target, in creation order.
    adjacency: HashMap<NodeId, Vec<Hash256>>,
    /// Content hash → nodes holding that content.
    content: HashMap<Hash256, Vec<NodeId>>,
}

impl GraphIndex {
    fn attach_link(&mut self, link: &Link) {
        let key = link.key();
        for end in [link.source, link.target] {
            let list = self.adjacency.entry(end).or_default();
            if !list.contains(&key) {
                list.push(key);
            }
        }
    }

    fn detach_link(&mut self, link: &Link) {
        let key = link.key();
        for end in [link.source, link.target] {
            if let Some(list) = self.adjacency.get_mut(&end) {
                list.retain(|k| *k != key);
                if list.is_empty() {
                    self.adjacency.remove(&end);
                }
            }
        }
    }

    fn attach_content(&mut self, hash: Hash256, node: NodeId) {
        let owners = self.content.entry(hash).or_default();
        if !owners.contains(&node) {
            owners.push(node);
        }
    }

    fn detach_content(&mut self, hash: &Hash256, node: &NodeId) {
        if let Some(owners) = self.content.get_mut(hash) {
            owners.retain(|n| n != node);
            if owners.is_empty() {
                self.content.remove(hash);
            }
        }
    }
}

pub struct Repository {
    path: PathBuf,
    config: EngineConfig,
    store: Arc<BinaryStore>,
    chunks: ChunkStore,
    similarity: SimilarityIndex,
    log: TransactionLog,
    graph: RwLock<GraphIndex>,
    /// Serialises mutations so each logged action sees a stable state.
    writer: Mutex<()>,
}

impl Repository {
    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Create a new store at `path` plus its `<path>.log`.
    pub fn create(path: &Path, config: EngineConfig) -> Result<Self, StoreError> {
        let log_path = TransactionLog::path_for(path);
        if std::fs::metadata(&log_path).is_ok_and(|m| m.len() > 0) {
            return Err(StoreError::InvalidFormat(format!(
                "{} already holds a history; remove it or open the matching store",
                log_path.display()
            )));
        }
        let store = Arc::new(BinaryStore::create(path)?);
        Self::assemble(path, config, store)
    }

    /// Open an existing store and rebuild the derived indexes.
    pub fn open(path: &Path, config: EngineConfig) -> Result<Self, StoreError> {
        let store = Arc::new(BinaryStore::open(path)?);
        Self::assemble(path, config, store)
    }

    pub fn open_or_create(path: &Path, config: EngineConfig) -> Result<Self, StoreError> {
        if path.exists() {
            Self::open(path, config)
        } else {
            Self::create(path, config)
        }
    }

    fn assemble(
        path: &Path,
        config: EngineConfig,
        store: Arc<BinaryStore>,
    ) -> Result<Self, StoreError> {
        let chunks = ChunkStore::open(store.clone(), ChunkEngine::new(config.chunking.clone()))?;
        let log = TransactionLog::open(&TransactionLog::path_for(path))?;
        let similarity = SimilarityIndex::new(config.similarity.threshold);

        let repo = Self {
            path: path.to_path_buf(),
            config,
            store,
            chunks,
            similarity,
            log,
            graph: RwLock::new(GraphIndex::default()),
            writer: Mutex::new(()),
        };
        repo.rebuild_indexes()?;
        Ok(repo)
    }

    fn rebuild_indexes(&self) -> Result<(), StoreError> {
        let mut graph = self.graph.write();
        let mut nodes = 0usize;
        for entry in self.store.entries(Table::Nodes) {
            if entry.is_deleted() {
                continue;
            }
            let node = self.read_node(&entry)?;
            if let Some(hash) = node.content_hash() {
                graph.attach_content(hash, node.id);
            }
            self.similarity.insert(node.id, &node.manifest()?);
            nodes += 1;
        }
        let mut links = 0usize;
        for entry in self.store.entries(Table::Edges) {
            if entry.is_deleted() {
                continue;
            }
            graph.attach_link(&self.read_link(&entry)?);
            links += 1;
        }
        info!(path = %self.path.display(), nodes, links, "repository ready");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flush index tables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        let _w = self.writer.lock();
        self.store.sync()
    }

    /// Flush and release the store file. Later calls fail with
    /// [`StoreError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), StoreError> {
        let _w = self.writer.lock();
        self.store.close()
    }

    // ── Nodes ─────────────────────────────────────────────────────────────

    /// Store `content` as a new node and link it to similar nodes.
    pub fn add_node(&self, content: &[u8], kind: &str, meta: Meta) -> Result<NodeId, StoreError> {
        self.validate_content(content)?;
        self.validate_type(kind)?;
        self.validate_meta(&meta)?;

        let _w = self.writer.lock();
        let manifest = self.chunks.put(content)?;
        let content_hash = Hash256::digest(content);
        let id = Hash256::digest_parts(&[
            Uuid::now_v7().as_bytes(),
            kind.as_bytes(),
            content_hash.as_bytes(),
        ]);
        let now = now_unix();
        let node = Node {
            id,
            kind: kind.to_string(),
            meta: with_content(meta, content_hash, &manifest),
            created: now,
            modified: now,
            version: 1,
        };

        if let Err(e) = self.write_node(&node, 0) {
            self.release_quietly(&manifest);
            return Err(e);
        }
        self.graph.write().attach_content(content_hash, id);
        let edges = self.link_similar(&node, &manifest)?;

        let mut payload = Meta::new();
        payload.insert(keys::NODE_ID.into(), id.into());
        payload.insert("type".into(), kind.into());
        payload.insert(META_CONTENT.into(), content_hash.into());
        payload.insert("chunk_count".into(), manifest.len().into());
        payload.insert(keys::EDGES.into(), hash_values(&edges));
        self.log.record_action(ActionType::AddNode, payload, self)?;

        debug!(node = %id.short(), kind, chunks = manifest.len(), similar = edges.len(), "node added");
        Ok(id)
    }

    pub fn get_node(&self, id: &NodeId) -> Result<Node, StoreError> {
        let entry = self
            .store
            .live_entry(Table::Nodes, id)
            .ok_or_else(|| StoreError::NotFound(format!("node {id}")))?;
        self.read_node(&entry)
    }

    /// Replace a node's content in place. `meta: None` keeps the caller
    /// metadata; `Some` replaces it. Similar links are recomputed.
    pub fn update_node(
        &self,
        id: &NodeId,
        content: &[u8],
        meta: Option<Meta>,
    ) -> Result<Node, StoreError> {
        self.validate_content(content)?;
        if let Some(meta) = &meta {
            self.validate_meta(meta)?;
        }

        let _w = self.writer.lock();
        let current = self.get_node(id)?;
        let old_manifest = current.manifest()?;
        let old_hash = current.content_hash();
        self.chunks.check_release(&old_manifest)?;

        // New chunks first, so chunks shared by old and new never hit zero.
        let manifest = self.chunks.put(content)?;
        let content_hash = Hash256::digest(content);
        let user_meta = meta.unwrap_or_else(|| current.user_meta());
        let node = Node {
            id: *id,
            kind: current.kind.clone(),
            meta: with_content(user_meta, content_hash, &manifest),
            created: current.created,
            modified: now_unix(),
            version: current.version + 1,
        };
        if let Err(e) = self.write_node(&node, FLAG_MODIFIED) {
            self.release_quietly(&manifest);
            return Err(e);
        }
        self.chunks.delete(&old_manifest)?;

        {
            let mut graph = self.graph.write();
            if let Some(old) = old_hash {
                graph.detach_content(&old, id);
            }
            graph.attach_content(content_hash, *id);
        }

        let mut edges = self.drop_similar_links(id)?;
        self.similarity.remove(id);
        edges.extend(self.link_similar(&node, &manifest)?);

        let mut payload = Meta::new();
        payload.insert(keys::NODE_ID.into(), (*id).into());
        payload.insert("version".into(), Value::Int(node.version as i64));
        payload.insert(META_CONTENT.into(), content_hash.into());
        payload.insert(keys::EDGES.into(), hash_values(&edges));
        self.log.record_action(ActionType::UpdateNode, payload, self)?;

        debug!(node = %id.short(), version = node.version, "node updated");
        Ok(node)
    }

    /// Delete a node, every link touching it, and its chunk references.
    ///
    /// Everything that can fail on read happens before the chunks are
    /// released; if either step fails the node and its links are untouched.
    pub fn delete_node(&self, id: &NodeId) -> Result<(), StoreError> {
        let _w = self.writer.lock();
        let node = self.get_node(id)?;
        let manifest = node.manifest()?;

        let touching = self.graph.read().adjacency.get(id).cloned().unwrap_or_default();
        let mut links = Vec::with_capacity(touching.len());
        for key in &touching {
            if let Some(entry) = self.store.live_entry(Table::Edges, key) {
                links.push((*key, self.read_link(&entry)?));
            }
        }
        self.chunks.delete(&manifest)?;

        for (key, link) in &links {
            self.store.tombstone(Table::Edges, key)?;
            self.graph.write().detach_link(link);
        }
        self.store.tombstone(Table::Nodes, id)?;
        self.similarity.remove(id);
        if let Some(hash) = node.content_hash() {
            self.graph.write().detach_content(&hash, id);
        }

        let mut payload = Meta::new();
        payload.insert(keys::NODE_ID.into(), (*id).into());
        payload.insert(keys::EDGES.into(), hash_values(&touching));
        self.log.record_action(ActionType::DeleteNode, payload, self)?;

        debug!(node = %id.short(), links = touching.len(), "node deleted");
        Ok(())
    }

    /// Live node ids in creation order.
    pub fn list(&self) -> Vec<NodeId> {
        self.store
            .entries(Table::Nodes)
            .into_iter()
            .filter(|e| !e.is_deleted())
            .map(|e| e.id)
            .collect()
    }

    // ── Links ─────────────────────────────────────────────────────────────

    /// Create or replace the link `(source, target, kind)`.
    pub fn add_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        kind: &str,
        meta: Meta,
    ) -> Result<Hash256, StoreError> {
        self.insert_link(Link {
            source: *source,
            target: *target,
            kind: kind.to_string(),
            meta,
            source_chunk: None,
            target_chunk: None,
        })
    }

    /// Link specific chunks of two documents. Each chunk must belong to its
    /// node's manifest.
    pub fn add_chunk_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        kind: &str,
        meta: Meta,
        source_chunk: &ChunkHash,
        target_chunk: &ChunkHash,
    ) -> Result<Hash256, StoreError> {
        for (node, chunk) in [(source, source_chunk), (target, target_chunk)] {
            if !self.get_node(node)?.manifest()?.contains(chunk) {
                return Err(StoreError::Validation(format!(
                    "chunk {} is not part of node {}",
                    chunk.short(),
                    node.short()
                )));
            }
        }
        self.insert_link(Link {
            source: *source,
            target: *target,
            kind: kind.to_string(),
            meta,
            source_chunk: Some(*source_chunk),
            target_chunk: Some(*target_chunk),
        })
    }

    /// Links where `id` is source or target, in creation order.
    pub fn get_links(&self, id: &NodeId) -> Result<Vec<Link>, StoreError> {
        if self.store.live_entry(Table::Nodes, id).is_none() {
            return Err(StoreError::NotFound(format!("node {id}")));
        }
        let keys = self.graph.read().adjacency.get(id).cloned().unwrap_or_default();
        keys.iter()
            .filter_map(|k| self.store.live_entry(Table::Edges, k))
            .map(|e| self.read_link(&e))
            .collect()
    }

    pub fn delete_link(
        &self,
        source: &NodeId,
        target: &NodeId,
        kind: &str,
    ) -> Result<(), StoreError> {
        let _w = self.writer.lock();
        let key = link_key(source, target, kind);
        if !self.remove_link_by_key(&key)? {
            return Err(StoreError::NotFound(format!(
                "link {} -[{kind}]-> {}",
                source.short(),
                target.short()
            )));
        }
        let mut payload = Meta::new();
        payload.insert(keys::SOURCE.into(), (*source).into());
        payload.insert(keys::TARGET.into(), (*target).into());
        payload.insert(keys::LINK_TYPE.into(), kind.into());
        self.log.record_action(ActionType::DeleteLink, payload, self)?;
        Ok(())
    }

    // ── Content ───────────────────────────────────────────────────────────

    pub fn get_chunk(&self, hash: &ChunkHash) -> Result<Vec<u8>, StoreError> {
        self.chunks.get_chunk(hash)
    }

    /// Rebuild content held by any live node, by content hash.
    pub fn reconstruct_content(&self, content_hash: &Hash256) -> Result<Vec<u8>, StoreError> {
        let owner = self
            .graph
            .read()
            .content
            .get(content_hash)
            .and_then(|owners| owners.first().copied())
            .ok_or_else(|| StoreError::NotFound(format!("content {content_hash}")))?;
        let node = self.get_node(&owner)?;
        self.load_verified(content_hash, &node.manifest()?)
    }

    /// Full content of a node.
    pub fn get_content(&self, id: &NodeId) -> Result<Vec<u8>, StoreError> {
        let node = self.get_node(id)?;
        let hash = node.content_hash().ok_or_else(|| {
            StoreError::InvalidFormat(format!("node {} has no content hash", id.short()))
        })?;
        self.load_verified(&hash, &node.manifest()?)
    }

    /// Store content that no node owns.
    pub fn put_content(&self, content: &[u8]) -> Result<ContentRef, StoreError> {
        self.validate_content(content)?;
        let _w = self.writer.lock();
        let chunks = self.chunks.put(content)?;
        let hash = Hash256::digest(content);

        let mut payload = Meta::new();
        payload.insert(META_CONTENT.into(), hash.into());
        payload.insert(META_CHUNKS.into(), hash_values(&chunks));
        self.log.record_action(ActionType::PutContent, payload, self)?;
        Ok(ContentRef { hash, chunks })
    }

    pub fn load_content(&self, content: &ContentRef) -> Result<Vec<u8>, StoreError> {
        self.load_verified(&content.hash, &content.chunks)
    }

    /// Drop the references taken by [`put_content`](Self::put_content).
    pub fn delete_content(&self, content: &ContentRef) -> Result<(), StoreError> {
        let _w = self.writer.lock();
        self.chunks.delete(&content.chunks)?;
        let mut payload = Meta::new();
        payload.insert(META_CONTENT.into(), content.hash.into());
        payload.insert(META_CHUNKS.into(), hash_values(&content.chunks));
        self.log.record_action(ActionType::DeleteContent, payload, self)?;
        Ok(())
    }

    pub fn chunk_ref_count(&self, hash: &ChunkHash) -> u32 {
        self.chunks.ref_count(hash)
    }

    // ── History ───────────────────────────────────────────────────────────

    pub fn history(&self) -> Result<Vec<Action>, StoreError> {
        self.log.get_history()
    }

    pub fn verify_history(&self) -> Result<bool, StoreError> {
        self.log.verify_history()
    }

    pub fn check_history(&self) -> Result<(), StoreError> {
        self.log.check_history()
    }

    /// Whether the newest action's state hash still matches the store.
    pub fn verify_state(&self) -> Result<bool, StoreError> {
        self.log.verify_state(self)
    }

    pub fn stats(&self) -> RepoStats {
        RepoStats {
            store: self.store.stats(),
            chunks: self.chunks.stats(),
            actions: self.log.len(),
        }
    }

    // ── internals ─────────────────────────────────────────────────────────

    fn validate_content(&self, content: &[u8]) -> Result<(), StoreError> {
        if content.is_empty() {
            return Err(StoreError::Validation("content must not be empty".into()));
        }
        if content.len() > self.config.limits.max_content_bytes {
            return Err(StoreError::Validation(format!(
                "content of {} bytes exceeds limit of {}",
                content.len(),
                self.config.limits.max_content_bytes
            )));
        }
        Ok(())
    }

    fn validate_type(&self, kind: &str) -> Result<(), StoreError> {
        if kind.trim().is_empty() {
            return Err(StoreError::Validation("type must not be empty".into()));
        }
        if kind.len() > self.config.limits.max_type_len {
            return Err(StoreError::Validation(format!(
                "type of {} bytes exceeds limit of {}",
                kind.len(),
                self.config.limits.max_type_len
            )));
        }
        Ok(())
    }

    fn validate_meta(&self, meta: &Meta) -> Result<(), StoreError> {
        for reserved in [META_CONTENT, META_CHUNKS] {
            if meta.contains_key(reserved) {
                return Err(StoreError::Validation(format!(
                    "metadata key '{reserved}' is reserved"
                )));
            }
        }
        let size = serde_json::to_vec(meta)?.len();
        if size > self.config.limits.max_meta_bytes {
            return Err(StoreError::Validation(format!(
                "metadata of {size} bytes exceeds limit of {}",
                self.config.limits.max_meta_bytes
            )));
        }
        Ok(())
    }

    fn read_node(&self, entry: &IndexEntry) -> Result<Node, StoreError> {
        let bytes = self.store.read_record(entry)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn read_link(&self, entry: &IndexEntry) -> Result<Link, StoreError> {
        let bytes = self.store.read_record(entry)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_node(&self, node: &Node, flags: u32) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(node)?;
        let offset = self.store.append(&bytes)?;
        let mut entry = IndexEntry::new(node.id, offset, record_len(&bytes)?);
        entry.flags = flags;
        self.store.write_index_entry(Table::Nodes, entry)
    }

    /// Append a link record and index it. Existing links with the same key
    /// are replaced.
    fn write_link(&self, link: &Link) -> Result<Hash256, StoreError> {
        let key = link.key();
        let bytes = serde_json::to_vec(link)?;
        let offset = self.store.append(&bytes)?;
        let mut entry = IndexEntry::new(key, offset, record_len(&bytes)?);
        if self.store.read_index_entry(Table::Edges, &key).is_some() {
            entry.flags = FLAG_MODIFIED;
        }
        self.store.write_index_entry(Table::Edges, entry)?;
        self.graph.write().attach_link(link);
        Ok(key)
    }

    fn insert_link(&self, link: Link) -> Result<Hash256, StoreError> {
        self.validate_type(&link.kind)?;
        self.validate_meta(&link.meta)?;

        let _w = self.writer.lock();
        for end in [&link.source, &link.target] {
            if self.store.live_entry(Table::Nodes, end).is_none() {
                return Err(StoreError::NotFound(format!("node {end}")));
            }
        }
        let key = self.write_link(&link)?;

        let mut payload = Meta::new();
        payload.insert(keys::SOURCE.into(), link.source.into());
        payload.insert(keys::TARGET.into(), link.target.into());
        payload.insert(keys::LINK_TYPE.into(), link.kind.as_str().into());
        payload.insert(keys::META.into(), Value::Map(link.meta.clone()));
        self.log.record_action(ActionType::AddLink, payload, self)?;

        debug!(source = %link.source.short(), target = %link.target.short(), kind = %link.kind, "link added");
        Ok(key)
    }

    /// Tombstone a link by key. `false` if there was no live link.
    fn remove_link_by_key(&self, key: &Hash256) -> Result<bool, StoreError> {
        let Some(entry) = self.store.live_entry(Table::Edges, key) else {
            return Ok(false);
        };
        let link = self.read_link(&entry)?;
        self.store.tombstone(Table::Edges, key)?;
        self.graph.write().detach_link(&link);
        Ok(true)
    }

    /// Register the node for similarity and create `similar` links to the
    /// nodes it overlaps with. Returns the keys of the new links.
    fn link_similar(&self, node: &Node, manifest: &[ChunkHash]) -> Result<Vec<Hash256>, StoreError> {
        let mut created = Vec::new();
        if self.config.similarity.enabled && manifest.len() > 1 {
            for found in self.similarity.find_similar(&node.id, manifest) {
                let mut meta = Meta::new();
                meta.insert("similarity".into(), Value::Float(found.similarity));
                meta.insert("shared".into(), found.shared.into());
                let link = Link {
                    source: node.id,
                    target: found.node,
                    kind: SIMILAR_LINK.to_string(),
                    meta,
                    source_chunk: None,
                    target_chunk: None,
                };
                created.push(self.write_link(&link)?);
                debug!(
                    source = %node.id.short(),
                    target = %found.node.short(),
                    similarity = found.similarity,
                    shared = found.shared,
                    "similar link"
                );
            }
        }
        self.similarity.insert(node.id, manifest);
        Ok(created)
    }

    /// Remove every `similar` link touching `id`; returns their keys.
    fn drop_similar_links(&self, id: &NodeId) -> Result<Vec<Hash256>, StoreError> {
        let keys = self.graph.read().adjacency.get(id).cloned().unwrap_or_default();
        let mut removed = Vec::new();
        for key in keys {
            let Some(entry) = self.store.live_entry(Table::Edges, &key) else {
                continue;
            };
            if self.read_link(&entry)?.kind == SIMILAR_LINK && self.remove_link_by_key(&key)? {
                removed.push(key);
            }
        }
        Ok(removed)
    }

    fn load_verified(&self, hash: &Hash256, manifest: &[ChunkHash]) -> Result<Vec<u8>, StoreError> {
        let bytes = self.chunks.get(manifest)?;
        let actual = Hash256::digest(&bytes);
        if actual != *hash {
            return Err(StoreError::InvalidFormat(format!(
                "content {} reassembled to {}",
                hash.short(),
                actual.short()
            )));
        }
        Ok(bytes)
    }

    fn release_quietly(&self, manifest: &[ChunkHash]) {
        if let Err(e) = self.chunks.delete(manifest) {
            warn!(error = %e, "failed to release chunks after aborted write");
        }
    }
}

impl StateView for Repository {
    fn node_state(&self, id: &NodeId) -> Option<Node> {
        self.get_node(id).ok()
    }

    fn link_state(&self, id: &Hash256) -> Option<Link> {
        let entry = self.store.live_entry(Table::Edges, id)?;
        self.read_link(&entry).ok()
    }
}

fn with_content(mut meta: Meta, content_hash: Hash256, manifest: &[ChunkHash]) -> Meta {
    meta.insert(META_CONTENT.into(), content_hash.into());
    meta.insert(META_CHUNKS.into(), hash_values(manifest));
    meta
}

fn hash_values(hashes: &[Hash256]) -> Value {
    Value::Array(hashes.iter().map(|h| Value::from(*h)).collect())
}

fn record_len(bytes: &[u8]) -> Result<u32, StoreError> {
    u32::try_from(bytes.len())
        .map_err(|_| StoreError::Validation(format!("record of {} bytes is too large", bytes.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn repo(tmp: &TempDir) -> Repository {
        Repository::create(&tmp.path().join("r.mx"), EngineConfig::default()).unwrap()
    }

    #[test]
    fn add_and_get_node() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let mut meta = Meta::new();
        meta.insert("title".into(), "notes".into());
        let id = repo.add_node(b"hello there world", "note", meta).unwrap();

        let node = repo.get_node(&id).unwrap();
        assert_eq!(node.kind, "note");
        assert_eq!(node.version, 1);
        assert_eq!(node.meta.get("title"), Some(&Value::from("notes")));
        assert_eq!(node.content_hash(), Some(Hash256::digest(b"hello there world")));
        assert_eq!(repo.get_content(&id).unwrap(), b"hello there world");
        assert_eq!(repo.list(), vec![id]);
    }

    #[test]
    fn validation_happens_before_mutation() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        assert!(matches!(repo.add_node(b"", "t", Meta::new()), Err(StoreError::Validation(_))));
        assert!(matches!(repo.add_node(b"x", " ", Meta::new()), Err(StoreError::Validation(_))));

        let mut reserved = Meta::new();
        reserved.insert("chunks".into(), Value::Null);
        assert!(matches!(repo.add_node(b"x", "t", reserved), Err(StoreError::Validation(_))));

        let mut huge = Meta::new();
        huge.insert("blob".into(), "x".repeat(70 * 1024).into());
        assert!(matches!(repo.add_node(b"x", "t", huge), Err(StoreError::Validation(_))));

        let stats = repo.stats();
        assert_eq!(stats.store.live_nodes, 0);
        assert_eq!(stats.chunks.chunks, 0);
        assert_eq!(stats.actions, 0);
    }

    #[test]
    fn same_content_gets_distinct_ids() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"twin content", "t", Meta::new()).unwrap();
        let b = repo.add_node(b"twin content", "t", Meta::new()).unwrap();
        assert_ne!(a, b);

        let links = repo.get_links(&b).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].meta.get("similarity"), Some(&Value::Float(1.0)));
    }

    #[test]
    fn update_is_in_place_with_version_bump() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let id = repo.add_node(b"first draft", "doc", Meta::new()).unwrap();
        let updated = repo.update_node(&id, b"second draft", None).unwrap();
        assert_eq!(updated.id, id);
        assert_eq!(updated.version, 2);
        assert_eq!(repo.get_content(&id).unwrap(), b"second draft");
        // "draft" is shared; "first " is released.
        assert_eq!(repo.chunk_ref_count(&Hash256::digest(b"draft")), 1);
        assert_eq!(repo.chunk_ref_count(&Hash256::digest(b"first ")), 0);
        assert!(repo.reconstruct_content(&Hash256::digest(b"first draft")).is_err());
    }

    #[test]
    fn delete_node_cascades_links() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"alpha", "t", Meta::new()).unwrap();
        let b = repo.add_node(b"beta", "t", Meta::new()).unwrap();
        repo.add_link(&a, &b, "cites", Meta::new()).unwrap();
        assert_eq!(repo.get_links(&b).unwrap().len(), 1);

        repo.delete_node(&a).unwrap();
        assert!(repo.get_links(&b).unwrap().is_empty());
        assert!(matches!(repo.get_node(&a), Err(StoreError::NotFound(_))));
        assert!(matches!(repo.delete_node(&a), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn links_need_live_endpoints() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"alpha", "t", Meta::new()).unwrap();
        let ghost = Hash256::digest(b"ghost");
        assert!(matches!(
            repo.add_link(&a, &ghost, "cites", Meta::new()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            repo.delete_link(&a, &a, "cites"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn add_link_upserts() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"alpha", "t", Meta::new()).unwrap();
        let b = repo.add_node(b"beta", "t", Meta::new()).unwrap();
        repo.add_link(&a, &b, "cites", Meta::new()).unwrap();
        let mut meta = Meta::new();
        meta.insert("weight".into(), Value::Int(3));
        repo.add_link(&a, &b, "cites", meta).unwrap();

        let links = repo.get_links(&a).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].meta.get("weight"), Some(&Value::Int(3)));
    }

    #[test]
    fn chunk_links_check_manifests() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"left side", "t", Meta::new()).unwrap();
        let b = repo.add_node(b"right part", "t", Meta::new()).unwrap();
        let ca = Hash256::digest(b"side");
        let cb = Hash256::digest(b"part");
        repo.add_chunk_link(&a, &b, "quotes", Meta::new(), &ca, &cb).unwrap();
        let link = &repo.get_links(&a).unwrap()[0];
        assert_eq!(link.source_chunk, Some(ca));
        assert_eq!(link.target_chunk, Some(cb));

        assert!(matches!(
            repo.add_chunk_link(&a, &b, "quotes", Meta::new(), &cb, &ca),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn standalone_content_round_trip() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let content = repo.put_content(b"loose attachment text").unwrap();
        assert_eq!(repo.load_content(&content).unwrap(), b"loose attachment text");
        repo.delete_content(&content).unwrap();
        assert!(matches!(
            repo.load_content(&content),
            Err(StoreError::ChunkNotFound(_))
        ));
        let kinds: Vec<_> = repo.history().unwrap().iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionType::PutContent, ActionType::DeleteContent]);
    }

    #[test]
    fn every_mutation_is_logged_and_state_verifies() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"alpha", "t", Meta::new()).unwrap();
        let b = repo.add_node(b"beta", "t", Meta::new()).unwrap();
        repo.add_link(&a, &b, "cites", Meta::new()).unwrap();
        assert!(repo.verify_state().unwrap());
        repo.delete_link(&a, &b, "cites").unwrap();
        repo.update_node(&b, b"beta two", None).unwrap();
        repo.delete_node(&a).unwrap();

        assert_eq!(repo.stats().actions, 6);
        assert!(repo.verify_history().unwrap());
        assert!(repo.verify_state().unwrap());
    }

    #[test]
    fn closed_repository_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        repo.close().unwrap();
        assert!(matches!(repo.close(), Err(StoreError::AlreadyClosed)));
        assert!(matches!(
            repo.add_node(b"late", "t", Meta::new()),
            Err(StoreError::AlreadyClosed)
        ));
    }

    #[test]
    fn failed_chunk_release_leaves_node_and_links() {
        let tmp = TempDir::new().unwrap();
        let repo = repo(&tmp);
        let a = repo.add_node(b"shared alpha", "note", Meta::new()).unwrap();
        let b = repo.add_node(b"shared beta", "note", Meta::new()).unwrap();
        repo.add_link(&a, &b, "cites", Meta::new()).unwrap();
        let links_before = repo.get_links(&a).unwrap().len();
        let actions_before = repo.stats().actions;

        // Drop a's references out from under the repository.
        let manifest = repo.get_node(&a).unwrap().manifest().unwrap();
        repo.chunks.delete(&manifest).unwrap();

        assert!(repo.delete_node(&a).is_err());
        assert!(repo.get_node(&a).is_ok());
        assert_eq!(repo.get_links(&a).unwrap().len(), links_before);

        assert!(repo.update_node(&a, b"fresh words", None).is_err());
        assert_eq!(repo.get_node(&a).unwrap().version, 1);
        let fresh = Hash256::digest(b"fresh ");
        assert_eq!(repo.chunk_ref_count(&fresh), 0);
        assert_eq!(repo.stats().actions, actions_before);
    }
}
