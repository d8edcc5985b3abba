//! `ChunkStore`: content-addressed, reference-counted chunk storage.
//!
//! Each chunk is stored once under the SHA-256 of its bytes. The record on
//! disk is
//!
//! ```text
//! [crc32 u32][content_len u32][content ...]
//! ```
//!
//! The CRC catches bit-rot on read without rehashing. Reference counts are
//! kept by [`BinaryStore`] beside the blob table and flushed with it, never
//! rewritten inside the record. A chunk is tombstoned when its count reaches
//! zero and its region becomes reusable after the next flush.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;

use super::binary_store::BinaryStore;
use super::chunker::ChunkEngine;
use super::format::{IndexEntry, Table};
use super::types::{ChunkHash, Hash256};

/// Bytes of chunk record header: crc32 + content length.
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Largest content a single chunk record can describe.
const MAX_RECORD_CONTENT: usize = u32::MAX as usize - CHUNK_HEADER_SIZE;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Distinct live chunks.
    pub chunks: usize,
    /// Sum of all reference counts.
    pub references: u64,
    /// Content bytes held by live chunks, excluding record headers.
    pub stored_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct ChunkInfo {
    refs: u32,
    content_len: u32,
}

pub struct ChunkStore {
    store: Arc<BinaryStore>,
    engine: ChunkEngine,
    /// Live chunks only. Taken before any `BinaryStore` lock.
    refs: RwLock<HashMap<ChunkHash, ChunkInfo>>,
}

impl ChunkStore {
    /// Build the in-memory reference table from the live blob entries.
    pub fn open(store: Arc<BinaryStore>, engine: ChunkEngine) -> Result<Self, StoreError> {
        let mut refs = HashMap::new();
        for entry in store.entries(Table::Blobs) {
            if entry.is_deleted() {
                continue;
            }
            let count = store.blob_refs(&entry.id);
            if count == 0 {
                warn!(chunk = %entry.id.short(), "live chunk with zero references");
            }
            let content_len = entry.length.saturating_sub(CHUNK_HEADER_SIZE as u32);
            refs.insert(entry.id, ChunkInfo { refs: count, content_len });
        }
        debug!(chunks = refs.len(), "chunk references loaded");
        Ok(Self { store, engine, refs: RwLock::new(refs) })
    }

    pub fn engine(&self) -> &ChunkEngine {
        &self.engine
    }

    /// Split `content`, store each chunk once and return the manifest.
    ///
    /// Every occurrence of a chunk in the manifest holds one reference. On
    /// error the references already taken for this manifest are released.
    pub fn put(&self, content: &[u8]) -> Result<Vec<ChunkHash>, StoreError> {
        let pieces = self.engine.split(content);
        let mut refs = self.refs.write();
        let mut manifest = Vec::with_capacity(pieces.len());
        let mut fresh = 0usize;
        for piece in pieces {
            match self.put_chunk(&mut refs, piece) {
                Ok((hash, new)) => {
                    fresh += new as usize;
                    manifest.push(hash);
                }
                Err(e) => {
                    self.release(&mut refs, &manifest);
                    return Err(e);
                }
            }
        }
        debug!(
            chunks = manifest.len(),
            stored = fresh,
            deduplicated = manifest.len() - fresh,
            "content stored"
        );
        Ok(manifest)
    }

    /// Concatenate the chunks of `manifest` in order.
    pub fn get(&self, manifest: &[ChunkHash]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::new();
        for hash in manifest {
            out.extend_from_slice(&self.get_chunk(hash)?);
        }
        Ok(out)
    }

    /// Content of a single live chunk, checksum-verified.
    pub fn get_chunk(&self, hash: &ChunkHash) -> Result<Vec<u8>, StoreError> {
        let entry = self
            .store
            .live_entry(Table::Blobs, hash)
            .ok_or_else(|| StoreError::ChunkNotFound(hash.to_hex()))?;
        let mut record = self.store.read_record(&entry)?;
        if record.len() < CHUNK_HEADER_SIZE {
            return Err(StoreError::InvalidFormat(format!(
                "chunk {} record is {} bytes",
                hash.short(),
                record.len()
            )));
        }
        let (crc, len) = decode_head(&record);
        let content = record.split_off(CHUNK_HEADER_SIZE);
        if len as usize != content.len() {
            return Err(StoreError::InvalidFormat(format!(
                "chunk {} declares {len} bytes, record holds {}",
                hash.short(),
                content.len()
            )));
        }
        let actual = crc32fast::hash(&content);
        if actual != crc {
            return Err(StoreError::InvalidFormat(format!(
                "chunk {} checksum mismatch: stored {crc:08x}, computed {actual:08x}",
                hash.short()
            )));
        }
        Ok(content)
    }

    /// Check that every chunk of `manifest` holds enough references for
    /// [`delete`](Self::delete) to succeed. Nothing is changed.
    pub fn check_release(&self, manifest: &[ChunkHash]) -> Result<(), StoreError> {
        check_counts(&self.refs.read(), manifest)
    }

    /// Release one reference per occurrence in `manifest`.
    ///
    /// The whole manifest is checked first; nothing is released if any chunk
    /// is unknown or short of references.
    pub fn delete(&self, manifest: &[ChunkHash]) -> Result<(), StoreError> {
        let mut refs = self.refs.write();
        check_counts(&refs, manifest)?;

        let mut reclaimed = 0usize;
        for hash in manifest {
            if self.release_one(&mut refs, hash)? {
                reclaimed += 1;
            }
        }
        debug!(released = manifest.len(), reclaimed, "content released");
        Ok(())
    }

    /// Current reference count; zero for unknown or reclaimed chunks.
    pub fn ref_count(&self, hash: &ChunkHash) -> u32 {
        self.refs.read().get(hash).map_or(0, |i| i.refs)
    }

    pub fn contains(&self, hash: &ChunkHash) -> bool {
        self.refs.read().contains_key(hash)
    }

    pub fn stats(&self) -> ChunkStats {
        let refs = self.refs.read();
        ChunkStats {
            chunks: refs.len(),
            references: refs.values().map(|i| i.refs as u64).sum(),
            stored_bytes: refs.values().map(|i| i.content_len as u64).sum(),
        }
    }

    // ── internals ─────────────────────────────────────────────────────────

    /// Returns the chunk hash and whether new bytes were written. The
    /// in-memory count only moves once the store has accepted it.
    fn put_chunk(
        &self,
        refs: &mut HashMap<ChunkHash, ChunkInfo>,
        piece: &[u8],
    ) -> Result<(ChunkHash, bool), StoreError> {
        let hash = Hash256::digest(piece);

        if let Some(info) = refs.get_mut(&hash) {
            let count = info.refs.checked_add(1).ok_or_else(|| {
                StoreError::Validation(format!("chunk {} reference count overflow", hash.short()))
            })?;
            self.store.set_blob_refs(&hash, count)?;
            info.refs = count;
            return Ok((hash, false));
        }

        if let Some(entry) = self.store.revive_blob(&hash)? {
            self.store.set_blob_refs(&hash, 1)?;
            refs.insert(hash, ChunkInfo { refs: 1, content_len: piece.len() as u32 });
            debug!(chunk = %hash.short(), offset = entry.offset, "revived reclaimed chunk");
            return Ok((hash, false));
        }

        if piece.len() > MAX_RECORD_CONTENT {
            return Err(StoreError::Validation(format!(
                "chunk of {} bytes exceeds record limit",
                piece.len()
            )));
        }
        let mut record = Vec::with_capacity(CHUNK_HEADER_SIZE + piece.len());
        record.extend_from_slice(&crc32fast::hash(piece).to_le_bytes());
        record.extend_from_slice(&(piece.len() as u32).to_le_bytes());
        record.extend_from_slice(piece);

        let offset = self.store.write_blob_record(&record)?;
        self.store.write_index_entry(
            Table::Blobs,
            IndexEntry::new(hash, offset, record.len() as u32),
        )?;
        self.store.set_blob_refs(&hash, 1)?;
        refs.insert(hash, ChunkInfo { refs: 1, content_len: piece.len() as u32 });
        Ok((hash, true))
    }

    /// Drop one reference. Returns true when the chunk was tombstoned.
    fn release_one(
        &self,
        refs: &mut HashMap<ChunkHash, ChunkInfo>,
        hash: &ChunkHash,
    ) -> Result<bool, StoreError> {
        let Some(info) = refs.get_mut(hash) else {
            return Err(StoreError::ChunkNotFound(hash.to_hex()));
        };
        let remaining = info.refs.saturating_sub(1);
        if remaining > 0 {
            self.store.set_blob_refs(hash, remaining)?;
            info.refs = remaining;
            return Ok(false);
        }
        self.store.tombstone(Table::Blobs, hash)?;
        refs.remove(hash);
        Ok(true)
    }

    /// Undo the references a failed `put` already took.
    fn release(&self, refs: &mut HashMap<ChunkHash, ChunkInfo>, manifest: &[ChunkHash]) {
        for hash in manifest {
            if let Err(e) = self.release_one(refs, hash) {
                warn!(chunk = %hash.short(), error = %e, "could not release chunk after failed put");
            }
        }
    }
}

fn check_counts(
    refs: &HashMap<ChunkHash, ChunkInfo>,
    manifest: &[ChunkHash],
) -> Result<(), StoreError> {
    let mut wanted: HashMap<ChunkHash, u32> = HashMap::new();
    for hash in manifest {
        *wanted.entry(*hash).or_default() += 1;
    }
    for (hash, n) in &wanted {
        match refs.get(hash) {
            Some(info) if info.refs >= *n => {}
            Some(info) => {
                return Err(StoreError::Validation(format!(
                    "chunk {} has {} references, {n} requested",
                    hash.short(),
                    info.refs
                )));
            }
            None => return Err(StoreError::ChunkNotFound(hash.to_hex())),
        }
    }
    Ok(())
}

fn decode_head(head: &[u8]) -> (u32, u32) {
    let crc = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
    let len = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    (crc, len)
}
