//! `BinaryStore`: the single store file: header, records, and three index tables.
//!
//! The index tables are fully materialised in memory (hash map keyed by id,
//! plus insertion order for deterministic flushes) and written back in full on
//! [`BinaryStore::sync`] / [`BinaryStore::close`].
//!
//! ## Growth policy
//! Records are appended at end-of-file. A flush writes the three tables after
//! the last record, fsyncs, and only then rewrites the header; the header is
//! the commit point. The tables a previous flush wrote are left behind as dead
//! space, so a crash between appends and the next flush still leaves the
//! header pointing at intact tables.
//!
//! Blob reference counts live in memory next to the blob table and are
//! written as a column after it, so a flush commits counts and tombstones
//! atomically. After a crash the store reopens with the counts that match
//! the tables the header points at.
//!
//! Chunk regions whose tombstones have been persisted go on a free list and
//! are reused first-fit by [`BinaryStore::write_blob_record`]. A reused
//! tombstone keeps its slot with a zero length, marking its region as gone.
//!
//! ## Locking
//! Four independent reader/writer locks: index tables (nodes + edges), chunk
//! table (blobs), file region, header. When more than one is needed they are
//! always taken in that order.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::StoreError;

use super::format::{
    FLAG_DELETED, HEADER_SIZE, Header, INDEX_ENTRY_SIZE, IndexEntry, REF_COUNT_SIZE, Table,
};
use super::types::{Hash256, now_unix};

// ── IndexTable ───────────────────────────────────────────────────────────────

/// In-memory index table: O(1) lookup by id, stable insertion order.
#[derive(Debug, Default, Clone)]
pub struct IndexTable {
    entries: HashMap<Hash256, IndexEntry>,
    order: Vec<Hash256>,
}

impl IndexTable {
    fn from_entries(list: Vec<IndexEntry>) -> Self {
        let mut table = Self::default();
        for entry in list {
            table.upsert(entry);
        }
        table
    }

    pub fn get(&self, id: &Hash256) -> Option<&IndexEntry> {
        self.entries.get(id)
    }

    fn get_mut(&mut self, id: &Hash256) -> Option<&mut IndexEntry> {
        self.entries.get_mut(id)
    }

    fn upsert(&mut self, entry: IndexEntry) {
        if self.entries.insert(entry.id, entry).is_none() {
            self.order.push(entry.id);
        }
    }

    /// All entries, tombstones included, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn live_len(&self) -> usize {
        self.entries.values().filter(|e| !e.is_deleted()).count()
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        for entry in self.iter() {
            entry.encode_into(buf);
        }
    }
}

#[derive(Debug, Default)]
struct IndexTables {
    nodes: IndexTable,
    edges: IndexTable,
}

#[derive(Debug, Default)]
struct ChunkTable {
    blobs: IndexTable,
    /// Reference counts of live blobs. Tombstones have none.
    refs: HashMap<Hash256, u32>,
    /// Tombstoned since the last flush; their space becomes reusable once the
    /// tombstone is on disk.
    pending_free: Vec<Hash256>,
}

/// A reusable region of the record area.
#[derive(Debug, Clone, Copy)]
struct FreeExtent {
    offset: u64,
    length: u32,
    /// Tombstoned chunk that used to live here, if the extent is its whole record.
    owner: Option<Hash256>,
}

#[derive(Debug)]
struct FileRegion {
    file: Option<File>,
    /// End of file; the next append lands here.
    end: u64,
    free: Vec<FreeExtent>,
}

/// Snapshot of table occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub live_nodes: usize,
    pub deleted_nodes: usize,
    pub live_edges: usize,
    pub deleted_edges: usize,
    pub live_blobs: usize,
    pub deleted_blobs: usize,
    pub free_extents: usize,
    pub file_len: u64,
}

// ── BinaryStore ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct BinaryStore {
    path: PathBuf,
    indexes: RwLock<IndexTables>,
    chunks: RwLock<ChunkTable>,
    region: RwLock<FileRegion>,
    header: RwLock<Header>,
    dirty: AtomicBool,
}

impl BinaryStore {
    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Create a new store file with an empty header. Fails if the file exists.
    pub fn create(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let header = Header::new(now_unix());
        write_all_at(&file, &header.to_bytes(), 0)?;
        file.sync_all()?;

        info!(path = %path.display(), "store created");

        Ok(Self {
            path: path.to_path_buf(),
            indexes: RwLock::new(IndexTables::default()),
            chunks: RwLock::new(ChunkTable::default()),
            region: RwLock::new(FileRegion {
                file: Some(file),
                end: HEADER_SIZE as u64,
                free: Vec::new(),
            }),
            header: RwLock::new(header),
            dirty: AtomicBool::new(false),
        })
    }

    /// Open an existing store: validate the header and load all three tables.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE as u64 {
            return Err(StoreError::InvalidFormat(format!(
                "{} is {file_len} bytes, shorter than the header",
                path.display()
            )));
        }

        let mut raw = [0u8; HEADER_SIZE];
        read_exact_at(&file, &mut raw, 0)?;
        let header = Header::from_bytes(&raw)?;
        header.validate_bounds(file_len)?;

        let mut crc = crc32fast::Hasher::new();
        let mut load = |table: Table| -> Result<Vec<IndexEntry>, StoreError> {
            let count = header.count(table) as usize;
            let mut buf = vec![0u8; count * INDEX_ENTRY_SIZE];
            read_exact_at(&file, &mut buf, header.offset(table))?;
            crc.update(&buf);
            let mut out = Vec::with_capacity(count);
            for slot in buf.chunks_exact(INDEX_ENTRY_SIZE) {
                let entry = IndexEntry::decode(slot)?;
                let end = entry.offset.checked_add(entry.length as u64);
                if entry.offset < HEADER_SIZE as u64 || end.is_none_or(|end| end > file_len) {
                    return Err(StoreError::InvalidFormat(format!(
                        "{} entry {} points past end of file",
                        table.name(),
                        entry.id.short()
                    )));
                }
                out.push(entry);
            }
            Ok(out)
        };
        let nodes = load(Table::Nodes)?;
        let edges = load(Table::Edges)?;
        let blobs = load(Table::Blobs)?;

        let mut column = vec![0u8; blobs.len() * REF_COUNT_SIZE];
        if !column.is_empty() {
            read_exact_at(&file, &mut column, header.blob_refs_offset)?;
            crc.update(&column);
        }
        let refs: HashMap<Hash256, u32> = blobs
            .iter()
            .zip(column.chunks_exact(REF_COUNT_SIZE))
            .filter(|(e, _)| !e.is_deleted())
            .map(|(e, raw)| (e.id, u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])))
            .collect();

        let computed = crc.finalize();
        if header.index_crc != 0 && header.index_crc != computed {
            return Err(StoreError::InvalidFormat(format!(
                "index checksum mismatch: header {:08x}, computed {computed:08x}",
                header.index_crc
            )));
        }

        let free: Vec<FreeExtent> = blobs
            .iter()
            .filter(|e| e.is_deleted() && e.length > 0)
            .map(|e| FreeExtent { offset: e.offset, length: e.length, owner: Some(e.id) })
            .collect();

        info!(
            path = %path.display(),
            nodes = nodes.len(),
            edges = edges.len(),
            blobs = blobs.len(),
            reusable = free.len(),
            "store opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            indexes: RwLock::new(IndexTables {
                nodes: IndexTable::from_entries(nodes),
                edges: IndexTable::from_entries(edges),
            }),
            chunks: RwLock::new(ChunkTable {
                blobs: IndexTable::from_entries(blobs),
                refs,
                pending_free: Vec::new(),
            }),
            region: RwLock::new(FileRegion { file: Some(file), end: file_len, free }),
            header: RwLock::new(header),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.region.read().file.is_none()
    }

    pub fn header(&self) -> Header {
        self.header.read().clone()
    }

    /// Flush the in-memory tables and header to disk.
    ///
    /// A no-op when nothing changed since the last flush.
    pub fn sync(&self) -> Result<(), StoreError> {
        let indexes = self.indexes.read();
        let mut chunks = self.chunks.write();
        let mut region = self.region.write();
        let mut header = self.header.write();

        let Some(file) = region.file.as_ref() else {
            return Err(StoreError::AlreadyClosed);
        };
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(
            (indexes.nodes.len() + indexes.edges.len() + chunks.blobs.len()) * INDEX_ENTRY_SIZE
                + chunks.blobs.len() * REF_COUNT_SIZE,
        );
        let base = region.end;
        indexes.nodes.encode_into(&mut buf);
        let edge_off = base + buf.len() as u64;
        indexes.edges.encode_into(&mut buf);
        let blob_off = base + buf.len() as u64;
        chunks.blobs.encode_into(&mut buf);
        let refs_off = base + buf.len() as u64;
        for entry in chunks.blobs.iter() {
            let count = chunks.refs.get(&entry.id).copied().unwrap_or(0);
            buf.extend_from_slice(&count.to_le_bytes());
        }

        write_all_at(file, &buf, base)?;
        file.sync_all()?;

        let mut next = header.clone();
        next.modified = now_unix();
        next.node_count = table_count(&indexes.nodes)?;
        next.edge_count = table_count(&indexes.edges)?;
        next.blob_count = table_count(&chunks.blobs)?;
        next.node_index_offset = base;
        next.edge_index_offset = edge_off;
        next.blob_index_offset = blob_off;
        next.blob_refs_offset = if chunks.blobs.is_empty() { 0 } else { refs_off };
        next.index_crc = crc32fast::hash(&buf);

        write_all_at(file, &next.to_bytes(), 0)?;
        file.sync_all()?;

        *header = next;
        region.end = base + buf.len() as u64;

        // Tombstones are durable now; their regions may be handed out again.
        let pending = std::mem::take(&mut chunks.pending_free);
        for id in pending {
            if let Some(entry) = chunks.blobs.get(&id).filter(|e| e.is_deleted()) {
                region.free.push(FreeExtent {
                    offset: entry.offset,
                    length: entry.length,
                    owner: Some(id),
                });
            }
        }

        self.dirty.store(false, Ordering::Release);
        debug!(
            nodes = header.node_count,
            edges = header.edge_count,
            blobs = header.blob_count,
            bytes = buf.len(),
            "indexes flushed"
        );
        Ok(())
    }

    /// Flush, fsync and release the file handle.
    ///
    /// A second call returns [`StoreError::AlreadyClosed`].
    pub fn close(&self) -> Result<(), StoreError> {
        self.sync()?;
        let mut region = self.region.write();
        match region.file.take() {
            Some(file) => {
                file.sync_all()?;
                info!(path = %self.path.display(), "store closed");
                Ok(())
            }
            None => Err(StoreError::AlreadyClosed),
        }
    }

    // ── Index access ──────────────────────────────────────────────────────

    /// Insert or replace an entry.
    pub fn write_index_entry(&self, table: Table, entry: IndexEntry) -> Result<(), StoreError> {
        self.ensure_open()?;
        match table {
            Table::Nodes => self.indexes.write().nodes.upsert(entry),
            Table::Edges => self.indexes.write().edges.upsert(entry),
            Table::Blobs => self.chunks.write().blobs.upsert(entry),
        }
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Look up an entry by id, tombstones included.
    pub fn read_index_entry(&self, table: Table, id: &Hash256) -> Option<IndexEntry> {
        match table {
            Table::Nodes => self.indexes.read().nodes.get(id).copied(),
            Table::Edges => self.indexes.read().edges.get(id).copied(),
            Table::Blobs => self.chunks.read().blobs.get(id).copied(),
        }
    }

    /// Look up an entry that is not tombstoned.
    pub fn live_entry(&self, table: Table, id: &Hash256) -> Option<IndexEntry> {
        self.read_index_entry(table, id).filter(|e| !e.is_deleted())
    }

    /// Tombstone an entry. Returns the entry as it was, or `None` if absent
    /// or already deleted.
    pub fn tombstone(&self, table: Table, id: &Hash256) -> Result<Option<IndexEntry>, StoreError> {
        self.ensure_open()?;
        let previous = match table {
            Table::Nodes => tombstone_in(&mut self.indexes.write().nodes, id),
            Table::Edges => tombstone_in(&mut self.indexes.write().edges, id),
            Table::Blobs => {
                let mut chunks = self.chunks.write();
                let prev = tombstone_in(&mut chunks.blobs, id);
                if prev.is_some() {
                    chunks.refs.remove(id);
                    chunks.pending_free.push(*id);
                }
                prev
            }
        };
        if previous.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(previous)
    }

    /// Clear the tombstone of a deleted chunk whose region has not been
    /// reused yet, taking the region back off the free list. The revived
    /// blob starts with a reference count of zero.
    pub fn revive_blob(&self, id: &Hash256) -> Result<Option<IndexEntry>, StoreError> {
        self.ensure_open()?;
        let mut chunks = self.chunks.write();
        let mut region = self.region.write();
        let Some(entry) = chunks.blobs.get_mut(id).filter(|e| e.is_deleted() && e.length > 0)
        else {
            return Ok(None);
        };
        entry.flags &= !FLAG_DELETED;
        let revived = *entry;
        chunks.pending_free.retain(|k| k != id);
        region.free.retain(|x| x.owner != Some(*id));
        self.dirty.store(true, Ordering::Release);
        Ok(Some(revived))
    }

    /// Reference count of a live blob; zero when unknown or tombstoned.
    pub fn blob_refs(&self, id: &Hash256) -> u32 {
        self.chunks.read().refs.get(id).copied().unwrap_or(0)
    }

    /// Set the reference count of a live blob. Persisted by the next flush.
    pub fn set_blob_refs(&self, id: &Hash256, count: u32) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut chunks = self.chunks.write();
        if !chunks.blobs.get(id).is_some_and(|e| !e.is_deleted()) {
            return Err(StoreError::ChunkNotFound(id.to_hex()));
        }
        chunks.refs.insert(*id, count);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// All entries of a table in insertion order, tombstones included.
    pub fn entries(&self, table: Table) -> Vec<IndexEntry> {
        match table {
            Table::Nodes => self.indexes.read().nodes.iter().copied().collect(),
            Table::Edges => self.indexes.read().edges.iter().copied().collect(),
            Table::Blobs => self.chunks.read().blobs.iter().copied().collect(),
        }
    }

    // ── Record I/O ────────────────────────────────────────────────────────

    /// Append a record at end-of-file and return its offset.
    pub fn append(&self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut region = self.region.write();
        let offset = region.end;
        let file = region.file.as_ref().ok_or(StoreError::AlreadyClosed)?;
        write_all_at(file, bytes, offset)?;
        region.end += bytes.len() as u64;
        Ok(offset)
    }

    /// Write a chunk record, reusing reclaimed space when an extent fits.
    pub fn write_blob_record(&self, bytes: &[u8]) -> Result<u64, StoreError> {
        let mut chunks = self.chunks.write();
        let mut region = self.region.write();
        let file = region.file.as_ref().ok_or(StoreError::AlreadyClosed)?;

        let need = bytes.len() as u64;
        let Some(pos) = region.free.iter().position(|x| x.length as u64 >= need) else {
            let offset = region.end;
            write_all_at(file, bytes, offset)?;
            region.end += need;
            return Ok(offset);
        };

        let extent = region.free[pos];
        write_all_at(file, bytes, extent.offset)?;
        if let Some(owner) = extent.owner {
            // The tombstone stays, but no longer claims the bytes.
            if let Some(entry) = chunks.blobs.get_mut(&owner).filter(|e| e.is_deleted()) {
                entry.length = 0;
                self.dirty.store(true, Ordering::Release);
            }
        }
        let rest = extent.length as u64 - need;
        if rest > 0 {
            region.free[pos] = FreeExtent {
                offset: extent.offset + need,
                length: rest as u32,
                owner: None,
            };
        } else {
            region.free.swap_remove(pos);
        }
        debug!(offset = extent.offset, len = need, "reused reclaimed chunk space");
        Ok(extent.offset)
    }

    /// Read `len` bytes at `offset`. Short reads are I/O errors.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StoreError> {
        let region = self.region.read();
        let file = region.file.as_ref().ok_or(StoreError::AlreadyClosed)?;
        if offset + len as u64 > region.end {
            return Err(StoreError::InvalidFormat(format!(
                "read [{offset}, {}) past end of data {}",
                offset + len as u64,
                region.end
            )));
        }
        let mut buf = vec![0u8; len];
        read_exact_at(file, &mut buf, offset)?;
        Ok(buf)
    }

    /// Read the full record an index entry points at.
    pub fn read_record(&self, entry: &IndexEntry) -> Result<Vec<u8>, StoreError> {
        self.read(entry.offset, entry.length as usize)
    }

    pub fn stats(&self) -> StoreStats {
        let indexes = self.indexes.read();
        let chunks = self.chunks.read();
        let region = self.region.read();
        StoreStats {
            live_nodes: indexes.nodes.live_len(),
            deleted_nodes: indexes.nodes.len() - indexes.nodes.live_len(),
            live_edges: indexes.edges.live_len(),
            deleted_edges: indexes.edges.len() - indexes.edges.live_len(),
            live_blobs: chunks.blobs.live_len(),
            deleted_blobs: chunks.blobs.len() - chunks.blobs.live_len(),
            free_extents: region.free.len(),
            file_len: region.end,
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for BinaryStore {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = self.sync() {
            warn!(path = %self.path.display(), error = %e, "flush on drop failed");
        }
    }
}

// ── internals ────────────────────────────────────────────────────────────────

fn tombstone_in(table: &mut IndexTable, id: &Hash256) -> Option<IndexEntry> {
    let entry = table.get_mut(id).filter(|e| !e.is_deleted())?;
    let before = *entry;
    entry.flags |= FLAG_DELETED;
    Some(before)
}

fn table_count(table: &IndexTable) -> Result<u32, StoreError> {
    u32::try_from(table.len())
        .map_err(|_| StoreError::InvalidFormat(format!("index table holds {} entries", table.len())))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read")),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset)? {
            0 => return Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
            n => {
                buf = &buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::format::FLAG_MODIFIED;
    use tempfile::TempDir;

    fn scratch() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("t.mx");
        (tmp, path)
    }

    #[test]
    fn create_writes_128_byte_header() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
        store.close().unwrap();
        let reopened = BinaryStore::open(&path).unwrap();
        assert_eq!(reopened.entries(Table::Nodes).len(), 0);
    }

    #[test]
    fn create_refuses_existing_file() {
        let (_tmp, path) = scratch();
        BinaryStore::create(&path).unwrap().close().unwrap();
        assert!(matches!(BinaryStore::create(&path), Err(StoreError::Io(_))));
    }

    #[test]
    fn entries_survive_close_and_reopen() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let off = store.append(b"{\"hello\":1}").unwrap();
        let id = Hash256::digest(b"node-1");
        let mut entry = IndexEntry::new(id, off, 11);
        entry.flags = FLAG_MODIFIED;
        store.write_index_entry(Table::Nodes, entry).unwrap();
        store.close().unwrap();

        let store = BinaryStore::open(&path).unwrap();
        let got = store.read_index_entry(Table::Nodes, &id).unwrap();
        assert_eq!(got, entry);
        assert_eq!(store.read_record(&got).unwrap(), b"{\"hello\":1}");
        assert!(store.read_index_entry(Table::Edges, &id).is_none());
    }

    #[test]
    fn double_close_is_an_error_not_a_panic() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        store.close().unwrap();
        assert!(matches!(store.close(), Err(StoreError::AlreadyClosed)));
        assert!(matches!(store.append(b"x"), Err(StoreError::AlreadyClosed)));
    }

    #[test]
    fn open_rejects_foreign_file() {
        let (_tmp, path) = scratch();
        std::fs::write(&path, vec![b'x'; 256]).unwrap();
        assert!(matches!(
            BinaryStore::open(&path),
            Err(StoreError::MagicMismatch { .. })
        ));
    }

    #[test]
    fn open_rejects_offsets_past_eof() {
        let (_tmp, path) = scratch();
        let mut header = Header::new(0);
        header.blob_count = 3;
        header.blob_index_offset = 4096;
        std::fs::write(&path, header.to_bytes()).unwrap();
        assert!(matches!(
            BinaryStore::open(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn open_detects_corrupted_index() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let off = store.append(b"abc").unwrap();
        store
            .write_index_entry(Table::Nodes, IndexEntry::new(Hash256::digest(b"a"), off, 3))
            .unwrap();
        store.close().unwrap();

        let node_off = {
            let raw = std::fs::read(&path).unwrap();
            Header::from_bytes(&raw).unwrap().node_index_offset as usize
        };
        let mut raw = std::fs::read(&path).unwrap();
        raw[node_off] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            BinaryStore::open(&path),
            Err(StoreError::InvalidFormat(_))
        ));
    }

    #[test]
    fn reclaimed_blob_space_is_reused_after_flush() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let id = Hash256::digest(b"chunk");
        let off = store.write_blob_record(&[7u8; 64]).unwrap();
        store.write_index_entry(Table::Blobs, IndexEntry::new(id, off, 64)).unwrap();
        store.tombstone(Table::Blobs, &id).unwrap();

        // Not reusable until the tombstone is durable.
        let second = store.write_blob_record(&[1u8; 16]).unwrap();
        assert_ne!(second, off);

        store.sync().unwrap();
        let third = store.write_blob_record(&[2u8; 16]).unwrap();
        assert_eq!(third, off);
        let old = store.read_index_entry(Table::Blobs, &id).unwrap();
        assert!(old.is_deleted());
        assert_eq!(old.length, 0);
        assert!(store.revive_blob(&id).unwrap().is_none());
        assert_eq!(store.stats().free_extents, 1);

        // The emptied tombstone is not handed out again after a reopen.
        store.close().unwrap();
        let store = BinaryStore::open(&path).unwrap();
        assert_eq!(store.stats().free_extents, 0);
        assert_eq!(store.stats().deleted_blobs, 1);
    }

    #[test]
    fn blob_refs_commit_with_the_tables() {
        let (_tmp, path) = scratch();
        let id = Hash256::digest(b"chunk");
        {
            let store = BinaryStore::create(&path).unwrap();
            let off = store.write_blob_record(&[7u8; 16]).unwrap();
            store.write_index_entry(Table::Blobs, IndexEntry::new(id, off, 16)).unwrap();
            store.set_blob_refs(&id, 2).unwrap();
            store.sync().unwrap();
            store.set_blob_refs(&id, 1).unwrap();
            // Crash: the lowered count was never flushed.
            std::mem::forget(store);
        }
        let store = BinaryStore::open(&path).unwrap();
        assert_eq!(store.blob_refs(&id), 2);
        store.set_blob_refs(&id, 5).unwrap();
        store.close().unwrap();
        assert_eq!(BinaryStore::open(&path).unwrap().blob_refs(&id), 5);
    }

    #[test]
    fn blob_refs_need_a_live_blob() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let id = Hash256::digest(b"chunk");
        assert!(matches!(store.set_blob_refs(&id, 1), Err(StoreError::ChunkNotFound(_))));
        let off = store.write_blob_record(&[7u8; 16]).unwrap();
        store.write_index_entry(Table::Blobs, IndexEntry::new(id, off, 16)).unwrap();
        store.set_blob_refs(&id, 1).unwrap();
        store.tombstone(Table::Blobs, &id).unwrap();
        assert_eq!(store.blob_refs(&id), 0);
        assert!(store.set_blob_refs(&id, 1).is_err());
    }

    #[test]
    fn revive_takes_region_off_free_list() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let id = Hash256::digest(b"chunk");
        let off = store.write_blob_record(&[7u8; 32]).unwrap();
        store.write_index_entry(Table::Blobs, IndexEntry::new(id, off, 32)).unwrap();
        store.tombstone(Table::Blobs, &id).unwrap();
        store.sync().unwrap();

        let revived = store.revive_blob(&id).unwrap().unwrap();
        assert!(!revived.is_deleted());
        let next = store.write_blob_record(&[1u8; 8]).unwrap();
        assert_ne!(next, off);
    }

    #[test]
    fn tombstone_keeps_slot() {
        let (_tmp, path) = scratch();
        let store = BinaryStore::create(&path).unwrap();
        let id = Hash256::digest(b"n");
        store.write_index_entry(Table::Nodes, IndexEntry::new(id, 128, 0)).unwrap();
        assert!(store.tombstone(Table::Nodes, &id).unwrap().is_some());
        assert!(store.tombstone(Table::Nodes, &id).unwrap().is_none());
        assert!(store.live_entry(Table::Nodes, &id).is_none());
        assert_eq!(store.entries(Table::Nodes).len(), 1);
        let stats = store.stats();
        assert_eq!(stats.deleted_nodes, 1);
        assert_eq!(stats.live_nodes, 0);
    }
}
