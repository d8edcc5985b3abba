//! On-disk layout of the store file.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (128 bytes, little-endian)                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  0..7    magic            "MEMEX01"                          │
//! │  7       version          u8                                 │
//! │  8..16   created          i64 unix seconds                   │
//! │ 16..24   modified         i64 unix seconds                   │
//! │ 24..28   node_count       u32                                │
//! │ 28..32   edge_count       u32                                │
//! │ 32..36   blob_count       u32                                │
//! │ 36..44   node_index_off   u64                                │
//! │ 44..52   edge_index_off   u64                                │
//! │ 52..60   blob_index_off   u64                                │
//! │ 60..64   index_crc        u32 (0 = not recorded)             │
//! │ 64..72   blob_refs_off    u64                                │
//! │ 72..128  reserved         zero                               │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Records (node JSON, link JSON, chunk records), append-only  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Index tables: nodes | edges | blobs, 48 bytes per entry      │
//! │ Blob reference counts: u32 per blob entry, same order        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The reference-count column is written with the tables and covered by
//! `index_crc`, so counts and tombstones always commit together.

use crate::error::StoreError;

use super::types::Hash256;

pub const MAGIC: &[u8; 7] = b"MEMEX01";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 128;
pub const INDEX_ENTRY_SIZE: usize = 48;

/// Entry has been deleted; its slot stays so offsets remain stable.
pub const FLAG_DELETED: u32 = 1 << 0;
/// Record was rewritten at least once since creation.
pub const FLAG_MODIFIED: u32 = 1 << 1;

/// Bytes per entry in the blob reference-count column.
pub const REF_COUNT_SIZE: usize = 4;

/// The three index tables held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Nodes,
    Edges,
    Blobs,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Nodes, Table::Edges, Table::Blobs];

    pub fn name(self) -> &'static str {
        match self {
            Table::Nodes => "nodes",
            Table::Edges => "edges",
            Table::Blobs => "blobs",
        }
    }
}

/// Fixed 128-byte file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub created: i64,
    pub modified: i64,
    pub node_count: u32,
    pub edge_count: u32,
    pub blob_count: u32,
    pub node_index_offset: u64,
    pub edge_index_offset: u64,
    pub blob_index_offset: u64,
    pub index_crc: u32,
    /// Start of the blob reference-count column; zero while there are no blobs.
    pub blob_refs_offset: u64,
}

impl Header {
    /// Header for a brand-new, empty store. All tables start right after the header.
    pub fn new(now: i64) -> Self {
        let end = HEADER_SIZE as u64;
        Self {
            version: FORMAT_VERSION,
            created: now,
            modified: now,
            node_count: 0,
            edge_count: 0,
            blob_count: 0,
            node_index_offset: end,
            edge_index_offset: end,
            blob_index_offset: end,
            index_crc: 0,
            blob_refs_offset: 0,
        }
    }

    pub fn count(&self, table: Table) -> u32 {
        match table {
            Table::Nodes => self.node_count,
            Table::Edges => self.edge_count,
            Table::Blobs => self.blob_count,
        }
    }

    pub fn offset(&self, table: Table) -> u64 {
        match table {
            Table::Nodes => self.node_index_offset,
            Table::Edges => self.edge_index_offset,
            Table::Blobs => self.blob_index_offset,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..7].copy_from_slice(MAGIC);
        buf[7] = self.version;
        buf[8..16].copy_from_slice(&self.created.to_le_bytes());
        buf[16..24].copy_from_slice(&self.modified.to_le_bytes());
        buf[24..28].copy_from_slice(&self.node_count.to_le_bytes());
        buf[28..32].copy_from_slice(&self.edge_count.to_le_bytes());
        buf[32..36].copy_from_slice(&self.blob_count.to_le_bytes());
        buf[36..44].copy_from_slice(&self.node_index_offset.to_le_bytes());
        buf[44..52].copy_from_slice(&self.edge_index_offset.to_le_bytes());
        buf[52..60].copy_from_slice(&self.blob_index_offset.to_le_bytes());
        buf[60..64].copy_from_slice(&self.index_crc.to_le_bytes());
        buf[64..72].copy_from_slice(&self.blob_refs_offset.to_le_bytes());
        buf
    }

    /// Parse and validate magic and version. Offsets are checked by the
    /// caller, which knows the file length.
    pub fn from_bytes(data: &[u8]) -> Result<Self, StoreError> {
        if data.len() < HEADER_SIZE {
            return Err(StoreError::InvalidFormat(format!(
                "header too short: {} bytes",
                data.len()
            )));
        }
        if &data[0..7] != MAGIC {
            return Err(StoreError::MagicMismatch {
                found: String::from_utf8_lossy(&data[0..7]).into_owned(),
            });
        }
        let version = data[7];
        if version == 0 || version > FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "unsupported format version {version}"
            )));
        }
        Ok(Self {
            version,
            created: i64::from_le_bytes(le_array(&data[8..16])),
            modified: i64::from_le_bytes(le_array(&data[16..24])),
            node_count: u32::from_le_bytes(le_array(&data[24..28])),
            edge_count: u32::from_le_bytes(le_array(&data[28..32])),
            blob_count: u32::from_le_bytes(le_array(&data[32..36])),
            node_index_offset: u64::from_le_bytes(le_array(&data[36..44])),
            edge_index_offset: u64::from_le_bytes(le_array(&data[44..52])),
            blob_index_offset: u64::from_le_bytes(le_array(&data[52..60])),
            index_crc: u32::from_le_bytes(le_array(&data[60..64])),
            blob_refs_offset: u64::from_le_bytes(le_array(&data[64..72])),
        })
    }

    /// Check that every table and the reference-count column lie inside a
    /// file of `file_len` bytes.
    pub fn validate_bounds(&self, file_len: u64) -> Result<(), StoreError> {
        for table in Table::ALL {
            let start = self.offset(table);
            let len = self.count(table) as u64 * INDEX_ENTRY_SIZE as u64;
            let end = start.checked_add(len).ok_or_else(|| {
                StoreError::InvalidFormat(format!("{} index offset overflows", table.name()))
            })?;
            if start < HEADER_SIZE as u64 || end > file_len {
                return Err(StoreError::InvalidFormat(format!(
                    "{} index [{start}, {end}) outside file of {file_len} bytes",
                    table.name()
                )));
            }
        }
        if self.blob_count > 0 {
            let start = self.blob_refs_offset;
            let end = start
                .checked_add(self.blob_count as u64 * REF_COUNT_SIZE as u64)
                .ok_or_else(|| StoreError::InvalidFormat("blob reference column overflows".into()))?;
            if start < HEADER_SIZE as u64 || end > file_len {
                return Err(StoreError::InvalidFormat(format!(
                    "blob reference column [{start}, {end}) outside file of {file_len} bytes"
                )));
            }
        }
        Ok(())
    }
}

/// One 48-byte slot in an index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: Hash256,
    pub offset: u64,
    pub length: u32,
    pub flags: u32,
}

impl IndexEntry {
    pub fn new(id: Hash256, offset: u64, length: u32) -> Self {
        Self { id, offset, length, flags: 0 }
    }

    pub fn is_deleted(&self) -> bool {
        self.flags & FLAG_DELETED != 0
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
    }

    pub fn decode(data: &[u8]) -> Result<Self, StoreError> {
        if data.len() < INDEX_ENTRY_SIZE {
            return Err(StoreError::InvalidFormat(format!(
                "index entry too short: {} bytes",
                data.len()
            )));
        }
        Ok(Self {
            id: Hash256(le_array(&data[0..32])),
            offset: u64::from_le_bytes(le_array(&data[32..40])),
            length: u32::from_le_bytes(le_array(&data[40..44])),
            flags: u32::from_le_bytes(le_array(&data[44..48])),
        })
    }
}

/// Copy a slice of known length into a fixed array. Callers slice exact
/// ranges, so the length always matches.
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
