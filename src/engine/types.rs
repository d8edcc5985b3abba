//! Core value types shared by every engine component.
//!
//! * [`Hash256`]: a SHA-256 digest. Node ids, chunk hashes, content hashes
//!   and log hashes are all `Hash256`; on disk they are raw 32 bytes, in JSON
//!   they are lowercase hex strings.
//!
//! * [`Value`] / [`Meta`]: the metadata vocabulary. A tagged variant that
//!   maps one-to-one onto JSON (null, bool, integer, float, string, array,
//!   object). `Meta` is a `BTreeMap`, so serialising it is canonical: the
//!   same map always produces the same bytes, which the transaction log
//!   relies on for its state hashes.
//!
//! * [`Node`] / [`Link`]: the graph records stored as JSON in the store file.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

// ── Hash256 ──────────────────────────────────────────────────────────────────

/// A 32-byte SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

/// Node identifier.
pub type NodeId = Hash256;

/// Identity of a stored chunk (SHA-256 of its bytes).
pub type ChunkHash = Hash256;

impl Hash256 {
    /// The all-zero hash; `prev_hash` of the first logged action.
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Hash256(Sha256::digest(data).into())
    }

    /// SHA-256 over several byte slices fed in order.
    pub fn digest_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        Hash256(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.short())
    }
}

impl FromStr for Hash256 {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| StoreError::Validation(format!("invalid hash '{s}': {e}")))?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            StoreError::Validation(format!("invalid hash '{s}': expected 32 bytes"))
        })?;
        Ok(Hash256(arr))
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Value ────────────────────────────────────────────────────────────────────

/// String-keyed metadata map. Ordered, so its JSON form is canonical.
pub type Meta = BTreeMap<String, Value>;

/// A JSON-compatible metadata value.
///
/// Integers and floats are kept apart: `1` deserialises as `Int(1)`, `1.0`
/// as `Float(1.0)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Map(Meta),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        if let Value::Str(s) = self { Some(s) } else { None }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        if let Value::Array(a) = self { Some(a) } else { None }
    }

    pub fn as_map(&self) -> Option<&Meta> {
        if let Value::Map(m) = self { Some(m) } else { None }
    }

    /// Parse a hex string value into a hash.
    pub fn as_hash(&self) -> Option<Hash256> {
        self.as_str().and_then(|s| s.parse().ok())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Array(a) => write!(f, "<array of {}>", a.len()),
            Value::Map(m) => write!(f, "<map of {}>", m.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}
impl From<usize> for Value {
    fn from(v: usize) -> Self { Value::Int(v as i64) }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self { Value::Float(v) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::Str(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Str(v.to_string()) }
}
impl From<Hash256> for Value {
    fn from(v: Hash256) -> Self { Value::Str(v.to_hex()) }
}
impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self { Value::Array(v) }
}
impl From<Meta> for Value {
    fn from(v: Meta) -> Self { Value::Map(v) }
}

// ── Graph records ────────────────────────────────────────────────────────────

/// Meta key holding the hash of a node's full content.
pub const META_CONTENT: &str = "content";
/// Meta key holding a node's ordered chunk manifest.
pub const META_CHUNKS: &str = "chunks";

/// A typed node. `meta` carries caller metadata plus the engine-owned
/// `content` and `chunks` keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: Meta,
    pub created: i64,
    pub modified: i64,
    pub version: u64,
}

impl Node {
    /// Hash of the reconstructed content.
    pub fn content_hash(&self) -> Option<Hash256> {
        self.meta.get(META_CONTENT).and_then(Value::as_hash)
    }

    /// Ordered chunk hashes that rebuild the content.
    pub fn manifest(&self) -> Result<Vec<ChunkHash>, StoreError> {
        let list = self
            .meta
            .get(META_CHUNKS)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                StoreError::InvalidFormat(format!("node {} has no chunk manifest", self.id.short()))
            })?;
        list.iter()
            .map(|v| {
                v.as_hash().ok_or_else(|| {
                    StoreError::InvalidFormat(format!(
                        "node {} manifest holds a non-hash entry",
                        self.id.short()
                    ))
                })
            })
            .collect()
    }

    /// Caller metadata without the engine-owned keys.
    pub fn user_meta(&self) -> Meta {
        self.meta
            .iter()
            .filter(|(k, _)| k.as_str() != META_CONTENT && k.as_str() != META_CHUNKS)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A directed, typed link. Chunk endpoints narrow the link to specific
/// regions of the two documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_chunk: Option<ChunkHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_chunk: Option<ChunkHash>,
}

impl Link {
    /// Edge-table id of this link.
    pub fn key(&self) -> Hash256 {
        link_key(&self.source, &self.target, &self.kind)
    }
}

/// Id of the link `(source, target, kind)`; one link exists per triple.
pub fn link_key(source: &NodeId, target: &NodeId, kind: &str) -> Hash256 {
    Hash256::digest_parts(&[source.as_bytes(), target.as_bytes(), kind.as_bytes()])
}

// ── Time ─────────────────────────────────────────────────────────────────────

/// Current wall-clock time as unix seconds (header and node timestamps).
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

/// Current wall-clock time as unix microseconds (action timestamps).
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}
