//! `TransactionLog`: append-only, hash-chained mutation history.
//!
//! ## Frame format
//!
//! ```text
//! [u32 length LE][Action as JSON, `length` bytes]   repeated, no file header
//! ```
//!
//! `hash(action)` is the SHA-256 of the frame's JSON bytes exactly as
//! stored. Each action carries the hash of its predecessor in `prev_hash`
//! (zero for the first), so altering any stored action breaks the chain at
//! the next one.
//!
//! `state_hash` snapshots every node and link named in the payload after the
//! mutation, which lets [`TransactionLog::verify_state`] notice store edits
//! made behind the log's back.
//!
//! Append order is the source of truth for ordering; timestamps are only
//! used by [`TransactionLog::get_history`] for presentation.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreError;

use super::types::{Hash256, Link, Meta, Node, NodeId, Value, link_key, now_micros};

const LEN_PREFIX: usize = 4;

/// Payload keys the state snapshot understands.
pub mod keys {
    pub const NODE_ID: &str = "node_id";
    pub const SOURCE: &str = "source";
    pub const TARGET: &str = "target";
    pub const LINK_TYPE: &str = "link_type";
    pub const NODES: &str = "nodes";
    pub const EDGES: &str = "edges";
    pub const META: &str = "meta";
    pub const ORDER: &str = "order";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    AddNode,
    UpdateNode,
    DeleteNode,
    AddLink,
    DeleteLink,
    PutContent,
    DeleteContent,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::AddNode => "add_node",
            ActionType::UpdateNode => "update_node",
            ActionType::DeleteNode => "delete_node",
            ActionType::AddLink => "add_link",
            ActionType::DeleteLink => "delete_link",
            ActionType::PutContent => "put_content",
            ActionType::DeleteContent => "delete_content",
        }
    }
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub payload: Meta,
    /// Unix microseconds.
    pub timestamp: i64,
    pub prev_hash: Hash256,
    pub state_hash: Hash256,
}

impl Action {
    /// The `order` tie-breaker, either at the top of the payload or inside
    /// its `meta` map.
    pub fn order(&self) -> Option<i64> {
        self.payload
            .get(keys::ORDER)
            .and_then(Value::as_i64)
            .or_else(|| {
                self.payload
                    .get(keys::META)
                    .and_then(Value::as_map)
                    .and_then(|m| m.get(keys::ORDER))
                    .and_then(Value::as_i64)
            })
    }
}

/// Read access to current store state, used for state hashes.
pub trait StateView {
    fn node_state(&self, id: &NodeId) -> Option<Node>;
    /// `id` is the link key, see [`link_key`].
    fn link_state(&self, id: &Hash256) -> Option<Link>;
}

#[derive(Serialize)]
struct SnapshotEntry<T: Serialize> {
    id: Hash256,
    state: Option<T>,
}

#[derive(Serialize)]
struct Snapshot {
    nodes: Vec<SnapshotEntry<Node>>,
    edges: Vec<SnapshotEntry<Link>>,
}

/// Hash of the current state of everything `payload` names.
pub fn state_hash(payload: &Meta, view: &dyn StateView) -> Result<Hash256, StoreError> {
    fn push(list: &mut Vec<Hash256>, id: Hash256) {
        if !list.contains(&id) {
            list.push(id);
        }
    }

    let mut node_ids: Vec<NodeId> = Vec::new();
    let mut edge_ids: Vec<Hash256> = Vec::new();

    if let Some(id) = payload.get(keys::NODE_ID).and_then(Value::as_hash) {
        push(&mut node_ids, id);
    }
    let source = payload.get(keys::SOURCE).and_then(Value::as_hash);
    let target = payload.get(keys::TARGET).and_then(Value::as_hash);
    for id in [source, target].into_iter().flatten() {
        push(&mut node_ids, id);
    }
    if let (Some(s), Some(t), Some(kind)) = (
        source,
        target,
        payload.get(keys::LINK_TYPE).and_then(Value::as_str),
    ) {
        push(&mut edge_ids, link_key(&s, &t, kind));
    }
    for id in hash_list(payload, keys::NODES) {
        push(&mut node_ids, id);
    }
    for id in hash_list(payload, keys::EDGES) {
        push(&mut edge_ids, id);
    }

    let snapshot = Snapshot {
        nodes: node_ids
            .into_iter()
            .map(|id| SnapshotEntry { id, state: view.node_state(&id) })
            .collect(),
        edges: edge_ids
            .into_iter()
            .map(|id| SnapshotEntry { id, state: view.link_state(&id) })
            .collect(),
    };
    Ok(Hash256::digest(&serde_json::to_vec(&snapshot)?))
}

fn hash_list<'a>(payload: &'a Meta, key: &str) -> impl Iterator<Item = Hash256> + 'a {
    payload
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or(&[])
        .iter()
        .filter_map(Value::as_hash)
}

/// A decoded frame and where it sits in the file.
#[derive(Debug, Clone)]
struct Frame {
    action: Action,
    hash: Hash256,
    end: usize,
}

/// Decode the frame starting at `pos`, if a complete, parseable one is there.
fn decode_frame(data: &[u8], pos: usize) -> Option<Frame> {
    let len_end = pos.checked_add(LEN_PREFIX)?;
    let prefix: [u8; LEN_PREFIX] = data.get(pos..len_end)?.try_into().ok()?;
    let len = u32::from_le_bytes(prefix) as usize;
    let end = len_end.checked_add(len)?;
    let body = data.get(len_end..end)?;
    let action: Action = serde_json::from_slice(body).ok()?;
    Some(Frame { action, hash: Hash256::digest(body), end })
}

/// Frames from the start of `data` up to the first undecodable byte.
/// Returns the frames and the offset where decoding stopped.
fn scan_forward(data: &[u8]) -> (Vec<Frame>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        match decode_frame(data, pos) {
            Some(frame) => {
                pos = frame.end;
                frames.push(frame);
            }
            None => break,
        }
    }
    (frames, pos)
}

/// Last decodable frame starting at or after `floor`, searching backward
/// from the end one byte at a time.
fn scan_backward(data: &[u8], floor: usize) -> Option<(usize, Frame)> {
    let top = data.len().checked_sub(LEN_PREFIX)?;
    (floor..=top)
        .rev()
        .find_map(|pos| decode_frame(data, pos).map(|f| (pos, f)))
}

#[derive(Debug)]
struct LogInner {
    file: File,
    last_hash: Hash256,
    count: usize,
}

#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
}

impl TransactionLog {
    /// `<store path>.log`
    pub fn path_for(store_path: &Path) -> PathBuf {
        let mut s: OsString = store_path.as_os_str().to_owned();
        s.push(".log");
        PathBuf::from(s)
    }

    /// Open or create the log, recovering `last_hash` and cutting off a torn
    /// trailing frame.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let data = std::fs::read(path)?;

        let (frames, good_end) = scan_forward(&data);
        let mut last_hash = frames.last().map_or(Hash256::ZERO, |f| f.hash);
        let mut count = frames.len();
        let mut keep = good_end;

        if good_end < data.len() {
            if let Some((pos, frame)) = scan_backward(&data, good_end + 1) {
                warn!(
                    path = %path.display(),
                    unreadable_from = good_end,
                    resumed_at = pos,
                    "transaction log has an unreadable region"
                );
                last_hash = frame.hash;
                count += 1;
                keep = frame.end;
            }
            if keep < data.len() {
                warn!(
                    path = %path.display(),
                    bytes = data.len() - keep,
                    "truncating torn transaction log tail"
                );
                file.set_len(keep as u64)?;
                file.sync_all()?;
            }
        }

        info!(path = %path.display(), actions = count, "transaction log opened");
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(LogInner { file, last_hash, count }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hash of the most recent action, zero for an empty log.
    pub fn last_hash(&self) -> Hash256 {
        self.inner.lock().last_hash
    }

    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append an action, chained to the previous one and fsynced before
    /// returning.
    pub fn record_action(
        &self,
        kind: ActionType,
        payload: Meta,
        view: &dyn StateView,
    ) -> Result<Action, StoreError> {
        let state_hash = state_hash(&payload, view)?;
        let mut inner = self.inner.lock();
        let action = Action {
            kind,
            payload,
            timestamp: now_micros(),
            prev_hash: inner.last_hash,
            state_hash,
        };
        let body = serde_json::to_vec(&action)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            StoreError::Validation(format!("action of {} bytes is too large to log", body.len()))
        })?;

        let mut frame = Vec::with_capacity(LEN_PREFIX + body.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&body);
        inner.file.write_all(&frame)?;
        inner.file.sync_data()?;

        inner.last_hash = Hash256::digest(&body);
        inner.count += 1;
        debug!(kind = kind.as_str(), hash = %inner.last_hash.short(), "action recorded");
        Ok(action)
    }

    /// Every readable action, ordered by timestamp, then `order`, then
    /// append position. Within one timestamp, actions carrying `order` come
    /// before those without.
    pub fn get_history(&self) -> Result<Vec<Action>, StoreError> {
        let frames = self.read_frames()?;
        let mut indexed: Vec<(usize, Action)> =
            frames.into_iter().map(|f| f.action).enumerate().collect();
        indexed.sort_by_key(|(i, a)| (a.timestamp, a.order().map_or((1, 0), |o| (0, o)), *i));
        Ok(indexed.into_iter().map(|(_, a)| a).collect())
    }

    /// True when every action chains to its predecessor in append order.
    /// Tampering yields `Ok(false)`; only I/O problems are errors.
    pub fn verify_history(&self) -> Result<bool, StoreError> {
        match self.check_history() {
            Ok(()) => Ok(true),
            Err(StoreError::ChainBroken { index }) => {
                warn!(path = %self.path.display(), index, "transaction log chain broken");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`verify_history`](Self::verify_history) but reports the first
    /// broken position as [`StoreError::ChainBroken`].
    pub fn check_history(&self) -> Result<(), StoreError> {
        let _guard = self.inner.lock();
        let data = std::fs::read(&self.path)?;
        let (frames, end) = scan_forward(&data);
        let mut prev = Hash256::ZERO;
        for (index, frame) in frames.iter().enumerate() {
            if frame.action.prev_hash != prev {
                return Err(StoreError::ChainBroken { index });
            }
            prev = frame.hash;
        }
        if end < data.len() {
            // Unreadable bytes between frames: whatever follows cannot be chained.
            return Err(StoreError::ChainBroken { index: frames.len() });
        }
        Ok(())
    }

    /// Recompute the state hash of the newest action against `view`.
    /// An empty log trivially matches.
    pub fn verify_state(&self, view: &dyn StateView) -> Result<bool, StoreError> {
        let frames = self.read_frames()?;
        let Some(last) = frames.last() else {
            return Ok(true);
        };
        Ok(state_hash(&last.action.payload, view)? == last.action.state_hash)
    }

    fn read_frames(&self) -> Result<Vec<Frame>, StoreError> {
        let _guard = self.inner.lock();
        let data = std::fs::read(&self.path)?;
        let (frames, end) = scan_forward(&data);
        if end < data.len() {
            return Err(StoreError::InvalidFormat(format!(
                "transaction log unreadable at byte {end} of {}",
                data.len()
            )));
        }
        Ok(frames)
    }
}
