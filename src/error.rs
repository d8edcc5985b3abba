//! Engine-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("magic mismatch: expected \"MEMEX01\", found {found:?}")]
    MagicMismatch { found: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// The action at `index` (append order) does not chain to its predecessor.
    #[error("transaction log chain broken at action {index}")]
    ChainBroken { index: usize },

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("store already closed")]
    AlreadyClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
