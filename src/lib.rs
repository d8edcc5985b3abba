//! memex: a single-file, content-addressable graph store.
//!
//! Nodes carry content that is split into content-defined chunks, stored
//! once and reference-counted. Documents sharing enough chunks are linked
//! as `similar`. Every mutation lands in a hash-chained action log next to
//! the store file.
//!
//! ```no_run
//! use memex::{EngineConfig, Meta, Repository};
//!
//! # fn main() -> Result<(), memex::StoreError> {
//! let repo = Repository::open_or_create("t.mx".as_ref(), EngineConfig::default())?;
//! let id = repo.add_node(b"The quick brown fox.", "file", Meta::new())?;
//! assert_eq!(repo.get_content(&id)?, b"The quick brown fox.");
//! repo.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod logger;

pub use engine::{
    ChunkingConfig, EngineConfig, Hash256, Limits, Link, Meta, Node, NodeId, Repository,
    SimilarityConfig, Value,
};
pub use error::StoreError;
