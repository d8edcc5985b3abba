//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `MEMEX_STORE_PATH` and `MEMEX_LOG_LEVEL` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::engine::{ChunkingConfig, EngineConfig, Limits, SimilarityConfig};
use crate::error::StoreError;
use crate::logger;

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store file (already expanded, no `~`). The log lives at `<path>.log`.
    pub store_path: PathBuf,
    pub log_level: String,
    /// Create the store when `store_path` does not exist.
    pub create_if_missing: bool,
    pub engine: EngineConfig,
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    store: RawStore,
    #[serde(default)]
    chunking: RawChunking,
    #[serde(default)]
    similarity: RawSimilarity,
    #[serde(default)]
    limits: RawLimits,
}

#[derive(Deserialize)]
struct RawStore {
    path: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_true")]
    create_if_missing: bool,
}

/// Every field optional; missing ones fall back to [`ChunkingConfig::default`].
#[derive(Deserialize, Default)]
struct RawChunking {
    small_threshold: Option<usize>,
    min_size: Option<usize>,
    max_size: Option<usize>,
    large_content_threshold: Option<usize>,
    avg_mask_bits: Option<u32>,
    large_avg_mask_bits: Option<u32>,
}

#[derive(Deserialize, Default)]
struct RawSimilarity {
    enabled: Option<bool>,
    threshold: Option<f64>,
}

#[derive(Deserialize, Default)]
struct RawLimits {
    max_meta_bytes: Option<usize>,
    max_content_bytes: Option<usize>,
    max_type_len: Option<usize>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, StoreError> {
    let store_path_override = env::var("MEMEX_STORE_PATH").ok();
    let log_level_override = env::var("MEMEX_LOG_LEVEL").ok();
    load_from(
        Path::new("config/default.toml"),
        store_path_override.as_deref(),
        log_level_override.as_deref(),
    )
}

/// Internal loader. Accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(
    path: &Path,
    store_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, StoreError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| StoreError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| StoreError::Config(format!("parse error in {}: {e}", path.display())))?;

    let s = parsed.store;
    let store_path = expand_home(store_path_override.unwrap_or(&s.path));
    let log_level = log_level_override.unwrap_or(&s.log_level).to_string();
    logger::parse_filter(&log_level)
        .map_err(|e| StoreError::Config(format!("store.log_level: {e}")))?;

    let engine = EngineConfig {
        chunking: resolve_chunking(parsed.chunking)?,
        similarity: resolve_similarity(parsed.similarity)?,
        limits: resolve_limits(parsed.limits),
    };

    Ok(Config {
        store_path,
        log_level,
        create_if_missing: s.create_if_missing,
        engine,
    })
}

fn resolve_chunking(raw: RawChunking) -> Result<ChunkingConfig, StoreError> {
    let d = ChunkingConfig::default();
    let c = ChunkingConfig {
        small_threshold: raw.small_threshold.unwrap_or(d.small_threshold),
        min_size: raw.min_size.unwrap_or(d.min_size),
        max_size: raw.max_size.unwrap_or(d.max_size),
        large_content_threshold: raw.large_content_threshold.unwrap_or(d.large_content_threshold),
        avg_mask_bits: raw.avg_mask_bits.unwrap_or(d.avg_mask_bits),
        large_avg_mask_bits: raw.large_avg_mask_bits.unwrap_or(d.large_avg_mask_bits),
    };
    if c.min_size == 0 || c.min_size.saturating_mul(2) > c.max_size {
        return Err(StoreError::Config(format!(
            "chunking.min_size ({}) must be non-zero and at most half of max_size ({})",
            c.min_size, c.max_size
        )));
    }
    if c.avg_mask_bits > 32 || c.large_avg_mask_bits > 32 {
        return Err(StoreError::Config("chunking mask bits must be at most 32".into()));
    }
    Ok(c)
}

fn resolve_similarity(raw: RawSimilarity) -> Result<SimilarityConfig, StoreError> {
    let d = SimilarityConfig::default();
    let threshold = raw.threshold.unwrap_or(d.threshold);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(StoreError::Config(format!(
            "similarity.threshold must be within 0.0..=1.0, got {threshold}"
        )));
    }
    Ok(SimilarityConfig { enabled: raw.enabled.unwrap_or(d.enabled), threshold })
}

fn resolve_limits(raw: RawLimits) -> Limits {
    let d = Limits::default();
    Limits {
        max_meta_bytes: raw.max_meta_bytes.unwrap_or(d.max_meta_bytes),
        max_content_bytes: raw.max_content_bytes.unwrap_or(d.max_content_bytes),
        max_type_len: raw.max_type_len.unwrap_or(d.max_type_len),
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
