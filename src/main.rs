//! memex: open a store and check its history.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger at configured level
//!   4. Open (or create) the store
//!   5. Verify the action log chain
//!   6. Print a summary and exit

use memex::{Repository, StoreError, config, logger};
use tracing::info;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), StoreError> {
    // Load .env if present; ignore errors (file is optional).
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::init(&config.log_level)?;

    info!(
        store = %config.store_path.display(),
        log_level = %config.log_level,
        "config loaded"
    );

    if !config.store_path.exists() && !config.create_if_missing {
        return Err(StoreError::NotFound(format!(
            "store {} (create_if_missing = false)",
            config.store_path.display()
        )));
    }
    if let Some(parent) = config.store_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let repo = Repository::open_or_create(&config.store_path, config.engine.clone())?;
    repo.check_history()?;
    let stats = repo.stats();
    repo.close()?;

    println!(
        "✓ {}: {} nodes, {} links, {} chunks ({} bytes), {} actions, history verified",
        config.store_path.display(),
        stats.store.live_nodes,
        stats.store.live_edges,
        stats.chunks.chunks,
        stats.chunks.stored_bytes,
        stats.actions,
    );
    Ok(())
}
