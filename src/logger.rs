//! Logging initialisation via tracing-subscriber.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! embedding program's job. The `memex` binary calls [`init`] once, after the
//! configured level is known. Config loading runs [`parse_filter`] first so
//! a bad `log_level` is reported as a config error.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::StoreError;

/// Validate a filter and build it.
///
/// Accepts a bare level (`"info"`) or comma-separated directives such as
/// `"memex::engine=debug,warn"`. Every directive must end in a known level,
/// so a typo like `"verbose"` is rejected instead of silently becoming a
/// target name.
pub fn parse_filter(spec: &str) -> Result<EnvFilter, StoreError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(StoreError::Logger("log level must not be empty".into()));
    }
    for directive in spec.split(',') {
        let level = directive.rsplit('=').next().unwrap_or(directive).trim();
        if level.is_empty() || level.parse::<LevelFilter>().is_err() {
            return Err(StoreError::Logger(format!(
                "unrecognised log level '{level}' in '{spec}'"
            )));
        }
    }
    EnvFilter::try_new(spec).map_err(|e| StoreError::Logger(format!("bad log filter '{spec}': {e}")))
}

/// Install the global subscriber, writing to stderr.
///
/// A valid `RUST_LOG` wins over `level`, which is the configured default.
/// Fails if a subscriber is already installed.
pub fn init(level: &str) -> Result<(), StoreError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(level)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| StoreError::Logger(format!("failed to set subscriber: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_levels_parse() {
        for l in ["error", "warn", "info", "debug", "trace", "off", " info "] {
            assert!(parse_filter(l).is_ok(), "expected '{l}' to be valid");
        }
    }

    #[test]
    fn directives_parse() {
        assert!(parse_filter("memex=debug").is_ok());
        assert!(parse_filter("memex::engine=trace,warn").is_ok());
    }

    #[test]
    fn typos_are_rejected() {
        assert!(parse_filter("verbose").is_err());
        assert!(parse_filter("").is_err());
        assert!(parse_filter("memex=loud").is_err());
        assert!(parse_filter("info,").is_err());
    }

    #[test]
    fn init_succeeds_or_already_init() {
        // Another test in this process may have installed a subscriber first.
        match init("info") {
            Ok(()) => {}
            Err(StoreError::Logger(msg)) if msg.contains("set subscriber") => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
