//! Structured logging setup.
//!
//! Initializes a `tracing-subscriber` stack from the application
//! configuration: an `EnvFilter` seeded from the configured level (the
//! `RUST_LOG` environment variable wins if set) plus a formatted output
//! layer. State transitions and hardware calls throughout the crate emit
//! structured events against this subscriber.

use anyhow::{anyhow, Result};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize the global tracing subscriber.
///
/// `level` is a default filter directive such as `info` or
/// `polscan=debug`. Returns an error if a global subscriber is already
/// installed or the directive does not parse.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow!("invalid log filter '{level}': {e}"))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))?;

    Ok(())
}
