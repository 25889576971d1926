//! Error types for the neighbor cache.
//!
//! Stale preconditions (VLAN gone, subnet changed, tree already up to date)
//! are not errors: reconciliation resolves them to a no-op. What remains
//! here are failures of the surrounding machinery.

use sonic_switch_state::StateUpdateError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NeighCacheError {
    /// The state updater could not apply a blocking update.
    #[error("state update failed: {0}")]
    StateUpdate(#[from] StateUpdateError),

    /// The background execution context could not be started.
    #[error("failed to start background context: {0}")]
    Background(#[source] std::io::Error),

    /// Configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for the config schema.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// Configuration values are out of range.
    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, NeighCacheError>;
