//! Error types for the switch state crate.

use thiserror::Error;

/// Parse failures for the identifier types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),
}

/// Errors surfaced by [`StateUpdater`](crate::StateUpdater).
///
/// A transform that decides there is nothing to do is not an error; it is
/// reported as `Ok(false)` by the blocking apply.
#[derive(Debug, Error)]
pub enum StateUpdateError {
    /// The committer thread has exited; nothing can be applied anymore.
    #[error("state updater stopped before applying '{0}'")]
    UpdaterStopped(String),

    /// The transform panicked while being applied.
    #[error("state update '{0}' panicked")]
    TransformPanicked(String),

    /// Failed to start the committer thread.
    #[error("failed to start state updater: {0}")]
    Spawn(#[from] std::io::Error),

    /// Warm-boot file could not be read or written.
    #[error("warm boot state I/O failed for {path}: {source}")]
    WarmBootIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Warm-boot file contents are not a valid state dump.
    #[error("warm boot state is malformed: {0}")]
    WarmBootFormat(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateUpdateError>;
