//! Neighbor cache timing configuration.

use crate::error::{NeighCacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STALE_ENTRY_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_PROBES: u32 = 300;

/// Timers and probe budget applied to every entry of a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NeighborCacheConfig {
    /// How long a binding stays REACHABLE before aging to STALE.
    pub timeout_secs: u64,
    /// How long a binding stays STALE before it is probed.
    pub stale_entry_interval_secs: u64,
    /// Retry interval while INCOMPLETE or PROBE.
    pub probe_interval_ms: u64,
    /// Unanswered probes before a binding expires.
    pub max_probes: u32,
}

impl Default for NeighborCacheConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            stale_entry_interval_secs: DEFAULT_STALE_ENTRY_INTERVAL_SECS,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            max_probes: DEFAULT_MAX_PROBES,
        }
    }
}

impl NeighborCacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| NeighCacheError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(NeighCacheError::Config("timeout_secs must be non-zero".into()));
        }
        if self.stale_entry_interval_secs == 0 {
            return Err(NeighCacheError::Config(
                "stale_entry_interval_secs must be non-zero".into(),
            ));
        }
        if self.probe_interval_ms == 0 {
            return Err(NeighCacheError::Config("probe_interval_ms must be non-zero".into()));
        }
        if self.max_probes == 0 {
            return Err(NeighCacheError::Config("max_probes must be non-zero".into()));
        }
        Ok(())
    }

    pub(crate) fn timings(&self) -> EntryTimings {
        EntryTimings {
            reachable: Duration::from_secs(self.timeout_secs),
            stale: Duration::from_secs(self.stale_entry_interval_secs),
            probe: Duration::from_millis(self.probe_interval_ms),
            max_probes: self.max_probes,
        }
    }
}

/// Resolved timer values carried by each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryTimings {
    pub reachable: Duration,
    pub stale: Duration,
    pub probe: Duration,
    pub max_probes: u32,
}
