//! Neighbor (ARP/NDP) resolution cache for the SONiC switch control plane.
//!
//! Each VLAN gets one cache per address family. A cache tracks learned and
//! pending IP to MAC/port bindings, ages them through the
//! REACHABLE/STALE/PROBE lifecycle on a shared background context, and
//! mirrors every change into the versioned [`SwitchState`] tree through the
//! [`StateUpdater`].
//!
//! # Architecture
//!
//! ```text
//!   protocol handler ──▶ NeighborCache<Arp|Ndp> ──transform──▶ StateUpdater ──▶ SwitchState
//!                          │  (map lock)                          (single committer)
//!                          ▼
//!                   NeighborCacheEntry ◀── timers ── BackgroundContext
//!                          │
//!                          └── probe due ──▶ NeighborProber
//! ```
//!
//! Reconciliation transforms re-check their preconditions against the
//! version they are applied to, so a VLAN deleted or a subnet changed while
//! an update was queued turns the update into a no-op.
//!
//! [`SwitchState`]: sonic_switch_state::SwitchState
//! [`StateUpdater`]: sonic_switch_state::StateUpdater

mod background;
mod cache;
mod config;
mod entry;
mod error;
mod neighbor_updater;
mod prober;
mod reconcile;

pub use background::BackgroundContext;
pub use cache::{ArpCache, NdpCache, NeighborCache};
pub use config::{
    NeighborCacheConfig, DEFAULT_MAX_PROBES, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_STALE_ENTRY_INTERVAL_SECS, DEFAULT_TIMEOUT_SECS,
};
pub use entry::{NeighborCacheEntry, NeighborEntrySnapshot, NeighborEntryState};
pub use error::{NeighCacheError, Result};
pub use neighbor_updater::{NeighborUpdater, VlanCaches};
pub use prober::{NeighborProber, NullProber};
