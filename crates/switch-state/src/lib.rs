//! Versioned switch state for the SONiC neighbor control plane.
//!
//! The state tree holds VLANs, router interfaces and the per-VLAN neighbor
//! tables that the forwarding plane is programmed from. Published versions
//! are immutable and shared; writers submit pure transforms to the
//! [`StateUpdater`], which applies them one at a time against the latest
//! version.
//!
//! ```text
//! SwitchState (generation N)
//!   ├── vlans:      VlanId -> Vlan { arp_table, ndp_table }
//!   └── interfaces: InterfaceId -> Interface { vlan_id, addresses }
//! ```

mod error;
mod neighbor;
mod state;
mod types;
mod updater;
pub mod warm_boot;

pub use error::{ParseError, Result, StateUpdateError};
pub use neighbor::{
    Arp, ArpTable, NdpTable, Ndp, NeighborAddress, NeighborEntryFields, NeighborTable,
    NeighborTableKind,
};
pub use state::{Interface, LocalSubnets, SwitchState, Vlan};
pub use types::{InterfaceId, IpPrefix, MacAddress, PortId, VlanId};
pub use updater::{PendingUpdate, StateUpdateFn, StateUpdater};
