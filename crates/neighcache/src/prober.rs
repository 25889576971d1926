//! Outbound resolution probes.
//!
//! Building and sending ARP requests / neighbor solicitations belongs to
//! the protocol handler. The cache only decides when a probe is due.

use sonic_switch_state::{InterfaceId, VlanId};
use std::net::IpAddr;

/// Sends a resolution probe (ARP request or neighbor solicitation).
#[cfg_attr(test, mockall::automock)]
pub trait NeighborProber: Send + Sync {
    fn probe_for(&self, ip: IpAddr, interface_id: InterfaceId, vlan_id: VlanId);
}

/// Prober that sends nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProber;

impl NeighborProber for NullProber {
    fn probe_for(&self, _ip: IpAddr, _interface_id: InterfaceId, _vlan_id: VlanId) {}
}
