//! The immutable, versioned switch state tree.
//!
//! A [`SwitchState`] is never mutated once it has been published. Building
//! a new version starts from a shallow clone of the current one; every
//! child sits behind an `Arc`, and the `modify_*` helpers go through
//! `Arc::make_mut`, so only the path from the root to the changed node is
//! copied while everything else stays shared with older versions.

use crate::neighbor::{ArpTable, NdpTable, NeighborTable, NeighborTableKind};
use crate::types::{InterfaceId, IpPrefix, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

/// A VLAN and the neighbor tables learned on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub id: VlanId,
    pub name: String,
    pub arp_table: Arc<ArpTable>,
    pub ndp_table: Arc<NdpTable>,
}

impl Vlan {
    pub fn new(id: VlanId) -> Self {
        Self {
            id,
            name: id.to_string(),
            arp_table: Arc::new(ArpTable::new()),
            ndp_table: Arc::new(NdpTable::new()),
        }
    }

    pub fn neighbor_table<T: NeighborTableKind>(&self) -> &Arc<NeighborTable<T::Addr>> {
        T::table(self)
    }
}

/// A router interface with the subnets configured on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub id: InterfaceId,
    pub vlan_id: VlanId,
    pub addresses: Vec<IpPrefix>,
}

impl Interface {
    pub fn new(id: InterfaceId, vlan_id: VlanId, addresses: Vec<IpPrefix>) -> Self {
        Self {
            id,
            vlan_id,
            addresses,
        }
    }

    pub fn has_subnet_for(&self, ip: IpAddr) -> bool {
        self.addresses.iter().any(|prefix| prefix.contains(ip))
    }
}

/// Root of the switch state tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchState {
    generation: u64,
    vlans: Arc<BTreeMap<VlanId, Arc<Vlan>>>,
    interfaces: Arc<BTreeMap<InterfaceId, Arc<Interface>>>,
}

impl SwitchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions published before this one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn get_vlan_if(&self, id: VlanId) -> Option<&Arc<Vlan>> {
        self.vlans.get(&id)
    }

    pub fn vlans(&self) -> impl Iterator<Item = &Arc<Vlan>> {
        self.vlans.values()
    }

    pub fn get_interface_if(&self, id: InterfaceId) -> Option<&Arc<Interface>> {
        self.interfaces.get(&id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Arc<Interface>> {
        self.interfaces.values()
    }

    /// Inserts or replaces a VLAN.
    pub fn add_vlan(&mut self, vlan: Vlan) {
        Arc::make_mut(&mut self.vlans).insert(vlan.id, Arc::new(vlan));
    }

    pub fn remove_vlan(&mut self, id: VlanId) -> Option<Arc<Vlan>> {
        Arc::make_mut(&mut self.vlans).remove(&id)
    }

    /// Inserts or replaces an interface.
    pub fn add_interface(&mut self, interface: Interface) {
        Arc::make_mut(&mut self.interfaces).insert(interface.id, Arc::new(interface));
    }

    pub fn remove_interface(&mut self, id: InterfaceId) -> Option<Arc<Interface>> {
        Arc::make_mut(&mut self.interfaces).remove(&id)
    }

    /// Copy-on-write access to a VLAN of this (unpublished) version.
    pub fn modify_vlan(&mut self, id: VlanId) -> Option<&mut Vlan> {
        Arc::make_mut(&mut self.vlans)
            .get_mut(&id)
            .map(Arc::make_mut)
    }

    /// Copy-on-write access to one neighbor table of a VLAN.
    pub fn modify_neighbor_table<T: NeighborTableKind>(
        &mut self,
        id: VlanId,
    ) -> Option<&mut NeighborTable<T::Addr>> {
        self.modify_vlan(id).map(T::modify)
    }
}

/// Subnet membership of addresses on router interfaces.
pub trait LocalSubnets {
    /// Returns true if `ip` falls in a subnet configured on `interface_id`.
    fn is_locally_attached(&self, ip: IpAddr, interface_id: InterfaceId) -> bool;
}

impl LocalSubnets for SwitchState {
    fn is_locally_attached(&self, ip: IpAddr, interface_id: InterfaceId) -> bool {
        self.get_interface_if(interface_id)
            .is_some_and(|intf| intf.has_subnet_for(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighbor::{Arp, NeighborEntryFields};
    use crate::types::{MacAddress, PortId};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn base_state() -> SwitchState {
        let mut state = SwitchState::new();
        state.add_vlan(Vlan::new(vlan(10)));
        state.add_vlan(Vlan::new(vlan(20)));
        state.add_interface(Interface::new(
            InterfaceId(10),
            vlan(10),
            vec!["10.0.10.1/24".parse().unwrap()],
        ));
        state
    }

    #[test]
    fn test_modify_leaves_published_version_untouched() {
        let published = Arc::new(base_state());
        let ip: Ipv4Addr = "10.0.10.5".parse().unwrap();

        let mut next = (*published).clone();
        next.modify_neighbor_table::<Arp>(vlan(10))
            .unwrap()
            .add_entry(NeighborEntryFields::resolved(
                ip,
                MacAddress::new([2, 0, 0, 0, 0, 5]),
                PortId(1),
                InterfaceId(10),
            ));

        let old_table = published.get_vlan_if(vlan(10)).unwrap().neighbor_table::<Arp>();
        let new_table = next.get_vlan_if(vlan(10)).unwrap().neighbor_table::<Arp>();
        assert!(old_table.get_node_if(&ip).is_none());
        assert!(new_table.get_node_if(&ip).is_some());

        // The untouched VLAN is still shared between both versions.
        assert!(Arc::ptr_eq(
            published.get_vlan_if(vlan(20)).unwrap(),
            next.get_vlan_if(vlan(20)).unwrap()
        ));
    }

    #[test]
    fn test_modify_missing_vlan() {
        let mut state = base_state();
        assert!(state.modify_neighbor_table::<Arp>(vlan(30)).is_none());
    }

    #[test]
    fn test_locally_attached() {
        let state = base_state();
        assert!(state.is_locally_attached("10.0.10.9".parse().unwrap(), InterfaceId(10)));
        assert!(!state.is_locally_attached("10.0.11.9".parse().unwrap(), InterfaceId(10)));
        assert!(!state.is_locally_attached("10.0.10.9".parse().unwrap(), InterfaceId(99)));
    }

    #[test]
    fn test_remove_vlan() {
        let mut state = base_state();
        assert!(state.remove_vlan(vlan(10)).is_some());
        assert!(state.get_vlan_if(vlan(10)).is_none());
        assert_eq!(state.vlans().count(), 1);
    }
}
