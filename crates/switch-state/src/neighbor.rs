//! Neighbor tables (ARP for IPv4, NDP for IPv6) stored under each VLAN.
//!
//! Both address families share one generic [`NeighborTable`]. The
//! [`NeighborTableKind`] trait picks which of a VLAN's two tables a caller
//! works on, so the neighbor cache engine can be written once and
//! instantiated for [`Arp`] and [`Ndp`].

use crate::state::Vlan;
use crate::types::{InterfaceId, MacAddress, PortId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// A network address that can key a neighbor table.
pub trait NeighborAddress:
    Copy
    + Eq
    + Ord
    + Hash
    + fmt::Debug
    + fmt::Display
    + Into<IpAddr>
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl NeighborAddress for Ipv4Addr {}
impl NeighborAddress for Ipv6Addr {}

/// One neighbor binding as stored in the state tree.
///
/// A binding without a MAC is pending: resolution has been requested but no
/// reply has been seen yet. `ip` and `interface_id` identify the binding;
/// `mac` and `port` are the resolved part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntryFields<A> {
    pub ip: A,
    pub mac: Option<MacAddress>,
    pub port: Option<PortId>,
    pub interface_id: InterfaceId,
}

impl<A: NeighborAddress> NeighborEntryFields<A> {
    pub fn resolved(ip: A, mac: MacAddress, port: PortId, interface_id: InterfaceId) -> Self {
        Self {
            ip,
            mac: Some(mac),
            port: Some(port),
            interface_id,
        }
    }

    pub fn pending(ip: A, interface_id: InterfaceId) -> Self {
        Self {
            ip,
            mac: None,
            port: None,
            interface_id,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.mac.is_none()
    }
}

impl<A: NeighborAddress> fmt::Display for NeighborEntryFields<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mac, self.port) {
            (Some(mac), Some(port)) => {
                write!(f, "{} --> {} on {} ({})", self.ip, mac, port, self.interface_id)
            }
            _ => write!(f, "{} --> pending ({})", self.ip, self.interface_id),
        }
    }
}

/// Neighbor bindings of one address family within one VLAN.
///
/// Tables are values: the state tree holds them behind `Arc` and mutates a
/// private copy when building a new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborTable<A> {
    nodes: BTreeMap<A, NeighborEntryFields<A>>,
}

pub type ArpTable = NeighborTable<Ipv4Addr>;
pub type NdpTable = NeighborTable<Ipv6Addr>;

impl<A: NeighborAddress> NeighborTable<A> {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get_node_if(&self, ip: &A) -> Option<&NeighborEntryFields<A>> {
        self.nodes.get(ip)
    }

    /// Adds a resolved binding.
    ///
    /// # Panics
    ///
    /// Panics if a node already exists for the address.
    pub fn add_entry(&mut self, fields: NeighborEntryFields<A>) {
        let ip = fields.ip;
        let prev = self.nodes.insert(ip, fields);
        assert!(prev.is_none(), "neighbor table already has a node for {}", ip);
    }

    /// Adds a pending binding for `ip` on `interface_id`.
    ///
    /// # Panics
    ///
    /// Panics if a node already exists for the address.
    pub fn add_pending_entry(&mut self, ip: A, interface_id: InterfaceId) {
        self.add_entry(NeighborEntryFields::pending(ip, interface_id));
    }

    /// Replaces the node for `fields.ip` in place.
    ///
    /// # Panics
    ///
    /// Panics if no node exists for the address.
    pub fn update_entry(&mut self, fields: NeighborEntryFields<A>) {
        match self.nodes.get_mut(&fields.ip) {
            Some(node) => *node = fields,
            None => panic!("neighbor table has no node for {}", fields.ip),
        }
    }

    pub fn remove_node(&mut self, ip: &A) -> Option<NeighborEntryFields<A>> {
        self.nodes.remove(ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NeighborEntryFields<A>> {
        self.nodes.values()
    }
}

impl<A: NeighborAddress> Default for NeighborTable<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: NeighborAddress> FromIterator<NeighborEntryFields<A>> for NeighborTable<A> {
    fn from_iter<I: IntoIterator<Item = NeighborEntryFields<A>>>(iter: I) -> Self {
        Self {
            nodes: iter.into_iter().map(|fields| (fields.ip, fields)).collect(),
        }
    }
}

// Tables serialize as a list of nodes so that JSON never needs address keys.
impl<A: NeighborAddress> Serialize for NeighborTable<A> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.nodes.values())
    }
}

impl<'de, A: NeighborAddress> Deserialize<'de> for NeighborTable<A> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let nodes = Vec::<NeighborEntryFields<A>>::deserialize(deserializer)?;
        Ok(nodes.into_iter().collect())
    }
}

/// Selects one of a VLAN's neighbor tables.
pub trait NeighborTableKind: Send + Sync + 'static {
    type Addr: NeighborAddress;

    /// Short protocol name used in logs ("arp" / "ndp").
    const NAME: &'static str;

    fn table(vlan: &Vlan) -> &Arc<NeighborTable<Self::Addr>>;

    fn table_mut(vlan: &mut Vlan) -> &mut Arc<NeighborTable<Self::Addr>>;

    /// Copy-on-write access: clones the table if any other version shares it.
    fn modify(vlan: &mut Vlan) -> &mut NeighborTable<Self::Addr> {
        Arc::make_mut(Self::table_mut(vlan))
    }
}

/// IPv4 neighbors resolved through ARP.
#[derive(Debug)]
pub enum Arp {}

/// IPv6 neighbors resolved through neighbor discovery.
#[derive(Debug)]
pub enum Ndp {}

impl NeighborTableKind for Arp {
    type Addr = Ipv4Addr;
    const NAME: &'static str = "arp";

    fn table(vlan: &Vlan) -> &Arc<ArpTable> {
        &vlan.arp_table
    }

    fn table_mut(vlan: &mut Vlan) -> &mut Arc<ArpTable> {
        &mut vlan.arp_table
    }
}

impl NeighborTableKind for Ndp {
    type Addr = Ipv6Addr;
    const NAME: &'static str = "ndp";

    fn table(vlan: &Vlan) -> &Arc<NdpTable> {
        &vlan.ndp_table
    }

    fn table_mut(vlan: &mut Vlan) -> &mut Arc<NdpTable> {
        &mut vlan.ndp_table
    }
}
