//! Per-switch owner of the neighbor caches.
//!
//! Keeps one ARP and one NDP cache per VLAN. All caches share a single
//! background context, state updater and prober.

use crate::background::BackgroundContext;
use crate::cache::{ArpCache, NdpCache};
use crate::config::NeighborCacheConfig;
use crate::error::Result;
use crate::prober::NeighborProber;
use parking_lot::RwLock;
use sonic_switch_state::{Arp, InterfaceId, Ndp, PortId, StateUpdater, SwitchState, VlanId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The two caches of one VLAN.
#[derive(Clone)]
pub struct VlanCaches {
    pub arp: Arc<ArpCache>,
    pub ndp: Arc<NdpCache>,
}

pub struct NeighborUpdater {
    config: NeighborCacheConfig,
    background: BackgroundContext,
    state_updater: StateUpdater,
    prober: Arc<dyn NeighborProber>,
    caches: RwLock<BTreeMap<VlanId, VlanCaches>>,
}

impl NeighborUpdater {
    /// Validates `config` and starts the shared background context.
    pub fn new(
        config: NeighborCacheConfig,
        state_updater: StateUpdater,
        prober: Arc<dyn NeighborProber>,
    ) -> Result<Self> {
        config.validate()?;
        let background = BackgroundContext::spawn("neighbor-cache")?;
        Ok(Self::with_background(config, background, state_updater, prober))
    }

    pub fn with_background(
        config: NeighborCacheConfig,
        background: BackgroundContext,
        state_updater: StateUpdater,
        prober: Arc<dyn NeighborProber>,
    ) -> Self {
        Self {
            config,
            background,
            state_updater,
            prober,
            caches: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn config(&self) -> &NeighborCacheConfig {
        &self.config
    }

    /// Creates the caches for `vlan_id`. Existing caches are kept.
    #[instrument(skip(self))]
    pub fn vlan_added(&self, vlan_id: VlanId, interface_id: InterfaceId) -> VlanCaches {
        let mut caches = self.caches.write();
        if let Some(existing) = caches.get(&vlan_id) {
            if existing.arp.interface_id() != interface_id {
                warn!(
                    existing = %existing.arp.interface_id(),
                    "VLAN already has neighbor caches for another interface"
                );
            }
            return existing.clone();
        }

        let created = VlanCaches {
            arp: Arc::new(ArpCache::new(
                vlan_id,
                interface_id,
                &self.config,
                self.background.clone(),
                self.state_updater.clone(),
                Arc::clone(&self.prober),
            )),
            ndp: Arc::new(NdpCache::new(
                vlan_id,
                interface_id,
                &self.config,
                self.background.clone(),
                self.state_updater.clone(),
                Arc::clone(&self.prober),
            )),
        };
        caches.insert(vlan_id, created.clone());
        info!("Added neighbor caches");
        created
    }

    /// Drops the caches for `vlan_id`, tearing down all of their entries.
    ///
    /// The tree nodes of the VLAN are left alone: the VLAN itself is being
    /// removed from the tree by whoever called this.
    #[instrument(skip(self))]
    pub fn vlan_deleted(&self, vlan_id: VlanId) -> bool {
        let Some(removed) = self.caches.write().remove(&vlan_id) else {
            return false;
        };
        info!(
            arp = removed.arp.len(),
            ndp = removed.ndp.len(),
            "Removing neighbor caches"
        );
        // Teardown waits on the background context, so it happens here,
        // outside the map lock.
        drop(removed);
        true
    }

    /// Forces every entry learned on `port` back to pending, in every VLAN.
    #[instrument(skip(self))]
    pub fn port_down(&self, port: PortId) {
        for caches in self.snapshot() {
            caches.arp.port_down(port);
            caches.ndp.port_down(port);
        }
    }

    pub fn caches_for(&self, vlan_id: VlanId) -> Option<VlanCaches> {
        self.caches.read().get(&vlan_id).cloned()
    }

    pub fn arp_cache(&self, vlan_id: VlanId) -> Option<Arc<ArpCache>> {
        self.caches.read().get(&vlan_id).map(|caches| Arc::clone(&caches.arp))
    }

    pub fn ndp_cache(&self, vlan_id: VlanId) -> Option<Arc<NdpCache>> {
        self.caches.read().get(&vlan_id).map(|caches| Arc::clone(&caches.ndp))
    }

    pub fn vlans(&self) -> Vec<VlanId> {
        self.caches.read().keys().copied().collect()
    }

    /// Seeds the caches from the neighbor tables of `state`.
    ///
    /// Used after a warm boot. VLANs without caches get them, provided the
    /// tree has an interface on that VLAN to own the entries.
    #[instrument(skip(self, state), fields(generation = state.generation()))]
    pub fn repopulate_from(&self, state: &SwitchState) {
        for vlan in state.vlans() {
            let caches = match self.caches_for(vlan.id) {
                Some(caches) => caches,
                None => {
                    let Some(interface) = state.interfaces().find(|intf| intf.vlan_id == vlan.id)
                    else {
                        warn!(vlan = %vlan.id, "No interface for VLAN, skipping neighbor tables");
                        continue;
                    };
                    self.vlan_added(vlan.id, interface.id)
                }
            };
            caches.arp.repopulate(vlan.neighbor_table::<Arp>());
            caches.ndp.repopulate(vlan.neighbor_table::<Ndp>());
        }
    }

    fn snapshot(&self) -> Vec<VlanCaches> {
        self.caches.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NeighborEntryState;
    use crate::prober::NullProber;
    use pretty_assertions::assert_eq;
    use sonic_switch_state::{Interface, MacAddress, NeighborEntryFields, Vlan};
    use std::net::{Ipv4Addr, Ipv6Addr};

    const INTF: InterfaceId = InterfaceId(20);

    fn vlan_id() -> VlanId {
        VlanId::new(20).unwrap()
    }

    fn fixture() -> SwitchState {
        let mut state = SwitchState::new();
        state.add_vlan(Vlan::new(vlan_id()));
        state.add_interface(Interface::new(
            INTF,
            vlan_id(),
            vec!["10.0.20.1/24".parse().unwrap(), "2001:db8:20::1/64".parse().unwrap()],
        ));
        state
    }

    fn updater_for(state: SwitchState) -> (NeighborUpdater, StateUpdater) {
        let state_updater = StateUpdater::spawn(state).unwrap();
        let config = NeighborCacheConfig {
            timeout_secs: 3600,
            stale_entry_interval_secs: 3600,
            ..NeighborCacheConfig::default()
        };
        let updater =
            NeighborUpdater::new(config, state_updater.clone(), Arc::new(NullProber)).unwrap();
        (updater, state_updater)
    }

    #[test]
    fn test_vlan_added_is_idempotent() {
        let (updater, _) = updater_for(fixture());
        let first = updater.vlan_added(vlan_id(), INTF);
        let second = updater.vlan_added(vlan_id(), INTF);
        assert!(Arc::ptr_eq(&first.arp, &second.arp));
        assert_eq!(updater.vlans(), vec![vlan_id()]);
    }

    #[test]
    fn test_vlan_deleted_drops_caches() {
        let (updater, _) = updater_for(fixture());
        updater.vlan_added(vlan_id(), INTF);
        updater
            .arp_cache(vlan_id())
            .unwrap()
            .set_pending(Ipv4Addr::new(10, 0, 20, 5), false);

        assert!(updater.vlan_deleted(vlan_id()));
        assert!(updater.arp_cache(vlan_id()).is_none());
        assert!(!updater.vlan_deleted(vlan_id()));
    }

    #[test]
    fn test_port_down_reaches_both_families() {
        let (updater, _) = updater_for(fixture());
        let caches = updater.vlan_added(vlan_id(), INTF);
        let v4 = Ipv4Addr::new(10, 0, 20, 2);
        let v6: Ipv6Addr = "2001:db8:20::2".parse().unwrap();
        let mac = MacAddress::new([2, 0, 0, 0, 20, 2]);
        caches.arp.upsert(v4, mac, PortId(3), NeighborEntryState::Reachable);
        caches.ndp.upsert(v6, mac, PortId(3), NeighborEntryState::Reachable);

        updater.port_down(PortId(3));

        assert!(caches.arp.lookup(v4).unwrap().is_pending());
        assert!(caches.ndp.lookup(v6).unwrap().is_pending());
    }

    #[test]
    fn test_repopulate_creates_missing_caches() {
        let ip = Ipv4Addr::new(10, 0, 20, 9);
        let mut state = fixture();
        state
            .modify_neighbor_table::<Arp>(vlan_id())
            .unwrap()
            .add_entry(NeighborEntryFields::resolved(
                ip,
                MacAddress::new([2, 0, 0, 0, 20, 9]),
                PortId(1),
                INTF,
            ));
        let (updater, state_updater) = updater_for(state.clone());

        updater.repopulate_from(&state);

        let entry = updater.arp_cache(vlan_id()).unwrap().lookup(ip).unwrap();
        assert_eq!(entry.state(), NeighborEntryState::Stale);
        state_updater.flush().unwrap();
        assert_eq!(state_updater.current().generation(), 0);
    }

    #[test]
    fn test_repopulate_skips_vlan_without_interface() {
        let mut state = SwitchState::new();
        state.add_vlan(Vlan::new(vlan_id()));
        let (updater, _) = updater_for(state.clone());

        updater.repopulate_from(&state);
        assert!(updater.vlans().is_empty());
    }
}
