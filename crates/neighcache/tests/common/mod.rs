//! Shared fixtures for the neighbor cache integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use sonic_neighcache::{
    ArpCache, BackgroundContext, NdpCache, NeighborCacheConfig, NeighborProber,
};
use sonic_switch_state::{
    Interface, InterfaceId, NeighborEntryFields, NeighborTableKind, StateUpdater, SwitchState,
    Vlan, VlanId,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

pub const INTF: InterfaceId = InterfaceId(10);

pub fn vlan_id() -> VlanId {
    VlanId::new(10).expect("valid VLAN")
}

pub fn v4(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, last)
}

pub fn v6(last: u16) -> Ipv6Addr {
    Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, last)
}

/// Installs a test subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// VLAN 10 with interface 10 on 10.0.0.1/24 and 2001:db8::1/64.
pub fn fixture_state() -> SwitchState {
    let mut state = SwitchState::new();
    state.add_vlan(Vlan::new(vlan_id()));
    state.add_interface(Interface::new(
        INTF,
        vlan_id(),
        vec![
            "10.0.0.1/24".parse().expect("valid prefix"),
            "2001:db8::1/64".parse().expect("valid prefix"),
        ],
    ));
    state
}

/// Timers long enough that nothing fires during a test.
pub fn quiet_config() -> NeighborCacheConfig {
    NeighborCacheConfig {
        timeout_secs: 3600,
        stale_entry_interval_secs: 3600,
        probe_interval_ms: 3_600_000,
        max_probes: 3,
    }
}

/// Records every probe instead of sending it.
#[derive(Default)]
pub struct RecordingProber {
    probes: Mutex<Vec<(IpAddr, InterfaceId, VlanId)>>,
}

impl RecordingProber {
    pub fn probes(&self) -> Vec<(IpAddr, InterfaceId, VlanId)> {
        self.probes.lock().clone()
    }

    pub fn count_for(&self, ip: impl Into<IpAddr>) -> usize {
        let ip = ip.into();
        self.probes.lock().iter().filter(|(probed, _, _)| *probed == ip).count()
    }
}

impl NeighborProber for RecordingProber {
    fn probe_for(&self, ip: IpAddr, interface_id: InterfaceId, vlan_id: VlanId) {
        self.probes.lock().push((ip, interface_id, vlan_id));
    }
}

pub struct Harness {
    pub updater: StateUpdater,
    pub background: BackgroundContext,
    pub prober: Arc<RecordingProber>,
    pub arp: ArpCache,
    pub ndp: NdpCache,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(fixture_state(), quiet_config())
    }

    pub fn with(state: SwitchState, config: NeighborCacheConfig) -> Self {
        init_tracing();
        let updater = StateUpdater::spawn(state).expect("state updater");
        let background = BackgroundContext::spawn("neighcache-test").expect("background context");
        let prober = Arc::new(RecordingProber::default());
        let arp = ArpCache::new(
            vlan_id(),
            INTF,
            &config,
            background.clone(),
            updater.clone(),
            prober.clone(),
        );
        let ndp = NdpCache::new(
            vlan_id(),
            INTF,
            &config,
            background.clone(),
            updater.clone(),
            prober.clone(),
        );
        Self {
            updater,
            background,
            prober,
            arp,
            ndp,
        }
    }

    /// Waits for every queued transform and returns the node for `ip`.
    pub fn node<T: NeighborTableKind>(&self, ip: T::Addr) -> Option<NeighborEntryFields<T::Addr>> {
        self.updater.flush().expect("flush");
        self.updater
            .current()
            .get_vlan_if(vlan_id())?
            .neighbor_table::<T>()
            .get_node_if(&ip)
            .cloned()
    }

    pub fn generation(&self) -> u64 {
        self.updater.flush().expect("flush");
        self.updater.current().generation()
    }

    /// Removes the VLAN from the tree, as a VLAN delete would.
    pub fn delete_vlan(&self) {
        let vlan = vlan_id();
        let removed = self
            .updater
            .update_state_blocking("delete vlan", move |state| {
                let mut next = (**state).clone();
                next.remove_vlan(vlan)?;
                Some(next)
            })
            .expect("delete vlan");
        assert!(removed);
    }
}

/// Polls `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
