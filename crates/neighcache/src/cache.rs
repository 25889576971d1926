//! The per-VLAN neighbor cache.
//!
//! A [`NeighborCache`] owns the entries for one (VLAN, address family) pair
//! and mirrors them into the switch state. The map of entries is guarded by
//! a single lock. Creation and removal only happen under that lock; field
//! and state changes of an existing entry happen under it as well, whether
//! they come from a caller or from the entry's own timer on the background
//! context.
//!
//! Each mutation builds a transform (see [`crate::reconcile`]) and queues
//! it on the [`StateUpdater`] before the lock is released, so transforms
//! reach the tree in the same order as the cache mutations they mirror.
//! Queueing never blocks; waiting for a transform to be applied only
//! happens after the lock is released.
//!
//! # Teardown
//!
//! Entry timers run on the background context and take the cache lock when
//! they fire. A thread holding that lock must therefore never wait for the
//! background context. Removed entries are handed to a teardown task on the
//! background context instead of being stopped in place, and dropping the
//! cache detaches every entry under the lock, releases it, and only then
//! waits for all teardown tasks.

use crate::background::BackgroundContext;
use crate::config::{EntryTimings, NeighborCacheConfig};
use crate::entry::{EntryOwner, NeighborCacheEntry, NeighborEntrySnapshot, NeighborEntryState};
use crate::error::Result;
use crate::prober::NeighborProber;
use crate::reconcile;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use sonic_switch_state::{
    Arp, InterfaceId, MacAddress, NeighborEntryFields, NeighborTable, NeighborTableKind, Ndp,
    PortId, StateUpdater, VlanId,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, instrument, warn};

type EntryMap<A> = HashMap<A, Arc<NeighborCacheEntry<A>>>;

pub type ArpCache = NeighborCache<Arp>;
pub type NdpCache = NeighborCache<Ndp>;

struct CacheCore<T: NeighborTableKind> {
    vlan_id: VlanId,
    interface_id: InterfaceId,
    timings: EntryTimings,
    background: BackgroundContext,
    updater: StateUpdater,
    prober: Arc<dyn NeighborProber>,
    entries: Mutex<EntryMap<T::Addr>>,
    self_ref: Weak<CacheCore<T>>,
}

/// Neighbor cache for one VLAN and one address family.
pub struct NeighborCache<T: NeighborTableKind> {
    core: Arc<CacheCore<T>>,
}

impl<T: NeighborTableKind> NeighborCache<T> {
    pub fn new(
        vlan_id: VlanId,
        interface_id: InterfaceId,
        config: &NeighborCacheConfig,
        background: BackgroundContext,
        updater: StateUpdater,
        prober: Arc<dyn NeighborProber>,
    ) -> Self {
        let core = Arc::new_cyclic(|self_ref| CacheCore {
            vlan_id,
            interface_id,
            timings: config.timings(),
            background,
            updater,
            prober,
            entries: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        });
        debug!(proto = T::NAME, vlan = %vlan_id, interface = %interface_id, "Created neighbor cache");
        Self { core }
    }

    pub fn vlan_id(&self) -> VlanId {
        self.core.vlan_id
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.core.interface_id
    }

    pub fn len(&self) -> usize {
        self.core.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, ip: T::Addr) -> Option<Arc<NeighborCacheEntry<T::Addr>>> {
        self.core.entries.lock().get(&ip).cloned()
    }

    /// Snapshots every entry in the cache.
    pub fn entries(&self) -> Vec<NeighborEntrySnapshot<T::Addr>> {
        let mut snapshots: Vec<_> = self
            .core
            .entries
            .lock()
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.fields.ip);
        snapshots
    }

    /// Creates or updates a resolved binding and programs it.
    ///
    /// # Panics
    ///
    /// Panics if `state` is EXPIRED; only the state machine expires entries.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn upsert(
        &self,
        ip: T::Addr,
        mac: MacAddress,
        port: PortId,
        state: NeighborEntryState,
    ) -> Arc<NeighborCacheEntry<T::Addr>> {
        assert_ne!(state, NeighborEntryState::Expired, "cannot upsert an expired entry for {}", ip);
        let fields = NeighborEntryFields::resolved(ip, mac, port, self.core.interface_id);
        let mut entries = self.core.entries.lock();
        let entry = self.core.set_entry_internal(&mut entries, &fields, state, true);
        self.core.program_entry(fields);
        // set_entry_internal always yields an entry when adding.
        entry.unwrap_or_else(|| unreachable!("upsert did not create an entry for {}", ip))
    }

    /// Like [`upsert`](Self::upsert), but never creates an entry.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn upsert_existing(
        &self,
        ip: T::Addr,
        mac: MacAddress,
        port: PortId,
        state: NeighborEntryState,
    ) -> Option<Arc<NeighborCacheEntry<T::Addr>>> {
        assert_ne!(state, NeighborEntryState::Expired, "cannot upsert an expired entry for {}", ip);
        let fields = NeighborEntryFields::resolved(ip, mac, port, self.core.interface_id);
        let mut entries = self.core.entries.lock();
        let entry = self.core.set_entry_internal(&mut entries, &fields, state, false);
        if entry.is_some() {
            self.core.program_entry(fields);
        }
        entry
    }

    /// Starts resolution of `ip` with a pending entry.
    ///
    /// An existing entry is left alone unless `force` is set, in which case
    /// it is turned back into a pending one.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn set_pending(&self, ip: T::Addr, force: bool) {
        let mut entries = self.core.entries.lock();
        if let Some(fields) = self.core.set_pending_locked(&mut entries, ip, force) {
            self.core.program_pending_entry(fields, force);
        }
    }

    /// Removes `ip` from the cache and queues its removal from the tree.
    ///
    /// Returns false if there was no entry.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn remove(&self, ip: T::Addr) -> bool {
        let mut entries = self.core.entries.lock();
        if !self.core.remove_entry(&mut entries, ip) {
            return false;
        }
        self.core.flush_from_state(ip);
        true
    }

    /// Removes `ip` from the cache and waits for the tree update.
    ///
    /// Returns `Ok(false)` if there was no entry, or if the tree no longer
    /// held the node (e.g. the VLAN was deleted meanwhile). Blocks, so it
    /// must not be called from the background context or an async task.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn remove_blocking(&self, ip: T::Addr) -> Result<bool> {
        let pending = {
            let mut entries = self.core.entries.lock();
            if !self.core.remove_entry(&mut entries, ip) {
                return Ok(false);
            }
            let vlan_id = self.core.vlan_id;
            self.core
                .updater
                .queue_update(format!("flush neighbor entry {ip}"), move |state| {
                    reconcile::flush_entry::<T>(state, vlan_id, ip)
                })
        };
        Ok(pending.wait()?)
    }

    /// Seeds the cache from an existing table, e.g. after a warm boot.
    ///
    /// Resolved nodes start STALE so they are re-validated soon; pending
    /// nodes start INCOMPLETE. Each node is reconciled like an upsert,
    /// which is a no-op when the tree already holds it. Nodes learned on
    /// another interface of the VLAN belong to another cache and are
    /// skipped.
    #[instrument(skip(self, table), fields(proto = T::NAME, vlan = %self.core.vlan_id, count = table.len()))]
    pub fn repopulate(&self, table: &NeighborTable<T::Addr>) {
        let mut entries = self.core.entries.lock();
        for node in table.iter() {
            if node.interface_id != self.core.interface_id {
                warn!(
                    entry = %node,
                    interface = %self.core.interface_id,
                    "Skipping neighbor node learned on another interface"
                );
                continue;
            }
            if node.is_pending() {
                self.core
                    .set_entry_internal(&mut entries, node, NeighborEntryState::Incomplete, true);
                self.core.program_pending_entry(node.clone(), false);
            } else {
                self.core
                    .set_entry_internal(&mut entries, node, NeighborEntryState::Stale, true);
                self.core.program_entry(node.clone());
            }
        }
        info!(entries = entries.len(), "Repopulated neighbor cache");
    }

    /// Runs one state machine step for `ip`, removing the entry if it
    /// expired.
    pub fn process(&self, ip: T::Addr) {
        self.core.process_entry(ip, None);
    }

    /// True if `ip` has an entry that is waiting for a reply.
    pub fn is_solicited(&self, ip: T::Addr) -> bool {
        self.core
            .entries
            .lock()
            .get(&ip)
            .is_some_and(|entry| entry.is_probing())
    }

    /// Turns every entry learned on `port` back into a pending entry.
    ///
    /// Entries are not merely marked stale: forwarding on the port must not
    /// resume before a fresh reply, and the pending to reachable transition
    /// is what triggers next-hop group re-expansion downstream.
    #[instrument(skip(self), fields(proto = T::NAME, vlan = %self.core.vlan_id))]
    pub fn port_down(&self, port: PortId) {
        let mut entries = self.core.entries.lock();
        let on_port: Vec<T::Addr> = entries
            .values()
            .filter(|entry| entry.port() == Some(port))
            .map(|entry| entry.ip())
            .collect();
        for &ip in &on_port {
            if let Some(fields) = self.core.set_pending_locked(&mut entries, ip, true) {
                self.core.program_pending_entry(fields, true);
            }
        }
        if !on_port.is_empty() {
            info!(%port, count = on_port.len(), "Port down, neighbor entries set pending");
        }
    }

    /// A binding learned from a reply or an unsolicited announcement.
    pub fn record_binding(&self, ip: T::Addr, mac: MacAddress, port: PortId) {
        self.upsert(ip, mac, port, NeighborEntryState::Reachable);
    }

    /// The protocol handler has sent a request for `ip`.
    pub fn request_resolution(&self, ip: T::Addr) {
        self.set_pending(ip, false);
    }

    /// Traffic from a known neighbor confirmed it is still reachable.
    pub fn confirm_reachable(&self, ip: T::Addr, mac: MacAddress, port: PortId) {
        self.upsert_existing(ip, mac, port, NeighborEntryState::Reachable);
    }
}

impl<T: NeighborTableKind> Drop for NeighborCache<T> {
    fn drop(&mut self) {
        self.core.destroy_all_entries();
    }
}

impl<T: NeighborTableKind> CacheCore<T> {
    fn owner(&self) -> Weak<dyn EntryOwner<T::Addr>> {
        self.self_ref.clone()
    }

    fn set_entry_internal(
        &self,
        entries: &mut EntryMap<T::Addr>,
        fields: &NeighborEntryFields<T::Addr>,
        state: NeighborEntryState,
        add: bool,
    ) -> Option<Arc<NeighborCacheEntry<T::Addr>>> {
        if let Some(entry) = entries.get(&fields.ip) {
            if !entry.fields_match(fields) {
                entry.update_fields(fields);
            }
            entry.update_state(state);
            return Some(Arc::clone(entry));
        }
        if !add {
            return None;
        }

        let entry = NeighborCacheEntry::new(
            fields.clone(),
            state,
            self.timings,
            self.background.clone(),
            self.owner(),
        );
        entries.insert(fields.ip, Arc::clone(&entry));
        info!(proto = T::NAME, vlan = %self.vlan_id, entry = %fields, %state, "Added neighbor cache entry");
        Some(entry)
    }

    /// Returns the pending fields to program, if the entry was (re)set.
    fn set_pending_locked(
        &self,
        entries: &mut EntryMap<T::Addr>,
        ip: T::Addr,
        force: bool,
    ) -> Option<NeighborEntryFields<T::Addr>> {
        if !force && entries.contains_key(&ip) {
            return None;
        }
        let fields = NeighborEntryFields::pending(ip, self.interface_id);
        self.set_entry_internal(entries, &fields, NeighborEntryState::Incomplete, true);
        Some(fields)
    }

    /// Detaches `ip` from the map and queues its teardown.
    fn remove_entry(&self, entries: &mut EntryMap<T::Addr>, ip: T::Addr) -> bool {
        let Some(entry) = entries.remove(&ip) else {
            return false;
        };
        // The caller usually holds the cache lock, which a firing timer on
        // the background context may be waiting for; stop it over there.
        drop(NeighborCacheEntry::destroy(entry, &self.background));
        info!(proto = T::NAME, vlan = %self.vlan_id, %ip, "Removed neighbor cache entry");
        true
    }

    fn program_entry(&self, fields: NeighborEntryFields<T::Addr>) {
        assert!(
            !fields.is_pending(),
            "program_entry called with pending entry {}",
            fields.ip
        );
        let vlan_id = self.vlan_id;
        self.updater
            .update_state(format!("add neighbor {}", fields.ip), move |state| {
                reconcile::program_entry::<T>(state, vlan_id, &fields)
            });
    }

    fn program_pending_entry(&self, fields: NeighborEntryFields<T::Addr>, force: bool) {
        assert!(
            fields.is_pending(),
            "program_pending_entry called with resolved entry {}",
            fields.ip
        );
        let vlan_id = self.vlan_id;
        self.updater
            .update_state(format!("add pending entry {}", fields.ip), move |state| {
                reconcile::program_pending_entry::<T>(state, vlan_id, &fields, force)
            });
    }

    fn flush_from_state(&self, ip: T::Addr) {
        let vlan_id = self.vlan_id;
        self.updater
            .update_state(format!("remove neighbor entry {ip}"), move |state| {
                reconcile::flush_entry::<T>(state, vlan_id, ip)
            });
    }

    /// One state machine step. With `expected` set, the step only runs if
    /// that exact entry is still the one mapped for `ip`.
    fn process_entry(&self, ip: T::Addr, expected: Option<&Arc<NeighborCacheEntry<T::Addr>>>) {
        let (step, interface_id) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get(&ip).cloned() else {
                return;
            };
            if expected.is_some_and(|expected| !Arc::ptr_eq(expected, &entry)) {
                return;
            }
            let step = entry.process();
            if step.state == NeighborEntryState::Expired {
                info!(proto = T::NAME, vlan = %self.vlan_id, %ip, "Neighbor entry expired");
                self.remove_entry(&mut entries, ip);
                self.flush_from_state(ip);
            }
            (step, entry.interface_id())
        };

        // The prober talks to the protocol handler, which may call back
        // into this cache.
        if step.probe {
            self.prober.probe_for(ip.into(), interface_id, self.vlan_id);
        }
    }

    /// Stops every entry on the background context and waits for all of
    /// them. The map lock is released before waiting.
    fn destroy_all_entries(&self) {
        let detached: Vec<_> = self.entries.lock().drain().map(|(_, entry)| entry).collect();
        let count = detached.len();

        if self.background.is_current() {
            // Already on the background context: nothing to migrate.
            for entry in detached {
                entry.stop();
            }
        } else {
            let stop_tasks = detached.into_iter().map(|entry| {
                let ip = entry.ip();
                NeighborCacheEntry::destroy(entry, &self.background).map(move |res| (ip, res))
            });
            for (ip, res) in futures::executor::block_on(join_all(stop_tasks)) {
                if let Err(err) = res {
                    error!(proto = T::NAME, vlan = %self.vlan_id, %ip, error = %err,
                        "Failed to stop neighbor cache entry");
                    std::process::abort();
                }
            }
        }
        debug!(proto = T::NAME, vlan = %self.vlan_id, count, "Destroyed neighbor cache entries");
    }
}

impl<T: NeighborTableKind> EntryOwner<T::Addr> for CacheCore<T> {
    fn entry_timer_fired(&self, entry: &Arc<NeighborCacheEntry<T::Addr>>) {
        self.process_entry(entry.ip(), Some(entry));
    }
}
