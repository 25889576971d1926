//! A single neighbor binding and its reachability state machine.
//!
//! ```text
//!  INCOMPLETE ──(probes spent)──────────────────────────────┐
//!      │ reply                                              ▼
//!      ▼          timeout           stale interval        EXPIRED
//!  REACHABLE ───────────────▶ STALE ───────────────▶ PROBE ──┘
//!      ▲                                              │
//!      └──────────────────── reply ───────────────────┘
//! ```
//!
//! Each entry owns one timer on the background context. When it fires the
//! owning cache runs [`NeighborCacheEntry::process`] for one step; the step
//! rearms the timer for the new state unless the entry expired. Timers are
//! only ever armed and cancelled on the background thread.

use crate::background::BackgroundContext;
use crate::config::EntryTimings;
use parking_lot::Mutex;
use serde::Serialize;
use sonic_switch_state::{InterfaceId, MacAddress, NeighborAddress, NeighborEntryFields, PortId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::trace;

/// Reachability state of a neighbor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NeighborEntryState {
    /// Resolution in progress, no MAC learned yet.
    Incomplete,
    Reachable,
    Stale,
    /// Re-validating a previously resolved binding.
    Probe,
    Expired,
}

impl NeighborEntryState {
    /// True for the states in which requests are being sent and a reply is
    /// expected.
    pub fn is_probing(&self) -> bool {
        matches!(self, Self::Incomplete | Self::Probe)
    }
}

impl fmt::Display for NeighborEntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Incomplete => "INCOMPLETE",
            Self::Reachable => "REACHABLE",
            Self::Stale => "STALE",
            Self::Probe => "PROBE",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Point-in-time copy of an entry, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NeighborEntrySnapshot<A> {
    pub fields: NeighborEntryFields<A>,
    pub state: NeighborEntryState,
    pub probes_left: u32,
}

/// Outcome of one state machine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryStep {
    /// A resolution probe is due.
    pub probe: bool,
    pub state: NeighborEntryState,
}

/// Receives timer expirations. Implemented by the cache; entries only hold
/// it weakly.
pub(crate) trait EntryOwner<A: NeighborAddress>: Send + Sync {
    fn entry_timer_fired(&self, entry: &Arc<NeighborCacheEntry<A>>);
}

struct EntryInner {
    mac: Option<MacAddress>,
    port: Option<PortId>,
    state: NeighborEntryState,
    probes_left: u32,
}

/// A neighbor binding tracked by a cache.
pub struct NeighborCacheEntry<A: NeighborAddress> {
    ip: A,
    interface_id: InterfaceId,
    inner: Mutex<EntryInner>,
    timer: Mutex<Option<AbortHandle>>,
    stopped: AtomicBool,
    timings: EntryTimings,
    background: BackgroundContext,
    owner: Weak<dyn EntryOwner<A>>,
}

impl<A: NeighborAddress> NeighborCacheEntry<A> {
    pub(crate) fn new(
        fields: NeighborEntryFields<A>,
        state: NeighborEntryState,
        timings: EntryTimings,
        background: BackgroundContext,
        owner: Weak<dyn EntryOwner<A>>,
    ) -> Arc<Self> {
        let entry = Arc::new(Self {
            ip: fields.ip,
            interface_id: fields.interface_id,
            inner: Mutex::new(EntryInner {
                mac: fields.mac,
                port: fields.port,
                state,
                probes_left: timings.max_probes,
            }),
            timer: Mutex::new(None),
            stopped: AtomicBool::new(false),
            timings,
            background,
            owner,
        });
        entry.request_rearm();
        entry
    }

    pub fn ip(&self) -> A {
        self.ip
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    pub fn mac(&self) -> Option<MacAddress> {
        self.inner.lock().mac
    }

    pub fn port(&self) -> Option<PortId> {
        self.inner.lock().port
    }

    pub fn state(&self) -> NeighborEntryState {
        self.inner.lock().state
    }

    pub fn probes_left(&self) -> u32 {
        self.inner.lock().probes_left
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().mac.is_none()
    }

    pub fn is_probing(&self) -> bool {
        self.state().is_probing()
    }

    pub fn fields(&self) -> NeighborEntryFields<A> {
        let inner = self.inner.lock();
        NeighborEntryFields {
            ip: self.ip,
            mac: inner.mac,
            port: inner.port,
            interface_id: self.interface_id,
        }
    }

    pub fn snapshot(&self) -> NeighborEntrySnapshot<A> {
        let inner = self.inner.lock();
        NeighborEntrySnapshot {
            fields: NeighborEntryFields {
                ip: self.ip,
                mac: inner.mac,
                port: inner.port,
                interface_id: self.interface_id,
            },
            state: inner.state,
            probes_left: inner.probes_left,
        }
    }

    /// Compares the mutable part of the binding (MAC and port).
    pub(crate) fn fields_match(&self, fields: &NeighborEntryFields<A>) -> bool {
        let inner = self.inner.lock();
        inner.mac == fields.mac && inner.port == fields.port
    }

    /// Overwrites MAC and port in place.
    ///
    /// # Panics
    ///
    /// Panics if `fields` names a different address or interface; those
    /// never change for the life of an entry.
    pub(crate) fn update_fields(&self, fields: &NeighborEntryFields<A>) {
        assert_eq!(fields.ip, self.ip, "neighbor entry address is immutable");
        assert_eq!(
            fields.interface_id, self.interface_id,
            "neighbor entry interface is immutable"
        );
        let mut inner = self.inner.lock();
        inner.mac = fields.mac;
        inner.port = fields.port;
    }

    /// Moves the entry to `state`, resets the probe budget and rearms the
    /// timer for the new state.
    pub(crate) fn update_state(self: &Arc<Self>, state: NeighborEntryState) {
        {
            let mut inner = self.inner.lock();
            inner.state = state;
            inner.probes_left = self.timings.max_probes;
        }
        self.request_rearm();
    }

    /// Advances the state machine by one step.
    pub(crate) fn process(self: &Arc<Self>) -> EntryStep {
        let step = {
            let mut inner = self.inner.lock();
            let probe = match inner.state {
                NeighborEntryState::Reachable => {
                    inner.state = NeighborEntryState::Stale;
                    false
                }
                NeighborEntryState::Stale => {
                    inner.state = NeighborEntryState::Probe;
                    inner.probes_left = self.timings.max_probes;
                    Self::take_probe(&mut inner)
                }
                NeighborEntryState::Incomplete | NeighborEntryState::Probe => {
                    Self::take_probe(&mut inner)
                }
                NeighborEntryState::Expired => false,
            };
            EntryStep {
                probe,
                state: inner.state,
            }
        };
        trace!(ip = %self.ip, state = %step.state, probe = step.probe, "Processed neighbor entry");

        if step.state != NeighborEntryState::Expired {
            self.request_rearm();
        }
        step
    }

    fn take_probe(inner: &mut EntryInner) -> bool {
        if inner.probes_left == 0 {
            inner.state = NeighborEntryState::Expired;
            false
        } else {
            inner.probes_left -= 1;
            true
        }
    }

    /// Tears the entry down on the background context.
    ///
    /// Ownership moves into the task, so the caller's reference can be
    /// dropped right away; the returned handle completes once the timer is
    /// cancelled.
    pub(crate) fn destroy(entry: Arc<Self>, background: &BackgroundContext) -> JoinHandle<()> {
        entry.stopped.store(true, Ordering::Release);
        background.run(move || entry.stop())
    }

    /// Cancels the timer. Runs on the background context.
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    /// True once the entry has been removed from its cache.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// True while a timer task is scheduled for this entry. Cleared by
    /// [`stop`](Self::stop) on the background context.
    pub(crate) fn timer_armed(&self) -> bool {
        self.timer.lock().is_some()
    }

    fn interval(&self) -> Option<Duration> {
        match self.state() {
            NeighborEntryState::Reachable => Some(self.timings.reachable),
            NeighborEntryState::Stale => Some(self.timings.stale),
            NeighborEntryState::Incomplete | NeighborEntryState::Probe => Some(self.timings.probe),
            NeighborEntryState::Expired => None,
        }
    }

    fn request_rearm(self: &Arc<Self>) {
        if self.background.is_current() {
            self.rearm();
        } else {
            let entry = Arc::clone(self);
            self.background.run(move || entry.rearm());
        }
    }

    fn rearm(self: &Arc<Self>) {
        let mut timer = self.timer.lock();
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        if self.is_stopped() {
            return;
        }
        let Some(delay) = self.interval() else {
            return;
        };

        let entry = Arc::downgrade(self);
        let owner = self.owner.clone();
        let task = self.background.spawn_task(async move {
            tokio::time::sleep(delay).await;
            let (Some(entry), Some(owner)) = (entry.upgrade(), owner.upgrade()) else {
                return;
            };
            if !entry.is_stopped() {
                owner.entry_timer_fired(&entry);
            }
        });
        *timer = Some(task.abort_handle());
    }
}

impl<A: NeighborAddress> fmt::Debug for NeighborCacheEntry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NeighborCacheEntry")
            .field("ip", &self.ip)
            .field("interface_id", &self.interface_id)
            .field("mac", &inner.mac)
            .field("port", &inner.port)
            .field("state", &inner.state)
            .field("probes_left", &inner.probes_left)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    const LONG: Duration = Duration::from_secs(3600);

    struct CountingOwner {
        fired: AtomicUsize,
    }

    impl EntryOwner<Ipv4Addr> for CountingOwner {
        fn entry_timer_fired(&self, _entry: &Arc<NeighborCacheEntry<Ipv4Addr>>) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timings(max_probes: u32) -> EntryTimings {
        EntryTimings {
            reachable: LONG,
            stale: LONG,
            probe: LONG,
            max_probes,
        }
    }

    fn resolved_fields() -> NeighborEntryFields<Ipv4Addr> {
        NeighborEntryFields::resolved(
            "10.0.0.2".parse().unwrap(),
            MacAddress::new([2, 0, 0, 0, 0, 2]),
            PortId(4),
            InterfaceId(1),
        )
    }

    fn make_entry(
        fields: NeighborEntryFields<Ipv4Addr>,
        state: NeighborEntryState,
        timings: EntryTimings,
    ) -> (Arc<NeighborCacheEntry<Ipv4Addr>>, Arc<CountingOwner>, BackgroundContext) {
        let background = BackgroundContext::spawn("entry-test").unwrap();
        let owner = Arc::new(CountingOwner {
            fired: AtomicUsize::new(0),
        });
        let weak: Weak<dyn EntryOwner<Ipv4Addr>> = Arc::downgrade(&owner) as Weak<dyn EntryOwner<Ipv4Addr>>;
        let entry = NeighborCacheEntry::new(fields, state, timings, background.clone(), weak);
        (entry, owner, background)
    }

    #[test]
    fn test_reachable_ages_through_stale_to_probe() {
        let (entry, _owner, _bg) =
            make_entry(resolved_fields(), NeighborEntryState::Reachable, timings(2));

        assert_eq!(entry.process().state, NeighborEntryState::Stale);

        let step = entry.process();
        assert_eq!(step.state, NeighborEntryState::Probe);
        assert!(step.probe);
        assert_eq!(entry.probes_left(), 1);

        let step = entry.process();
        assert!(step.probe);
        assert_eq!(entry.probes_left(), 0);

        let step = entry.process();
        assert_eq!(step.state, NeighborEntryState::Expired);
        assert!(!step.probe);
    }

    #[test]
    fn test_incomplete_expires_after_budget() {
        let fields = NeighborEntryFields::pending("10.0.0.3".parse().unwrap(), InterfaceId(1));
        let (entry, _owner, _bg) = make_entry(fields, NeighborEntryState::Incomplete, timings(3));
        assert!(entry.is_pending());
        assert!(entry.is_probing());

        let probes = (0..3).filter(|_| entry.process().probe).count();
        assert_eq!(probes, 3);
        assert_eq!(entry.process().state, NeighborEntryState::Expired);
        assert!(!entry.is_probing());
    }

    #[test]
    fn test_update_state_resets_budget() {
        let (entry, _owner, _bg) =
            make_entry(resolved_fields(), NeighborEntryState::Stale, timings(5));
        entry.process();
        entry.process();
        assert_eq!(entry.probes_left(), 3);

        entry.update_state(NeighborEntryState::Reachable);
        assert_eq!(entry.state(), NeighborEntryState::Reachable);
        assert_eq!(entry.probes_left(), 5);
    }

    #[test]
    fn test_fields_match_ignores_identity() {
        let (entry, _owner, _bg) =
            make_entry(resolved_fields(), NeighborEntryState::Reachable, timings(1));
        assert!(entry.fields_match(&resolved_fields()));

        let mut moved = resolved_fields();
        moved.port = Some(PortId(9));
        assert!(!entry.fields_match(&moved));

        entry.update_fields(&moved);
        assert_eq!(entry.port(), Some(PortId(9)));
        assert_eq!(entry.fields(), moved);
    }

    #[test]
    #[should_panic(expected = "interface is immutable")]
    fn test_update_fields_rejects_other_interface() {
        let (entry, _owner, _bg) =
            make_entry(resolved_fields(), NeighborEntryState::Reachable, timings(1));
        let mut other = resolved_fields();
        other.interface_id = InterfaceId(2);
        entry.update_fields(&other);
    }

    #[test]
    fn test_timer_fires_owner() {
        let fast = EntryTimings {
            probe: Duration::from_millis(5),
            ..timings(10)
        };
        let fields = NeighborEntryFields::pending("10.0.0.4".parse().unwrap(), InterfaceId(1));
        let (_entry, owner, _bg) = make_entry(fields, NeighborEntryState::Incomplete, fast);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while owner.fired.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_destroyed_entry_never_fires() {
        let fast = EntryTimings {
            probe: Duration::from_millis(20),
            ..timings(10)
        };
        let fields = NeighborEntryFields::pending("10.0.0.5".parse().unwrap(), InterfaceId(1));
        let (entry, owner, bg) = make_entry(fields, NeighborEntryState::Incomplete, fast);

        futures::executor::block_on(NeighborCacheEntry::destroy(entry, &bg)).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(owner.fired.load(Ordering::SeqCst), 0);
    }
}
