//! Serialized application of state transforms.
//!
//! All writers describe their change as a pure function from the latest
//! published [`SwitchState`] to either a new version or `None` (nothing to
//! do). A single committer thread applies queued transforms one at a time
//! against whatever version is current when the transform is dequeued, and
//! atomically publishes the result. Readers load the current version
//! without locking.

use crate::error::{Result, StateUpdateError};
use crate::state::SwitchState;
use arc_swap::ArcSwap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// A transform over the latest snapshot.
///
/// Returning `None` leaves the tree untouched.
pub type StateUpdateFn = Box<dyn FnOnce(&Arc<SwitchState>) -> Option<SwitchState> + Send>;

struct QueuedUpdate {
    name: String,
    func: StateUpdateFn,
    done: Option<oneshot::Sender<Result<bool>>>,
}

struct Inner {
    tx: mpsc::UnboundedSender<QueuedUpdate>,
    published: Arc<ArcSwap<SwitchState>>,
}

/// Handle to the single-writer state store.
///
/// Cloning is cheap; every clone feeds the same queue. The committer thread
/// exits once the last handle is dropped and the queue has drained.
#[derive(Clone)]
pub struct StateUpdater {
    inner: Arc<Inner>,
}

impl StateUpdater {
    /// Publishes `initial` as generation 0 and starts the committer thread.
    pub fn spawn(initial: SwitchState) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let published = Arc::new(ArcSwap::from_pointee(initial));

        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let committer_view = Arc::clone(&published);
        std::thread::Builder::new()
            .name("state-updater".to_string())
            .spawn(move || runtime.block_on(run_committer(rx, committer_view)))?;

        Ok(Self {
            inner: Arc::new(Inner { tx, published }),
        })
    }

    /// The most recently published version.
    pub fn current(&self) -> Arc<SwitchState> {
        self.inner.published.load_full()
    }

    /// Queues `func` and returns immediately.
    pub fn update_state<F>(&self, name: impl Into<String>, func: F)
    where
        F: FnOnce(&Arc<SwitchState>) -> Option<SwitchState> + Send + 'static,
    {
        let update = QueuedUpdate {
            name: name.into(),
            func: Box::new(func),
            done: None,
        };
        if let Err(mpsc::error::SendError(update)) = self.inner.tx.send(update) {
            warn!(update = %update.name, "State updater stopped, dropping update");
        }
    }

    /// Queues `func` and returns a handle to wait on its outcome.
    ///
    /// Only the send happens here, so it is safe to call while holding a
    /// lock that orders updates; [`PendingUpdate::wait`] can then be called
    /// once the lock is released.
    pub fn queue_update<F>(&self, name: impl Into<String>, func: F) -> PendingUpdate
    where
        F: FnOnce(&Arc<SwitchState>) -> Option<SwitchState> + Send + 'static,
    {
        let name = name.into();
        let (done_tx, done_rx) = oneshot::channel();
        let update = QueuedUpdate {
            name: name.clone(),
            func: Box::new(func),
            done: Some(done_tx),
        };
        let done = match self.inner.tx.send(update) {
            Ok(()) => Some(done_rx),
            Err(_) => None,
        };
        PendingUpdate { name, done }
    }

    /// Queues `func` and waits until it has been applied.
    ///
    /// Returns `Ok(true)` if a new version was published and `Ok(false)` if
    /// the transform resolved to a no-op. Blocks the calling thread, so it
    /// must not be called from within an async task.
    pub fn update_state_blocking<F>(&self, name: impl Into<String>, func: F) -> Result<bool>
    where
        F: FnOnce(&Arc<SwitchState>) -> Option<SwitchState> + Send + 'static,
    {
        self.queue_update(name, func).wait()
    }

    /// Waits until every transform queued before this call has been applied.
    pub fn flush(&self) -> Result<()> {
        self.update_state_blocking("flush", |_| None).map(|_| ())
    }
}

/// A queued update whose outcome has not been collected yet.
#[must_use = "dropping a PendingUpdate discards the outcome of the update"]
pub struct PendingUpdate {
    name: String,
    done: Option<oneshot::Receiver<Result<bool>>>,
}

impl PendingUpdate {
    /// Blocks until the update has been applied.
    ///
    /// Returns `Ok(true)` if a new version was published and `Ok(false)` if
    /// the transform resolved to a no-op.
    pub fn wait(self) -> Result<bool> {
        let Some(done) = self.done else {
            return Err(StateUpdateError::UpdaterStopped(self.name));
        };
        done.blocking_recv()
            .map_err(|_| StateUpdateError::UpdaterStopped(self.name))?
    }
}

async fn run_committer(
    mut rx: mpsc::UnboundedReceiver<QueuedUpdate>,
    published: Arc<ArcSwap<SwitchState>>,
) {
    while let Some(update) = rx.recv().await {
        let QueuedUpdate { name, func, done } = update;
        let current = published.load_full();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| func(&current))) {
            Ok(Some(mut next)) => {
                let generation = current.generation() + 1;
                next.set_generation(generation);
                published.store(Arc::new(next));
                debug!(update = %name, generation, "Published new switch state");
                Ok(true)
            }
            Ok(None) => {
                trace!(update = %name, "State update was a no-op");
                Ok(false)
            }
            Err(_) => {
                error!(update = %name, "State update panicked, state left unchanged");
                Err(StateUpdateError::TransformPanicked(name))
            }
        };

        if let Some(done) = done {
            // The waiter may have gone away; the update stands either way.
            let _ = done.send(result);
        }
    }
    debug!("State updater queue closed");
}
