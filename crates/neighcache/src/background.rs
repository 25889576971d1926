//! The background execution context shared by all neighbor entries.
//!
//! One dedicated thread runs a single-threaded tokio runtime. Every entry
//! timer and every entry teardown runs here, so entry lifecycle work is
//! serialized without any per-entry locking discipline beyond what the
//! cache already holds.

use crate::error::{NeighCacheError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, warn};

struct Inner {
    handle: Handle,
    thread_id: ThreadId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
        // The last handle can be released by a task running on the context
        // itself; that thread cannot join itself.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("Background context thread panicked");
            }
        }
    }
}

/// Handle to the background execution context. Clones share the thread.
#[derive(Clone)]
pub struct BackgroundContext {
    inner: Arc<Inner>,
}

impl BackgroundContext {
    /// Starts the background thread.
    pub fn spawn(name: &str) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(NeighCacheError::Background)?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                debug!("Background context stopped");
            })
            .map_err(NeighCacheError::Background)?;

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                thread_id: thread.thread().id(),
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    /// Returns true when called from the background thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Runs a future on the background context.
    pub fn spawn_task<F>(&self, future: F) -> task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.handle.spawn(future)
    }

    /// Runs a closure on the background context.
    pub fn run<F, R>(&self, func: F) -> task::JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.spawn_task(async move { func() })
    }

    /// Blocks until the context has polled every task submitted before this
    /// call. Closures passed to [`run`](Self::run) have completed by then.
    ///
    /// Must not be called from the background thread.
    pub fn flush(&self) {
        debug_assert!(!self.is_current(), "flush() from the background context");
        let _ = futures::executor::block_on(self.run(|| ()));
    }
}
