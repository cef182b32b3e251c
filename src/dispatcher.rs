//! The dispatcher host: owns the maintenance worker and the dispatch
//! context used when a subscriber has no ambient context of its own.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::manager::ManagerInner;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// A target a change event or scheduled callback can be posted to.
///
/// `Inline` models "caller-affinity": the closure runs synchronously, on
/// whatever thread released the tree lock, right after it is released. A
/// [`DispatcherHost`] models the dedicated worker: the closure is queued
/// and runs later, in FIFO order, on the host's single maintenance
/// thread.
///
/// Subscribers that ask for caller-affinity without supplying an explicit
/// `Dispatch` fall back to the host worker, since this crate has no
/// implicit thread-local synchronization context to capture.
pub trait Dispatch: Send + Sync {
    /// Queues `job` for execution on this dispatch target.
    fn post(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs the job immediately, on the thread that called `post`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Dispatch for Inline {
    fn post(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job();
    }
}

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

struct HostInner {
    tx: Sender<Job>,
    worker: Mutex<Option<JoinHandle<()>>>,
    trees: Arc<Mutex<Vec<Weak<ManagerInner>>>>,
}

/// Owns the dedicated maintenance thread and dispatch queue shared by
/// every tree registered with it.
///
/// A process can share a single host across many trees, or construct one
/// per tree; the host only holds weak references to the tree managers it
/// sweeps, so it never keeps a tree alive on its own.
#[derive(Clone)]
pub struct DispatcherHost {
    inner: Arc<HostInner>,
}

impl DispatcherHost {
    /// Creates a host with the default 10s sweep interval.
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a host with a custom sweep interval. `interval` must be
    /// greater than zero.
    pub fn with_interval(interval: Duration) -> Self {
        assert!(interval > Duration::ZERO, "sweep interval must be > 0");
        let (tx, rx) = mpsc::channel();
        let trees: Arc<Mutex<Vec<Weak<ManagerInner>>>> = Arc::new(Mutex::new(Vec::new()));
        let worker_trees = trees.clone();
        let worker = std::thread::Builder::new()
            .name("obstree-dispatcher".into())
            .spawn(move || Self::run(rx, worker_trees, interval))
            .expect("failed to spawn dispatcher thread");
        Self {
            inner: Arc::new(HostInner {
                tx,
                worker: Mutex::new(Some(worker)),
                trees,
            }),
        }
    }

    fn run(rx: Receiver<Job>, trees: Arc<Mutex<Vec<Weak<ManagerInner>>>>, interval: Duration) {
        loop {
            match rx.recv_timeout(interval) {
                Ok(Job::Run(f)) => Self::run_guarded(f),
                Ok(Job::Shutdown) => {
                    while let Ok(Job::Run(f)) = rx.try_recv() {
                        Self::run_guarded(f);
                    }
                    debug!("dispatcher worker shutting down");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => {
                    trace!("dispatcher sweep tick");
                    trees.lock().retain(|weak| match weak.upgrade() {
                        Some(manager) => manager.check_periodically(),
                        None => false,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run_guarded(f: Box<dyn FnOnce() + Send + 'static>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            warn!(?payload, "event handler panicked; isolating and continuing");
        }
    }

    /// Registers a tree manager for periodic dummy-path cleanup. The
    /// host holds only a weak reference.
    pub(crate) fn register_tree(&self, manager: &Arc<ManagerInner>) {
        self.inner.trees.lock().push(Arc::downgrade(manager));
    }

    /// Returns the number of trees currently tracked (dead weaks pruned on
    /// the next sweep, not eagerly). Exposed for tests.
    #[cfg(test)]
    pub(crate) fn tracked_tree_count(&self) -> usize {
        self.inner.trees.lock().len()
    }

    /// Queues each handler invocation for `handlers`, each isolated so a
    /// panicking handler cannot stop its siblings from running.
    pub fn enqueue_event<E>(&self, handlers: Vec<Arc<dyn Fn(&E) + Send + Sync>>, args: E)
    where
        E: Send + 'static,
    {
        let args = Arc::new(args);
        for handler in handlers {
            let args = args.clone();
            self.post(Box::new(move || handler(&args)));
        }
    }

    /// Queues a single method invocation.
    pub fn enqueue_method(&self, f: impl FnOnce() + Send + 'static) {
        self.post(Box::new(f));
    }

    /// Requests a graceful shutdown: drains queued callbacks and joins
    /// the worker within 2s, or logs and joins unbounded.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(Job::Shutdown);
        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            let (done_tx, done_rx) = mpsc::channel();
            let thread_name = handle.thread().name().unwrap_or("obstree-dispatcher").to_string();
            std::thread::spawn(move || {
                let _ = handle.join();
                let _ = done_tx.send(());
            });
            if done_rx.recv_timeout(SHUTDOWN_JOIN_TIMEOUT).is_err() {
                warn!(thread = %thread_name, "dispatcher worker did not shut down within 2s, joining unbounded");
                let _ = done_rx.recv();
            }
        }
    }
}

impl Default for DispatcherHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatch for DispatcherHost {
    fn post(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        if self.inner.tx.send(Job::Run(job)).is_err() {
            warn!("dispatcher worker is gone; dropping posted job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_runs_synchronously() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        Inline.post(Box::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn host_runs_queued_jobs_and_shuts_down() {
        let host = DispatcherHost::with_interval(Duration::from_millis(50));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        host.enqueue_method(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        host.shutdown();
    }
}
