//! Background delivery worker. One cycle at a time, across all endpoints.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{self, Pool};
use crate::endpoint::Endpoint;
use crate::model::ShareNotification;
use crate::notification::{coalesce, Notifier};

#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherOptions {
    /// Periodic wake; None waits for triggers only.
    pub poll_interval: Option<Duration>,
    /// Failed rows older than this are pruned at the start of each cycle.
    pub failed_retention: Option<Duration>,
    /// Claims not renewed for this long are recovered at the start of each
    /// cycle. None leaves processing rows alone.
    pub claim_lease: Option<Duration>,
}

struct Shared {
    pool: Pool,
    endpoints: Vec<Arc<Endpoint>>,
    notifier: Arc<dyn Notifier>,
    options: DispatcherOptions,
    wake: Notify,
    in_flight: AtomicBool,
    cycle: Mutex<()>,
    cycles_completed: AtomicU64,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoints", &self.shared.endpoints.len())
            .field("options", &self.shared.options)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Spawn the worker on `executor`. Endpoints run in the given order.
    pub fn spawn(
        pool: Pool,
        endpoints: Vec<Arc<Endpoint>>,
        notifier: Arc<dyn Notifier>,
        options: DispatcherOptions,
        executor: &Handle,
    ) -> Self {
        let (shared, shutdown, shutdown_rx) = Shared::new(pool, endpoints, notifier, options);
        let worker = executor.spawn(run(Arc::clone(&shared), shutdown_rx));
        Self {
            shared,
            shutdown,
            worker: parking_lot::Mutex::new(Some(worker)),
        }
    }

    /// A dispatcher without a background worker. Cycles run only through
    /// `flush`; `wake` has no effect.
    pub fn manual(
        pool: Pool,
        endpoints: Vec<Arc<Endpoint>>,
        notifier: Arc<dyn Notifier>,
        options: DispatcherOptions,
    ) -> Self {
        let (shared, shutdown, _) = Shared::new(pool, endpoints, notifier, options);
        Self {
            shared,
            shutdown,
            worker: parking_lot::Mutex::new(None),
        }
    }

    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Request a cycle. Absorbed while one is in flight; coalesced otherwise.
    pub fn wake(&self) {
        if self.shared.in_flight.load(Ordering::SeqCst) {
            debug!("cycle in flight; trigger absorbed");
            return;
        }
        self.shared.wake.notify_one();
    }

    /// Run one cycle on the caller's task, after any cycle already running.
    pub async fn flush(&self) -> Vec<ShareNotification> {
        self.shared.run_cycle().await
    }

    pub fn cycles_completed(&self) -> u64 {
        self.shared.cycles_completed.load(Ordering::SeqCst)
    }

    pub fn is_cycle_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Stop the worker once its current cycle, if any, has finished.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                error!(?err, "dispatcher worker ended abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let poll = shared.options.poll_interval;
    info!(
        endpoints = shared.endpoints.len(),
        poll_ms = poll.map_or(0, |p| p.as_millis() as u64),
        "dispatcher started"
    );
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep(poll.unwrap_or_default()), if poll.is_some() => {
                debug!("periodic wake");
            }
        }
        if let Err(panic) = AssertUnwindSafe(shared.run_cycle()).catch_unwind().await {
            error!(panic = panic_message(panic.as_ref()), "delivery cycle panicked");
        }
    }
    info!("dispatcher stopped");
}

/// Held for the length of a cycle. Dropping it, including when the cycle's
/// future is cancelled, clears the in-flight flag and releases the cycle lock.
struct CycleGuard<'a> {
    in_flight: &'a AtomicBool,
    _cycle: MutexGuard<'a, ()>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn new(
        pool: Pool,
        endpoints: Vec<Arc<Endpoint>>,
        notifier: Arc<dyn Notifier>,
        options: DispatcherOptions,
    ) -> (Arc<Self>, watch::Sender<bool>, watch::Receiver<bool>) {
        let shared = Arc::new(Self {
            pool,
            endpoints,
            notifier,
            options,
            wake: Notify::new(),
            in_flight: AtomicBool::new(false),
            cycle: Mutex::new(()),
            cycles_completed: AtomicU64::new(0),
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        (shared, shutdown, shutdown_rx)
    }

    async fn begin_cycle(&self) -> CycleGuard<'_> {
        let cycle = self.cycle.lock().await;
        self.in_flight.store(true, Ordering::SeqCst);
        CycleGuard {
            in_flight: &self.in_flight,
            _cycle: cycle,
        }
    }

    async fn run_cycle(&self) -> Vec<ShareNotification> {
        let cycle = self.begin_cycle().await;

        if let Some(lease) = self.options.claim_lease {
            match db::recover_interrupted(&self.pool, lease).await {
                Ok(0) => {}
                Ok(recovered) => warn!(recovered, "expired claims marked failed"),
                Err(err) => error!(?err, "recovering expired claims"),
            }
        }
        if let Some(retention) = self.options.failed_retention {
            match db::prune_failed(&self.pool, retention).await {
                Ok(0) => {}
                Ok(pruned) => info!(pruned, "expired failed share requests pruned"),
                Err(err) => error!(?err, "pruning failed share requests"),
            }
        }

        let mut notifications = Vec::new();
        for endpoint in &self.endpoints {
            let kind = endpoint.kind();
            if let Err(err) = endpoint.refresh_link_state().await {
                warn!(%kind, ?err, "refreshing link state failed");
            }
            match AssertUnwindSafe(endpoint.process_share_requests())
                .catch_unwind()
                .await
            {
                Ok(Ok(produced)) => notifications.extend(produced),
                Ok(Err(err)) => error!(%kind, ?err, "processing share requests failed"),
                Err(panic) => error!(
                    %kind,
                    panic = panic_message(panic.as_ref()),
                    "processing share requests panicked"
                ),
            }
        }

        let notifications = coalesce(notifications);
        for notification in &notifications {
            let notify = || self.notifier.share_completed(notification);
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(notify)) {
                error!(
                    id = notification.id,
                    panic = panic_message(panic.as_ref()),
                    "notifier panicked"
                );
            }
        }

        drop(cycle);
        self.cycles_completed.fetch_add(1, Ordering::SeqCst);
        debug!(notifications = notifications.len(), "cycle complete");
        notifications
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
