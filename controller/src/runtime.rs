//! Glues the Scheduler Tick and the Reconciler to a watched object store: a bounded worker
//! pool runs at most `WorkerPoolSize` handlers concurrently, and a per-object lock ensures the
//! scheduler tick and the reconciler for a given `NodeRefresh` never run at the same time.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::{Api, ResourceExt};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{interval, sleep};
use tracing::{event, instrument, Level};

use models::constants::REFRESH_TIMER_INTERVAL;
use models::node::client::ApiGateway;
use models::node::{NodeRefresh, NodeRefreshPhase, NodeRefreshStatus};

use crate::scheduler::scheduler_tick;
use crate::statemachine::{reconcile, ReconcileOutcome};

/// Drives every `NodeRefresh` object in `store` forward, forever. Intended to run as the
/// operator's single long-lived task; `tokio::select!` it against a reflector drainer in
/// `main`, exactly as the scheduler tick and reconciler in `SPEC_FULL.md` §5 describe.
pub struct Runtime<G: ApiGateway + 'static> {
    gateway: Arc<G>,
    store: Store<NodeRefresh>,
    semaphore: Arc<Semaphore>,
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl<G: ApiGateway + 'static> Runtime<G> {
    pub fn new(gateway: Arc<G>, store: Store<NodeRefresh>, worker_pool_size: usize) -> Self {
        Runtime {
            gateway,
            store,
            semaphore: Arc::new(Semaphore::new(worker_pool_size)),
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Returns the serialization lock for a single named object, creating it on first use.
    async fn object_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Runs the periodic scheduling loop: every `RefreshTimerInterval`, every known object is
    /// handed to a worker-pool task that runs the scheduler tick and, if it moves the object
    /// into an active phase, drives the reconciler to completion before releasing its permit.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(REFRESH_TIMER_INTERVAL);
        loop {
            ticker.tick().await;
            let objects: Vec<_> = self.store.state();
            event!(Level::DEBUG, count = objects.len(), "Scheduler tick over known NodeRefresh objects.");

            for nr in objects {
                let runtime = Arc::clone(&self);
                let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return, // semaphore closed: runtime is shutting down
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    let lock = runtime.object_lock(&nr.name_any()).await;
                    let _guard = lock.lock().await;
                    runtime.drive_object((*nr).clone()).await;
                });
            }
        }
    }

    /// Runs a scheduler tick for `nr`, then if the tick (or the object's persisted state)
    /// puts it in an active phase, drives the reconciler until it leaves the active set.
    #[instrument(skip(self, nr), fields(name = %nr.metadata.name.clone().unwrap_or_default()))]
    async fn drive_object(&self, mut nr: NodeRefresh) {
        let namespace = nr.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = match nr.metadata.name.clone() {
            Some(name) => name,
            None => return,
        };

        if let Err(e) = nr.validate_spec() {
            event!(Level::ERROR, name, error = %e, "NodeRefresh has an invalid spec; marking Failed.");
            let status = nr.status.clone().unwrap_or_default();
            let (_, patch) = models::status::StatusPatchBuilder::new(status, Utc::now())
                .phase(NodeRefreshPhase::Failed)
                .current_node("")
                .message(format!("Invalid spec: {}", e))
                .build();
            let _ = self.gateway.patch_noderefresh_status(&namespace, &name, &patch).await;
            return;
        }

        let status = nr.status.clone().unwrap_or_default();
        if let Some((status, patch)) = scheduler_tick(&nr.spec, &status, Utc::now()) {
            if let Err(e) = self.gateway.patch_noderefresh_status(&namespace, &name, &patch).await {
                event!(Level::WARN, name, error = %e, "Failed to persist scheduler tick.");
                return;
            }
            nr.status = Some(status);
        }

        loop {
            if !is_active(&nr.status) {
                return;
            }

            let (status, patch, outcome) = reconcile(&*self.gateway, &nr, Utc::now()).await;
            if let Err(e) = self.gateway.patch_noderefresh_status(&namespace, &name, &patch).await {
                event!(Level::WARN, name, error = %e, "Failed to persist reconcile status.");
                return;
            }
            nr.status = Some(status);

            match outcome {
                ReconcileOutcome::Done => continue,
                ReconcileOutcome::RetryAfter(delay) => {
                    sleep(delay).await;
                    continue;
                }
                ReconcileOutcome::Failed(reason) => {
                    event!(Level::ERROR, name, reason, "NodeRefresh reconcile failed.");
                    return;
                }
            }
        }
    }
}

fn is_active(status: &Option<NodeRefreshStatus>) -> bool {
    matches!(
        status.as_ref().map(|s| s.phase),
        Some(NodeRefreshPhase::FindingNodes) | Some(NodeRefreshPhase::ProcessingNode)
    )
}

/// Sets up a reflector over `NodeRefresh` objects and returns its readable `Store` plus the
/// background stream that keeps it in sync. The caller should `tokio::select!` the returned
/// future against [`Runtime::run`].
pub fn watch_noderefreshes(
    api: Api<NodeRefresh>,
) -> (Store<NodeRefresh>, impl std::future::Future<Output = ()>) {
    let (store, writer) = reflector::store();
    let watch = watcher::watcher(api, watcher::Config::default()).default_backoff();
    let stream = reflector::reflector(writer, watch)
        .touched_objects()
        .for_each(|event| async move {
            match event {
                Ok(nr) => event!(Level::DEBUG, name = %nr.name_any(), "Observed a NodeRefresh event."),
                Err(e) => event!(Level::WARN, error = %e, "Watch stream error."),
            }
        });
    (store, stream)
}
