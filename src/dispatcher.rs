//! Single-worker loop draining the work queue into the reconciler.

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::Store;

use crate::gateway::ClusterGateway;
use crate::queue::WorkQueue;
use crate::reconcile::Reconciler;
use crate::watcher;

/// Pulls keys one at a time, resolves them against the cache and reconciles.
///
/// Failures are retried through the queue's per-key backoff; nothing a
/// single key does can stop the loop.
pub struct Dispatcher<G> {
    queue: WorkQueue<String>,
    store: Store<EndpointSlice>,
    reconciler: Reconciler<G>,
}

impl<G: ClusterGateway> Dispatcher<G> {
    /// Creates a dispatcher over a synced cache.
    #[must_use]
    pub fn new(queue: WorkQueue<String>, store: Store<EndpointSlice>, reconciler: Reconciler<G>) -> Self {
        Self {
            queue,
            store,
            reconciler,
        }
    }

    /// Processes keys until the queue is shut down.
    pub async fn run(&self) {
        tracing::info!("Starting worker");
        while self.process_next_item().await {}
        tracing::info!("Worker stopped: queue closed");
    }

    /// Handles one key. Returns `false` once the queue is closed.
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        if self.handle(&key).await {
            self.queue.forget(&key);
        } else {
            tracing::warn!(retries = self.queue.num_requeues(&key), "requeueing {key}");
            self.queue.add_rate_limited(key.clone());
        }
        self.queue.done(&key);
        true
    }

    /// Returns `false` if the key should be retried.
    async fn handle(&self, key: &str) -> bool {
        let slice = match watcher::lookup(&self.store, key) {
            Ok(Some(slice)) => slice,
            Ok(None) => {
                tracing::debug!("EndpointSlice {key} no longer cached, skipping");
                return true;
            }
            Err(e) => {
                tracing::error!("failed to look up {key}: {e}");
                return true;
            }
        };

        match self.reconciler.reconcile(&slice).await {
            Ok(()) => {
                tracing::debug!("reconciled {key}");
                true
            }
            Err(e) => {
                tracing::warn!("failed to reconcile {key}: {e}");
                false
            }
        }
    }
}
