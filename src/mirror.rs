//! The leader's session: watch the source slice and keep the mirror converged.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::Client;
use kube::runtime::watcher::{self as kube_watcher, Event};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::gateway::{ClusterGateway, KubeGateway};
use crate::lease::LeaderCallbacks;
use crate::queue::WorkQueue;
use crate::reconcile::Reconciler;
use crate::watcher::{self, SourceSelector};

/// Runs one mirroring session until `token` is cancelled or event delivery stops.
///
/// # Errors
///
/// Fails without reconciling anything if the cache does not sync within
/// `sync_timeout`.
pub async fn run_session<S, G>(
    events: S,
    reconciler: Reconciler<G>,
    sync_timeout: Duration,
    token: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = kube_watcher::Result<Event<EndpointSlice>>> + Send + 'static,
    G: ClusterGateway,
{
    let queue = WorkQueue::default();
    let store = watcher::start(events, queue.clone(), token, sync_timeout).await?;

    Dispatcher::new(queue, store, reconciler).run().await;
    Ok(())
}

/// Leader callbacks that mirror the API server Service through the cluster API.
pub struct MirrorController {
    client: Client,
    config: Arc<Config>,
}

impl MirrorController {
    /// Creates a controller using `client` for both watching and writing.
    #[must_use]
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self { client, config }
    }
}

impl LeaderCallbacks for MirrorController {
    async fn started_leading(&self, token: CancellationToken) {
        tracing::info!(identity = %self.config.identity, "started leading");

        let events = watcher::watch(self.client.clone(), &SourceSelector::default());
        let reconciler = Reconciler::new(KubeGateway::new(self.client.clone()), Arc::clone(&self.config));

        if let Err(e) = run_session(events, reconciler, self.config.cache_sync_timeout, token).await {
            tracing::error!(identity = %self.config.identity, "mirroring session failed: {e}");
        }
    }

    fn stopped_leading(&self) {
        tracing::info!(identity = %self.config.identity, "stopped leading");
    }

    fn new_leader(&self, identity: &str) {
        if identity != self.config.identity {
            tracing::info!("new leader elected: {identity}");
        }
    }
}
