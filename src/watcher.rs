//! Change watcher for the API server's `EndpointSlice`.
//!
//! # How It Works
//!
//! 1. Lists and watches `EndpointSlice` objects with a `metadata.name` field selector
//! 2. Mirrors every event into a reflector [`Store`]
//! 3. Enqueues the `namespace/name` key of every added or updated slice
//! 4. Ignores deletions: the mirrored objects outlive a transient source removal
//! 5. Shuts the queue down once event delivery stops
//!
//! # Example
//!
//! ```ignore
//! use apiserver_mirror::queue::WorkQueue;
//! use apiserver_mirror::watcher::{self, SourceSelector};
//!
//! let queue = WorkQueue::default();
//! let events = watcher::watch(client, &SourceSelector::default());
//! let store = watcher::start(events, queue.clone(), cancel, Duration::from_secs(60)).await?;
//!
//! while let Some(key) = queue.get().await {
//!     let slice = watcher::lookup(&store, &key)?;
//!     // ...
//!     queue.done(&key);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use tokio_util::sync::CancellationToken;

use crate::queue::WorkQueue;
use crate::reconcile::{SOURCE_NAME, SOURCE_NAMESPACE};
use crate::{Error, Result};

/// Which `EndpointSlice` to watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceSelector {
    /// Name matched with a `metadata.name` field selector.
    pub name: String,

    /// Namespace to watch. If `None`, all namespaces are watched.
    pub namespace: Option<String>,
}

impl Default for SourceSelector {
    fn default() -> Self {
        Self::new(SOURCE_NAME).namespace(SOURCE_NAMESPACE)
    }
}

impl SourceSelector {
    /// Selects slices named `name` in every namespace.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Restricts the watch to one namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// The field selector used for list and watch calls.
    #[must_use]
    pub fn field_selector(&self) -> String {
        format!("metadata.name={}", self.name)
    }
}

/// Opens a list+watch stream for the selected `EndpointSlice`, retrying
/// transient failures with the watcher's default backoff.
pub fn watch(
    client: Client,
    selector: &SourceSelector,
) -> impl Stream<Item = watcher::Result<Event<EndpointSlice>>> + Send + 'static {
    let slices: Api<EndpointSlice> = match &selector.namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    let field_selector = selector.field_selector();
    let watcher_config = WatcherConfig::default().fields(&field_selector);

    tracing::debug!(
        "Starting EndpointSlice watch in {} with {field_selector}",
        selector.namespace.as_deref().unwrap_or("all namespaces")
    );

    watcher::watcher(slices, watcher_config).default_backoff()
}

/// Work queue key for an object: `namespace/name`, or `name` when cluster scoped.
pub fn object_key<K: Resource>(obj: &K) -> Option<String> {
    let name = obj.meta().name.as_deref()?;
    Some(match obj.meta().namespace.as_deref() {
        Some(namespace) if !namespace.is_empty() => format!("{namespace}/{name}"),
        _ => name.to_string(),
    })
}

/// Splits a key produced by [`object_key`] into namespace and name.
///
/// # Errors
///
/// [`Error::InvalidKey`] if `key` has more than one `/` or an empty name.
pub fn split_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, name)),
        [namespace, name] if !name.is_empty() => {
            Ok(((!namespace.is_empty()).then_some(*namespace), name))
        }
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// Resolves a key against the cache. `Ok(None)` if the object is gone.
///
/// # Errors
///
/// Fails if `key` is malformed.
pub fn lookup(store: &Store<EndpointSlice>, key: &str) -> Result<Option<Arc<EndpointSlice>>> {
    let (namespace, name) = split_key(key)?;
    let mut object_ref = ObjectRef::new(name);
    if let Some(namespace) = namespace {
        object_ref = object_ref.within(namespace);
    }
    Ok(store.get(&object_ref))
}

/// Returns the key to enqueue for a watcher event, if any.
///
/// This function is extracted to enable unit testing of the event processing logic.
fn process_event(event: &Event<EndpointSlice>) -> Option<String> {
    match event {
        Event::Apply(slice) | Event::InitApply(slice) => {
            let key = object_key(slice);
            if key.is_none() {
                tracing::error!("EndpointSlice event without a name, skipping");
            }
            key
        }

        Event::Delete(slice) => {
            tracing::debug!(
                "ignoring deletion of EndpointSlice {}/{}",
                slice.namespace().unwrap_or_default(),
                slice.name_any()
            );
            None
        }

        Event::Init | Event::InitDone => {
            tracing::debug!("EndpointSlice watcher initialization event");
            None
        }
    }
}

/// Starts delivering `events` into a cache and `queue`.
///
/// Returns the cache once the initial list has been applied. Cancelling stops
/// event delivery and then shuts the queue down.
///
/// # Errors
///
/// [`Error::CacheSyncTimeout`] if the initial list takes longer than
/// `sync_timeout` or `cancel` fires first.
pub async fn start<S>(
    events: S,
    queue: WorkQueue<String>,
    cancel: CancellationToken,
    sync_timeout: Duration,
) -> Result<Store<EndpointSlice>>
where
    S: Stream<Item = watcher::Result<Event<EndpointSlice>>> + Send + 'static,
{
    let (store, writer) = reflector::store();
    let delivery = cancel.child_token();

    tokio::spawn(deliver(events.reflect(writer), queue, delivery.clone()));

    tracing::info!("Starting EndpointSlice informer");
    let synced = tokio::select! {
        () = cancel.cancelled() => false,
        res = tokio::time::timeout(sync_timeout, store.wait_until_ready()) => {
            matches!(res, Ok(Ok(())))
        }
    };

    if !synced {
        delivery.cancel();
        return Err(Error::CacheSyncTimeout(sync_timeout));
    }

    tracing::debug!("EndpointSlice cache synced with {} object(s)", store.len());
    Ok(store)
}

/// Pumps reflected events into `queue` until `cancel` fires or the stream ends.
async fn deliver<S>(events: S, queue: WorkQueue<String>, cancel: CancellationToken)
where
    S: Stream<Item = watcher::Result<Event<EndpointSlice>>> + Send,
{
    tokio::pin!(events);

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if let Some(key) = process_event(&event) {
                    tracing::debug!("enqueueing EndpointSlice {key}");
                    queue.add(key);
                }
            }
            Some(Err(e)) => tracing::warn!("EndpointSlice watch error: {e}"),
            None => {
                tracing::warn!("EndpointSlice watch stream ended");
                break;
            }
        }
    }

    tracing::info!("Stopping EndpointSlice informer");
    queue.shut_down();
}
