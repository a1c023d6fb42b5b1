//! Leader election using Kubernetes Leases.
//!
//! Only the holder of the `coordination.k8s.io/v1` Lease runs the mirror.
//! Every other replica keeps polling the lease and takes over once it expires.
//!
//! # Atomicity
//!
//! Writes carry the resourceVersion that was read. If the lease changes between
//! read and write the update fails with 409 Conflict and the attempt counts as
//! "not acquired".
//!
//! # Expiry
//!
//! A lease held by another identity is considered expired once
//! `lease_duration` has passed on the local monotonic clock since this process
//! last saw the record change. Remote timestamps are written for humans and
//! other clients but never compared against the local wall clock.
//!
//! # Handoff
//!
//! The leader stops renewing and cancels its session after `renew_deadline`
//! without a successful renewal, while a standby waits at least
//! `lease_duration` before taking over. As long as a session winds down
//! within `lease_duration - renew_deadline`, two replicas never lead at once.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaseTimings;
use crate::{Error, Result};

/// Name of the lease guarding the mirror.
pub const LEASE_NAME: &str = "k8s-apiserver-leader-election";

/// Contents of a lease, independent of its storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current holder; `None` when released.
    pub holder_identity: Option<String>,
    /// How long the holder may go without renewing.
    pub lease_duration: Duration,
    /// When the current holder acquired the lease.
    pub acquire_time: Option<Timestamp>,
    /// When the current holder last renewed the lease.
    pub renew_time: Option<Timestamp>,
    /// Number of times the lease changed hands.
    pub transitions: i32,
}

/// A lease record together with the version it was stored under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredLease {
    /// The record.
    pub record: LeaseRecord,
    /// Opaque version for compare-and-swap updates.
    pub version: String,
}

/// Storage for a single lease record with compare-and-swap updates.
///
/// `create` and `update` fail with [`Error::LeaseConflict`] when another
/// writer got there first.
pub trait LeaseStore: Send + Sync + 'static {
    /// Human-readable lease identity, e.g. `namespace/name`.
    fn describe(&self) -> String;

    /// Reads the lease, `None` if it does not exist.
    fn get(&self) -> impl Future<Output = Result<Option<StoredLease>>> + Send;

    /// Creates the lease.
    fn create(&self, record: &LeaseRecord) -> impl Future<Output = Result<StoredLease>> + Send;

    /// Overwrites the lease if it is still at `version`.
    fn update(
        &self,
        record: &LeaseRecord,
        version: &str,
    ) -> impl Future<Output = Result<StoredLease>> + Send;
}

/// [`LeaseStore`] backed by a `coordination.k8s.io/v1` Lease.
pub struct KubeLeaseStore {
    api: Api<Lease>,
    namespace: String,
    name: String,
}

impl KubeLeaseStore {
    /// Lease `name` in `namespace`.
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, version: Option<&str>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: version.map(str::to_string),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(
                    i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX),
                ),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.transitions),
                ..Default::default()
            }),
        }
    }

    fn map_conflict(&self, err: kube::Error) -> Error {
        match err {
            kube::Error::Api(e) if e.code == 409 => Error::LeaseConflict(self.describe()),
            e => Error::Kube(e),
        }
    }
}

fn from_lease(lease: Lease) -> StoredLease {
    let spec = lease.spec.unwrap_or_default();
    let seconds = spec
        .lease_duration_seconds
        .and_then(|s| u64::try_from(s).ok())
        .unwrap_or_default();

    StoredLease {
        record: LeaseRecord {
            holder_identity: spec.holder_identity.filter(|h| !h.is_empty()),
            lease_duration: Duration::from_secs(seconds),
            acquire_time: spec.acquire_time.map(|t| t.0),
            renew_time: spec.renew_time.map(|t| t.0),
            transitions: spec.lease_transitions.unwrap_or_default(),
        },
        version: lease.metadata.resource_version.unwrap_or_default(),
    }
}

impl LeaseStore for KubeLeaseStore {
    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn get(&self) -> Result<Option<StoredLease>> {
        Ok(self.api.get_opt(&self.name).await?.map(from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<StoredLease> {
        let lease = self.to_lease(record, None);
        self.api
            .create(&PostParams::default(), &lease)
            .await
            .map(from_lease)
            .map_err(|e| self.map_conflict(e))
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<StoredLease> {
        let lease = self.to_lease(record, Some(version));
        self.api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map(from_lease)
            .map_err(|e| self.map_conflict(e))
    }
}

/// Hooks invoked as leadership changes.
pub trait LeaderCallbacks: Send + Sync + 'static {
    /// Runs once per continuous leadership interval.
    ///
    /// `token` is cancelled as soon as leadership is lost or the process shuts
    /// down; the returned future must finish promptly after that. Returning on
    /// its own ends the session and gives up the lease.
    fn started_leading(&self, token: CancellationToken) -> impl Future<Output = ()> + Send;

    /// Called after a leadership session has fully wound down.
    fn stopped_leading(&self) {}

    /// Called whenever the observed holder changes, including to this process.
    fn new_leader(&self, identity: &str) {
        let _ = identity;
    }
}

struct Observed {
    lease: StoredLease,
    at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Renewal failed past the renew deadline or another holder showed up.
    Lost,
    /// The process-wide stop signal fired.
    Shutdown,
    /// The leading task returned on its own.
    Finished,
}

/// Drives acquisition, renewal and release of a lease for one identity.
pub struct LeaderElector<S> {
    store: S,
    identity: String,
    timings: LeaseTimings,
    release_on_cancel: bool,
    observed: Option<Observed>,
    reported_leader: Option<String>,
}

impl<S: LeaseStore> LeaderElector<S> {
    /// Creates an elector. The lease is released on shutdown by default.
    pub fn new(store: S, identity: impl Into<String>, timings: LeaseTimings) -> Self {
        Self {
            store,
            identity: identity.into(),
            timings,
            release_on_cancel: true,
            observed: None,
            reported_leader: None,
        }
    }

    /// Whether to release the lease when the stop signal fires.
    #[must_use]
    pub fn release_on_cancel(mut self, release: bool) -> Self {
        self.release_on_cancel = release;
        self
    }

    /// Whether the last observed record names this identity as holder.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.observed.as_ref().is_some_and(|o| {
            o.lease.record.holder_identity.as_deref() == Some(self.identity.as_str())
        })
    }

    /// Contends for leadership until `cancel` fires.
    ///
    /// Each time the lease is acquired, `started_leading` runs with a child of
    /// `cancel`; when that session ends, the elector goes back to contending.
    pub async fn run<C: LeaderCallbacks>(mut self, callbacks: Arc<C>, cancel: CancellationToken) {
        let lease = self.store.describe();

        loop {
            if !self.acquire(callbacks.as_ref(), &cancel).await {
                break;
            }
            info!(identity = %self.identity, %lease, "successfully acquired lease");

            let session = cancel.child_token();
            let mut work = tokio::spawn({
                let callbacks = Arc::clone(&callbacks);
                let token = session.clone();
                async move { callbacks.started_leading(token).await }
            });

            let end = self.hold(callbacks.as_ref(), &cancel, &mut work).await;
            session.cancel();
            if end != SessionEnd::Finished
                && let Err(e) = work.await
            {
                error!(identity = %self.identity, "leading task failed: {e}");
            }

            match end {
                SessionEnd::Lost => warn!(identity = %self.identity, %lease, "leadership lost"),
                SessionEnd::Shutdown if !self.release_on_cancel => {}
                SessionEnd::Shutdown | SessionEnd::Finished => {
                    if let Err(e) = self.release().await {
                        warn!(identity = %self.identity, %lease, "failed to release lease: {e}");
                    }
                }
            }
            callbacks.stopped_leading();

            if end == SessionEnd::Shutdown {
                break;
            }

            // give the standbys a chance before contending again
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.timings.retry_period) => {}
            }
        }

        info!(identity = %self.identity, %lease, "leader election stopped");
    }

    /// Retries every `retry_period` until the lease is ours. Returns `false` on cancellation.
    async fn acquire<C: LeaderCallbacks>(&mut self, callbacks: &C, cancel: &CancellationToken) -> bool {
        debug!(identity = %self.identity, lease = %self.store.describe(), "attempting to acquire lease");

        loop {
            let acquired = tokio::select! {
                () = cancel.cancelled() => return false,
                acquired = self.attempt(callbacks) => acquired,
            };
            if acquired {
                return true;
            }

            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.timings.retry_period) => {}
            }
        }
    }

    /// Renews every `retry_period` while `work` runs.
    async fn hold<C: LeaderCallbacks>(
        &mut self,
        callbacks: &C,
        cancel: &CancellationToken,
        work: &mut JoinHandle<()>,
    ) -> SessionEnd {
        let mut last_renew = Instant::now();

        loop {
            tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Shutdown,
                res = &mut *work => {
                    if let Err(e) = res {
                        error!(identity = %self.identity, "leading task failed: {e}");
                    }
                    return SessionEnd::Finished;
                }
                () = tokio::time::sleep(self.timings.retry_period) => {}
            }

            let remaining = self
                .timings
                .renew_deadline
                .saturating_sub(last_renew.elapsed());
            let renewed = tokio::select! {
                () = cancel.cancelled() => return SessionEnd::Shutdown,
                res = tokio::time::timeout(remaining, self.attempt(callbacks)) => res.unwrap_or(false),
            };

            if renewed {
                last_renew = Instant::now();
                continue;
            }
            if self.held_by_other() {
                return SessionEnd::Lost;
            }
            if last_renew.elapsed() >= self.timings.renew_deadline {
                warn!(
                    identity = %self.identity,
                    deadline_secs = self.timings.renew_deadline.as_secs(),
                    "failed to renew lease before the deadline"
                );
                return SessionEnd::Lost;
            }
        }
    }

    /// One acquire-or-renew round trip, with errors logged and counted as failure.
    async fn attempt<C: LeaderCallbacks>(&mut self, callbacks: &C) -> bool {
        match self.try_acquire_or_renew(callbacks).await {
            Ok(acquired) => acquired,
            Err(Error::LeaseConflict(lease)) => {
                debug!(identity = %self.identity, %lease, "lease was modified concurrently");
                false
            }
            Err(e) => {
                warn!(
                    identity = %self.identity,
                    lease = %self.store.describe(),
                    retry_secs = self.timings.retry_period.as_secs(),
                    "failed to acquire or renew lease: {e}"
                );
                false
            }
        }
    }

    async fn try_acquire_or_renew<C: LeaderCallbacks>(&mut self, callbacks: &C) -> Result<bool> {
        let now = Timestamp::now();
        let mut desired = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration: self.timings.lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions: 0,
        };

        let Some(current) = self.store.get().await? else {
            let stored = self.store.create(&desired).await?;
            self.observe(stored, callbacks);
            return Ok(true);
        };
        self.observe(current.clone(), callbacks);

        if self.held_by_other() && !self.observed_expired() {
            return Ok(false);
        }

        if current.record.holder_identity.as_deref() == Some(self.identity.as_str()) {
            desired.acquire_time = current.record.acquire_time;
            desired.transitions = current.record.transitions;
        } else {
            desired.transitions = current.record.transitions.saturating_add(1);
        }

        let stored = self.store.update(&desired, &current.version).await?;
        self.observe(stored, callbacks);
        Ok(true)
    }

    /// Clears the holder if this identity still holds the lease.
    async fn release(&mut self) -> Result<()> {
        let Some(current) = self.store.get().await? else {
            debug!(identity = %self.identity, "lease not found, nothing to release");
            return Ok(());
        };
        if current.record.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let now = Timestamp::now();
        let released = LeaseRecord {
            holder_identity: None,
            lease_duration: Duration::from_secs(1),
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions: current.record.transitions,
        };
        let stored = self.store.update(&released, &current.version).await?;
        self.observed = Some(Observed {
            lease: stored,
            at: Instant::now(),
        });

        info!(identity = %self.identity, lease = %self.store.describe(), "lease released");
        Ok(())
    }

    fn observe<C: LeaderCallbacks>(&mut self, lease: StoredLease, callbacks: &C) {
        // any write bumps the version, so an unchanged lease means nobody renewed it
        if self.observed.as_ref().is_none_or(|o| o.lease != lease) {
            self.observed = Some(Observed {
                lease,
                at: Instant::now(),
            });
        }

        let holder = self
            .observed
            .as_ref()
            .and_then(|o| o.lease.record.holder_identity.clone());
        if let Some(holder) = holder
            && self.reported_leader.as_ref() != Some(&holder)
        {
            info!(identity = %self.identity, leader = %holder, "new leader");
            callbacks.new_leader(&holder);
            self.reported_leader = Some(holder);
        }
    }

    fn held_by_other(&self) -> bool {
        self.observed.as_ref().is_some_and(|o| {
            o.lease
                .record
                .holder_identity
                .as_deref()
                .is_some_and(|h| h != self.identity)
        })
    }

    fn observed_expired(&self) -> bool {
        self.observed
            .as_ref()
            .is_none_or(|o| o.at + o.lease.record.lease_duration <= Instant::now())
    }
}
