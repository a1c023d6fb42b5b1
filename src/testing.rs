//! In-memory fakes for unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::ServiceType;
use crate::gateway::ClusterGateway;
use crate::lease::{LeaseRecord, LeaseStore, StoredLease};
use crate::reconcile::{SERVICE_NAME_LABEL, SOURCE_NAME, SOURCE_NAMESPACE};
use crate::{Error, Result};

/// The `default/kubernetes` Service as a cluster serves it.
pub fn apiserver_service() -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(SOURCE_NAME.to_string()),
            namespace: Some(SOURCE_NAMESPACE.to_string()),
            uid: Some("3f1c".to_string()),
            resource_version: Some("42".to_string()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("10.96.0.1".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("https".to_string()),
                port: 443,
                target_port: Some(IntOrString::Int(6443)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// The `default/kubernetes` EndpointSlice with one endpoint per address.
pub fn apiserver_slice(addresses: &[&str]) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(SOURCE_NAME.to_string()),
            namespace: Some(SOURCE_NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([(
                SERVICE_NAME_LABEL.to_string(),
                SOURCE_NAME.to_string(),
            )])),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: addresses
            .iter()
            .map(|a| Endpoint {
                addresses: vec![(*a).to_string()],
                ..Default::default()
            })
            .collect(),
        ports: None,
    }
}

/// A gateway call, keyed by `namespace/name`. Mutations are recorded; any op can be failed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    CreateService(String),
    PatchServiceType(String, ServiceType),
    CreateEndpointSlice(String),
    ReplaceEndpointSlice(String),
    GetService(String),
}

fn key(meta: &ObjectMeta) -> (String, String) {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

#[derive(Default)]
struct GatewayState {
    services: BTreeMap<(String, String), Service>,
    slices: BTreeMap<(String, String), EndpointSlice>,
    mutations: Vec<Op>,
    failing: HashSet<Op>,
    next_version: u64,
}

impl GatewayState {
    fn check(&self, op: &Op) -> Result<()> {
        if self.failing.contains(op) {
            Err(Error::other(format!("injected failure: {op:?}")))
        } else {
            Ok(())
        }
    }

    fn stamp(&mut self, meta: &mut ObjectMeta) {
        self.next_version += 1;
        meta.resource_version = Some(self.next_version.to_string());
    }
}

/// [`ClusterGateway`] over in-memory maps with injectable failures.
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl FakeGateway {
    pub fn insert_service(&self, service: Service) {
        let mut state = self.state.lock().unwrap();
        state.services.insert(key(&service.metadata), service);
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let state = self.state.lock().unwrap();
        state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn endpoint_slice(&self, namespace: &str, name: &str) -> Option<EndpointSlice> {
        let state = self.state.lock().unwrap();
        state
            .slices
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mutating calls in the order they succeeded.
    pub fn mutations(&self) -> Vec<Op> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().unwrap().mutations.clear();
    }

    /// Makes every future `op` fail until [`FakeGateway::heal`].
    pub fn fail_on(&self, op: Op) {
        self.state.lock().unwrap().failing.insert(op);
    }

    pub fn heal(&self) {
        self.state.lock().unwrap().failing.clear();
    }
}

impl ClusterGateway for FakeGateway {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let state = self.state.lock().unwrap();
        state.check(&Op::GetService(format!("{namespace}/{name}")))?;
        Ok(state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let (namespace, name) = key(&service.metadata);
        let op = Op::CreateService(format!("{namespace}/{name}"));
        state.check(&op)?;
        if state.services.contains_key(&(namespace.clone(), name.clone())) {
            return Err(Error::other(format!("Service {namespace}/{name} already exists")));
        }

        let mut created = service.clone();
        state.stamp(&mut created.metadata);
        state.services.insert((namespace, name), created.clone());
        state.mutations.push(op);
        Ok(created)
    }

    async fn patch_service_type(
        &self,
        namespace: &str,
        name: &str,
        service_type: ServiceType,
    ) -> Result<Service> {
        let mut state = self.state.lock().unwrap();
        let op = Op::PatchServiceType(format!("{namespace}/{name}"), service_type);
        state.check(&op)?;

        let mut service = state
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| Error::other(format!("Service {namespace}/{name} not found")))?;
        service.spec.get_or_insert_default().type_ = Some(service_type.to_string());
        state.stamp(&mut service.metadata);
        state
            .services
            .insert((namespace.to_string(), name.to_string()), service.clone());
        state.mutations.push(op);
        Ok(service)
    }

    async fn get_endpoint_slice(&self, namespace: &str, name: &str) -> Result<Option<EndpointSlice>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .slices
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_endpoint_slice(&self, slice: &EndpointSlice) -> Result<EndpointSlice> {
        let mut state = self.state.lock().unwrap();
        let (namespace, name) = key(&slice.metadata);
        let op = Op::CreateEndpointSlice(format!("{namespace}/{name}"));
        state.check(&op)?;
        if state.slices.contains_key(&(namespace.clone(), name.clone())) {
            return Err(Error::other(format!(
                "EndpointSlice {namespace}/{name} already exists"
            )));
        }

        state.slices.insert((namespace, name), slice.clone());
        state.mutations.push(op);
        Ok(slice.clone())
    }

    async fn replace_endpoint_slice(&self, slice: &EndpointSlice) -> Result<EndpointSlice> {
        let mut state = self.state.lock().unwrap();
        let (namespace, name) = key(&slice.metadata);
        let op = Op::ReplaceEndpointSlice(format!("{namespace}/{name}"));
        state.check(&op)?;
        if !state.slices.contains_key(&(namespace.clone(), name.clone())) {
            return Err(Error::other(format!(
                "EndpointSlice {namespace}/{name} not found"
            )));
        }

        state.slices.insert((namespace, name), slice.clone());
        state.mutations.push(op);
        Ok(slice.clone())
    }
}

#[derive(Default)]
struct LeaseState {
    stored: Option<StoredLease>,
    next_version: u64,
    writes: usize,
    calls: u64,
    fail_every: u64,
    conflict_next_write: bool,
    partitioned: HashSet<String>,
}

/// A single shared lease that several [`FakeLeaseStore`] handles contend for.
#[derive(Clone, Default)]
pub struct FakeLease {
    state: Arc<Mutex<LeaseState>>,
}

impl FakeLease {
    /// A store handle whose calls can be partitioned by `identity`.
    pub fn handle(&self, identity: &str) -> FakeLeaseStore {
        FakeLeaseStore {
            state: Arc::clone(&self.state),
            identity: identity.to_string(),
        }
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        let state = self.state.lock().unwrap();
        state.stored.as_ref().map(|s| s.record.clone())
    }

    /// Successful creates and updates so far.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Fails every call made through `identity`'s handle.
    pub fn partition(&self, identity: &str) {
        self.state
            .lock()
            .unwrap()
            .partitioned
            .insert(identity.to_string());
    }

    pub fn heal(&self, identity: &str) {
        self.state.lock().unwrap().partitioned.remove(identity);
    }

    /// Fails every `n`th call across all handles.
    pub fn fail_every(&self, n: u64) {
        self.state.lock().unwrap().fail_every = n;
    }

    /// Rejects the next write as if another writer got there first.
    pub fn conflict_next_write(&self) {
        self.state.lock().unwrap().conflict_next_write = true;
    }
}

/// One participant's view of a [`FakeLease`].
pub struct FakeLeaseStore {
    state: Arc<Mutex<LeaseState>>,
    identity: String,
}

impl FakeLeaseStore {
    fn enter(&self) -> Result<std::sync::MutexGuard<'_, LeaseState>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.partitioned.contains(&self.identity) {
            return Err(Error::other(format!("{} is partitioned", self.identity)));
        }
        if state.fail_every > 0 && state.calls % state.fail_every == 0 {
            return Err(Error::other("injected lease store failure"));
        }
        Ok(state)
    }
}

impl LeaseState {
    fn store(&mut self, record: &LeaseRecord) -> StoredLease {
        self.next_version += 1;
        self.writes += 1;
        let stored = StoredLease {
            record: record.clone(),
            version: self.next_version.to_string(),
        };
        self.stored = Some(stored.clone());
        stored
    }
}

impl LeaseStore for FakeLeaseStore {
    fn describe(&self) -> String {
        "fake/lease".to_string()
    }

    async fn get(&self) -> Result<Option<StoredLease>> {
        Ok(self.enter()?.stored.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<StoredLease> {
        let mut state = self.enter()?;
        if state.stored.is_some() || std::mem::take(&mut state.conflict_next_write) {
            return Err(Error::LeaseConflict(self.describe()));
        }
        Ok(state.store(record))
    }

    async fn update(&self, record: &LeaseRecord, version: &str) -> Result<StoredLease> {
        let mut state = self.enter()?;
        if std::mem::take(&mut state.conflict_next_write) {
            return Err(Error::LeaseConflict(self.describe()));
        }
        let current = state.stored.as_ref().map(|s| s.version.clone());
        match current.as_deref() {
            Some(v) if v == version => Ok(state.store(record)),
            Some(_) => Err(Error::LeaseConflict(self.describe())),
            None => Err(Error::other("lease not found")),
        }
    }
}
