//! Cluster resource gateway: the handful of API calls the reconciler needs.

use std::future::Future;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;

use crate::Result;
use crate::config::ServiceType;

/// Remote operations on `Service` and `EndpointSlice` objects.
///
/// `get_*` return `Ok(None)` when the object does not exist.
pub trait ClusterGateway: Send + Sync {
    /// Fetches a Service.
    fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<Service>>> + Send;

    /// Creates a Service.
    fn create_service(&self, service: &Service) -> impl Future<Output = Result<Service>> + Send;

    /// Merge-patches `spec.type` of a Service.
    fn patch_service_type(
        &self,
        namespace: &str,
        name: &str,
        service_type: ServiceType,
    ) -> impl Future<Output = Result<Service>> + Send;

    /// Fetches an EndpointSlice.
    fn get_endpoint_slice(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<EndpointSlice>>> + Send;

    /// Creates an EndpointSlice.
    fn create_endpoint_slice(
        &self,
        slice: &EndpointSlice,
    ) -> impl Future<Output = Result<EndpointSlice>> + Send;

    /// Replaces an existing EndpointSlice with `slice`.
    fn replace_endpoint_slice(
        &self,
        slice: &EndpointSlice,
    ) -> impl Future<Output = Result<EndpointSlice>> + Send;

    /// Whether a Service exists.
    fn service_exists(&self, namespace: &str, name: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get_service(namespace, name).await?.is_some()) }
    }

    /// Whether an EndpointSlice exists.
    fn endpoint_slice_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get_endpoint_slice(namespace, name).await?.is_some()) }
    }
}

/// [`ClusterGateway`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Wraps a client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn endpoint_slices(&self, namespace: &str) -> Api<EndpointSlice> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn namespace_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.namespace.as_deref().unwrap_or("default")
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

impl ClusterGateway for KubeGateway {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let service = self.services(namespace).get_opt(name).await?;
        if service.is_none() {
            tracing::debug!("Service {namespace}/{name} does not exist");
        }
        Ok(service)
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        let namespace = namespace_of(&service.metadata);
        let created = self
            .services(namespace)
            .create(&PostParams::default(), service)
            .await?;
        tracing::info!(
            "created Service {namespace}/{}",
            name_of(&service.metadata)
        );
        Ok(created)
    }

    async fn patch_service_type(
        &self,
        namespace: &str,
        name: &str,
        service_type: ServiceType,
    ) -> Result<Service> {
        let patch = json!({ "spec": { "type": service_type.as_str() } });
        let patched = self
            .services(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!("set type of Service {namespace}/{name} to {service_type}");
        Ok(patched)
    }

    async fn get_endpoint_slice(&self, namespace: &str, name: &str) -> Result<Option<EndpointSlice>> {
        let slice = self.endpoint_slices(namespace).get_opt(name).await?;
        if slice.is_none() {
            tracing::info!("EndpointSlice {namespace}/{name} does not exist");
        }
        Ok(slice)
    }

    async fn create_endpoint_slice(&self, slice: &EndpointSlice) -> Result<EndpointSlice> {
        let namespace = namespace_of(&slice.metadata);
        let created = self
            .endpoint_slices(namespace)
            .create(&PostParams::default(), slice)
            .await?;
        tracing::info!(
            "created EndpointSlice {namespace}/{}",
            name_of(&slice.metadata)
        );
        Ok(created)
    }

    async fn replace_endpoint_slice(&self, slice: &EndpointSlice) -> Result<EndpointSlice> {
        let namespace = namespace_of(&slice.metadata);
        let name = name_of(&slice.metadata);
        let replaced = self
            .endpoint_slices(namespace)
            .replace(name, &PostParams::default(), slice)
            .await?;
        tracing::debug!("updated EndpointSlice {namespace}/{name}");
        Ok(replaced)
    }
}
