//! Desired-state derivation and the reconcile pass.
//!
//! The mirrored Service is derived from the live `default/kubernetes` Service
//! and the mirrored EndpointSlice from the watched `default/kubernetes`
//! EndpointSlice. Derivation never mutates its input.
//!
//! Updates are deliberately asymmetric: an existing mirrored Service only has
//! its `spec.type` corrected, while the mirrored EndpointSlice is replaced on
//! every pass so address changes propagate.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::Result;
use crate::config::Config;
use crate::gateway::ClusterGateway;

/// Name of the API server's own Service and EndpointSlice.
pub const SOURCE_NAME: &str = "kubernetes";

/// Namespace of the API server's own Service and EndpointSlice.
pub const SOURCE_NAMESPACE: &str = "default";

/// Label binding an EndpointSlice to its Service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Port name the API server publishes.
pub const HTTPS_PORT_NAME: &str = "https";

/// Port the API server Service publishes.
pub const HTTPS_PORT: i32 = 443;

/// Port the mirrored Service publishes instead of [`HTTPS_PORT`].
pub const MIRRORED_HTTPS_PORT: i32 = 6443;

/// Moves the API server's `https/443` port to 6443.
///
/// Target port, protocol and every other entry are passed through unchanged, in order.
#[must_use]
pub fn transform_ports(ports: &[ServicePort]) -> Vec<ServicePort> {
    ports
        .iter()
        .map(|port| {
            if port.name.as_deref() == Some(HTTPS_PORT_NAME) && port.port == HTTPS_PORT {
                ServicePort {
                    port: MIRRORED_HTTPS_PORT,
                    ..port.clone()
                }
            } else {
                port.clone()
            }
        })
        .collect()
}

/// Metadata for a mirrored object: source labels and annotations under the
/// target name, with everything the API server assigns stripped.
fn mirrored_metadata(source: &ObjectMeta, name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: source.labels.clone(),
        annotations: source.annotations.clone(),
        ..Default::default()
    }
}

/// Builds the mirrored Service from the API server's Service.
#[must_use]
pub fn desired_service(source: &Service, config: &Config) -> Service {
    let mut spec = source.spec.clone().unwrap_or_default();
    spec.cluster_ip = None;
    spec.cluster_ips = None;
    spec.ports = spec.ports.as_deref().map(transform_ports);
    spec.type_ = Some(config.service_type.to_string());

    Service {
        metadata: mirrored_metadata(
            &source.metadata,
            &config.service_name,
            &config.service_namespace,
        ),
        spec: Some(spec),
        status: None,
    }
}

/// Builds the mirrored EndpointSlice from the watched API server EndpointSlice.
#[must_use]
pub fn desired_endpoint_slice(source: &EndpointSlice, config: &Config) -> EndpointSlice {
    let mut metadata = mirrored_metadata(
        &source.metadata,
        &config.service_name,
        &config.service_namespace,
    );
    metadata
        .labels
        .get_or_insert_default()
        .insert(SERVICE_NAME_LABEL.to_string(), config.service_name.clone());

    EndpointSlice {
        metadata,
        ..source.clone()
    }
}

/// Applies the mirrored state for one source EndpointSlice.
pub struct Reconciler<G> {
    gateway: G,
    config: Arc<Config>,
}

impl<G: ClusterGateway> Reconciler<G> {
    /// Creates a reconciler writing through `gateway`.
    #[must_use]
    pub fn new(gateway: G, config: Arc<Config>) -> Self {
        Self { gateway, config }
    }

    /// The gateway this reconciler writes through.
    #[must_use]
    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Converges the mirrored Service and EndpointSlice.
    ///
    /// # Errors
    ///
    /// Returns the first gateway failure, after logging it, or an error if the
    /// source Service does not exist. Retrying is up to the caller.
    pub async fn reconcile(&self, source_slice: &EndpointSlice) -> Result<()> {
        let name = self.config.service_name.as_str();
        let namespace = self.config.service_namespace.as_str();

        self.reconcile_service(namespace, name).await?;
        self.reconcile_endpoint_slice(source_slice, namespace, name)
            .await
    }

    async fn reconcile_service(&self, namespace: &str, name: &str) -> Result<()> {
        let existing = self
            .gateway
            .get_service(namespace, name)
            .await
            .inspect_err(|e| {
                tracing::error!("failed to check if Service {namespace}/{name} exists: {e}");
            })?;

        let source = self
            .gateway
            .get_service(SOURCE_NAMESPACE, SOURCE_NAME)
            .await
            .inspect_err(|e| {
                tracing::error!("failed to get Service {SOURCE_NAMESPACE}/{SOURCE_NAME}: {e}");
            })?
            .ok_or_else(|| {
                tracing::error!("Service {SOURCE_NAMESPACE}/{SOURCE_NAME} not found");
                crate::Error::other(format!(
                    "source Service {SOURCE_NAMESPACE}/{SOURCE_NAME} not found"
                ))
            })?;

        let desired = desired_service(&source, &self.config);

        let Some(existing) = existing else {
            self.gateway
                .create_service(&desired)
                .await
                .inspect_err(|e| {
                    tracing::error!("failed to create Service {namespace}/{name}: {e}");
                })?;
            return Ok(());
        };

        let wanted = self.config.service_type;
        let current = existing.spec.as_ref().and_then(|s| s.type_.as_deref());
        if current == Some(wanted.as_str()) {
            tracing::debug!("Service {namespace}/{name} already has type {wanted}");
            return Ok(());
        }

        self.gateway
            .patch_service_type(namespace, name, wanted)
            .await
            .inspect_err(|e| {
                tracing::error!("failed to update Service {namespace}/{name}: {e}");
            })?;
        Ok(())
    }

    async fn reconcile_endpoint_slice(
        &self,
        source: &EndpointSlice,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        let exists = self
            .gateway
            .endpoint_slice_exists(namespace, name)
            .await
            .inspect_err(|e| {
                tracing::error!("failed to check if EndpointSlice {namespace}/{name} exists: {e}");
            })?;

        let desired = desired_endpoint_slice(source, &self.config);

        if exists {
            self.gateway
                .replace_endpoint_slice(&desired)
                .await
                .inspect_err(|e| {
                    tracing::error!("failed to update EndpointSlice {namespace}/{name}: {e}");
                })?;
        } else {
            self.gateway
                .create_endpoint_slice(&desired)
                .await
                .inspect_err(|e| {
                    tracing::error!("failed to create EndpointSlice {namespace}/{name}: {e}");
                })?;
        }
        Ok(())
    }
}
