#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Mirrors the Kubernetes API server's `default/kubernetes` Service under a
//! configurable name, namespace and Service type.
//!
//! The built-in `kubernetes` Service is always `ClusterIP`, so it cannot be
//! reached from outside the cluster through a load balancer. This crate keeps a
//! copy of it (a Service plus its EndpointSlice) whose type you choose, with the
//! `https` port exposed on 6443.
//!
//! # Features
//!
//! - **Leader election**: Replicas contend for a `coordination.k8s.io` Lease; only the holder writes
//! - **Watch-driven**: Endpoint changes of the API server propagate as they happen
//! - **Retries**: Failed reconciles are re-queued with per-key exponential backoff
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use apiserver_mirror::config::{Config, ServiceType};
//! use apiserver_mirror::lease::{KubeLeaseStore, LeaderElector, LEASE_NAME};
//! use apiserver_mirror::mirror::MirrorController;
//!
//! let config = Arc::new(Config::new("k8s-apiserver", "default", ServiceType::LoadBalancer, "pod-0")?);
//! let client = apiserver_mirror::client::connect(None).await?;
//!
//! let store = KubeLeaseStore::new(client.clone(), &config.service_namespace, LEASE_NAME);
//! LeaderElector::new(store, config.identity.clone(), config.lease)
//!     .run(Arc::new(MirrorController::new(client, config)), cancel)
//!     .await;
//! ```

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod lease;
pub mod mirror;
pub mod queue;
pub mod reconcile;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
