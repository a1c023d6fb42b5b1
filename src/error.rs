//! Error types shared across the mirror.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Main error type for mirror operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid command-line or environment configuration.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The kubeconfig file could not be read or resolved.
    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// In-cluster credentials were requested but are not available.
    #[error("failed to load in-cluster config: {0}")]
    InCluster(#[from] kube::config::InClusterError),

    /// Kubernetes API error.
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease changed between read and write.
    #[error("lease {0} was modified concurrently")]
    LeaseConflict(String),

    /// The initial list of the watched resource did not complete in time.
    #[error("cache sync timed out after {0:?}")]
    CacheSyncTimeout(Duration),

    /// A work queue key is not of the form `namespace/name` or `name`.
    #[error("invalid resource key: {0:?}")]
    InvalidKey(String),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from an arbitrary message.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns the HTTP status code when this is a Kubernetes API error response.
    #[must_use]
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(e)) => Some(e.code),
            _ => None,
        }
    }
}

/// Result type for mirror operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
