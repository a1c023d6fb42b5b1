//! Kubernetes client construction.

use std::path::Path;

use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig};

use crate::Result;

/// Connects with the kubeconfig at `kubeconfig`, or with the in-cluster
/// service account when no path is given.
///
/// # Errors
///
/// Fails if the credentials cannot be loaded or the client cannot be built.
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            tracing::debug!("loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => {
            tracing::debug!("using in-cluster configuration");
            kube::Config::incluster()?
        }
    };

    tracing::info!("connecting to {}", config.cluster_url);
    Ok(Client::try_from(config)?)
}
