use std::process::ExitCode;
use std::sync::Arc;

use apiserver_mirror::config::{Cli, Config};
use apiserver_mirror::lease::{KubeLeaseStore, LEASE_NAME, LeaderElector};
use apiserver_mirror::mirror::MirrorController;
use apiserver_mirror::{Result, client};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_subscriber();

    match run(cli).await {
        Ok(()) => {
            info!("Exiting...");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(Config::try_from(cli)?);
    let client = client::connect(config.kubeconfig.as_deref()).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    info!(
        identity = %config.identity,
        "mirroring default/kubernetes to {}/{} as {}",
        config.service_namespace,
        config.service_name,
        config.service_type
    );

    let store = KubeLeaseStore::new(client.clone(), &config.service_namespace, LEASE_NAME);
    LeaderElector::new(store, config.identity.clone(), config.lease)
        .run(Arc::new(MirrorController::new(client, Arc::clone(&config))), cancel)
        .await;

    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apiserver_mirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("captured ctrl_c signal"),
        () = terminate => info!("captured SIGTERM"),
    }
}
