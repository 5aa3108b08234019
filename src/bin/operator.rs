//! Controller-manager binary: runs the ActDeployment and ActRunner
//! reconcilers against the cluster the process is deployed into.

use act_operator::controllers::{self, OperatorConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,act_operator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "starting Forgejo act-runner operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let client = kube::Client::try_default().await?;
    info!("connected to Kubernetes cluster");

    let config = Arc::new(OperatorConfig::from_env());

    tokio::select! {
        result = controllers::run_controllers(client, config) => {
            result?;
        }
        () = shutdown_signal() => {
            info!("shutting down");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("received SIGTERM, shutting down gracefully");
        },
    }
}
