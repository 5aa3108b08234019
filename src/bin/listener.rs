//! Listener binary: per-ActDeployment poller that admits Forgejo jobs as
//! ActRunner resources. Configured via flags or environment (see
//! [`ListenerConfig`]); the operator supplies the environment when it creates
//! the listener workload.

use act_operator::listener::{self, ListenerConfig};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ListenerConfig::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,act_operator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "starting Forgejo listener v{} for ActDeployment {}",
        env!("CARGO_PKG_VERSION"),
        config.act_deployment_name
    );

    let client = kube::Client::try_default().await?;

    // Dropping the run future at the select point is the cancellation path:
    // the listener returns from whatever step it is blocked on, and partial
    // work is reconciled by future ticks or the controllers.
    tokio::select! {
        result = listener::run(client, config) => {
            result?;
        }
        () = shutdown_signal() => {
            info!("listener stopped");
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
            info!("received Ctrl+C, initiating graceful shutdown");
        },
        () = terminate => {
            info!("received SIGTERM, initiating graceful shutdown");
        },
    }
}
