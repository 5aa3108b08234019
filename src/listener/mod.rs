//! Long-lived poller process, one per ActDeployment.
//!
//! Bootstraps against the cluster (waiting for the API token secret if it is
//! not there yet), then ticks at the configured interval: reload the owning
//! ActDeployment, push spec changes down to Pending runners, and admit newly
//! observed jobs.

use crate::controllers::types::{Error, Result};
use crate::crds::{ActDeployment, ActRunner};
use crate::forgejo;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

pub mod config;
pub mod poll;

pub use config::ListenerConfig;

const INITIAL_TOKEN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_TOKEN_BACKOFF: Duration = Duration::from_secs(30);

/// Run the poll loop until the process is stopped. Cancellation is handled by
/// dropping this future (the binaries race it against a shutdown signal), so
/// every await point doubles as a cancellation point.
pub async fn run(client: Client, config: ListenerConfig) -> Result<()> {
    let token = wait_for_api_token(&client, &config).await?;
    let forgejo_client =
        forgejo::Client::with_tls(&config.forgejo_server, &token, config.skip_tls_verify)?;

    info!(
        server = %config.forgejo_server,
        organization = %config.organization,
        labels = %config.labels,
        interval = ?config.poll_interval,
        "starting listener"
    );

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // An interval's first tick completes immediately; consume it so the first
    // poll happens one full period after startup.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(err) = tick(&client, &forgejo_client, &config).await {
            // A failed tick never takes the loop down; the next one retries.
            error!("poll tick failed: {}", err);
        }
    }
}

async fn tick(
    client: &Client,
    forgejo_client: &forgejo::Client,
    config: &ListenerConfig,
) -> Result<()> {
    let act_deployments: Api<ActDeployment> = Api::namespaced(client.clone(), &config.namespace);
    // Reloaded every tick so in-flight spec edits (runnerImage, templates)
    // take effect without a restart.
    let act_deployment = act_deployments.get(&config.act_deployment_name).await?;

    let runners: Api<ActRunner> = Api::namespaced(client.clone(), &config.namespace);
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);

    if let Err(err) = poll::propagate_deployment_spec(&runners, &act_deployment).await {
        // Admission can still proceed with the deployment spec we just read.
        error!("failed to update existing ActRunners: {}", err);
    }

    poll::admit_pending_jobs(&runners, &secrets, forgejo_client, &act_deployment, config).await
}

/// Resolve the Forgejo API token, waiting with exponential backoff while the
/// secret does not exist yet. A present secret with a missing key or an empty
/// value is a configuration error and fails immediately.
async fn wait_for_api_token(client: &Client, config: &ListenerConfig) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.namespace);
    let mut backoff = INITIAL_TOKEN_BACKOFF;
    let mut logged_waiting = false;

    loop {
        match secrets.get(&config.token_secret_name).await {
            Ok(secret) => {
                if logged_waiting {
                    info!(
                        "secret {} found in namespace {}",
                        config.token_secret_name, config.namespace
                    );
                }
                return token_from_secret(
                    &secret,
                    &config.token_secret_name,
                    &config.token_secret_key,
                );
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                if !logged_waiting {
                    info!(
                        "secret {} not found in namespace {}, waiting for it to be created",
                        config.token_secret_name, config.namespace
                    );
                    logged_waiting = true;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_TOKEN_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn token_from_secret(secret: &Secret, secret_name: &str, key: &str) -> Result<String> {
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .ok_or_else(|| {
            Error::ConfigError(format!("key {key} not found in secret {secret_name}"))
        })?;

    if value.0.is_empty() {
        return Err(Error::ConfigError(format!(
            "token key {key} in secret {secret_name} is empty"
        )));
    }

    String::from_utf8(value.0.clone()).map_err(|_| {
        Error::ConfigError(format!("token in secret {secret_name} is not valid UTF-8"))
    })
}
