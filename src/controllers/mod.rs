use crate::crds::{ActDeployment, ActRunner};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument};

pub mod deployment;
pub mod runner;
pub mod types;

// Re-export commonly used items
pub use deployment::reconcile_act_deployment;
pub use runner::reconcile_act_runner;
pub use types::{Context, Error, OperatorConfig, Result};

/// Main entry point for both reconcilers. Runs until the process is stopped.
#[instrument(skip(client, config))]
pub async fn run_controllers(client: Client, config: Arc<OperatorConfig>) -> Result<()> {
    info!("starting ActDeployment and ActRunner controllers");

    let context = Arc::new(Context {
        client: client.clone(),
        config,
    });

    let deployment_handle = tokio::spawn({
        let client = client.clone();
        let context = context.clone();
        async move { run_deployment_controller(client, context).await }
    });

    let runner_handle = tokio::spawn({
        let client = client.clone();
        let context = context.clone();
        async move { run_runner_controller(client, context).await }
    });

    match tokio::try_join!(deployment_handle, runner_handle) {
        Ok((deployment_result, runner_result)) => {
            if let Err(e) = deployment_result {
                error!("ActDeployment controller failed: {:?}", e);
            }
            if let Err(e) = runner_result {
                error!("ActRunner controller failed: {:?}", e);
            }
        }
        Err(e) => {
            error!("controller task join error: {:?}", e);
        }
    }

    info!("controllers shutting down");
    Ok(())
}

/// Run the ActDeployment controller, watching its owned runners and listener
/// workloads for events.
async fn run_deployment_controller(client: Client, context: Arc<Context>) -> Result<()> {
    let act_deployments: Api<ActDeployment> = Api::all(client.clone());
    let act_runners: Api<ActRunner> = Api::all(client.clone());
    let workloads: Api<Deployment> = Api::all(client);
    let watcher_config = Config::default().any_semantic();

    Controller::new(act_deployments, watcher_config.clone())
        .owns(act_runners, watcher_config.clone())
        .owns(workloads, watcher_config)
        .run(reconcile_act_deployment, error_policy_deployment, context)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok(object) => debug!(?object, "ActDeployment reconciliation successful"),
                Err(err) => error!(error = ?err, "ActDeployment reconciliation error"),
            }
        })
        .await;

    info!("ActDeployment controller shutting down");
    Ok(())
}

/// Run the ActRunner controller, watching owned execution pods for events.
async fn run_runner_controller(client: Client, context: Arc<Context>) -> Result<()> {
    let act_runners: Api<ActRunner> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);
    let watcher_config = Config::default().any_semantic();

    Controller::new(act_runners, watcher_config.clone())
        .owns(pods, watcher_config)
        .run(reconcile_act_runner, error_policy_runner, context)
        .for_each(|reconciliation_result| async move {
            match reconciliation_result {
                Ok(object) => debug!(?object, "ActRunner reconciliation successful"),
                Err(err) => error!(error = ?err, "ActRunner reconciliation error"),
            }
        })
        .await;

    info!("ActRunner controller shutting down");
    Ok(())
}

fn error_policy_deployment(
    act_deployment: Arc<ActDeployment>,
    err: &Error,
    _ctx: Arc<Context>,
) -> Action {
    error!(
        error = ?err,
        act_deployment = %act_deployment.name_any(),
        "ActDeployment reconciliation failed, retrying"
    );
    Action::requeue(Duration::from_secs(5))
}

fn error_policy_runner(act_runner: Arc<ActRunner>, err: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        error = ?err,
        act_runner = %act_runner.name_any(),
        "ActRunner reconciliation failed, retrying"
    );
    Action::requeue(Duration::from_secs(5))
}
