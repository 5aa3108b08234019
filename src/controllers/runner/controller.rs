use super::resources::RunnerResources;
use crate::controllers::types::{Context, Error, Result};
use crate::crds::{ActRunner, ActRunnerPhase};
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Reconcile one `ActRunner` through its phase lifecycle by observing and,
/// when Pending, creating its execution pod.
#[instrument(skip(ctx), fields(act_runner = %act_runner.name_any()))]
pub async fn reconcile_act_runner(
    act_runner: Arc<ActRunner>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = act_runner.name_any();
    let namespace = act_runner.namespace().ok_or(Error::MissingObjectKey)?;

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let runners: Api<ActRunner> = Api::namespaced(ctx.client.clone(), &namespace);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    // The registration secret is deliberately not owner-referenced, so the
    // deletion branch is what removes it when the runner goes away.
    if act_runner.metadata.deletion_timestamp.is_some() {
        if let Err(err) = delete_registration_secret(&secrets, &act_runner).await {
            warn!(
                "failed to clean up registration secret during deletion of {}: {}",
                name, err
            );
        }
        return Ok(Action::await_change());
    }

    let mut pod = None;
    if let Some(pod_name) = act_runner
        .status
        .as_ref()
        .and_then(|status| status.kubernetes_job_name.as_deref())
    {
        match pods.get(pod_name).await {
            Ok(found) => pod = Some(found),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                // Pod vanished out from under us; go back to Pending so the
                // next reconciliation creates a fresh one.
                warn!(
                    "execution pod {} for ActRunner {} no longer exists, resetting",
                    pod_name, name
                );
                runners
                    .patch_status(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({
                            "status": {
                                "phase": ActRunnerPhase::Pending,
                                "kubernetesJobName": null,
                            }
                        })),
                    )
                    .await?;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let current = act_runner.status.clone().unwrap_or_default();
    let phase = ActRunnerPhase::from_pod(pod.as_ref());
    if current.phase != phase {
        let now = Utc::now().to_rfc3339();
        let mut patch = json!({"status": {"phase": phase}});
        if phase == ActRunnerPhase::Running && current.started_at.is_none() {
            patch["status"]["startedAt"] = json!(now);
        }
        if phase.is_terminal() && current.completed_at.is_none() {
            patch["status"]["completedAt"] = json!(now);
        }
        debug!("ActRunner {} phase {} -> {}", name, current.phase, phase);
        runners
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
    }

    match phase {
        ActRunnerPhase::Pending => {
            let resources = RunnerResources {
                pods: &pods,
                runners: &runners,
            };
            resources.reconcile_pod(&act_runner).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        ActRunnerPhase::Running => Ok(Action::requeue(Duration::from_secs(10))),
        ActRunnerPhase::Succeeded | ActRunnerPhase::Failed => {
            // Retried on every reconciliation of a finished runner, so an
            // earlier failed cleanup eventually converges.
            if let Err(err) = delete_registration_secret(&secrets, &act_runner).await {
                error!(
                    "failed to clean up registration secret for finished ActRunner {}: {}",
                    name, err
                );
                return Ok(Action::requeue(Duration::from_secs(30)));
            }
            Ok(Action::await_change())
        }
    }
}

/// Delete the runner's registration token secret, tolerating absence.
async fn delete_registration_secret(secrets: &Api<Secret>, runner: &ActRunner) -> Result<()> {
    let secret_name = &runner.spec.registration_token_secret_ref.name;
    if secret_name.is_empty() {
        return Ok(());
    }

    match secrets.delete(secret_name, &DeleteParams::default()).await {
        Ok(_) => {
            info!(
                "deleted registration token secret {} for ActRunner {}",
                secret_name,
                runner.name_any()
            );
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            debug!("registration secret {} already deleted", secret_name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
