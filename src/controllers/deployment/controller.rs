use super::resources::ListenerResources;
use crate::controllers::types::{Context, Error, Result};
use crate::crds::{ActDeployment, ActRunner};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Reconcile one `ActDeployment`: bring up the listener's service account,
/// RBAC, and workload, then publish the owned-runner count.
#[instrument(skip(ctx), fields(act_deployment = %act_deployment.name_any()))]
pub async fn reconcile_act_deployment(
    act_deployment: Arc<ActDeployment>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let name = act_deployment.name_any();
    let namespace = act_deployment.namespace().ok_or(Error::MissingObjectKey)?;
    debug!("reconciling ActDeployment {}/{}", namespace, name);

    // Children are owner-referenced; deletion cascades without our help.
    if act_deployment.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let service_accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), &namespace);
    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), &namespace);
    let role_bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), &namespace);
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), &namespace);

    let resources = ListenerResources {
        service_accounts: &service_accounts,
        roles: &roles,
        role_bindings: &role_bindings,
        deployments: &deployments,
        ctx: &ctx,
    };

    let service_account_name = resources.ensure_service_account(&act_deployment).await?;
    resources.ensure_rbac(&act_deployment).await?;
    let listener_name = resources
        .ensure_deployment(&act_deployment, &service_account_name)
        .await?;

    let active = count_active_runners(&ctx, &act_deployment, &namespace).await?;

    let act_deployments: Api<ActDeployment> = Api::namespaced(ctx.client.clone(), &namespace);
    let status = json!({
        "status": {
            "listenerPodName": format!("{listener_name}-0"),
            "activeActRunners": active,
            "observedGeneration": act_deployment.metadata.generation,
        }
    });
    act_deployments
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&status))
        .await?;

    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Count runners owned by this deployment that are not yet terminal.
async fn count_active_runners(
    ctx: &Context,
    act_deployment: &ActDeployment,
    namespace: &str,
) -> Result<i32> {
    let runners: Api<ActRunner> = Api::namespaced(ctx.client.clone(), namespace);
    let list = runners.list(&ListParams::default()).await?;

    let active = list
        .items
        .iter()
        .filter(|runner| runner.is_owned_by(act_deployment) && !runner.phase().is_terminal())
        .count();

    Ok(i32::try_from(active).unwrap_or(i32::MAX))
}
