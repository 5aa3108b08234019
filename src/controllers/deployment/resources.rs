//! Builders and idempotent create-or-update for the per-deployment listener
//! infrastructure: service account, RBAC, and the listener workload.

use crate::controllers::types::{
    Context, Error, Result, ACT_DEPLOYMENT_LABEL, DEFAULT_POLL_INTERVAL, LISTENER_APP,
    TOKEN_SECRET_KEY,
};
use crate::crds::ActDeployment;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, PostParams};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name shared by the listener's ServiceAccount, Role, RoleBinding, and Deployment.
pub fn listener_name(deployment_name: &str) -> String {
    format!("{deployment_name}-listener")
}

fn owner_reference(act_deployment: &ActDeployment) -> Result<OwnerReference> {
    act_deployment
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey)
}

fn listener_labels(act_deployment_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), LISTENER_APP.to_string());
    labels.insert(
        ACT_DEPLOYMENT_LABEL.to_string(),
        act_deployment_name.to_string(),
    );
    labels
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Rule set granted to the listener: read/provision secrets, read its
/// deployment, and manage the runners it emits.
pub fn listener_policy_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            verbs: vec!["get", "list", "create", "update"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["forgejo.actions.io".to_string()]),
            resources: Some(vec!["actdeployments".to_string()]),
            verbs: vec!["get", "list", "watch"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["forgejo.actions.io".to_string()]),
            resources: Some(vec!["actrunners".to_string()]),
            verbs: vec!["create", "get", "list", "watch", "update", "patch"]
                .into_iter()
                .map(String::from)
                .collect(),
            ..Default::default()
        },
    ]
}

pub fn build_service_account(act_deployment: &ActDeployment) -> Result<ServiceAccount> {
    Ok(ServiceAccount {
        metadata: ObjectMeta {
            name: Some(listener_name(&act_deployment.name_any())),
            namespace: act_deployment.namespace(),
            owner_references: Some(vec![owner_reference(act_deployment)?]),
            ..Default::default()
        },
        ..Default::default()
    })
}

pub fn build_role(act_deployment: &ActDeployment) -> Result<Role> {
    Ok(Role {
        metadata: ObjectMeta {
            name: Some(listener_name(&act_deployment.name_any())),
            namespace: act_deployment.namespace(),
            owner_references: Some(vec![owner_reference(act_deployment)?]),
            ..Default::default()
        },
        rules: Some(listener_policy_rules()),
    })
}

pub fn build_role_binding(act_deployment: &ActDeployment) -> Result<RoleBinding> {
    let name = listener_name(&act_deployment.name_any());
    Ok(RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: act_deployment.namespace(),
            owner_references: Some(vec![owner_reference(act_deployment)?]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: name.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name,
            namespace: act_deployment.namespace(),
            ..Default::default()
        }]),
    })
}

/// Derive the listener workload from the declared template.
///
/// The template is opaque apart from the augmentations applied here: discovery
/// labels on both the pod template and the workload selector, an injected
/// default container when the template has none, the listener environment
/// appended to the first container, and the service account binding.
pub fn build_listener_deployment(
    act_deployment: &ActDeployment,
    service_account_name: &str,
    listener_image: &str,
) -> Result<Deployment> {
    let act_deployment_name = act_deployment.name_any();
    let labels = listener_labels(&act_deployment_name);

    let mut template = act_deployment.spec.listener_template.clone();
    template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    if pod_spec.containers.is_empty() {
        pod_spec.containers = vec![Container {
            name: "listener".to_string(),
            image: Some(listener_image.to_string()),
            command: Some(vec!["/listener".to_string()]),
            ..Default::default()
        }];
    }

    let poll_interval = act_deployment
        .spec
        .poll_interval
        .clone()
        .unwrap_or_else(|| DEFAULT_POLL_INTERVAL.to_string());

    // Environment is appended, never replaced, so template-declared variables
    // survive. The listener reads these at startup.
    let container = &mut pod_spec.containers[0];
    container.env.get_or_insert_with(Vec::new).extend([
        env_var("FORGEJO_SERVER", &act_deployment.spec.forgejo_server),
        env_var("ORGANIZATION", &act_deployment.spec.organization),
        env_var("LABELS", &act_deployment.spec.labels),
        env_var(
            "TOKEN_SECRET_NAME",
            &act_deployment.spec.token_secret_ref.name,
        ),
        env_var("TOKEN_SECRET_KEY", TOKEN_SECRET_KEY),
        env_var(
            "NAMESPACE",
            act_deployment.namespace().as_deref().unwrap_or_default(),
        ),
        env_var("ACT_DEPLOYMENT_NAME", &act_deployment_name),
        env_var("POLL_INTERVAL", &poll_interval),
    ]);

    pod_spec.service_account_name = Some(service_account_name.to_string());

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(listener_name(&act_deployment_name)),
            namespace: act_deployment.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(act_deployment)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Idempotent creation of the listener's ServiceAccount, RBAC, and workload.
pub struct ListenerResources<'a> {
    pub service_accounts: &'a Api<ServiceAccount>,
    pub roles: &'a Api<Role>,
    pub role_bindings: &'a Api<RoleBinding>,
    pub deployments: &'a Api<Deployment>,
    pub ctx: &'a Arc<Context>,
}

impl ListenerResources<'_> {
    /// Ensure the listener's service account exists. Returns its name.
    pub async fn ensure_service_account(&self, act_deployment: &ActDeployment) -> Result<String> {
        let name = listener_name(&act_deployment.name_any());
        match self.service_accounts.get(&name).await {
            Ok(_) => Ok(name),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let service_account = build_service_account(act_deployment)?;
                match self
                    .service_accounts
                    .create(&PostParams::default(), &service_account)
                    .await
                {
                    Ok(_) => {
                        info!("created listener ServiceAccount: {}", name);
                        Ok(name)
                    }
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(name),
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the Role and RoleBinding exist, replacing the rule set on drift.
    pub async fn ensure_rbac(&self, act_deployment: &ActDeployment) -> Result<()> {
        let name = listener_name(&act_deployment.name_any());

        let role = build_role(act_deployment)?;
        match self.roles.get(&name).await {
            Ok(existing) => {
                if existing.rules.as_deref().unwrap_or_default() != listener_policy_rules() {
                    let mut updated = existing;
                    updated.rules = role.rules;
                    self.roles
                        .replace(&name, &PostParams::default(), &updated)
                        .await?;
                    info!("updated listener Role rules: {}", name);
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                self.roles.create(&PostParams::default(), &role).await?;
                info!("created listener Role: {}", name);
            }
            Err(e) => return Err(e.into()),
        }

        let binding = build_role_binding(act_deployment)?;
        match self.role_bindings.get(&name).await {
            Ok(existing) => {
                if existing.role_ref != binding.role_ref || existing.subjects != binding.subjects {
                    let mut updated = existing;
                    updated.role_ref = binding.role_ref;
                    updated.subjects = binding.subjects;
                    self.role_bindings
                        .replace(&name, &PostParams::default(), &updated)
                        .await?;
                    info!("updated listener RoleBinding: {}", name);
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                self.role_bindings
                    .create(&PostParams::default(), &binding)
                    .await?;
                info!("created listener RoleBinding: {}", name);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    /// Ensure the single-replica listener workload exists with the current
    /// spec, replacing it on change. Returns the workload name.
    pub async fn ensure_deployment(
        &self,
        act_deployment: &ActDeployment,
        service_account_name: &str,
    ) -> Result<String> {
        let name = listener_name(&act_deployment.name_any());
        let desired = build_listener_deployment(
            act_deployment,
            service_account_name,
            &self.ctx.config.listener_image,
        )?;

        match self.deployments.get(&name).await {
            Ok(existing) => {
                if existing.spec == desired.spec {
                    debug!("listener Deployment {} is up to date", name);
                } else {
                    let mut updated = existing;
                    updated.spec = desired.spec;
                    self.deployments
                        .replace(&name, &PostParams::default(), &updated)
                        .await?;
                    info!("updated listener Deployment: {}", name);
                }
                Ok(name)
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                self.deployments
                    .create(&PostParams::default(), &desired)
                    .await?;
                info!("created listener Deployment: {}", name);
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ActDeploymentSpec, SecretRef};
    use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};

    fn deployment_fixture() -> ActDeployment {
        let mut act_deployment = ActDeployment::new(
            "fleet",
            ActDeploymentSpec {
                forgejo_server: "https://git.example.com".to_string(),
                organization: "builders".to_string(),
                labels: "docker,ubuntu-22.04".to_string(),
                token_secret_ref: SecretRef {
                    name: "forgejo-token".to_string(),
                    namespace: None,
                },
                poll_interval: Some("30s".to_string()),
                min_runners: None,
                max_runners: Some(2),
                listener_template: PodTemplateSpec::default(),
                runner_template: PodTemplateSpec::default(),
                runner_image: String::new(),
                docker_in_docker_image: String::new(),
                docker_config_map_ref: None,
            },
        );
        act_deployment.metadata.namespace = Some("ci".to_string());
        act_deployment.metadata.uid = Some("uid-fleet".to_string());
        act_deployment
    }

    fn env_value(container: &Container, name: &str) -> Option<String> {
        container
            .env
            .as_ref()
            .and_then(|env| env.iter().find(|e| e.name == name))
            .and_then(|e| e.value.clone())
    }

    #[test]
    fn test_listener_name_suffix() {
        assert_eq!(listener_name("fleet"), "fleet-listener");
    }

    #[test]
    fn test_policy_rules_cover_listener_needs() {
        let rules = listener_policy_rules();
        assert_eq!(rules.len(), 3);

        let secrets = &rules[0];
        assert_eq!(secrets.resources.as_deref().unwrap(), ["secrets"]);
        assert!(secrets.verbs.contains(&"create".to_string()));
        assert!(secrets.verbs.contains(&"update".to_string()));

        let actdeployments = &rules[1];
        assert_eq!(
            actdeployments.api_groups.as_deref().unwrap(),
            ["forgejo.actions.io"]
        );
        assert!(!actdeployments.verbs.contains(&"update".to_string()));

        let actrunners = &rules[2];
        assert!(actrunners.verbs.contains(&"create".to_string()));
        assert!(actrunners.verbs.contains(&"patch".to_string()));
    }

    #[test]
    fn test_listener_deployment_injects_default_container() {
        let act_deployment = deployment_fixture();
        let workload =
            build_listener_deployment(&act_deployment, "fleet-listener", "operator:latest")
                .unwrap();

        let template = &workload.spec.as_ref().unwrap().template;
        let containers = &template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "listener");
        assert_eq!(containers[0].image.as_deref(), Some("operator:latest"));
        assert_eq!(
            containers[0].command.as_deref(),
            Some(&["/listener".to_string()][..])
        );
    }

    #[test]
    fn test_listener_deployment_appends_environment() {
        let mut act_deployment = deployment_fixture();
        act_deployment.spec.listener_template = PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "custom".to_string(),
                    image: Some("custom:1".to_string()),
                    env: Some(vec![EnvVar {
                        name: "EXTRA".to_string(),
                        value: Some("kept".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };

        let workload =
            build_listener_deployment(&act_deployment, "fleet-listener", "operator:latest")
                .unwrap();
        let template = &workload.spec.as_ref().unwrap().template;
        let container = &template.spec.as_ref().unwrap().containers[0];

        // The template's container and env survive; ours are appended.
        assert_eq!(container.name, "custom");
        assert_eq!(env_value(container, "EXTRA").as_deref(), Some("kept"));
        assert_eq!(
            env_value(container, "FORGEJO_SERVER").as_deref(),
            Some("https://git.example.com")
        );
        assert_eq!(
            env_value(container, "LABELS").as_deref(),
            Some("docker,ubuntu-22.04")
        );
        assert_eq!(
            env_value(container, "TOKEN_SECRET_NAME").as_deref(),
            Some("forgejo-token")
        );
        assert_eq!(env_value(container, "TOKEN_SECRET_KEY").as_deref(), Some("token"));
        assert_eq!(env_value(container, "NAMESPACE").as_deref(), Some("ci"));
        assert_eq!(
            env_value(container, "ACT_DEPLOYMENT_NAME").as_deref(),
            Some("fleet")
        );
        assert_eq!(env_value(container, "POLL_INTERVAL").as_deref(), Some("30s"));
    }

    #[test]
    fn test_listener_deployment_selector_matches_template_labels() {
        let act_deployment = deployment_fixture();
        let workload =
            build_listener_deployment(&act_deployment, "fleet-listener", "operator:latest")
                .unwrap();
        let spec = workload.spec.as_ref().unwrap();

        let selector = spec.selector.match_labels.as_ref().unwrap();
        assert_eq!(selector.get("app").map(String::as_str), Some(LISTENER_APP));
        assert_eq!(
            selector.get(ACT_DEPLOYMENT_LABEL).map(String::as_str),
            Some("fleet")
        );

        let template_labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.as_ref())
            .unwrap();
        for (key, value) in selector {
            assert_eq!(template_labels.get(key), Some(value));
        }

        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.template.spec.as_ref().unwrap().service_account_name.as_deref(),
            Some("fleet-listener")
        );
    }

    #[test]
    fn test_listener_deployment_defaults_poll_interval() {
        let mut act_deployment = deployment_fixture();
        act_deployment.spec.poll_interval = None;

        let workload =
            build_listener_deployment(&act_deployment, "fleet-listener", "operator:latest")
                .unwrap();
        let container = &workload
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        assert_eq!(env_value(container, "POLL_INTERVAL").as_deref(), Some("10s"));
    }

    #[test]
    fn test_children_carry_controller_owner_reference() {
        let act_deployment = deployment_fixture();

        let service_account = build_service_account(&act_deployment).unwrap();
        let owners = service_account.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "ActDeployment");
        assert_eq!(owners[0].name, "fleet");
        assert_eq!(owners[0].uid, "uid-fleet");
        assert_eq!(owners[0].controller, Some(true));

        let role = build_role(&act_deployment).unwrap();
        assert!(role.metadata.owner_references.is_some());

        let binding = build_role_binding(&act_deployment).unwrap();
        assert_eq!(binding.role_ref.name, "fleet-listener");
        assert_eq!(
            binding.subjects.as_ref().unwrap()[0].namespace.as_deref(),
            Some("ci")
        );
    }
}
