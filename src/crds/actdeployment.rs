//! `ActDeployment` Custom Resource Definition for declaring a runner fleet

use super::{Condition, ConfigMapRef, SecretRef};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `ActDeployment` CRD declaring the desired state of one runner fleet
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "forgejo.actions.io", version = "v1alpha1", kind = "ActDeployment")]
#[kube(namespaced)]
#[kube(status = "ActDeploymentStatus")]
#[kube(printcolumn = r#"{"name":"Server","type":"string","jsonPath":".spec.forgejoServer"}"#)]
#[kube(printcolumn = r#"{"name":"Organization","type":"string","jsonPath":".spec.organization"}"#)]
#[kube(printcolumn = r#"{"name":"Active","type":"integer","jsonPath":".status.activeActRunners"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ActDeploymentSpec {
    /// Base URL of the Forgejo server (must start with http:// or https://)
    #[serde(rename = "forgejoServer")]
    pub forgejo_server: String,

    /// Forgejo organization to monitor for pending jobs
    pub organization: String,

    /// Label filter for jobs, passed verbatim to Forgejo
    /// (e.g. "docker" or "ubuntu-22.04:docker://node:20-bullseye")
    pub labels: String,

    /// Reference to a secret holding the Forgejo API token under key "token"
    #[serde(rename = "tokenSecretRef")]
    pub token_secret_ref: SecretRef,

    /// Interval at which the listener polls Forgejo (duration string, default "10s")
    #[serde(default, rename = "pollInterval", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// Minimum number of ActRunner resources to maintain
    #[serde(default, rename = "minRunners", skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub min_runners: Option<i32>,

    /// Maximum number of concurrent ActRunner resources; 0 means unbounded
    #[serde(default, rename = "maxRunners", skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub max_runners: Option<i32>,

    /// Pod template for the listener pod that polls the Forgejo API
    #[serde(default, rename = "listenerTemplate")]
    pub listener_template: PodTemplateSpec,

    /// Pod template for the execution pods created per admitted job
    #[serde(default, rename = "runnerTemplate")]
    pub runner_template: PodTemplateSpec,

    /// Default container image for runner pods when the template names none
    #[serde(default, rename = "runnerImage")]
    pub runner_image: String,

    /// Docker-in-Docker sidecar image for runner pods
    #[serde(default, rename = "dockerInDockerImage")]
    pub docker_in_docker_image: String,

    /// Config map holding a Docker config.json to mount into runner containers
    #[serde(default, rename = "dockerConfigMapRef", skip_serializing_if = "Option::is_none")]
    pub docker_config_map_ref: Option<ConfigMapRef>,
}

/// Observed state of an `ActDeployment`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ActDeploymentStatus {
    /// Name of the listener pod created for this deployment
    #[serde(rename = "listenerPodName", skip_serializing_if = "Option::is_none")]
    pub listener_pod_name: Option<String>,

    /// Timestamp of the last successful poll from the listener (RFC3339 format)
    #[serde(rename = "lastPollTime", skip_serializing_if = "Option::is_none")]
    pub last_poll_time: Option<String>,

    /// Count of owned ActRunner resources that are not yet terminal
    #[serde(default, rename = "activeActRunners")]
    pub active_act_runners: i32,

    /// Generation most recently reconciled
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions for the `ActDeployment`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl ActDeployment {
    /// Concurrency cap for this fleet. `None` means unbounded (absent or 0).
    pub fn effective_max_runners(&self) -> Option<i32> {
        match self.spec.max_runners {
            Some(max) if max > 0 => Some(max),
            _ => None,
        }
    }
}
