//! `ActRunner` Custom Resource Definition for single-use job execution

use super::{ActDeployment, Condition, ConfigMapRef, SecretRef};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Snapshot of the job payload from the Forgejo API
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct JobData {
    /// Forgejo job ID
    pub id: i64,

    /// Repository ID
    pub repo_id: i64,

    /// Owner ID
    pub owner_id: i64,

    /// Job name
    #[serde(default)]
    pub name: String,

    /// Job dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,

    /// Runner labels the job requires (e.g. ["ubuntu-22.04:docker://node:20-bullseye"])
    #[serde(default)]
    pub runs_on: Vec<String>,

    /// Task ID
    pub task_id: i64,

    /// Job status at admission time (e.g. "waiting")
    #[serde(default)]
    pub status: String,
}

/// `ActRunner` CRD representing one pending job's execution
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "forgejo.actions.io", version = "v1alpha1", kind = "ActRunner")]
#[kube(namespaced)]
#[kube(status = "ActRunnerStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Job ID","type":"integer","jsonPath":".spec.forgejoJobID"}"#)]
#[kube(printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".status.repositoryFullName"}"#)]
#[kube(printcolumn = r#"{"name":"User","type":"string","jsonPath":".status.triggerUser"}"#)]
#[kube(printcolumn = r#"{"name":"Ref","type":"string","jsonPath":".status.prettyRef"}"#)]
#[kube(printcolumn = r#"{"name":"Event","type":"string","jsonPath":".status.triggerEvent"}"#)]
#[kube(printcolumn = r#"{"name":"K8s Pod","type":"string","jsonPath":".status.kubernetesJobName"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ActRunnerSpec {
    /// Forgejo job ID to execute; unique among runners owned by one deployment
    #[serde(rename = "forgejoJobID")]
    pub forgejo_job_id: i64,

    /// Forgejo server URL, inherited from the owning ActDeployment
    #[serde(rename = "forgejoServer")]
    pub forgejo_server: String,

    /// Forgejo organization name
    pub organization: String,

    /// Reference to the secret holding the Forgejo API token
    #[serde(rename = "tokenSecretRef")]
    pub token_secret_ref: SecretRef,

    /// Reference to the transient secret holding the runner registration token
    #[serde(rename = "registrationTokenSecretRef")]
    pub registration_token_secret_ref: SecretRef,

    /// Container image for the runner
    #[serde(default, rename = "runnerImage")]
    pub runner_image: String,

    /// Docker-in-Docker sidecar image
    #[serde(default, rename = "dockerInDockerImage")]
    pub docker_in_docker_image: String,

    /// Config map holding a Docker config.json to mount into the runner container
    #[serde(default, rename = "dockerConfigMapRef", skip_serializing_if = "Option::is_none")]
    pub docker_config_map_ref: Option<ConfigMapRef>,

    /// Job payload snapshot taken at admission
    #[serde(rename = "jobData")]
    pub job_data: JobData,

    /// Pod template for the execution pod, copied from the owning deployment
    #[serde(default, rename = "jobTemplate")]
    pub job_template: PodTemplateSpec,
}

/// Phase of an `ActRunner` lifecycle
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ActRunnerPhase {
    /// Waiting for an execution pod
    #[default]
    Pending,
    /// Execution pod is running
    Running,
    /// Execution pod completed successfully
    Succeeded,
    /// Execution pod failed
    Failed,
}

impl ActRunnerPhase {
    /// Whether no further execution work remains for this phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, ActRunnerPhase::Succeeded | ActRunnerPhase::Failed)
    }

    /// Map an observed execution pod onto a runner phase. `None` means the
    /// pod has not been created yet.
    pub fn from_pod(pod: Option<&Pod>) -> Self {
        match pod
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.phase.as_deref())
        {
            Some("Succeeded") => ActRunnerPhase::Succeeded,
            Some("Failed") => ActRunnerPhase::Failed,
            Some("Running") => ActRunnerPhase::Running,
            _ => ActRunnerPhase::Pending,
        }
    }
}

impl std::fmt::Display for ActRunnerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            ActRunnerPhase::Pending => "Pending",
            ActRunnerPhase::Running => "Running",
            ActRunnerPhase::Succeeded => "Succeeded",
            ActRunnerPhase::Failed => "Failed",
        };
        f.write_str(phase)
    }
}

/// Observed state of an `ActRunner`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct ActRunnerStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ActRunnerPhase,

    /// Name of the execution pod created for this runner
    #[serde(rename = "kubernetesJobName", skip_serializing_if = "Option::is_none")]
    pub kubernetes_job_name: Option<String>,

    /// Timestamp when job execution started (RFC3339 format)
    #[serde(rename = "startedAt", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,

    /// Timestamp when job execution completed (RFC3339 format)
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,

    /// Full name of the repository (e.g. "owner/repo")
    #[serde(rename = "repositoryFullName", skip_serializing_if = "Option::is_none")]
    pub repository_full_name: Option<String>,

    /// Login of the user who triggered the run
    #[serde(rename = "triggerUser", skip_serializing_if = "Option::is_none")]
    pub trigger_user: Option<String>,

    /// Branch or tag reference (e.g. "main")
    #[serde(rename = "prettyRef", skip_serializing_if = "Option::is_none")]
    pub pretty_ref: Option<String>,

    /// Event that triggered the run (e.g. "push", "workflow_dispatch")
    #[serde(rename = "triggerEvent", skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,

    /// Conditions for the `ActRunner`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

impl ActRunner {
    /// Current phase, defaulting to Pending when no status has been written.
    pub fn phase(&self) -> ActRunnerPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether this runner carries a controller owner reference to `deployment`.
    pub fn is_owned_by(&self, deployment: &ActDeployment) -> bool {
        let deployment_uid = deployment.metadata.uid.as_deref().unwrap_or_default();
        self.metadata
            .owner_references
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|owner| {
                owner.kind == "ActDeployment"
                    && owner.name == deployment.name_any()
                    && owner.uid == deployment_uid
            })
    }
}
