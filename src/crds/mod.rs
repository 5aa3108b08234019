//! Custom resource definitions for the operator.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod actdeployment;
pub mod actrunner;

pub use actdeployment::{ActDeployment, ActDeploymentSpec, ActDeploymentStatus};
pub use actrunner::{ActRunner, ActRunnerPhase, ActRunnerSpec, ActRunnerStatus, JobData};

/// Reference to a secret by name, optionally qualified with a namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct SecretRef {
    /// Name of the secret
    pub name: String,

    /// Namespace of the secret (defaults to the referencing object's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to a config map in the same namespace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct ConfigMapRef {
    /// Name of the config map
    pub name: String,
}

/// Condition describing one aspect of a resource's state.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, or Unknown)
    pub status: String,

    /// Last time the condition transitioned (RFC3339 format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Reason for the condition's last transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
