use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Label carrying the Forgejo job ID on runners, pods, and secrets.
pub const JOB_ID_LABEL: &str = "forgejo.actions.io/job-id";

/// Label tying an execution pod back to its ActRunner.
pub const ACT_RUNNER_LABEL: &str = "forgejo.actions.io/actrunner";

/// Label tying listener workloads to their ActDeployment.
pub const ACT_DEPLOYMENT_LABEL: &str = "forgejo.actions.io/act-deployment";

/// Marker label on registration token secrets.
pub const REGISTRATION_TOKEN_LABEL: &str = "forgejo.actions.io/registration-token";

/// `app` label value for listener pods.
pub const LISTENER_APP: &str = "forgejo-listener";

/// Fallback runner image when neither spec nor template name one.
pub const DEFAULT_RUNNER_IMAGE: &str = "code.forgejo.org/forgejo/runner:9.1.0";

/// Fallback Docker-in-Docker sidecar image.
pub const DEFAULT_DIND_IMAGE: &str = "docker.io/library/docker:29.1.3-dind-alpine3.23";

/// Shared emptyDir volume carrying the Docker socket between containers.
pub const DOCKER_SOCKET_VOLUME: &str = "docker-socket";

/// Mount path of the shared socket volume in both containers.
pub const DOCKER_SOCKET_DIR: &str = "/var/docker";

/// `DOCKER_HOST` value forced into every runner container.
pub const DOCKER_HOST: &str = "unix:///var/docker/docker.sock";

/// Key under which API and registration tokens are stored in secrets.
pub const TOKEN_SECRET_KEY: &str = "token";

/// Poll interval handed to listeners when the deployment does not set one.
pub const DEFAULT_POLL_INTERVAL: &str = "10s";

/// Errors surfaced by the reconcilers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Forgejo API error: {0}")]
    ForgejoError(#[from] crate::forgejo::ClientError),

    #[error("object is missing name, namespace, or uid")]
    MissingObjectKey,

    #[error("configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Operator-level configuration, read from the operator's own environment.
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Image used for injected listener containers. The listener binary ships
    /// in the operator image, so this defaults to the operator's own image.
    pub listener_image: String,
}

impl OperatorConfig {
    pub fn from_env() -> Self {
        Self {
            listener_image: std::env::var("LISTENER_IMAGE")
                .unwrap_or_else(|_| "ghcr.io/forgejo-act/operator:latest".to_string()),
        }
    }
}

/// Shared state handed to every reconciliation.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<OperatorConfig>,
}
