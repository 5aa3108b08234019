//! Execution pod construction and idempotent creation for `ActRunner`s.

use super::naming;
use crate::controllers::types::{
    Error, Result, ACT_RUNNER_LABEL, DEFAULT_DIND_IMAGE, DEFAULT_RUNNER_IMAGE, DOCKER_HOST,
    DOCKER_SOCKET_DIR, DOCKER_SOCKET_VOLUME, JOB_ID_LABEL, TOKEN_SECRET_KEY,
};
use crate::crds::{ActRunner, ActRunnerPhase, ActRunnerSpec};
use chrono::Utc;
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, KeyToPath, Pod,
    SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::info;

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn dind_container(spec: &ActRunnerSpec) -> Container {
    let image = if spec.docker_in_docker_image.is_empty() {
        DEFAULT_DIND_IMAGE
    } else {
        &spec.docker_in_docker_image
    };

    // dockerd publishes its socket on the shared emptyDir; vfs avoids
    // depending on the node's storage driver inside the sandbox.
    Container {
        name: "dind".to_string(),
        image: Some(image.to_string()),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![env_var("DOCKER_TLS_CERTDIR", "")]),
        args: Some(vec![
            "dockerd".to_string(),
            format!("--host={DOCKER_HOST}"),
            "--storage-driver=vfs".to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Synthesize the execution pod for a runner from its captured job template.
///
/// Deterministic: the same `ActRunner` always yields the same pod, so the
/// create path can rely on name collisions for idempotence.
pub fn build_runner_pod(runner: &ActRunner) -> Result<Pod> {
    let namespace = runner.namespace().ok_or(Error::MissingObjectKey)?;
    let owner_ref = runner
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey)?;
    let pod_name = naming::pod_name(runner);

    let template = runner.spec.job_template.clone();

    let mut labels: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|meta| meta.labels.clone())
        .unwrap_or_default();
    labels.insert(
        JOB_ID_LABEL.to_string(),
        runner.spec.forgejo_job_id.to_string(),
    );
    labels.insert(ACT_RUNNER_LABEL.to_string(), runner.name_any());

    let mut pod_spec = template.spec.unwrap_or_default();

    // The template may carry only pod-level fields (dnsPolicy, hostAliases,
    // ...); a runner container is injected when it declares none.
    if pod_spec.containers.is_empty() {
        let image = if runner.spec.runner_image.is_empty() {
            DEFAULT_RUNNER_IMAGE.to_string()
        } else {
            runner.spec.runner_image.clone()
        };
        pod_spec.containers = vec![Container {
            name: "runner".to_string(),
            image: Some(image),
            ..Default::default()
        }];
    }

    {
        let runner_container = &mut pod_spec.containers[0];
        runner_container.name = "runner".to_string();
        if !runner.spec.runner_image.is_empty() {
            runner_container.image = Some(runner.spec.runner_image.clone());
        }

        // DOCKER_HOST must point at the sidecar socket; any template-declared
        // value is dropped before ours is appended.
        let mut env: Vec<EnvVar> = runner_container
            .env
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|var| var.name != "DOCKER_HOST")
            .collect();

        env.push(EnvVar {
            name: "TOKEN".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: runner.spec.registration_token_secret_ref.name.clone(),
                    key: TOKEN_SECRET_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        env.push(env_var("FORGEJO_SERVER", &runner.spec.forgejo_server));
        env.push(env_var("FORGEJO_ORG", &runner.spec.organization));
        env.push(env_var(
            "FORGEJO_LABELS",
            &runner.spec.job_data.runs_on.join(","),
        ));

        if let Some(status) = &runner.status {
            if let Some(repository) = &status.repository_full_name {
                env.push(env_var("FORGEJO_REPOSITORY", repository));
            }
            if let Some(user) = &status.trigger_user {
                env.push(env_var("FORGEJO_TRIGGER_USER", user));
            }
            if let Some(reference) = &status.pretty_ref {
                env.push(env_var("FORGEJO_REF", reference));
            }
            if let Some(event) = &status.trigger_event {
                env.push(env_var("FORGEJO_TRIGGER_EVENT", event));
            }
        }

        env.push(env_var("DOCKER_HOST", DOCKER_HOST));
        runner_container.env = Some(env);

        // The socket mount is authoritative: a template-declared mount of the
        // same name is dropped first.
        let mut mounts: Vec<VolumeMount> = runner_container
            .volume_mounts
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|mount| mount.name != DOCKER_SOCKET_VOLUME)
            .collect();
        mounts.push(VolumeMount {
            name: DOCKER_SOCKET_VOLUME.to_string(),
            mount_path: DOCKER_SOCKET_DIR.to_string(),
            ..Default::default()
        });

        if runner.spec.docker_config_map_ref.is_some() {
            mounts.push(VolumeMount {
                name: "docker-config".to_string(),
                mount_path: "/root/.docker".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }
        runner_container.volume_mounts = Some(mounts);
    }

    let mut volumes: Vec<Volume> = pod_spec.volumes.take().unwrap_or_default();
    volumes.push(Volume {
        name: DOCKER_SOCKET_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    if let Some(config_map) = &runner.spec.docker_config_map_ref {
        volumes.push(Volume {
            name: "docker-config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.name.clone(),
                items: Some(vec![KeyToPath {
                    key: "config.json".to_string(),
                    path: "config.json".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    pod_spec.volumes = Some(volumes);

    pod_spec.containers.push(dind_container(&runner.spec));

    // One-shot execution: the pod must never restart a finished job.
    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace),
            labels: Some(labels),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(pod_spec),
        ..Default::default()
    })
}

/// Pod creation and status alignment for one runner.
pub struct RunnerResources<'a> {
    pub pods: &'a Api<Pod>,
    pub runners: &'a Api<ActRunner>,
}

impl RunnerResources<'_> {
    /// Create the execution pod, or align status to a pod that already exists.
    pub async fn reconcile_pod(&self, runner: &ActRunner) -> Result<()> {
        let pod = build_runner_pod(runner)?;
        let pod_name = pod.name_any();

        match self.pods.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(
                    "created execution pod {} for ActRunner {}",
                    pod_name,
                    runner.name_any()
                );
                self.record_pod(runner, &pod_name, ActRunnerPhase::Running)
                    .await
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                let existing = self.pods.get(&pod_name).await?;
                let phase = ActRunnerPhase::from_pod(Some(&existing));
                self.record_pod(runner, &pod_name, phase).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record the pod name and derived phase on the runner status, stamping
    /// `startedAt`/`completedAt` only on their first transition.
    async fn record_pod(
        &self,
        runner: &ActRunner,
        pod_name: &str,
        phase: ActRunnerPhase,
    ) -> Result<()> {
        let current = runner.status.clone().unwrap_or_default();
        let mut patch = json!({
            "status": {
                "kubernetesJobName": pod_name,
                "phase": phase,
            }
        });

        let now = Utc::now().to_rfc3339();
        if phase == ActRunnerPhase::Running && current.started_at.is_none() {
            patch["status"]["startedAt"] = json!(now);
        }
        if phase.is_terminal() && current.completed_at.is_none() {
            patch["status"]["completedAt"] = json!(now);
        }

        self.runners
            .patch_status(
                &runner.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}
