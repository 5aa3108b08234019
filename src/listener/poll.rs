//! One poll tick: propagate deployment spec changes to existing runners, then
//! admit newly observed Forgejo jobs as ActRunners.

use super::config::ListenerConfig;
use crate::controllers::types::{
    Error, Result, DEFAULT_RUNNER_IMAGE, JOB_ID_LABEL, REGISTRATION_TOKEN_LABEL, TOKEN_SECRET_KEY,
};
use crate::crds::{
    ActDeployment, ActRunner, ActRunnerPhase, ActRunnerSpec, JobData, SecretRef,
};
use crate::forgejo;
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use rand::Rng;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, error, info};

const MAX_K8S_NAME_LENGTH: usize = 63;

/// ActRunner name for a job: deterministic, so a create race between ticks
/// collapses into an already-exists error.
pub(crate) fn act_runner_name(job_id: i64) -> String {
    format!("actrunner-{}-{:04}", job_id, (job_id % 10_000).abs())
}

/// Registration secret name: `actrunner-reg-<jobID>-<suffix>`, capped to the
/// Kubernetes name length limit.
pub(crate) fn registration_secret_name(job_id: i64, suffix: &str) -> String {
    let name = format!("actrunner-reg-{job_id}-{suffix}");
    if name.len() <= MAX_K8S_NAME_LENGTH {
        name
    } else {
        name.chars().take(MAX_K8S_NAME_LENGTH).collect()
    }
}

/// Fresh 4-byte hex suffix. Keeps secret names from colliding when a job ID
/// is re-observed while an old secret still awaits garbage collection.
fn random_suffix() -> String {
    let bytes: [u8; 4] = rand::thread_rng().gen();
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Split a repository `full_name` ("owner/repo") into owner and repo name,
/// falling back to the organization and the repository's short name.
pub(crate) fn split_full_name(
    full_name: &str,
    organization: &str,
    repo_name: &str,
) -> (String, String) {
    match full_name.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            (owner.to_string(), name.to_string())
        }
        _ => (organization.to_string(), repo_name.to_string()),
    }
}

/// The job template a runner admitted right now would carry: the deployment's
/// `runnerTemplate` with a default container injected when it declares none.
pub(crate) fn runner_job_template(act_deployment: &ActDeployment) -> PodTemplateSpec {
    let mut template = act_deployment.spec.runner_template.clone();
    let pod_spec = template.spec.get_or_insert_with(Default::default);
    if pod_spec.containers.is_empty() {
        pod_spec.containers = vec![Container {
            name: "runner".to_string(),
            image: Some(DEFAULT_RUNNER_IMAGE.to_string()),
            ..Default::default()
        }];
    }
    template
}

/// Whether the deployment's propagated fields differ from the runner's.
pub(crate) fn spec_drift(act_deployment: &ActDeployment, runner: &ActRunner) -> bool {
    runner.spec.runner_image != act_deployment.spec.runner_image
        || runner.spec.docker_in_docker_image != act_deployment.spec.docker_in_docker_image
        || runner.spec.docker_config_map_ref != act_deployment.spec.docker_config_map_ref
}

/// A runner with no execution pod yet. Only these may receive spec updates;
/// anything later already embeds its configuration in a live pod.
pub(crate) fn is_pending(runner: &ActRunner) -> bool {
    runner.phase() == ActRunnerPhase::Pending
        || runner
            .status
            .as_ref()
            .is_none_or(|status| status.kubernetes_job_name.is_none())
}

fn job_data_from(job: &forgejo::Job) -> JobData {
    JobData {
        id: job.id,
        repo_id: job.repo_id,
        owner_id: job.owner_id,
        name: job.name.clone(),
        needs: job.needs.clone(),
        runs_on: job.runs_on.clone(),
        task_id: job.task_id,
        status: job.status.clone(),
    }
}

/// The ActRunner to create for an admitted job.
pub(crate) fn desired_runner(
    act_deployment: &ActDeployment,
    job: &forgejo::Job,
    registration_secret: &str,
) -> Result<ActRunner> {
    let namespace = act_deployment.namespace().ok_or(Error::MissingObjectKey)?;
    let owner_ref = act_deployment
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey)?;

    let mut runner = ActRunner::new(
        &act_runner_name(job.id),
        ActRunnerSpec {
            forgejo_job_id: job.id,
            forgejo_server: act_deployment.spec.forgejo_server.clone(),
            organization: act_deployment.spec.organization.clone(),
            token_secret_ref: act_deployment.spec.token_secret_ref.clone(),
            registration_token_secret_ref: SecretRef {
                name: registration_secret.to_string(),
                namespace: Some(namespace.clone()),
            },
            runner_image: act_deployment.spec.runner_image.clone(),
            docker_in_docker_image: act_deployment.spec.docker_in_docker_image.clone(),
            docker_config_map_ref: act_deployment.spec.docker_config_map_ref.clone(),
            job_data: job_data_from(job),
            job_template: runner_job_template(act_deployment),
        },
    );
    runner.metadata.namespace = Some(namespace);
    runner.metadata.labels = Some(BTreeMap::from([(
        JOB_ID_LABEL.to_string(),
        job.id.to_string(),
    )]));
    runner.metadata.owner_references = Some(vec![owner_ref]);
    Ok(runner)
}

pub(crate) fn build_registration_secret(
    name: &str,
    namespace: &str,
    job_id: i64,
    token: &str,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([
                (JOB_ID_LABEL.to_string(), job_id.to_string()),
                (REGISTRATION_TOKEN_LABEL.to_string(), "true".to_string()),
            ])),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([(
            TOKEN_SECRET_KEY.to_string(),
            token.to_string(),
        )])),
        ..Default::default()
    }
}

/// Push deployment spec changes down to owned Pending runners.
///
/// Runners with a pod are left alone: restarting an in-flight CI job to pick
/// up new configuration would be surprising, so they finish as admitted.
pub async fn propagate_deployment_spec(
    runners: &Api<ActRunner>,
    act_deployment: &ActDeployment,
) -> Result<()> {
    let list = runners.list(&ListParams::default()).await?;
    let desired_template = runner_job_template(act_deployment);

    let mut updated_count = 0;
    for runner in list
        .items
        .into_iter()
        .filter(|runner| runner.is_owned_by(act_deployment))
    {
        let pending = is_pending(&runner);
        let template_drift = pending && runner.spec.job_template != desired_template;
        if !spec_drift(act_deployment, &runner) && !template_drift {
            continue;
        }
        if !pending {
            debug!(
                "skipping ActRunner {} update (pod already exists)",
                runner.name_any()
            );
            continue;
        }

        let name = runner.name_any();
        let mut updated = runner;
        updated.spec.runner_image = act_deployment.spec.runner_image.clone();
        updated.spec.docker_in_docker_image = act_deployment.spec.docker_in_docker_image.clone();
        updated.spec.docker_config_map_ref = act_deployment.spec.docker_config_map_ref.clone();
        updated.spec.job_template = desired_template.clone();

        info!("updating ActRunner {} from deployment spec", name);
        match runners.replace(&name, &PostParams::default(), &updated).await {
            Ok(_) => updated_count += 1,
            Err(err) => {
                error!("failed to update ActRunner {}: {}", name, err);
                continue;
            }
        }
    }

    if updated_count > 0 {
        info!("updated {} ActRunner resource(s)", updated_count);
    }
    Ok(())
}

/// Fetch waiting jobs and admit each one that has no runner yet, respecting
/// the deployment's concurrency cap.
pub async fn admit_pending_jobs(
    runners: &Api<ActRunner>,
    secrets: &Api<Secret>,
    forgejo_client: &forgejo::Client,
    act_deployment: &ActDeployment,
    config: &ListenerConfig,
) -> Result<()> {
    let jobs = forgejo_client
        .pending_jobs(&config.organization, &config.labels)
        .await?;
    debug!("polled Forgejo: {} waiting job(s)", jobs.len());

    let owned: Vec<ActRunner> = runners
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .filter(|runner| runner.is_owned_by(act_deployment))
        .collect();

    let max_runners = act_deployment.effective_max_runners();
    let mut active = owned
        .iter()
        .filter(|runner| !runner.phase().is_terminal())
        .count() as i32;

    for job in jobs {
        if let Some(existing) = owned
            .iter()
            .find(|runner| runner.spec.forgejo_job_id == job.id)
        {
            debug!(
                "ActRunner {} already exists for job {}",
                existing.name_any(),
                job.id
            );
            continue;
        }

        if let Some(max) = max_runners {
            if active >= max {
                debug!(
                    "maximum runner count reached ({}/{}), skipping remaining jobs",
                    active, max
                );
                break;
            }
        }

        info!(
            "detected pending job requiring runner: id={} name={:?} repo_id={}",
            job.id, job.name, job.repo_id
        );

        // Repository and run enrichment is best-effort; the runner still
        // works with blank metadata.
        let repository = match forgejo_client
            .repository(&config.organization, job.repo_id)
            .await
        {
            Ok(repository) => Some(repository),
            Err(err) => {
                error!("failed to get repository for job {}: {}", job.id, err);
                None
            }
        };
        let run = match &repository {
            Some(repository) => {
                let (owner, repo_name) = split_full_name(
                    &repository.full_name,
                    &config.organization,
                    &repository.name,
                );
                match forgejo_client.run(&owner, &repo_name, job.id).await {
                    Ok(run) => Some(run),
                    Err(err) => {
                        error!("failed to get run details for job {}: {}", job.id, err);
                        None
                    }
                }
            }
            None => None,
        };

        let token = match forgejo_client.registration_token(&config.organization).await {
            Ok(token) => token,
            Err(err) => {
                error!("failed to get registration token for job {}: {}", job.id, err);
                continue;
            }
        };

        let secret_name = registration_secret_name(job.id, &random_suffix());
        if let Err(err) =
            ensure_registration_secret(secrets, &secret_name, &config.namespace, job.id, &token)
                .await
        {
            error!(
                "failed to provision registration secret for job {}: {}",
                job.id, err
            );
            continue;
        }

        let runner = match desired_runner(act_deployment, &job, &secret_name) {
            Ok(runner) => runner,
            Err(err) => {
                error!("failed to build ActRunner for job {}: {}", job.id, err);
                continue;
            }
        };
        let runner_name = runner.name_any();

        match runners.create(&PostParams::default(), &runner).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!("ActRunner {} already exists", runner_name);
                continue;
            }
            Err(err) => {
                error!("failed to create ActRunner for job {}: {}", job.id, err);
                continue;
            }
        }

        // Initial phase plus whatever metadata the enrichment produced.
        let mut status = json!({ "phase": ActRunnerPhase::Pending });
        if let Some(repository) = &repository {
            status["repositoryFullName"] = json!(repository.full_name);
        }
        if let Some(run) = &run {
            status["triggerUser"] = json!(run.trigger_user.login);
            status["prettyRef"] = json!(run.pretty_ref);
            status["triggerEvent"] = json!(run.trigger_event);
        }
        if let Err(err) = runners
            .patch_status(
                &runner_name,
                &PatchParams::default(),
                &Patch::Merge(&json!({ "status": status })),
            )
            .await
        {
            error!("failed to update ActRunner {} status: {}", runner_name, err);
        }

        active += 1;
        info!(
            "created ActRunner {} for job {} (active {}, max {:?})",
            runner_name, job.id, active, max_runners
        );
    }

    Ok(())
}

async fn ensure_registration_secret(
    secrets: &Api<Secret>,
    name: &str,
    namespace: &str,
    job_id: i64,
    token: &str,
) -> Result<()> {
    let secret = build_registration_secret(name, namespace, job_id, token);
    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => {
            info!("created registration token secret {}", name);
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            // Name collision: refresh the token in place, the newest wins.
            let mut existing = secrets.get(name).await?;
            existing.string_data = secret.string_data;
            secrets.replace(name, &PostParams::default(), &existing).await?;
            info!("updated existing registration token secret {}", name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ActDeploymentSpec, ActRunnerStatus, ConfigMapRef};
    use k8s_openapi::api::core::v1::PodSpec;

    fn deployment_fixture() -> ActDeployment {
        let mut act_deployment = ActDeployment::new(
            "fleet",
            ActDeploymentSpec {
                forgejo_server: "https://git.example.com".to_string(),
                organization: "builders".to_string(),
                labels: "docker".to_string(),
                token_secret_ref: SecretRef {
                    name: "forgejo-token".to_string(),
                    namespace: None,
                },
                poll_interval: None,
                min_runners: None,
                max_runners: Some(2),
                listener_template: PodTemplateSpec::default(),
                runner_template: PodTemplateSpec::default(),
                runner_image: "forgejo/runner:9.0.0".to_string(),
                docker_in_docker_image: String::new(),
                docker_config_map_ref: None,
            },
        );
        act_deployment.metadata.namespace = Some("ci".to_string());
        act_deployment.metadata.uid = Some("uid-fleet".to_string());
        act_deployment
    }

    fn job_fixture(id: i64) -> forgejo::Job {
        forgejo::Job {
            id,
            repo_id: 7,
            owner_id: 3,
            name: "build".to_string(),
            needs: Vec::new(),
            runs_on: vec!["docker".to_string()],
            task_id: 99,
            status: "waiting".to_string(),
        }
    }

    #[test]
    fn test_act_runner_name_is_deterministic() {
        assert_eq!(act_runner_name(42), "actrunner-42-0042");
        assert_eq!(act_runner_name(123456), "actrunner-123456-3456");
        assert_eq!(act_runner_name(5), "actrunner-5-0005");
    }

    #[test]
    fn test_registration_secret_name_shape_and_cap() {
        let name = registration_secret_name(42, "deadbeef");
        assert_eq!(name, "actrunner-reg-42-deadbeef");

        let long = registration_secret_name(i64::MAX, &"f".repeat(64));
        assert_eq!(long.len(), 63);
        assert!(long.starts_with("actrunner-reg-"));
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(
            split_full_name("builders/widgets", "builders", "widgets"),
            ("builders".to_string(), "widgets".to_string())
        );
        assert_eq!(
            split_full_name("", "builders", "widgets"),
            ("builders".to_string(), "widgets".to_string())
        );
        assert_eq!(
            split_full_name("odd/extra/parts", "builders", "widgets"),
            ("builders".to_string(), "widgets".to_string())
        );
    }

    #[test]
    fn test_runner_job_template_injects_default_container() {
        let template = runner_job_template(&deployment_fixture());
        let containers = &template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "runner");
        assert_eq!(containers[0].image.as_deref(), Some(DEFAULT_RUNNER_IMAGE));
    }

    #[test]
    fn test_runner_job_template_keeps_declared_containers() {
        let mut act_deployment = deployment_fixture();
        act_deployment.spec.runner_template = PodTemplateSpec {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "custom".to_string(),
                    image: Some("custom:1".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let template = runner_job_template(&act_deployment);
        let containers = &template.spec.as_ref().unwrap().containers;
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "custom");
    }

    #[test]
    fn test_spec_drift_detection() {
        let act_deployment = deployment_fixture();
        let runner = desired_runner(&act_deployment, &job_fixture(42), "reg-secret").unwrap();
        assert!(!spec_drift(&act_deployment, &runner));

        let mut edited = act_deployment.clone();
        edited.spec.runner_image = "forgejo/runner:9.1.0".to_string();
        assert!(spec_drift(&edited, &runner));

        let mut edited = act_deployment.clone();
        edited.spec.docker_config_map_ref = Some(ConfigMapRef {
            name: "registry-auth".to_string(),
        });
        assert!(spec_drift(&edited, &runner));
    }

    #[test]
    fn test_is_pending_considers_phase_and_pod() {
        let act_deployment = deployment_fixture();
        let mut runner = desired_runner(&act_deployment, &job_fixture(42), "reg-secret").unwrap();
        assert!(is_pending(&runner));

        runner.status = Some(ActRunnerStatus {
            phase: ActRunnerPhase::Running,
            kubernetes_job_name: Some("runner-42-actrunner-42-0042".to_string()),
            ..Default::default()
        });
        assert!(!is_pending(&runner));

        // Running but with no pod recorded counts as pending (about to reset).
        runner.status = Some(ActRunnerStatus {
            phase: ActRunnerPhase::Running,
            kubernetes_job_name: None,
            ..Default::default()
        });
        assert!(is_pending(&runner));
    }

    #[test]
    fn test_desired_runner_snapshot() {
        let act_deployment = deployment_fixture();
        let job = job_fixture(42);
        let runner = desired_runner(&act_deployment, &job, "actrunner-reg-42-deadbeef").unwrap();

        assert_eq!(runner.name_any(), "actrunner-42-0042");
        assert_eq!(runner.metadata.namespace.as_deref(), Some("ci"));
        assert_eq!(runner.spec.forgejo_job_id, 42);
        assert_eq!(runner.spec.forgejo_server, "https://git.example.com");
        assert_eq!(runner.spec.organization, "builders");
        assert_eq!(runner.spec.runner_image, "forgejo/runner:9.0.0");
        assert_eq!(runner.spec.token_secret_ref.name, "forgejo-token");
        assert_eq!(
            runner.spec.registration_token_secret_ref.name,
            "actrunner-reg-42-deadbeef"
        );
        assert_eq!(
            runner.spec.registration_token_secret_ref.namespace.as_deref(),
            Some("ci")
        );
        assert_eq!(runner.spec.job_data.id, 42);
        assert_eq!(runner.spec.job_data.status, "waiting");
        assert!(!runner.spec.job_template.spec.as_ref().unwrap().containers.is_empty());

        let labels = runner.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(JOB_ID_LABEL).map(String::as_str), Some("42"));

        let owners = runner.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "ActDeployment");
        assert_eq!(owners[0].uid, "uid-fleet");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_registration_secret_contents() {
        let secret = build_registration_secret("actrunner-reg-42-deadbeef", "ci", 42, "tok-1");
        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(JOB_ID_LABEL).map(String::as_str), Some("42"));
        assert_eq!(
            labels.get(REGISTRATION_TOKEN_LABEL).map(String::as_str),
            Some("true")
        );
        assert_eq!(
            secret
                .string_data
                .as_ref()
                .unwrap()
                .get(TOKEN_SECRET_KEY)
                .map(String::as_str),
            Some("tok-1")
        );
    }

    #[test]
    fn test_random_suffix_is_eight_hex_chars() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
