use crate::crds::ActRunner;
use kube::ResourceExt;

const MAX_K8S_NAME_LENGTH: usize = 63;

/// Execution pod name for a runner: `runner-<jobID>-<runnerName>`, capped to
/// the Kubernetes name length limit.
pub fn pod_name(runner: &ActRunner) -> String {
    let name = format!(
        "runner-{}-{}",
        runner.spec.forgejo_job_id,
        runner.name_any()
    );
    truncate_name(name)
}

fn truncate_name(name: String) -> String {
    if name.len() <= MAX_K8S_NAME_LENGTH {
        name
    } else {
        name.chars().take(MAX_K8S_NAME_LENGTH).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{ActRunnerSpec, JobData, SecretRef};
    use k8s_openapi::api::core::v1::PodTemplateSpec;

    fn runner_named(name: &str, job_id: i64) -> ActRunner {
        ActRunner::new(
            name,
            ActRunnerSpec {
                forgejo_job_id: job_id,
                forgejo_server: "https://git.example.com".to_string(),
                organization: "builders".to_string(),
                token_secret_ref: SecretRef::default(),
                registration_token_secret_ref: SecretRef::default(),
                runner_image: String::new(),
                docker_in_docker_image: String::new(),
                docker_config_map_ref: None,
                job_data: JobData::default(),
                job_template: PodTemplateSpec::default(),
            },
        )
    }

    #[test]
    fn test_pod_name_combines_job_id_and_runner() {
        let runner = runner_named("actrunner-42-0042", 42);
        assert_eq!(pod_name(&runner), "runner-42-actrunner-42-0042");
    }

    #[test]
    fn test_pod_name_is_capped_at_63_chars() {
        let long_name = "a".repeat(80);
        let runner = runner_named(&long_name, 1234567890);
        let name = pod_name(&runner);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("runner-1234567890-aaaa"));
    }
}
