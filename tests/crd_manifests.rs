//! Assertions on the generated CRD manifests.
//!
//! These verify the API surface other tooling depends on (group, kinds,
//! plural names, status subresource) without needing a cluster.

use act_operator::crds::{ActDeployment, ActRunner};
use kube::CustomResourceExt;

#[test]
fn test_act_deployment_crd_identity() {
    let crd = ActDeployment::crd();
    assert_eq!(crd.metadata.name.as_deref(), Some("actdeployments.forgejo.actions.io"));
    assert_eq!(crd.spec.group, "forgejo.actions.io");
    assert_eq!(crd.spec.names.kind, "ActDeployment");
    assert_eq!(crd.spec.names.plural, "actdeployments");
    assert_eq!(crd.spec.scope, "Namespaced");
}

#[test]
fn test_act_runner_crd_identity() {
    let crd = ActRunner::crd();
    assert_eq!(crd.metadata.name.as_deref(), Some("actrunners.forgejo.actions.io"));
    assert_eq!(crd.spec.group, "forgejo.actions.io");
    assert_eq!(crd.spec.names.kind, "ActRunner");
    assert_eq!(crd.spec.names.plural, "actrunners");
    assert_eq!(crd.spec.scope, "Namespaced");
}

#[test]
fn test_both_crds_serve_v1alpha1_with_status_subresource() {
    for crd in [ActDeployment::crd(), ActRunner::crd()] {
        let versions = &crd.spec.versions;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].name, "v1alpha1");
        assert!(versions[0].served);
        assert!(versions[0].storage);
        assert!(
            versions[0]
                .subresources
                .as_ref()
                .and_then(|subresources| subresources.status.as_ref())
                .is_some(),
            "status subresource must be enabled"
        );
    }
}

#[test]
fn test_act_runner_schema_requires_job_id() {
    let crd = ActRunner::crd();
    let schema = crd.spec.versions[0]
        .schema
        .as_ref()
        .and_then(|validation| validation.open_api_v3_schema.as_ref())
        .expect("ActRunner CRD must carry a schema");

    let spec_schema = schema
        .properties
        .as_ref()
        .and_then(|properties| properties.get("spec"))
        .expect("schema must describe .spec");
    let required = spec_schema.required.clone().unwrap_or_default();
    assert!(required.contains(&"forgejoJobID".to_string()));
    assert!(required.contains(&"forgejoServer".to_string()));
    assert!(required.contains(&"jobData".to_string()));
}
