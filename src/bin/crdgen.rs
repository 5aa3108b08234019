//! Prints the ActDeployment and ActRunner CRD manifests as YAML.

use act_operator::crds::{ActDeployment, ActRunner};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&ActDeployment::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ActRunner::crd())?);
    Ok(())
}
