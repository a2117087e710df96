//! Prints the Component custom resource definition as YAML, for applying
//! to the cluster or committing to deployment manifests.

use component_controller::crd::Component;
use kube::core::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Component::crd())?);
    Ok(())
}
