//! Prints the IntegrationPlatform CRD manifest to stdout.

use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!(
        "{}",
        serde_yaml::to_string(&crds::IntegrationPlatform::crd())?
    );
    Ok(())
}
