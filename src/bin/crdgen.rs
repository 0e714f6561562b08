//! Print the CustomResourceDefinitions served by the operator as a multi-document YAML

use kube::CustomResourceExt;
use olm_operator::{ClusterServiceVersion, OLMConfig};

fn main() -> Result<(), serde_yaml::Error> {
    let csv = serde_yaml::to_string(&ClusterServiceVersion::crd())?;
    let olm_config = serde_yaml::to_string(&OLMConfig::crd())?;
    print!("{}---\n{}", csv, olm_config);
    Ok(())
}
