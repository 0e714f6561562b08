//! Deployment generation for the `deployment` install strategy
//!
//! The desired pod template is hashed and the hash recorded on the Deployment, so an
//! update is only issued when the template really changed. Top-level fields such as
//! `replicas` ride along with a template change but never trigger one.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition};
use kube::ResourceExt;
use kube::core::ObjectMeta;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;
use crate::crd::{ClusterServiceVersion, StrategyDeploymentSpec};
use crate::resources::common::{owner_reference, standard_labels};

/// Hash of the desired pod template, recorded on the Deployment
pub const SPEC_HASH_ANNOTATION: &str = "olm.deployment-spec-hash";

/// SHA-256 of the serving CA, stamped on the pod template so rotation rolls pods
pub const CA_HASH_ANNOTATION: &str = "olmcahash";

/// CSV annotations never copied onto pod templates
const SKIPPED_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Deployment plus the template hash it was generated with
#[derive(Clone, Debug)]
pub struct DesiredDeployment {
    pub deployment: Deployment,
    pub template_hash: String,
}

impl DesiredDeployment {
    pub fn name(&self) -> String {
        self.deployment.name_any()
    }
}

/// Pod template annotations: strategy template first, CSV annotations win on collision
pub fn merged_template_annotations(
    csv: &ClusterServiceVersion,
    strategy: &StrategyDeploymentSpec,
    ca_hash: Option<&str>,
) -> BTreeMap<String, String> {
    let mut annotations = strategy
        .spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();

    for (key, value) in csv.annotations() {
        if !SKIPPED_ANNOTATIONS.contains(&key.as_str()) {
            annotations.insert(key.clone(), value.clone());
        }
    }

    if let Some(hash) = ca_hash {
        annotations.insert(CA_HASH_ANNOTATION.to_string(), hash.to_string());
    }
    annotations
}

/// Generate the Deployment for one strategy entry
///
/// `ca_hash` is set when the Deployment serves owned API services.
pub fn generate_deployment(
    csv: &ClusterServiceVersion,
    strategy: &StrategyDeploymentSpec,
    ca_hash: Option<&str>,
) -> Result<DesiredDeployment> {
    let mut spec = strategy.spec.clone();
    let template_meta = spec.template.metadata.get_or_insert_with(ObjectMeta::default);
    template_meta.annotations = Some(merged_template_annotations(csv, strategy, ca_hash));

    let template_hash = hash_template(&spec.template)?;

    let mut labels = standard_labels(csv);
    labels.extend(strategy.label.clone());

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(strategy.name.clone()),
            namespace: csv.namespace(),
            labels: Some(labels),
            annotations: Some(BTreeMap::from([(
                SPEC_HASH_ANNOTATION.to_string(),
                template_hash.clone(),
            )])),
            owner_references: Some(vec![owner_reference(csv)]),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    };

    Ok(DesiredDeployment {
        deployment,
        template_hash,
    })
}

/// Hex SHA-256 over the JSON form of a pod template
pub fn hash_template<T: serde::Serialize>(template: &T) -> Result<String> {
    let bytes = serde_json::to_vec(template)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Template hash recorded on a live Deployment
pub fn recorded_hash(deployment: &Deployment) -> Option<&str> {
    deployment
        .metadata
        .annotations
        .as_ref()?
        .get(SPEC_HASH_ANNOTATION)
        .map(String::as_str)
}

/// CA hash on a live Deployment's pod template
pub fn live_ca_hash(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(CA_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Service account the Deployment's pods run as
pub fn service_account_name(strategy: &StrategyDeploymentSpec) -> String {
    strategy
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|s| s.service_account_name.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string())
}

/// Whether the Deployment runs under the namespace's built-in account
pub fn uses_default_service_account(strategy: &StrategyDeploymentSpec) -> bool {
    service_account_name(strategy) == DEFAULT_SERVICE_ACCOUNT
}

/// Pod selector labels, used for the API service Service
pub fn selector_labels(strategy: &StrategyDeploymentSpec) -> BTreeMap<String, String> {
    strategy
        .spec
        .selector
        .match_labels
        .clone()
        .unwrap_or_default()
}

fn condition<'a>(deployment: &'a Deployment, type_: &str) -> Option<&'a DeploymentCondition> {
    deployment
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

/// Rollout state of a Deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rollout {
    Complete,
    Waiting(String),
    /// Rolled out but below the Deployment's minimum availability
    Unavailable(String),
    Failed(String),
}

/// Judge a Deployment at the Deployment level.
///
/// Complete means the controller observed the latest generation, every desired replica
/// runs the latest template, no old replicas remain and the `Available` condition holds.
/// Availability follows the Deployment's own `maxUnavailable` budget, so losing a single
/// pod of a multi-replica Deployment keeps it complete.
pub fn rollout_status(deployment: &Deployment) -> Rollout {
    let name = deployment.name_any();
    let generation = deployment.metadata.generation.unwrap_or(0);
    let Some(status) = deployment.status.as_ref() else {
        return Rollout::Waiting(format!("deployment {} has no status yet", name));
    };

    if status.observed_generation.unwrap_or(0) < generation {
        return Rollout::Waiting(format!(
            "waiting for deployment {} spec update to be observed",
            name
        ));
    }

    if let Some(progressing) = condition(deployment, "Progressing")
        && progressing.reason.as_deref() == Some("ProgressDeadlineExceeded")
    {
        return Rollout::Failed(format!("deployment {} exceeded its progress deadline", name));
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let total = status.replicas.unwrap_or(0);

    if updated < desired {
        return Rollout::Waiting(format!(
            "waiting for deployment {} rollout: {} of {} updated replicas",
            name, updated, desired
        ));
    }
    if total > updated {
        return Rollout::Waiting(format!(
            "waiting for deployment {} rollout: {} old replicas pending termination",
            name,
            total - updated
        ));
    }

    match condition(deployment, "Available") {
        Some(c) if c.status == "True" => Rollout::Complete,
        _ => Rollout::Unavailable(format!(
            "deployment {} does not have minimum availability",
            name
        )),
    }
}
