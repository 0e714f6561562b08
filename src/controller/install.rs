//! Install executor for the `deployment` strategy
//!
//! Applies the ServiceAccounts, RBAC and Deployments a ClusterServiceVersion declares,
//! and judges whether what runs in the cluster still matches the strategy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::controller::Context;
use crate::controller::apply::{apply_resource, create_if_absent};
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::ComponentHealth;
use crate::crd::{ClusterServiceVersion, INSTALL_STRATEGY_DEPLOYMENT};
use crate::resources::common::{OwnerKey, adopt, owner_of};
use crate::resources::deployment::{
    DesiredDeployment, Rollout, generate_deployment, live_ca_hash, recorded_hash,
    rollout_status, service_account_name, uses_default_service_account,
};
use crate::resources::rbac;

/// Reject strategies the executor cannot install
pub fn validate_strategy(csv: &ClusterServiceVersion) -> Result<()> {
    let strategy = &csv.spec.install_strategy;
    if strategy.strategy != INSTALL_STRATEGY_DEPLOYMENT {
        return Err(Error::InvalidStrategy(format!(
            "unsupported install strategy {:?}",
            strategy.strategy
        )));
    }

    let mut seen = BTreeSet::new();
    for dep in &strategy.spec.deployments {
        if dep.name.is_empty() {
            return Err(Error::InvalidStrategy(
                "deployment without a name".to_string(),
            ));
        }
        if !seen.insert(dep.name.as_str()) {
            return Err(Error::InvalidStrategy(format!(
                "deployment {} declared twice",
                dep.name
            )));
        }
    }
    Ok(())
}

/// Service accounts Deployments run as that no permission entry declares
pub fn undeclared_service_accounts(csv: &ClusterServiceVersion) -> Vec<String> {
    let strategy = &csv.spec.install_strategy.spec;
    let declared: BTreeSet<&str> = strategy
        .permissions
        .iter()
        .chain(&strategy.cluster_permissions)
        .map(|p| p.service_account_name.as_str())
        .collect();

    let mut accounts: Vec<String> = strategy
        .deployments
        .iter()
        .filter(|d| !uses_default_service_account(d))
        .map(service_account_name)
        .filter(|sa| !declared.contains(sa.as_str()))
        .collect();
    accounts.sort();
    accounts.dedup();
    accounts
}

/// Who holds an existing object this CSV also declares
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ownership {
    Absent,
    Mine,
    /// Carries no owner labels
    Unowned,
    /// Held by a predecessor of this CSV
    Adoptable(OwnerKey),
    /// Held by a CSV outside the replacement chain
    Foreign(OwnerKey),
}

/// Classify the owner of `existing`.
///
/// `adoptable` holds the names of the CSVs in the same namespace whose objects this
/// CSV may take over: its predecessors.
pub fn ownership(
    existing: Option<&ObjectMeta>,
    csv: &ClusterServiceVersion,
    adoptable: &BTreeSet<String>,
) -> Ownership {
    let Some(meta) = existing else {
        return Ownership::Absent;
    };
    let me = OwnerKey::of(csv);
    match owner_of(meta) {
        Some(owner) if owner == me => Ownership::Mine,
        Some(owner) if owner.namespace == me.namespace && adoptable.contains(&owner.name) => {
            Ownership::Adoptable(owner)
        }
        Some(owner) => Ownership::Foreign(owner),
        None => Ownership::Unowned,
    }
}

/// What to do with one Deployment
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeploymentAction {
    Create,
    /// Template changed, or the object has no owner
    Update,
    /// Owned by a predecessor; ownership is rewritten before the update
    Adopt(OwnerKey),
    Unchanged,
    /// Owned by a CSV outside the replacement chain
    Foreign(OwnerKey),
}

/// Decide how to converge an existing Deployment onto `desired`
pub fn plan_deployment(
    existing: Option<&Deployment>,
    desired: &DesiredDeployment,
    csv: &ClusterServiceVersion,
    adoptable: &BTreeSet<String>,
) -> DeploymentAction {
    match ownership(existing.map(|d| &d.metadata), csv, adoptable) {
        Ownership::Absent => DeploymentAction::Create,
        Ownership::Mine => match existing.and_then(recorded_hash) {
            Some(hash) if hash == desired.template_hash => DeploymentAction::Unchanged,
            _ => DeploymentAction::Update,
        },
        Ownership::Adoptable(owner) => DeploymentAction::Adopt(owner),
        Ownership::Foreign(owner) => DeploymentAction::Foreign(owner),
        Ownership::Unowned => DeploymentAction::Update,
    }
}

/// Health of one Deployment against what the strategy wants
pub fn deployment_health(
    existing: Option<&Deployment>,
    desired: &DesiredDeployment,
    expected_ca: Option<&str>,
) -> ComponentHealth {
    let name = desired.name();
    let Some(existing) = existing else {
        return ComponentHealth::Missing(format!("deployment {} not found", name));
    };

    if recorded_hash(existing) != Some(desired.template_hash.as_str()) {
        return ComponentHealth::Stale(format!(
            "deployment {} does not match the install strategy",
            name
        ));
    }
    if let Some(expected) = expected_ca
        && live_ca_hash(existing) != Some(expected)
    {
        return ComponentHealth::Stale(format!(
            "deployment {} does not carry the current serving CA",
            name
        ));
    }

    match rollout_status(existing) {
        Rollout::Complete => ComponentHealth::Ready,
        Rollout::Waiting(m) => ComponentHealth::RollingOut(m),
        Rollout::Unavailable(m) => ComponentHealth::Unavailable(m),
        Rollout::Failed(m) => ComponentHealth::Failed(m),
    }
}

fn severity(health: &ComponentHealth) -> u8 {
    match health {
        ComponentHealth::Ready => 0,
        ComponentHealth::Unknown => 1,
        ComponentHealth::RollingOut(_) => 2,
        ComponentHealth::Unavailable(_) => 3,
        ComponentHealth::Stale(_) => 4,
        ComponentHealth::Missing(_) => 5,
        ComponentHealth::Failed(_) => 6,
    }
}

/// The worst of several component verdicts; nothing to check is `Ready`
pub fn combine_health(healths: impl IntoIterator<Item = ComponentHealth>) -> ComponentHealth {
    healths
        .into_iter()
        .max_by_key(severity)
        .unwrap_or(ComponentHealth::Ready)
}

/// Applies and checks the install strategy of one ClusterServiceVersion
pub struct InstallExecutor<'a> {
    csv: &'a ClusterServiceVersion,
    client: Client,
    namespace: String,
    adoptable: BTreeSet<String>,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(csv: &'a ClusterServiceVersion, ctx: &Context, predecessors: Vec<String>) -> Self {
        Self {
            csv,
            client: ctx.client.clone(),
            namespace: csv.namespace().unwrap_or_default(),
            adoptable: predecessors.into_iter().collect(),
        }
    }

    fn desired_deployments(
        &self,
        ca_hashes: &BTreeMap<String, String>,
    ) -> Result<Vec<DesiredDeployment>> {
        self.csv
            .spec
            .install_strategy
            .spec
            .deployments
            .iter()
            .map(|d| generate_deployment(self.csv, d, ca_hashes.get(&d.name).map(String::as_str)))
            .collect()
    }

    /// Apply the strategy. `ca_hashes` maps Deployment name to the serving CA hash.
    pub async fn apply(&self, ca_hashes: &BTreeMap<String, String>) -> Result<()> {
        validate_strategy(self.csv)?;
        self.ensure_service_accounts().await?;
        self.ensure_permissions().await?;
        self.ensure_deployments(ca_hashes).await
    }

    /// ServiceAccounts left behind by a predecessor are taken over, or garbage
    /// collection of the predecessor would remove them from under the Deployments.
    async fn ensure_service_accounts(&self) -> Result<()> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        for name in undeclared_service_accounts(self.csv) {
            let existing = api.get_opt(&name).await?;
            match ownership(existing.as_ref().map(|sa| &sa.metadata), self.csv, &self.adoptable) {
                Ownership::Absent => {
                    if create_if_absent(&api, &rbac::generate_service_account(self.csv, &name))
                        .await?
                    {
                        info!(service_account = %name, "Created ServiceAccount");
                    }
                }
                Ownership::Adoptable(previous) => {
                    if let Some(existing) = existing.as_ref() {
                        adopt_object(&api, existing, self.csv).await?;
                    }
                    info!(service_account = %name, from = %previous, "Adopted ServiceAccount");
                }
                Ownership::Foreign(owner) => {
                    debug!(
                        service_account = %name,
                        owner = %owner,
                        "ServiceAccount shared with another CSV"
                    );
                }
                Ownership::Mine | Ownership::Unowned => {}
            }
        }
        Ok(())
    }

    /// Permission RBAC is created once per service account and never diffed
    async fn ensure_permissions(&self) -> Result<()> {
        let strategy = &self.csv.spec.install_strategy.spec;

        let roles: Api<Role> = Api::namespaced(self.client.clone(), &self.namespace);
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &self.namespace);
        for (sa, rules) in rbac::rules_by_service_account(&strategy.permissions) {
            create_if_absent(&roles, &rbac::generate_permission_role(self.csv, &sa, &rules))
                .await?;
            create_if_absent(
                &bindings,
                &rbac::generate_permission_role_binding(self.csv, &sa),
            )
            .await?;
        }

        let cluster_roles: Api<ClusterRole> = Api::all(self.client.clone());
        let cluster_bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        for (sa, rules) in rbac::rules_by_service_account(&strategy.cluster_permissions) {
            create_if_absent(
                &cluster_roles,
                &rbac::generate_cluster_permission_role(self.csv, &sa, &rules),
            )
            .await?;
            create_if_absent(
                &cluster_bindings,
                &rbac::generate_cluster_permission_role_binding(self.csv, &sa),
            )
            .await?;
        }
        Ok(())
    }

    async fn ensure_deployments(&self, ca_hashes: &BTreeMap<String, String>) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        for desired in self.desired_deployments(ca_hashes)? {
            let name = desired.name();
            let existing = api.get_opt(&name).await?;
            match plan_deployment(existing.as_ref(), &desired, self.csv, &self.adoptable) {
                DeploymentAction::Unchanged => debug!(deployment = %name, "Deployment up to date"),
                DeploymentAction::Create | DeploymentAction::Update => {
                    info!(deployment = %name, hash = %desired.template_hash, "Applying Deployment");
                    apply_resource(&api, &desired.deployment).await?;
                }
                DeploymentAction::Adopt(previous) => {
                    if let Some(existing) = existing.as_ref() {
                        adopt_object(&api, existing, self.csv).await?;
                    }
                    info!(deployment = %name, from = %previous, "Adopted Deployment");
                    apply_resource(&api, &desired.deployment).await?;
                }
                DeploymentAction::Foreign(owner) => {
                    return Err(Error::PermanentError(format!(
                        "deployment {} is owned by {}",
                        name, owner
                    )));
                }
            }
        }
        Ok(())
    }

    /// Judge every declared Deployment; `ca_hashes` as for [`InstallExecutor::apply`]
    pub async fn check_health(
        &self,
        ca_hashes: &BTreeMap<String, String>,
    ) -> Result<ComponentHealth> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut healths = Vec::new();
        for desired in self.desired_deployments(ca_hashes)? {
            let existing = api.get_opt(&desired.name()).await?;
            let expected_ca = ca_hashes.get(&desired.name()).map(String::as_str);
            healths.push(deployment_health(existing.as_ref(), &desired, expected_ca));
        }
        Ok(combine_health(healths))
    }
}

/// Move a predecessor's object to `csv`. The write carries the observed
/// resourceVersion so a concurrent change fails with a conflict.
async fn adopt_object<K>(api: &Api<K>, existing: &K, csv: &ClusterServiceVersion) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut meta = existing.meta().clone();
    adopt(&mut meta, csv);
    let patch = serde_json::json!({
        "metadata": {
            "labels": meta.labels,
            "ownerReferences": meta.owner_references,
            "resourceVersion": meta.resource_version,
        }
    });
    api.patch(&existing.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
