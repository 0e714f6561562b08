//! Requirement evaluation for ClusterServiceVersions
//!
//! Every declared dependency is looked up against live cluster state and turned into a
//! [`RequirementStatus`]. The full list is recomputed on every pass. A missing object is
//! a `NotPresent` verdict; only API failures surface as errors.
//!
//! Cluster access goes through [`ClusterLookup`] so evaluation can be exercised without
//! an API server.

use std::collections::BTreeSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{
    APIService, CRDDescription, ClusterServiceVersion, RequirementState, RequirementStatus,
};

pub const CRD_GROUP: &str = "apiextensions.k8s.io";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const API_SERVICE_GROUP: &str = "apiregistration.k8s.io";
pub const API_SERVICE_KIND: &str = "APIService";
pub const PLATFORM_VERSION_KIND: &str = "PlatformVersion";

pub const MSG_CRD_VERSION_NOT_SERVED: &str = "CRD version not served";
pub const MSG_CRD_NOT_ESTABLISHED: &str = "CRD is not yet established";

/// Read-only view of the cluster used during evaluation
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>>;

    async fn api_service(&self, name: &str) -> Result<Option<APIService>>;

    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Whether API discovery lists `kind` under `group/version`
    async fn serves_kind(&self, group: &str, version: &str, kind: &str) -> Result<bool>;

    /// `gitVersion` of the API server
    async fn server_version(&self) -> Result<String>;
}

/// [`ClusterLookup`] backed by the API server
pub struct KubeLookup {
    client: Client,
}

impl KubeLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLookup for KubeLookup {
    async fn custom_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<CustomResourceDefinition>> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn api_service(&self, name: &str) -> Result<Option<APIService>> {
        let api: Api<APIService> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn serves_kind(&self, group: &str, version: &str, kind: &str) -> Result<bool> {
        let listing = if group.is_empty() {
            self.client.list_core_api_resources(version).await
        } else {
            self.client
                .list_api_group_resources(&format!("{}/{}", group, version))
                .await
        };
        match listing {
            Ok(list) => Ok(list.resources.iter().any(|r| r.kind == kind)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}

fn crd_status(name: &str, state: RequirementState, message: &str) -> RequirementStatus {
    RequirementStatus {
        group: CRD_GROUP.to_string(),
        version: "v1".to_string(),
        kind: CRD_KIND.to_string(),
        name: name.to_string(),
        status: state,
        message: message.to_string(),
    }
}

fn api_service_status(name: &str, state: RequirementState, message: String) -> RequirementStatus {
    RequirementStatus {
        group: API_SERVICE_GROUP.to_string(),
        version: "v1".to_string(),
        kind: API_SERVICE_KIND.to_string(),
        name: name.to_string(),
        status: state,
        message,
    }
}

fn crd_condition_true(crd: &CustomResourceDefinition, type_: &str) -> bool {
    crd.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
}

/// Established and with accepted names
pub fn crd_is_established(crd: &CustomResourceDefinition) -> bool {
    crd_condition_true(crd, "Established") && crd_condition_true(crd, "NamesAccepted")
}

/// Whether `version` is a `served: true` version of `crd`
pub fn crd_serves_version(crd: &CustomResourceDefinition, version: &str) -> bool {
    crd.spec
        .versions
        .iter()
        .any(|v| v.name == version && v.served)
}

/// Verdict for an owned CRD: version-exact, then established
pub fn owned_crd_requirement(
    desc: &CRDDescription,
    crd: Option<&CustomResourceDefinition>,
) -> RequirementStatus {
    match crd {
        None => crd_status(&desc.name, RequirementState::NotPresent, "CRD not found"),
        Some(crd) if !crd_serves_version(crd, &desc.version) => crd_status(
            &desc.name,
            RequirementState::NotPresent,
            MSG_CRD_VERSION_NOT_SERVED,
        ),
        Some(crd) if !crd_is_established(crd) => crd_status(
            &desc.name,
            RequirementState::NotPresent,
            MSG_CRD_NOT_ESTABLISHED,
        ),
        Some(_) => crd_status(&desc.name, RequirementState::Present, "CRD is present"),
    }
}

/// Verdict for a required CRD: existence, version-agnostic
pub fn required_crd_requirement(
    desc: &CRDDescription,
    crd: Option<&CustomResourceDefinition>,
) -> RequirementStatus {
    match crd {
        None => crd_status(&desc.name, RequirementState::NotPresent, "CRD not found"),
        Some(crd) if !crd_is_established(crd) => crd_status(
            &desc.name,
            RequirementState::NotPresent,
            MSG_CRD_NOT_ESTABLISHED,
        ),
        Some(_) => crd_status(&desc.name, RequirementState::Present, "CRD is present"),
    }
}

/// Parsed `major.minor.patch`
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PlatformVersion(pub u64, pub u64, pub u64);

impl PlatformVersion {
    /// Parse `v1.30.2`, `1.30`, `v1.30.2-gke.100` or `v1.28.3+k3s1`
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_start_matches('v');
        let core = trimmed
            .split(['-', '+'])
            .next()
            .filter(|c| !c.is_empty())?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        let patch = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }
        Some(Self(major, minor, patch))
    }
}

/// Verdict for `minKubeVersion`; unparseable versions fail closed
pub fn platform_version_requirement(minimum: &str, server: &str) -> RequirementStatus {
    let (state, message) = match (PlatformVersion::parse(minimum), PlatformVersion::parse(server))
    {
        (Some(min), Some(live)) if live >= min => (
            RequirementState::Present,
            format!("server version {} satisfies minimum {}", server, minimum),
        ),
        (Some(_), Some(_)) => (
            RequirementState::NotPresent,
            format!(
                "minimum platform version {} exceeds server version {}",
                minimum, server
            ),
        ),
        (None, _) => (
            RequirementState::NotPresent,
            format!("minimum platform version {:?} is not a valid version", minimum),
        ),
        (_, None) => (
            RequirementState::NotPresent,
            format!("server version {:?} could not be parsed", server),
        ),
    };
    RequirementStatus {
        group: String::new(),
        version: String::new(),
        kind: PLATFORM_VERSION_KIND.to_string(),
        name: minimum.to_string(),
        status: state,
        message,
    }
}

/// Service accounts named by `permissions` and `clusterPermissions`, first-seen order
pub fn permission_service_accounts(csv: &ClusterServiceVersion) -> Vec<String> {
    let strategy = &csv.spec.install_strategy.spec;
    let mut seen = BTreeSet::new();
    strategy
        .permissions
        .iter()
        .chain(strategy.cluster_permissions.iter())
        .filter(|p| seen.insert(p.service_account_name.clone()))
        .map(|p| p.service_account_name.clone())
        .collect()
}

/// Evaluate every declared dependency of `csv`
pub async fn evaluate(
    csv: &ClusterServiceVersion,
    lookup: &dyn ClusterLookup,
) -> Result<Vec<RequirementStatus>> {
    let namespace = csv.namespace().unwrap_or_default();
    let mut statuses = Vec::new();

    for desc in &csv.spec.customresourcedefinitions.owned {
        let crd = lookup.custom_resource_definition(&desc.name).await?;
        statuses.push(owned_crd_requirement(desc, crd.as_ref()));
    }

    for desc in &csv.spec.customresourcedefinitions.required {
        let crd = lookup.custom_resource_definition(&desc.name).await?;
        statuses.push(required_crd_requirement(desc, crd.as_ref()));
    }

    let deployments = csv.deployment_names();
    for desc in &csv.spec.apiservicedefinitions.owned {
        let name = desc.api_service_name();
        let status = match desc.deployment_name.as_deref() {
            Some(dep) if deployments.contains(&dep) => api_service_status(
                &name,
                RequirementState::Present,
                format!("served by deployment {}", dep),
            ),
            Some(dep) => api_service_status(
                &name,
                RequirementState::NotPresent,
                format!("deployment {} is not defined in the install strategy", dep),
            ),
            None => api_service_status(
                &name,
                RequirementState::NotPresent,
                "owned APIService does not name a deployment".to_string(),
            ),
        };
        statuses.push(status);
    }

    for desc in &csv.spec.apiservicedefinitions.required {
        let name = desc.api_service_name();
        let status = match lookup.api_service(&name).await? {
            Some(_) => api_service_status(
                &name,
                RequirementState::Present,
                "APIService is present".to_string(),
            ),
            None => api_service_status(
                &name,
                RequirementState::NotPresent,
                "APIService not found".to_string(),
            ),
        };
        statuses.push(status);
    }

    for gvk in &csv.spec.native_apis {
        let served = lookup
            .serves_kind(&gvk.group, &gvk.version, &gvk.kind)
            .await?;
        let (state, message) = if served {
            (RequirementState::Present, "native API is served")
        } else {
            (RequirementState::NotPresent, "native API is not served")
        };
        statuses.push(RequirementStatus {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            name: String::new(),
            status: state,
            message: message.to_string(),
        });
    }

    // Existence only: an account owned by anything satisfies the requirement
    for sa in permission_service_accounts(csv) {
        let exists = lookup.service_account_exists(&namespace, &sa).await?;
        let (state, message) = if exists {
            (RequirementState::Present, "service account is present")
        } else {
            (RequirementState::NotPresent, "service account not found")
        };
        statuses.push(RequirementStatus {
            group: String::new(),
            version: "v1".to_string(),
            kind: "ServiceAccount".to_string(),
            name: sa,
            status: state,
            message: message.to_string(),
        });
    }

    if let Some(minimum) = csv
        .spec
        .min_kube_version
        .as_deref()
        .filter(|m| !m.trim().is_empty())
    {
        let server = lookup.server_version().await?;
        statuses.push(platform_version_requirement(minimum, &server));
    }

    Ok(statuses)
}

pub fn all_present(statuses: &[RequirementStatus]) -> bool {
    statuses.iter().all(RequirementStatus::is_present)
}

/// Human-readable list of unmet requirements
pub fn unmet_summary(statuses: &[RequirementStatus]) -> String {
    let unmet: Vec<String> = statuses
        .iter()
        .filter(|s| !s.is_present())
        .map(|s| {
            if s.name.is_empty() {
                format!("{}/{} {}", s.group, s.version, s.kind)
            } else {
                format!("{} {}", s.kind, s.name)
            }
        })
        .collect();
    if unmet.is_empty() {
        "all requirements met".to_string()
    } else {
        format!("one or more requirements couldn't be found: {}", unmet.join(", "))
    }
}
