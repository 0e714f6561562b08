use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// ClusterServiceVersion describes one version of an operator: the workloads that run
/// it, the RBAC they need and the APIs it owns or depends on.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1alpha1",
    kind = "ClusterServiceVersion",
    plural = "clusterserviceversions",
    shortname = "csv",
    namespaced,
    status = "ClusterServiceVersionStatus",
    printcolumn = r#"{"name":"Replaces", "type":"string", "jsonPath":".spec.replaces"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Reason", "type":"string", "jsonPath":".status.reason"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionSpec {
    /// Named install strategy; only `deployment` is understood
    pub install_strategy: NamedInstallStrategy,

    /// Namespace topologies the operator supports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install_modes: Vec<InstallMode>,

    /// Minimum Kubernetes version (e.g. "1.28.0")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_kube_version: Option<String>,

    /// Name of the ClusterServiceVersion in the same namespace this one upgrades
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,

    /// CustomResourceDefinitions the operator owns or requires
    #[serde(default)]
    pub customresourcedefinitions: CustomResourceDefinitions,

    /// Aggregated API services the operator owns or requires
    #[serde(default)]
    pub apiservicedefinitions: APIServiceDefinitions,

    /// Built-in kinds that must be served by the API server
    #[serde(default, rename = "nativeAPIs", skip_serializing_if = "Vec::is_empty")]
    pub native_apis: Vec<GroupVersionKind>,

    /// Free-form version string of the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Install strategy name plus strategy-specific details
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedInstallStrategy {
    /// Strategy name, must be `deployment`
    pub strategy: String,

    /// Deployment strategy details
    #[serde(default)]
    pub spec: StrategyDetailsDeployment,
}

/// The only strategy name understood by the install executor
pub const INSTALL_STRATEGY_DEPLOYMENT: &str = "deployment";

impl Default for NamedInstallStrategy {
    fn default() -> Self {
        Self {
            strategy: INSTALL_STRATEGY_DEPLOYMENT.to_string(),
            spec: StrategyDetailsDeployment::default(),
        }
    }
}

/// Deployments and RBAC that make up an installed operator
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDetailsDeployment {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<StrategyDeploymentSpec>,

    /// Namespaced permissions, bound with a Role and RoleBinding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<StrategyDeploymentPermissions>,

    /// Cluster permissions, bound with a ClusterRole and ClusterRoleBinding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_permissions: Vec<StrategyDeploymentPermissions>,
}

/// A named Deployment to create
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDeploymentSpec {
    pub name: String,

    pub spec: DeploymentSpec,

    /// Extra labels for the Deployment object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label: BTreeMap<String, String>,
}

/// Policy rules granted to a service account
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StrategyDeploymentPermissions {
    pub service_account_name: String,

    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Namespace topologies
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum InstallModeType {
    OwnNamespace,
    SingleNamespace,
    MultiNamespace,
    AllNamespaces,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallMode {
    #[serde(rename = "type")]
    pub type_: InstallModeType,
    pub supported: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceDefinitions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned: Vec<CRDDescription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<CRDDescription>,
}

/// Reference to a CRD by full name (`<plural>.<group>`), served version and kind
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CRDDescription {
    pub name: String,
    pub version: String,
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceDefinitions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned: Vec<APIServiceDescription>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<APIServiceDescription>,
}

/// An aggregated API group/version, and for owned services the Deployment serving it
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceDescription {
    pub name: String,
    pub group: String,
    pub version: String,
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl APIServiceDescription {
    /// Name of the APIService registration object, `<version>.<group>`
    pub fn api_service_name(&self) -> String {
        format!("{}.{}", self.version, self.group)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// Status written by the controller
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceVersionStatus {
    #[serde(default)]
    pub phase: CsvPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<CsvReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    /// Last time the phase changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,

    /// Per-dependency verdicts from the latest evaluation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirement_status: Vec<RequirementStatus>,

    /// When serving certificates were last issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs_last_updated: Option<String>,

    /// When serving certificates must be reissued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certs_rotate_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Lifecycle phase of a ClusterServiceVersion
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash,
)]
pub enum CsvPhase {
    /// Waiting for requirements
    #[default]
    Pending,
    /// Requirements met, install not yet applied
    InstallReady,
    /// Install applied, waiting for components to become healthy
    Installing,
    /// All components healthy
    Succeeded,
    /// Install failed or a conflict was detected
    Failed,
    /// A newer ClusterServiceVersion replaces this one
    Replacing,
    /// Replacement succeeded, being garbage collected
    Deleting,
}

impl CsvPhase {
    pub const ALL: [CsvPhase; 7] = [
        CsvPhase::Pending,
        CsvPhase::InstallReady,
        CsvPhase::Installing,
        CsvPhase::Succeeded,
        CsvPhase::Failed,
        CsvPhase::Replacing,
        CsvPhase::Deleting,
    ];

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for CsvPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsvPhase::Pending => write!(f, "Pending"),
            CsvPhase::InstallReady => write!(f, "InstallReady"),
            CsvPhase::Installing => write!(f, "Installing"),
            CsvPhase::Succeeded => write!(f, "Succeeded"),
            CsvPhase::Failed => write!(f, "Failed"),
            CsvPhase::Replacing => write!(f, "Replacing"),
            CsvPhase::Deleting => write!(f, "Deleting"),
        }
    }
}

/// A finite set of phases, used wherever "any of these phases" is asked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PhaseSet(u8);

impl PhaseSet {
    pub const EMPTY: PhaseSet = PhaseSet(0);
    pub const ANY: PhaseSet = PhaseSet::of(&CsvPhase::ALL);
    /// Phases of a ClusterServiceVersion that has been superseded
    pub const SUPERSEDED: PhaseSet = PhaseSet::of(&[CsvPhase::Replacing, CsvPhase::Deleting]);
    /// Phases in which the install is being driven towards Succeeded
    pub const INSTALLING: PhaseSet = PhaseSet::of(&[
        CsvPhase::Pending,
        CsvPhase::InstallReady,
        CsvPhase::Installing,
    ]);

    pub const fn of(phases: &[CsvPhase]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < phases.len() {
            bits |= phases[i].bit();
            i += 1;
        }
        PhaseSet(bits)
    }

    pub const fn with(self, phase: CsvPhase) -> Self {
        PhaseSet(self.0 | phase.bit())
    }

    pub const fn contains(&self, phase: CsvPhase) -> bool {
        self.0 & phase.bit() != 0
    }

    pub const fn union(self, other: PhaseSet) -> Self {
        PhaseSet(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = CsvPhase> + '_ {
        CsvPhase::ALL.into_iter().filter(|p| self.contains(*p))
    }
}

impl FromIterator<CsvPhase> for PhaseSet {
    fn from_iter<I: IntoIterator<Item = CsvPhase>>(iter: I) -> Self {
        iter.into_iter().fold(PhaseSet::EMPTY, PhaseSet::with)
    }
}

impl fmt::Display for PhaseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|p| p.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Machine-readable reason accompanying a phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Hash)]
pub enum CsvReason {
    RequirementsUnknown,
    RequirementsNotMet,
    AllRequirementsMet,
    OwnerConflict,
    InvalidInstallStrategy,
    InstallWaiting,
    InstallSucceeded,
    InstallComponentFailed,
    ComponentUnhealthy,
    NeedsReinstall,
    NeedsCertRotation,
    #[serde(rename = "APIServiceResourceIssue")]
    ApiServiceResourceIssue,
    BeingReplaced,
    Replaced,
    Copied,
    /// Any reason written by something other than this controller
    #[serde(other)]
    Unknown,
}

impl fmt::Display for CsvReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CsvReason::RequirementsUnknown => "RequirementsUnknown",
            CsvReason::RequirementsNotMet => "RequirementsNotMet",
            CsvReason::AllRequirementsMet => "AllRequirementsMet",
            CsvReason::OwnerConflict => "OwnerConflict",
            CsvReason::InvalidInstallStrategy => "InvalidInstallStrategy",
            CsvReason::InstallWaiting => "InstallWaiting",
            CsvReason::InstallSucceeded => "InstallSucceeded",
            CsvReason::InstallComponentFailed => "InstallComponentFailed",
            CsvReason::ComponentUnhealthy => "ComponentUnhealthy",
            CsvReason::NeedsReinstall => "NeedsReinstall",
            CsvReason::NeedsCertRotation => "NeedsCertRotation",
            CsvReason::ApiServiceResourceIssue => "APIServiceResourceIssue",
            CsvReason::BeingReplaced => "BeingReplaced",
            CsvReason::Replaced => "Replaced",
            CsvReason::Copied => "Copied",
            CsvReason::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Verdict for one declared dependency
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum RequirementState {
    Present,
    NotPresent,
}

impl fmt::Display for RequirementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementState::Present => write!(f, "Present"),
            RequirementState::NotPresent => write!(f, "NotPresent"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequirementStatus {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
    pub status: RequirementState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl RequirementStatus {
    pub fn is_present(&self) -> bool {
        self.status == RequirementState::Present
    }
}

impl ClusterServiceVersion {
    pub fn phase(&self) -> CsvPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn reason(&self) -> Option<CsvReason> {
        self.status.as_ref().and_then(|s| s.reason)
    }

    pub fn is_in(&self, phases: PhaseSet) -> bool {
        phases.contains(self.phase())
    }

    /// Whether the operator supports being installed for every namespace
    pub fn supports(&self, mode: InstallModeType) -> bool {
        self.spec
            .install_modes
            .iter()
            .any(|m| m.type_ == mode && m.supported)
    }

    pub fn owns_crd(&self, crd_name: &str) -> bool {
        self.spec
            .customresourcedefinitions
            .owned
            .iter()
            .any(|c| c.name == crd_name)
    }

    pub fn owns_api_service(&self, api_service_name: &str) -> bool {
        self.spec
            .apiservicedefinitions
            .owned
            .iter()
            .any(|a| a.api_service_name() == api_service_name)
    }

    pub fn deployment_names(&self) -> Vec<&str> {
        self.spec
            .install_strategy
            .spec
            .deployments
            .iter()
            .map(|d| d.name.as_str())
            .collect()
    }
}
