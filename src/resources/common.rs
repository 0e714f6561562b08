//! Common utilities for Kubernetes resource generation
//!
//! Ownership of generated objects is recorded twice: owner labels, which work for
//! cluster-scoped and cross-namespace objects, and an owner reference, which lets
//! Kubernetes garbage collect namespaced objects. [`owner_of`] resolves either form.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use crate::crd::ClusterServiceVersion;

/// API version for the ClusterServiceVersion CRD
pub const API_VERSION: &str = "operators.coreos.com/v1alpha1";

/// Kind for the ClusterServiceVersion CRD
pub const KIND: &str = "ClusterServiceVersion";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "olm-operator";

pub const OWNER_LABEL: &str = "olm.owner";
pub const OWNER_NAMESPACE_LABEL: &str = "olm.owner.namespace";
pub const OWNER_KIND_LABEL: &str = "olm.owner.kind";

/// Marks a ClusterServiceVersion as a copy, value is the source namespace
pub const COPIED_FROM_LABEL: &str = "olm.copiedFrom";

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Identity of the ClusterServiceVersion owning an object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    pub name: String,
    pub namespace: String,
}

impl OwnerKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn of(csv: &ClusterServiceVersion) -> Self {
        Self::new(csv.name_any(), csv.namespace().unwrap_or_default())
    }
}

impl std::fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Generate an owner reference for a ClusterServiceVersion
pub fn owner_reference(csv: &ClusterServiceVersion) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: csv.name_any(),
        uid: csv.metadata.uid.clone().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(false),
    }
}

/// Labels linking an object to the ClusterServiceVersion that manages it
pub fn owner_labels(csv: &ClusterServiceVersion) -> BTreeMap<String, String> {
    BTreeMap::from([
        (OWNER_LABEL.to_string(), csv.name_any()),
        (
            OWNER_NAMESPACE_LABEL.to_string(),
            csv.namespace().unwrap_or_default(),
        ),
        (OWNER_KIND_LABEL.to_string(), KIND.to_string()),
    ])
}

/// Owner labels plus the operator's managed-by label
pub fn standard_labels(csv: &ClusterServiceVersion) -> BTreeMap<String, String> {
    let mut labels = owner_labels(csv);
    labels.insert(MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string());
    labels
}

/// Label selector matching objects owned by `owner`
pub fn owner_selector(owner: &OwnerKey) -> String {
    format!(
        "{}={},{}={},{}={}",
        OWNER_KIND_LABEL, KIND, OWNER_LABEL, owner.name, OWNER_NAMESPACE_LABEL, owner.namespace
    )
}

/// Resolve the owning ClusterServiceVersion of an object.
///
/// Labels win over owner references. An owner reference only names the owner, so the
/// object's own namespace is used for it.
pub fn owner_of(meta: &ObjectMeta) -> Option<OwnerKey> {
    if let Some(labels) = meta.labels.as_ref()
        && labels.get(OWNER_KIND_LABEL).map(String::as_str) == Some(KIND)
        && let (Some(name), Some(namespace)) =
            (labels.get(OWNER_LABEL), labels.get(OWNER_NAMESPACE_LABEL))
    {
        return Some(OwnerKey::new(name, namespace));
    }

    let namespace = meta.namespace.as_ref()?;
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == KIND && r.api_version.starts_with("operators.coreos.com/"))
        .map(|r| OwnerKey::new(&r.name, namespace))
}

/// Whether `meta` is owned by `csv`
pub fn is_owned_by(meta: &ObjectMeta, csv: &ClusterServiceVersion) -> bool {
    owner_of(meta).is_some_and(|owner| owner == OwnerKey::of(csv))
}

/// Rewrite ownership of an existing object to `csv`.
///
/// Owner labels are replaced. For objects in the ClusterServiceVersion's namespace the
/// ClusterServiceVersion owner references are replaced by one pointing at `csv`.
pub fn adopt(meta: &mut ObjectMeta, csv: &ClusterServiceVersion) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    labels.extend(owner_labels(csv));

    if meta.namespace.is_some() && meta.namespace == csv.namespace() {
        let refs = meta.owner_references.get_or_insert_with(Vec::new);
        refs.retain(|r| r.kind != KIND);
        refs.push(owner_reference(csv));
    }
}

/// Whether a ClusterServiceVersion is a copy managed by the copy controller
pub fn is_copied(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .is_some_and(|l| l.contains_key(COPIED_FROM_LABEL))
}
