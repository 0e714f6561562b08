//! RBAC generation for install strategies and API service serving
//!
//! Strategy permissions become one Role/RoleBinding (or ClusterRole/ClusterRoleBinding)
//! per service account. API service serving needs read access to the certificate
//! Secret plus the two standard delegated-auth bindings.

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{ClusterServiceVersion, StrategyDeploymentPermissions};
use crate::resources::common::{owner_reference, standard_labels};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// ClusterRole granting token and subject access review
pub const AUTH_DELEGATOR_CLUSTER_ROLE: &str = "system:auth-delegator";

/// Role in the system namespace exposing the front-proxy client CA
pub const AUTH_READER_ROLE: &str = "extension-apiserver-authentication-reader";

fn namespaced_meta(csv: &ClusterServiceVersion, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: csv.namespace(),
        labels: Some(standard_labels(csv)),
        owner_references: Some(vec![owner_reference(csv)]),
        ..Default::default()
    }
}

/// Metadata for objects that cannot carry an owner reference to the CSV
fn labelled_meta(
    csv: &ClusterServiceVersion,
    name: String,
    namespace: Option<String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace,
        labels: Some(standard_labels(csv)),
        ..Default::default()
    }
}

fn service_account_subject(name: &str, namespace: Option<String>) -> Subject {
    Subject {
        kind: "ServiceAccount".to_string(),
        name: name.to_string(),
        namespace,
        ..Default::default()
    }
}

/// Group permission entries by service account, keeping first-seen order
pub fn rules_by_service_account(
    permissions: &[StrategyDeploymentPermissions],
) -> Vec<(String, Vec<PolicyRule>)> {
    let mut grouped: Vec<(String, Vec<PolicyRule>)> = Vec::new();
    for perm in permissions {
        match grouped
            .iter_mut()
            .find(|(sa, _)| *sa == perm.service_account_name)
        {
            Some((_, rules)) => rules.extend(perm.rules.iter().cloned()),
            None => grouped.push((perm.service_account_name.clone(), perm.rules.clone())),
        }
    }
    grouped
}

pub fn permission_role_name(csv: &ClusterServiceVersion, service_account: &str) -> String {
    format!("{}-{}", csv.name_any(), service_account)
}

pub fn cluster_permission_role_name(csv: &ClusterServiceVersion, service_account: &str) -> String {
    format!(
        "{}-{}-{}",
        csv.name_any(),
        csv.namespace().unwrap_or_default(),
        service_account
    )
}

pub fn generate_permission_role(
    csv: &ClusterServiceVersion,
    service_account: &str,
    rules: &[PolicyRule],
) -> Role {
    Role {
        metadata: namespaced_meta(csv, permission_role_name(csv, service_account)),
        rules: Some(rules.to_vec()),
    }
}

pub fn generate_permission_role_binding(
    csv: &ClusterServiceVersion,
    service_account: &str,
) -> RoleBinding {
    let name = permission_role_name(csv, service_account);
    RoleBinding {
        metadata: namespaced_meta(csv, name.clone()),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name,
        },
        subjects: Some(vec![service_account_subject(
            service_account,
            csv.namespace(),
        )]),
    }
}

pub fn generate_cluster_permission_role(
    csv: &ClusterServiceVersion,
    service_account: &str,
    rules: &[PolicyRule],
) -> ClusterRole {
    ClusterRole {
        metadata: labelled_meta(csv, cluster_permission_role_name(csv, service_account), None),
        rules: Some(rules.to_vec()),
        ..Default::default()
    }
}

pub fn generate_cluster_permission_role_binding(
    csv: &ClusterServiceVersion,
    service_account: &str,
) -> ClusterRoleBinding {
    let name = cluster_permission_role_name(csv, service_account);
    ClusterRoleBinding {
        metadata: labelled_meta(csv, name.clone(), None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name,
        },
        subjects: Some(vec![service_account_subject(
            service_account,
            csv.namespace(),
        )]),
    }
}

/// ServiceAccount for a Deployment that no permission entry covers
pub fn generate_service_account(csv: &ClusterServiceVersion, name: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: namespaced_meta(csv, name.to_string()),
        ..Default::default()
    }
}

/// Role allowing the serving Deployment to read its certificate Secret
pub fn generate_secret_reader_role(csv: &ClusterServiceVersion, secret_name: &str) -> Role {
    Role {
        metadata: namespaced_meta(csv, secret_name.to_string()),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![secret_name.to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        }]),
    }
}

pub fn generate_secret_reader_role_binding(
    csv: &ClusterServiceVersion,
    secret_name: &str,
    service_account: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: namespaced_meta(csv, secret_name.to_string()),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: secret_name.to_string(),
        },
        subjects: Some(vec![service_account_subject(
            service_account,
            csv.namespace(),
        )]),
    }
}

pub fn auth_delegator_binding_name(service_name: &str) -> String {
    format!("{}-{}", service_name, AUTH_DELEGATOR_CLUSTER_ROLE)
}

pub fn auth_reader_binding_name(service_name: &str) -> String {
    format!("{}-auth-reader", service_name)
}

pub fn generate_auth_delegator_binding(
    csv: &ClusterServiceVersion,
    service_name: &str,
    service_account: &str,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: labelled_meta(csv, auth_delegator_binding_name(service_name), None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: AUTH_DELEGATOR_CLUSTER_ROLE.to_string(),
        },
        subjects: Some(vec![service_account_subject(
            service_account,
            csv.namespace(),
        )]),
    }
}

/// RoleBinding in the system namespace; labelled only, it lives outside the CSV namespace
pub fn generate_auth_reader_binding(
    csv: &ClusterServiceVersion,
    service_name: &str,
    service_account: &str,
    system_namespace: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: labelled_meta(
            csv,
            auth_reader_binding_name(service_name),
            Some(system_namespace.to_string()),
        ),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "Role".to_string(),
            name: AUTH_READER_ROLE.to_string(),
        },
        subjects: Some(vec![service_account_subject(
            service_account,
            csv.namespace(),
        )]),
    }
}
