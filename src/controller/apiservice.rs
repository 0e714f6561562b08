//! Serving resources for owned aggregated API services
//!
//! Every Deployment that serves owned API services gets a Service, a certificate Secret
//! signed by its own CA, RBAC to read the Secret and delegate authentication, and one
//! APIService registration per served group/version carrying the CA as `caBundle`.
//!
//! Objects created under the older naming scheme (keyed by API service name instead of
//! Deployment name) are removed once the current set exists, but only when they belong
//! to this CSV or one of its predecessors.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding};
use kube::core::ObjectMeta;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::controller::Context;
use crate::controller::apply::{apply_resource, delete_if_present};
use crate::controller::error::{Error, Result};
use crate::controller::install::combine_health;
use crate::controller::state_machine::ComponentHealth;
use crate::crd::{
    APIService, APIServiceDescription, APIServiceSpec, ClusterServiceVersion,
    ClusterServiceVersionStatus, ServiceReference,
};
use crate::resources::certificate::{self, ServingCertificate};
use crate::resources::common::{OwnerKey, owner_of, standard_labels};
use crate::resources::deployment::{selector_labels, service_account_name};
use crate::resources::rbac;
use crate::resources::secret::{cert_secret_name, generate_cert_secret, secret_ca};
use crate::resources::service::{
    SERVICE_PORT, generate_api_service_service, legacy_service_name, service_name,
};

pub const GROUP_PRIORITY_MINIMUM: i32 = 2000;
pub const VERSION_PRIORITY: i32 = 15;

/// Owned API services grouped by the Deployment serving them
pub fn served_by_deployment(
    csv: &ClusterServiceVersion,
) -> BTreeMap<String, Vec<&APIServiceDescription>> {
    let mut grouped: BTreeMap<String, Vec<&APIServiceDescription>> = BTreeMap::new();
    for desc in &csv.spec.apiservicedefinitions.owned {
        if let Some(dep) = desc.deployment_name.as_ref() {
            grouped.entry(dep.clone()).or_default().push(desc);
        }
    }
    grouped
}

/// Registration object for one owned API service
pub fn generate_api_service(
    csv: &ClusterServiceVersion,
    desc: &APIServiceDescription,
    service: &str,
    ca_pem: &[u8],
) -> APIService {
    let mut api_service = APIService::new(
        &desc.api_service_name(),
        APIServiceSpec {
            group: desc.group.clone(),
            version: desc.version.clone(),
            service: Some(ServiceReference {
                namespace: csv.namespace().unwrap_or_default(),
                name: service.to_string(),
                port: Some(SERVICE_PORT),
            }),
            ca_bundle: Some(ByteString(ca_pem.to_vec())),
            group_priority_minimum: GROUP_PRIORITY_MINIMUM,
            version_priority: VERSION_PRIORITY,
            insecure_skip_tls_verify: None,
        },
    );
    api_service.metadata.labels = Some(standard_labels(csv));
    api_service
}

/// Ownership of an existing APIService, judged for `csv`.
///
/// `chain` holds every CSV of the same namespace in the replacement chain of `csv`,
/// `owner_live` whether the recorded owner still exists. Unowned and orphaned objects
/// are adopted.
pub fn api_service_conflict(
    existing: &APIService,
    csv: &ClusterServiceVersion,
    chain: &BTreeSet<String>,
    owner_live: bool,
) -> Option<String> {
    let owner = owner_of(&existing.metadata)?;
    let me = OwnerKey::of(csv);
    if owner == me || (owner.namespace == me.namespace && chain.contains(&owner.name)) {
        return None;
    }
    owner_live.then(|| {
        format!(
            "APIService {} is owned by ClusterServiceVersion {}",
            existing.name_any(),
            owner
        )
    })
}

/// Whether a legacy object may be removed by `csv`
pub fn legacy_removable(
    meta: &ObjectMeta,
    csv: &ClusterServiceVersion,
    predecessors: &BTreeSet<String>,
) -> bool {
    let me = OwnerKey::of(csv);
    owner_of(meta).is_some_and(|owner| {
        owner == me || (owner.namespace == me.namespace && predecessors.contains(&owner.name))
    })
}

/// Whether the serving certificate for one Deployment must be issued again
pub fn needs_new_certificate(
    status: Option<&ClusterServiceVersionStatus>,
    secret: Option<&Secret>,
    now: DateTime<Utc>,
) -> bool {
    crate::controller::status::cert_rotation_due(status, now)
        || status.is_none_or(|s| s.certs_rotate_at.is_none())
        || secret.and_then(secret_ca).is_none()
}

/// CA hashes per Deployment and whether any certificate was issued in this pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServingOutcome {
    pub ca_hashes: BTreeMap<String, String>,
    pub rotated: bool,
}

/// Health of one APIService registration against the CA it should carry
pub fn api_service_health(
    existing: Option<&APIService>,
    name: &str,
    ca_hash: Option<&str>,
) -> ComponentHealth {
    let Some(existing) = existing else {
        return ComponentHealth::Missing(format!("APIService {} not found", name));
    };
    let live_hash = existing.ca_bundle().map(certificate::ca_hash);
    if ca_hash.is_none() || live_hash.as_deref() != ca_hash {
        return ComponentHealth::Stale(format!(
            "APIService {} does not carry the current CA bundle",
            name
        ));
    }
    if !existing.is_available() {
        return ComponentHealth::Unavailable(format!("APIService {} is not available", name));
    }
    ComponentHealth::Ready
}

/// Manages the API service serving resources of one ClusterServiceVersion
pub struct ApiServiceManager<'a> {
    csv: &'a ClusterServiceVersion,
    client: Client,
    namespace: String,
    system_namespace: String,
    cert_validity_days: i64,
    predecessors: BTreeSet<String>,
    chain: BTreeSet<String>,
}

impl<'a> ApiServiceManager<'a> {
    /// `predecessors` may be adopted from; `chain` additionally holds successors
    pub fn new(
        csv: &'a ClusterServiceVersion,
        ctx: &Context,
        predecessors: Vec<String>,
        chain: BTreeSet<String>,
    ) -> Self {
        Self {
            csv,
            client: ctx.client.clone(),
            namespace: csv.namespace().unwrap_or_default(),
            system_namespace: ctx.config.system_namespace.clone(),
            cert_validity_days: ctx.config.cert_validity_days,
            predecessors: predecessors.into_iter().collect(),
            chain,
        }
    }

    pub fn has_owned_api_services(&self) -> bool {
        !served_by_deployment(self.csv).is_empty()
    }

    async fn owner_exists(&self, owner: &OwnerKey) -> Result<bool> {
        let api: Api<ClusterServiceVersion> =
            Api::namespaced(self.client.clone(), &owner.namespace);
        Ok(api.get_opt(&owner.name).await?.is_some())
    }

    /// First owned APIService held by another live CSV outside the replacement chain
    pub async fn ownership_conflict(&self) -> Result<Option<String>> {
        let api: Api<APIService> = Api::all(self.client.clone());
        for desc in &self.csv.spec.apiservicedefinitions.owned {
            let Some(existing) = api.get_opt(&desc.api_service_name()).await? else {
                continue;
            };
            let live = match owner_of(&existing.metadata) {
                Some(owner) => self.owner_exists(&owner).await?,
                None => false,
            };
            if let Some(conflict) = api_service_conflict(&existing, self.csv, &self.chain, live) {
                return Ok(Some(conflict));
            }
        }
        Ok(None)
    }

    /// Create or update every serving resource, rotating certificates when due
    pub async fn ensure(&self, now: DateTime<Utc>) -> Result<ServingOutcome> {
        let mut outcome = ServingOutcome::default();
        for (deployment, descs) in served_by_deployment(self.csv) {
            let (hash, rotated) = self.ensure_deployment(&deployment, &descs, now).await?;
            outcome.ca_hashes.insert(deployment, hash);
            outcome.rotated |= rotated;
        }
        if !outcome.ca_hashes.is_empty() {
            self.remove_legacy().await?;
        }
        Ok(outcome)
    }

    async fn ensure_deployment(
        &self,
        deployment: &str,
        descs: &[&APIServiceDescription],
        now: DateTime<Utc>,
    ) -> Result<(String, bool)> {
        let strategy = self
            .csv
            .spec
            .install_strategy
            .spec
            .deployments
            .iter()
            .find(|d| d.name == deployment)
            .ok_or_else(|| {
                Error::InvalidStrategy(format!(
                    "API service deployment {} is not part of the install strategy",
                    deployment
                ))
            })?;
        let service = service_name(deployment);
        let secret_name = cert_secret_name(&service);
        let sa = service_account_name(strategy);
        let port = descs
            .iter()
            .find_map(|d| d.container_port)
            .unwrap_or(SERVICE_PORT);

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        apply_resource(
            &services,
            &generate_api_service_service(self.csv, deployment, selector_labels(strategy), port),
        )
        .await?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let existing = secrets.get_opt(&secret_name).await?;
        let fresh = !needs_new_certificate(self.csv.status.as_ref(), existing.as_ref(), now);
        let (ca_pem, rotated) =
            match existing.as_ref().and_then(secret_ca).map(<[u8]>::to_vec) {
                Some(ca) if fresh => (ca, false),
                _ => {
                    let cert: ServingCertificate =
                        certificate::issue(&service, &self.namespace, self.cert_validity_days)?;
                    info!(deployment, service = %service, "Issued serving certificate");
                    apply_resource(&secrets, &generate_cert_secret(self.csv, &secret_name, &cert))
                        .await?;
                    (cert.ca_pem.into_bytes(), true)
                }
            };

        let roles: Api<Role> = Api::namespaced(self.client.clone(), &self.namespace);
        apply_resource(&roles, &rbac::generate_secret_reader_role(self.csv, &secret_name)).await?;
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &self.namespace);
        apply_resource(
            &bindings,
            &rbac::generate_secret_reader_role_binding(self.csv, &secret_name, &sa),
        )
        .await?;

        let cluster_bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        apply_resource(
            &cluster_bindings,
            &rbac::generate_auth_delegator_binding(self.csv, &service, &sa),
        )
        .await?;
        let system_bindings: Api<RoleBinding> =
            Api::namespaced(self.client.clone(), &self.system_namespace);
        apply_resource(
            &system_bindings,
            &rbac::generate_auth_reader_binding(self.csv, &service, &sa, &self.system_namespace),
        )
        .await?;

        let api_services: Api<APIService> = Api::all(self.client.clone());
        for desc in descs {
            apply_resource(
                &api_services,
                &generate_api_service(self.csv, desc, &service, &ca_pem),
            )
            .await?;
            debug!(api_service = %desc.api_service_name(), "Registered APIService");
        }

        Ok((certificate::ca_hash(&ca_pem), rotated))
    }

    async fn remove_if_legacy<T>(
        &self,
        api: &Api<T>,
        name: &str,
        current: &BTreeSet<String>,
    ) -> Result<()>
    where
        T: Resource + DeserializeOwned + Clone + std::fmt::Debug,
    {
        if current.contains(name) {
            return Ok(());
        }
        let Some(existing) = api.get_opt(name).await? else {
            return Ok(());
        };
        if legacy_removable(existing.meta(), self.csv, &self.predecessors) {
            info!(name, "Removing legacy API service resource");
            delete_if_present(api, name).await?;
        } else {
            debug!(name, "Leaving legacy resource with foreign or no owner");
        }
        Ok(())
    }

    async fn remove_legacy(&self) -> Result<()> {
        let current: BTreeSet<String> = served_by_deployment(self.csv)
            .keys()
            .flat_map(|dep| {
                let service = service_name(dep);
                [
                    cert_secret_name(&service),
                    rbac::auth_delegator_binding_name(&service),
                    rbac::auth_reader_binding_name(&service),
                    service,
                ]
            })
            .collect();

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let roles: Api<Role> = Api::namespaced(self.client.clone(), &self.namespace);
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), &self.namespace);
        let cluster_bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let system_bindings: Api<RoleBinding> =
            Api::namespaced(self.client.clone(), &self.system_namespace);

        for desc in &self.csv.spec.apiservicedefinitions.owned {
            let api_name = desc.api_service_name();
            let legacy_cert = cert_secret_name(&api_name);
            self.remove_if_legacy(&services, &legacy_service_name(&api_name), &current)
                .await?;
            self.remove_if_legacy(&secrets, &legacy_cert, &current).await?;
            self.remove_if_legacy(&roles, &legacy_cert, &current).await?;
            self.remove_if_legacy(&bindings, &legacy_cert, &current).await?;
            self.remove_if_legacy(
                &cluster_bindings,
                &rbac::auth_delegator_binding_name(&api_name),
                &current,
            )
            .await?;
            self.remove_if_legacy(
                &system_bindings,
                &rbac::auth_reader_binding_name(&api_name),
                &current,
            )
            .await?;
        }
        Ok(())
    }

    /// CA hash per serving Deployment, read from the certificate Secrets
    pub async fn current_ca_hashes(&self) -> Result<BTreeMap<String, String>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut hashes = BTreeMap::new();
        for deployment in served_by_deployment(self.csv).keys() {
            let name = cert_secret_name(&service_name(deployment));
            if let Some(ca) = secrets.get_opt(&name).await?.as_ref().and_then(secret_ca) {
                hashes.insert(deployment.clone(), certificate::ca_hash(ca));
            }
        }
        Ok(hashes)
    }

    /// Judge every owned APIService and the certificate Secrets behind them
    pub async fn check_health(
        &self,
        ca_hashes: &BTreeMap<String, String>,
    ) -> Result<ComponentHealth> {
        let api: Api<APIService> = Api::all(self.client.clone());
        let mut healths = Vec::new();
        for (deployment, descs) in served_by_deployment(self.csv) {
            let expected = ca_hashes.get(&deployment).map(String::as_str);
            if expected.is_none() {
                healths.push(ComponentHealth::Missing(format!(
                    "serving certificate for deployment {} not found",
                    deployment
                )));
            }
            for desc in descs {
                let name = desc.api_service_name();
                let existing = api.get_opt(&name).await?;
                healths.push(api_service_health(existing.as_ref(), &name, expected));
            }
        }
        Ok(combine_health(healths))
    }
}
