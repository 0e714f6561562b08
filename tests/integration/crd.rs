//! CRD installation helpers for integration tests

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use olm_operator::crd::{ClusterServiceVersion, OLMConfig};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrdError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("CRD establishment timeout")]
    EstablishmentTimeout,

    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),
}

async fn apply_crd(
    crds: &Api<CustomResourceDefinition>,
    crd: CustomResourceDefinition,
) -> Result<(), CrdError> {
    let name = crd.name_any();
    let params = PatchParams::apply("integration-test").force();

    tracing::info!("Installing CRD {}...", name);
    crds.patch(&name, &params, &Patch::Apply(&crd)).await?;

    let establish = await_condition(crds.clone(), &name, conditions::is_crd_established());
    tokio::time::timeout(Duration::from_secs(30), establish)
        .await
        .map_err(|_| CrdError::EstablishmentTimeout)??;

    tracing::info!("CRD {} installed and established", name);
    Ok(())
}

/// Install the ClusterServiceVersion and OLMConfig CRDs into the cluster
pub async fn install_crds(client: Client) -> Result<(), CrdError> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    apply_crd(&crds, ClusterServiceVersion::crd()).await?;
    apply_crd(&crds, OLMConfig::crd()).await?;
    Ok(())
}
