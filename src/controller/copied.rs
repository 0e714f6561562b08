//! Copies of ClusterServiceVersions installed for all namespaces
//!
//! An operator installed for every namespace is mirrored into each other namespace so
//! tenants can discover it. Copies carry [`COPIED_FROM_LABEL`], mirror the source's
//! spec and status, and are rewritten when they drift. Whether copies exist at all is
//! decided per pass by `OLMConfig/cluster`.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::Context;
use crate::controller::apply::{apply_resource, delete_if_present};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::crd::{
    ClusterServiceVersion, ClusterServiceVersionStatus, CsvReason, InstallModeType,
};
use crate::resources::common::{COPIED_FROM_LABEL, is_copied};

/// Annotation listing the namespaces an operator serves; empty means all namespaces
pub const TARGET_NAMESPACES_ANNOTATION: &str = "olm.targetNamespaces";

/// Annotation on the source recording its namespace on every copy
pub const OPERATOR_NAMESPACE_ANNOTATION: &str = "olm.operatorNamespace";

/// Whether `csv` is installed for all namespaces and must be copied
pub fn is_copy_source(csv: &ClusterServiceVersion) -> bool {
    !is_copied(&csv.metadata)
        && csv.metadata.deletion_timestamp.is_none()
        && csv.supports(InstallModeType::AllNamespaces)
        && csv
            .annotations()
            .get(TARGET_NAMESPACES_ANNOTATION)
            .is_some_and(|v| v.trim().is_empty())
}

/// Namespace a copy was made from
pub fn copied_from(csv: &ClusterServiceVersion) -> Option<&str> {
    csv.labels().get(COPIED_FROM_LABEL).map(String::as_str)
}

/// Status shown on a copy: the source status with reason `Copied`
pub fn copied_status(source: &ClusterServiceVersion) -> ClusterServiceVersionStatus {
    let source_ns = source.namespace().unwrap_or_default();
    ClusterServiceVersionStatus {
        reason: Some(CsvReason::Copied),
        message: Some(format!(
            "The operator is running in {} but is managing this namespace",
            source_ns
        )),
        requirement_status: Vec::new(),
        conditions: Vec::new(),
        ..source.status.clone().unwrap_or_default()
    }
}

/// Desired copy of `source` in `namespace`
pub fn generate_copy(source: &ClusterServiceVersion, namespace: &str) -> ClusterServiceVersion {
    let source_ns = source.namespace().unwrap_or_default();
    let mut labels = source.labels().clone();
    labels.insert(COPIED_FROM_LABEL.to_string(), source_ns.clone());
    let mut annotations = source.annotations().clone();
    annotations.insert(OPERATOR_NAMESPACE_ANNOTATION.to_string(), source_ns);

    let mut copy = ClusterServiceVersion::new(&source.name_any(), source.spec.clone());
    copy.metadata.namespace = Some(namespace.to_string());
    copy.metadata.labels = Some(labels);
    copy.metadata.annotations = Some(annotations);
    copy
}

/// Whether an existing copy still matches its source
pub fn copy_in_sync(existing: &ClusterServiceVersion, source: &ClusterServiceVersion) -> bool {
    let desired = generate_copy(source, &existing.namespace().unwrap_or_default());
    let spec_matches = serde_json::to_value(&existing.spec).ok()
        == serde_json::to_value(&desired.spec).ok();
    let labels_match = desired
        .labels()
        .iter()
        .all(|(k, v)| existing.labels().get(k) == Some(v));
    let status = copied_status(source);
    let status_matches = existing.status.as_ref().is_some_and(|s| {
        s.phase == status.phase && s.reason == status.reason && s.message == status.message
    });
    spec_matches && labels_match && status_matches
}

/// Namespaces a source is copied into
pub fn target_namespaces(namespaces: &[Namespace], source_ns: &str) -> Vec<String> {
    namespaces
        .iter()
        .filter(|ns| ns.metadata.deletion_timestamp.is_none())
        .filter(|ns| {
            ns.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_none_or(|phase| phase != "Terminating")
        })
        .map(|ns| ns.name_any())
        .filter(|name| name != source_ns)
        .collect()
}

async fn write_copy(
    ctx: &Context,
    source: &ClusterServiceVersion,
    namespace: &str,
) -> Result<()> {
    let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), namespace);
    let copy = apply_resource(&api, &generate_copy(source, namespace)).await?;
    let patch = serde_json::json!({ "status": copied_status(source) });
    api.patch_status(&copy.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Copies of `source` across the cluster
async fn list_copies(
    ctx: &Context,
    source: &ClusterServiceVersion,
) -> Result<Vec<ClusterServiceVersion>> {
    let api: Api<ClusterServiceVersion> = Api::all(ctx.client.clone());
    let selector = format!(
        "{}={}",
        COPIED_FROM_LABEL,
        source.namespace().unwrap_or_default()
    );
    let copies = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(copies
        .items
        .into_iter()
        .filter(|c| c.name_any() == source.name_any())
        .collect())
}

async fn delete_copy(ctx: &Context, copy: &ClusterServiceVersion) -> Result<()> {
    let ns = copy.namespace().unwrap_or_default();
    let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), &ns);
    if delete_if_present(&api, &copy.name_any()).await? {
        info!(namespace = %ns, "Deleted copied ClusterServiceVersion {}", copy.name_any());
    }
    Ok(())
}

/// Make the copies of one source match the current setting
async fn sync_source(source: &ClusterServiceVersion, ctx: &Context, enabled: bool) -> Result<()> {
    let existing = list_copies(ctx, source).await?;

    if !enabled || !is_copy_source(source) {
        for copy in &existing {
            delete_copy(ctx, copy).await?;
        }
        return Ok(());
    }

    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());
    let namespaces = namespaces.list(&ListParams::default()).await?;
    let source_ns = source.namespace().unwrap_or_default();

    for target in target_namespaces(&namespaces.items, &source_ns) {
        let current = existing
            .iter()
            .find(|c| c.namespace().as_deref() == Some(target.as_str()));
        if current.is_some_and(|c| copy_in_sync(c, source)) {
            continue;
        }
        // a namespace can disappear between list and write
        match write_copy(ctx, source, &target).await {
            Ok(()) => debug!(namespace = %target, "Synced copied ClusterServiceVersion"),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %target, "Target namespace gone, skipping copy")
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reconcile the copies belonging to a ClusterServiceVersion.
///
/// For a copy, the source is looked up and only that copy is checked.
#[instrument(
    skip(csv, ctx),
    fields(name = %csv.name_any(), namespace = csv.namespace().unwrap_or_default())
)]
pub async fn reconcile(csv: Arc<ClusterServiceVersion>, ctx: Arc<Context>) -> Result<Action> {
    let enabled = ctx.copied_resources_enabled().await?;

    if let Some(source_ns) = copied_from(&csv) {
        let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), source_ns);
        match api.get_opt(&csv.name_any()).await? {
            Some(source) if enabled && is_copy_source(&source) => {
                if !copy_in_sync(&csv, &source) {
                    info!("Reverting drift on copied ClusterServiceVersion");
                    write_copy(&ctx, &source, &csv.namespace().unwrap_or_default()).await?;
                }
            }
            _ => delete_copy(&ctx, &csv).await?,
        }
        return Ok(Action::requeue(ctx.config.resync()));
    }

    sync_source(&csv, &ctx, enabled).await?;
    Ok(Action::requeue(ctx.config.resync()))
}

pub fn error_policy(csv: Arc<ClusterServiceVersion>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(
        "Copy reconciliation failed for {}: {}, requeuing in {:?}",
        csv.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
