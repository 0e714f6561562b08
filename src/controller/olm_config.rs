//! Status reporting for `OLMConfig/cluster`

use std::sync::Arc;
use std::time::Duration;

use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, info, instrument, warn};

use crate::controller::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::status::{ConditionBuilder, condition_status};
use crate::crd::{ClusterServiceVersion, Condition, OLM_CONFIG_NAME, OLMConfig};
use crate::resources::common::COPIED_FROM_LABEL;

pub const DISABLED_COPIED_CSVS_CONDITION: &str = "DisabledCopiedCSVs";

/// Requeue while copies are still being removed
const DRAIN_REQUEUE: Duration = Duration::from_secs(5);

/// Condition status, reason and message for the copy setting
pub fn copied_csvs_condition(
    enabled: bool,
    copies_found: bool,
) -> (&'static str, &'static str, &'static str) {
    match (enabled, copies_found) {
        (false, false) => (
            condition_status::TRUE,
            "NoCopiedCSVsFound",
            "Copied CSVs are disabled and none were found for operators installed in AllNamespace mode",
        ),
        (false, true) => (
            condition_status::FALSE,
            "CopiedCSVsFound",
            "Copied CSVs are disabled and at least one copied CSV was found for an operator installed in AllNamespace mode",
        ),
        (true, _) => (
            condition_status::FALSE,
            "CopiedCSVsEnabled",
            "Copied CSVs are enabled and present across the cluster",
        ),
    }
}

fn conditions_changed(old: &[Condition], new: &[Condition]) -> bool {
    old.len() != new.len()
        || old.iter().zip(new).any(|(a, b)| {
            a.type_ != b.type_
                || a.status != b.status
                || a.reason != b.reason
                || a.message != b.message
        })
}

#[instrument(skip(config, ctx), fields(name = %config.name_any()))]
pub async fn reconcile(config: Arc<OLMConfig>, ctx: Arc<Context>) -> Result<Action> {
    if !config.is_singleton() {
        debug!("Ignoring OLMConfig other than {}", OLM_CONFIG_NAME);
        return Ok(Action::await_change());
    }

    let enabled = config.copied_csvs_are_enabled();

    let csvs: Api<ClusterServiceVersion> = Api::all(ctx.client.clone());
    let copies = csvs
        .list_metadata(&ListParams::default().labels(COPIED_FROM_LABEL).limit(1))
        .await?;
    let copies_found = !copies.items.is_empty();

    let (status, reason, message) = copied_csvs_condition(enabled, copies_found);
    let existing = config
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let conditions = ConditionBuilder::from_existing(existing.clone(), config.metadata.generation)
        .set_condition(DISABLED_COPIED_CSVS_CONDITION, status, reason, message)
        .build();

    if conditions_changed(&existing, &conditions) {
        let api: Api<OLMConfig> = Api::all(ctx.client.clone());
        let patch = serde_json::json!({ "status": { "conditions": conditions } });
        api.patch_status(&config.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        info!(reason, "Updated {} condition", DISABLED_COPIED_CSVS_CONDITION);
    }

    if !enabled && copies_found {
        return Ok(Action::requeue(DRAIN_REQUEUE));
    }
    Ok(Action::requeue(ctx.config.resync()))
}

pub fn error_policy(config: Arc<OLMConfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    let delay = BackoffConfig::default().delay_for_error(error, 0);
    warn!(
        "OLMConfig reconciliation failed for {}: {}, requeuing in {:?}",
        config.name_any(),
        error,
        delay
    );
    Action::requeue(delay)
}
