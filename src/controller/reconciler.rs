//! Reconciliation logic for ClusterServiceVersion resources
//!
//! One pass evaluates requirements, detects ownership conflicts and the replacement
//! chain, applies or checks the install strategy depending on the phase, and then lets
//! the state machine pick the next phase. Status is only written when it changed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding};
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::controller::apiservice::ApiServiceManager;
use crate::controller::apply::delete_if_present;
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::events::actions;
use crate::controller::gc::{self, ReplaceGraph};
use crate::controller::install::{InstallExecutor, combine_health};
use crate::controller::requirements::{self, KubeLookup, all_present, unmet_summary};
use crate::controller::state_machine::{
    ComponentHealth, CsvEvent, CsvStateMachine, TransitionContext, TransitionResult,
    determine_event,
};
use crate::controller::status::{PhaseUpdate, StatusManager, cert_rotation_due, next_status};
use crate::crd::{APIService, ClusterServiceVersion, CsvPhase, CsvReason, PhaseSet};
use crate::resources::common::{OwnerKey, is_copied, owner_selector};

/// Finalizer removing cluster-scoped and system-namespace objects on deletion
pub const FINALIZER: &str = "operators.coreos.com/csv-cleanup";

/// Default backoff configuration for error handling
fn default_backoff() -> BackoffConfig {
    BackoffConfig::default()
}

/// Main reconciliation function
#[instrument(
    skip(csv, ctx),
    fields(name = %csv.name_any(), namespace = csv.namespace().unwrap_or_default())
)]
pub async fn reconcile(csv: Arc<ClusterServiceVersion>, ctx: Arc<Context>) -> Result<Action> {
    let ns = csv.namespace().unwrap_or_default();
    let name = csv.name_any();

    // Copies are owned by the copy controller
    if is_copied(&csv.metadata) {
        return Ok(Action::await_change());
    }

    if csv.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&csv, &ctx, &ns).await;
    }

    if !has_finalizer(&csv) {
        add_finalizer(&csv, &ctx, &ns).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    debug!("Reconciling ClusterServiceVersion in phase {}", csv.phase());
    let start = Instant::now();
    let result = reconcile_csv(&csv, &ctx, &ns).await;
    match &result {
        Ok(_) => ctx.record_reconcile(&ns, &name, start.elapsed().as_secs_f64()),
        Err(e) => {
            ctx.record_error(&ns, &name);
            if !e.is_not_found() {
                error!("Reconciliation failed: {}", e);
            }
        }
    }
    result
}

/// Error policy for the controller with exponential backoff
pub fn error_policy(csv: Arc<ClusterServiceVersion>, error: &Error, _ctx: Arc<Context>) -> Action {
    let name = csv.name_any();
    let delay = default_backoff().delay_for_error(error, 0);

    if error.is_retryable() {
        warn!(
            "Retryable error for {}: {:?}, requeuing in {:?}",
            name, error, delay
        );
    } else {
        error!(
            "Non-retryable error for {}: {:?}, requeuing in {:?} for manual intervention",
            name, error, delay
        );
    }

    Action::requeue(delay)
}

/// Outcome of the install step of a pass
#[derive(Default)]
struct InstallOutcome {
    error: Option<Error>,
    certs_rotated: bool,
    components: ComponentHealth,
}

async fn reconcile_csv(csv: &ClusterServiceVersion, ctx: &Context, ns: &str) -> Result<Action> {
    let phase = csv.phase();
    let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), ns);
    let siblings = api.list(&ListParams::default()).await?.items;
    let graph = ReplaceGraph::new(&siblings);
    let chain_state = gc::chain_state(&graph, csv);

    if phase == CsvPhase::Deleting {
        let head = chain_state
            .head
            .as_deref()
            .and_then(|h| graph.get(h))
            .unwrap_or(csv);
        gc::collect_replaced(csv, head, ctx).await?;
        return Ok(Action::await_change());
    }

    let predecessors = graph.predecessors(csv);
    let chain: BTreeSet<String> = predecessors
        .iter()
        .cloned()
        .chain(graph.successors(csv))
        .chain([csv.name_any()])
        .collect();

    let lookup = KubeLookup::new(ctx.client.clone());
    let requirement_status = requirements::evaluate(csv, &lookup).await?;
    let requirements_met = all_present(&requirement_status);

    let apiservices = ApiServiceManager::new(csv, ctx, predecessors.clone(), chain);
    let mut owner_conflict = graph
        .replacement_conflict(csv)
        .or_else(|| graph.crd_owner_conflict(csv));
    if owner_conflict.is_none() && !csv.is_in(PhaseSet::SUPERSEDED) {
        owner_conflict = apiservices.ownership_conflict().await?;
    }

    let now = Utc::now();
    let executor = InstallExecutor::new(csv, ctx, predecessors);
    let may_install = requirements_met && owner_conflict.is_none() && !chain_state.has_successor;
    let outcome = if may_install {
        run_install_step(csv, phase, &apiservices, &executor, now).await?
    } else {
        InstallOutcome::default()
    };

    let invalid_strategy = matches!(outcome.error, Some(Error::InvalidStrategy(_)));
    let tctx = TransitionContext {
        requirements_met,
        requirements_message: unmet_summary(&requirement_status),
        owner_conflict,
        install_error: outcome.error.as_ref().map(ToString::to_string),
        components: outcome.components,
        cert_rotation_due: phase == CsvPhase::Succeeded
            && cert_rotation_due(csv.status.as_ref(), now),
        has_successor: chain_state.has_successor,
        chain_head_succeeded: chain_state.chain_head_succeeded,
    };

    let (update, event) = next_phase(csv, &tctx);
    let update = if invalid_strategy && update.phase == CsvPhase::Failed {
        PhaseUpdate {
            reason: CsvReason::InvalidInstallStrategy,
            ..update
        }
    } else {
        update
    };

    let now_str = now.to_rfc3339();
    let mut status = next_status(
        csv.status.as_ref(),
        &update,
        Some(requirement_status),
        csv.metadata.generation,
        &now_str,
    );
    if outcome.certs_rotated {
        status.certs_last_updated = Some(now_str.clone());
        status.certs_rotate_at = Some((now + ctx.config.cert_rotate_after()).to_rfc3339());
        if let Some(ref state) = ctx.health_state {
            state.metrics.record_certificate_rotation(ns, &csv.name_any());
        }
        publish(
            csv,
            ctx,
            EventType::Normal,
            "CertificatesRotated",
            actions::ROTATE,
            "serving certificates issued".to_string(),
        )
        .await;
    }

    let changed = csv.status.is_none()
        || csv.reason() != Some(update.reason)
        || phase != update.phase;
    StatusManager::new(csv, ctx).update(status).await?;

    if changed {
        info!(
            from = %phase,
            to = %update.phase,
            reason = %update.reason,
            "{}",
            update.message
        );
        if phase != update.phase
            && let Some(ref state) = ctx.health_state
        {
            state
                .metrics
                .record_transition(&phase.to_string(), &update.phase.to_string());
        }
        let type_ = if update.phase == CsvPhase::Failed {
            EventType::Warning
        } else {
            EventType::Normal
        };
        publish(
            csv,
            ctx,
            type_,
            &update.reason.to_string(),
            event_action(event),
            update.message.clone(),
        )
        .await;
    }

    Ok(Action::requeue(ctx.config.resync()))
}

/// Apply the strategy in `InstallReady`/`Installing`, check it in `Succeeded`.
///
/// Retryable API errors abort the pass; anything else is reported through status.
async fn run_install_step(
    csv: &ClusterServiceVersion,
    phase: CsvPhase,
    apiservices: &ApiServiceManager<'_>,
    executor: &InstallExecutor<'_>,
    now: chrono::DateTime<Utc>,
) -> Result<InstallOutcome> {
    let mut outcome = InstallOutcome::default();
    match phase {
        CsvPhase::InstallReady | CsvPhase::Installing => {
            let applied = async {
                let serving = apiservices.ensure(now).await?;
                executor.apply(&serving.ca_hashes).await?;
                Ok::<_, Error>(serving.rotated)
            }
            .await;
            match applied {
                Ok(rotated) => outcome.certs_rotated = rotated,
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(csv = %csv.name_any(), "Install failed: {}", e);
                    outcome.error = Some(e);
                    return Ok(outcome);
                }
            }
            if phase == CsvPhase::Installing {
                outcome.components = check_components(apiservices, executor).await?;
            }
        }
        CsvPhase::Succeeded => {
            outcome.components = check_components(apiservices, executor).await?;
        }
        _ => {}
    }
    Ok(outcome)
}

async fn check_components(
    apiservices: &ApiServiceManager<'_>,
    executor: &InstallExecutor<'_>,
) -> Result<ComponentHealth> {
    let ca_hashes = apiservices.current_ca_hashes().await?;
    let deployments = executor.check_health(&ca_hashes).await?;
    let api_services = if apiservices.has_owned_api_services() {
        apiservices.check_health(&ca_hashes).await?
    } else {
        ComponentHealth::Ready
    };
    Ok(combine_health([deployments, api_services]))
}

/// Phase update for this pass, and the event that caused it
fn next_phase(
    csv: &ClusterServiceVersion,
    tctx: &TransitionContext,
) -> (PhaseUpdate, Option<CsvEvent>) {
    let phase = csv.phase();
    let current = PhaseUpdate {
        phase,
        reason: csv.reason().unwrap_or(CsvReason::RequirementsUnknown),
        message: csv
            .status
            .as_ref()
            .and_then(|s| s.message.clone())
            .unwrap_or_default(),
    };

    let Some(event) = determine_event(phase, tctx) else {
        return (current, None);
    };

    match CsvStateMachine::new().transition(phase, event, tctx) {
        TransitionResult::Success { to, reason, .. } => (
            PhaseUpdate {
                phase: to,
                reason,
                message: tctx.message_for(event),
            },
            Some(event),
        ),
        TransitionResult::GuardFailed { to, reason, .. } => {
            debug!(%event, from = %phase, %to, "Transition guard failed: {}", reason);
            (current, None)
        }
        TransitionResult::InvalidTransition { current: from, event } => {
            warn!(%event, %from, "No transition for event");
            (current, None)
        }
    }
}

fn event_action(event: Option<CsvEvent>) -> &'static str {
    match event {
        Some(CsvEvent::RequirementsMet | CsvEvent::RequirementsNotMet) | None => actions::EVALUATE,
        Some(CsvEvent::SuccessorFound | CsvEvent::SuccessorGone | CsvEvent::ChainHeadSucceeded) => {
            actions::REPLACE
        }
        Some(CsvEvent::CertRotationDue) => actions::ROTATE,
        Some(_) => actions::INSTALL,
    }
}

async fn publish(
    csv: &ClusterServiceVersion,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&csv.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

/// Check if the finalizer is present
fn has_finalizer(csv: &ClusterServiceVersion) -> bool {
    csv.finalizers().iter().any(|f| f == FINALIZER)
}

/// Add the finalizer to the resource
async fn add_finalizer(csv: &ClusterServiceVersion, ctx: &Context, ns: &str) -> Result<()> {
    let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), ns);
    let name = csv.name_any();

    let mut finalizers = csv.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": csv.resource_version(),
        }
    });

    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!("Added finalizer to {}", name);
    Ok(())
}

/// Delete objects Kubernetes garbage collection cannot reach: cluster-scoped objects
/// and bindings in the system namespace, matched by owner labels
async fn cleanup_unreferenced(csv: &ClusterServiceVersion, ctx: &Context) -> Result<()> {
    let selector = owner_selector(&OwnerKey::of(csv));
    let params = ListParams::default().labels(&selector);

    let api_services: Api<APIService> = Api::all(ctx.client.clone());
    for item in api_services.list_metadata(&params).await? {
        delete_if_present(&api_services, &item.name_any()).await?;
    }
    let cluster_roles: Api<ClusterRole> = Api::all(ctx.client.clone());
    for item in cluster_roles.list_metadata(&params).await? {
        delete_if_present(&cluster_roles, &item.name_any()).await?;
    }
    let cluster_bindings: Api<ClusterRoleBinding> = Api::all(ctx.client.clone());
    for item in cluster_bindings.list_metadata(&params).await? {
        delete_if_present(&cluster_bindings, &item.name_any()).await?;
    }
    let system_bindings: Api<RoleBinding> =
        Api::namespaced(ctx.client.clone(), &ctx.config.system_namespace);
    for item in system_bindings.list_metadata(&params).await? {
        delete_if_present(&system_bindings, &item.name_any()).await?;
    }
    Ok(())
}

/// Handle deletion of the ClusterServiceVersion
async fn handle_deletion(csv: &ClusterServiceVersion, ctx: &Context, ns: &str) -> Result<Action> {
    let name = csv.name_any();

    if has_finalizer(csv) {
        info!("Cleaning up cluster-scoped objects of {}", name);
        cleanup_unreferenced(csv, ctx).await?;

        // Namespaced objects carry owner references and are collected by Kubernetes
        let api: Api<ClusterServiceVersion> = Api::namespaced(ctx.client.clone(), ns);
        let finalizers: Vec<String> = csv
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": csv.resource_version(),
            }
        });

        api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!("Removed finalizer from {}", name);
    }

    Ok(Action::await_change())
}
