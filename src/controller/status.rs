//! Status and conditions management
//!
//! CSV status is only written when something other than `lastUpdateTime` changed, so
//! a pass over a settled CSV leaves the object untouched. Phase changes are appended
//! to a bounded condition history.

use chrono::Utc;
use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use serde_json::Value;
use tracing::debug;

use crate::controller::Context;
use crate::controller::error::Result;
use crate::crd::{
    ClusterServiceVersion, ClusterServiceVersionStatus, Condition, CsvPhase, CsvReason,
    RequirementStatus,
};

/// Number of phase history entries kept in `status.conditions`
pub const MAX_CONDITION_HISTORY: usize = 20;

/// Condition status values
pub mod condition_status {
    pub const TRUE: &str = "True";
    pub const FALSE: &str = "False";
}

/// Builder for creating and updating typed conditions
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
    generation: Option<i64>,
}

impl ConditionBuilder {
    /// Create from existing conditions
    pub fn from_existing(existing: Vec<Condition>, generation: Option<i64>) -> Self {
        Self {
            conditions: existing,
            generation,
        }
    }

    /// Set a condition, updating if it exists or adding if it doesn't.
    ///
    /// `lastTransitionTime` only moves when the status flips.
    pub fn set_condition(mut self, type_: &str, status: &str, reason: &str, message: &str) -> Self {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.status = status.to_string();
                existing.last_transition_time = Utc::now().to_rfc3339();
            }
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            existing.observed_generation = self.generation;
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: Utc::now().to_rfc3339(),
                observed_generation: self.generation,
            });
        }
        self
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

/// Desired phase-related part of a CSV status
#[derive(Clone, Debug)]
pub struct PhaseUpdate {
    pub phase: CsvPhase,
    pub reason: CsvReason,
    pub message: String,
}

/// Compute the next status from the current one.
///
/// Only fields that are passed change; `lastTransitionTime` moves on a phase change and
/// a history entry is appended when phase or reason changes.
pub fn next_status(
    existing: Option<&ClusterServiceVersionStatus>,
    update: &PhaseUpdate,
    requirements: Option<Vec<RequirementStatus>>,
    generation: Option<i64>,
    now: &str,
) -> ClusterServiceVersionStatus {
    let mut status = existing.cloned().unwrap_or_default();
    let phase_changed = existing.is_none_or(|s| s.phase != update.phase);
    let reason_changed = status.reason != Some(update.reason);

    if phase_changed {
        status.last_transition_time = Some(now.to_string());
    }
    if phase_changed || reason_changed {
        status.conditions.push(Condition {
            type_: update.phase.to_string(),
            status: condition_status::TRUE.to_string(),
            reason: update.reason.to_string(),
            message: update.message.clone(),
            last_transition_time: now.to_string(),
            observed_generation: generation,
        });
        let overflow = status
            .conditions
            .len()
            .saturating_sub(MAX_CONDITION_HISTORY);
        status.conditions.drain(..overflow);
    }

    status.phase = update.phase;
    status.reason = Some(update.reason);
    status.message = Some(update.message.clone());
    if let Some(requirements) = requirements {
        status.requirement_status = requirements;
    }
    status.observed_generation = generation;
    status
}

/// Equal apart from `lastUpdateTime`
pub fn semantically_equal(
    a: &ClusterServiceVersionStatus,
    b: &ClusterServiceVersionStatus,
) -> bool {
    let strip = |s: &ClusterServiceVersionStatus| ClusterServiceVersionStatus {
        last_update_time: None,
        ..s.clone()
    };
    strip(a) == strip(b)
}

/// Merge patch body that replaces `old` with `new`, nulling fields that disappeared
pub fn status_patch(
    old: Option<&ClusterServiceVersionStatus>,
    new: &ClusterServiceVersionStatus,
) -> Result<Value> {
    let mut body = serde_json::to_value(new)?;
    if let (Some(old), Value::Object(map)) = (old, &mut body)
        && let Value::Object(old_map) = serde_json::to_value(old)?
    {
        for key in old_map.keys() {
            if !map.contains_key(key) {
                map.insert(key.clone(), Value::Null);
            }
        }
    }
    Ok(serde_json::json!({ "status": body }))
}

/// Status writer for one ClusterServiceVersion
pub struct StatusManager<'a> {
    csv: &'a ClusterServiceVersion,
    ctx: &'a Context,
}

impl<'a> StatusManager<'a> {
    pub fn new(csv: &'a ClusterServiceVersion, ctx: &'a Context) -> Self {
        Self { csv, ctx }
    }

    /// Write `status` unless it matches what is stored. Returns whether a write happened.
    pub async fn update(&self, mut status: ClusterServiceVersionStatus) -> Result<bool> {
        if let Some(existing) = self.csv.status.as_ref()
            && semantically_equal(existing, &status)
        {
            debug!("Status unchanged, skipping write");
            return Ok(false);
        }

        status.last_update_time = Some(Utc::now().to_rfc3339());
        let api: Api<ClusterServiceVersion> = Api::namespaced(
            self.ctx.client.clone(),
            &self.csv.namespace().unwrap_or_default(),
        );
        let patch = status_patch(self.csv.status.as_ref(), &status)?;
        api.patch_status(
            &self.csv.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(true)
    }
}

/// Whether `certsRotateAt` has been reached
pub fn cert_rotation_due(
    status: Option<&ClusterServiceVersionStatus>,
    now: chrono::DateTime<Utc>,
) -> bool {
    status
        .and_then(|s| s.certs_rotate_at.as_deref())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .is_some_and(|rotate_at| rotate_at <= now)
}
