//! Status computation and write suppression

use olm_operator::controller::status::{PhaseUpdate, next_status, semantically_equal, status_patch};
use olm_operator::crd::{CsvPhase, CsvReason, RequirementState, RequirementStatus};

const T0: &str = "2024-03-01T10:00:00+00:00";
const T1: &str = "2024-03-01T10:00:30+00:00";

fn update(phase: CsvPhase, reason: CsvReason, message: &str) -> PhaseUpdate {
    PhaseUpdate {
        phase,
        reason,
        message: message.to_string(),
    }
}

fn crd_requirement(state: RequirementState) -> RequirementStatus {
    RequirementStatus {
        group: "apiextensions.k8s.io".to_string(),
        version: "v1".to_string(),
        kind: "CustomResourceDefinition".to_string(),
        name: "etcdclusters.etcd.database.coreos.com".to_string(),
        status: state,
        message: String::new(),
    }
}

#[test]
fn test_repeated_pass_is_not_written() {
    let first = next_status(
        None,
        &update(CsvPhase::Pending, CsvReason::RequirementsNotMet, "missing crd"),
        Some(vec![crd_requirement(RequirementState::NotPresent)]),
        Some(1),
        T0,
    );
    let second = next_status(
        Some(&first),
        &update(CsvPhase::Pending, CsvReason::RequirementsNotMet, "missing crd"),
        Some(vec![crd_requirement(RequirementState::NotPresent)]),
        Some(1),
        T1,
    );
    assert!(semantically_equal(&first, &second));
    assert_eq!(second.last_transition_time.as_deref(), Some(T0));
    assert_eq!(second.conditions.len(), 1);
}

#[test]
fn test_phase_change_moves_transition_time() {
    let pending = next_status(
        None,
        &update(CsvPhase::Pending, CsvReason::RequirementsNotMet, "missing crd"),
        None,
        Some(1),
        T0,
    );
    let ready = next_status(
        Some(&pending),
        &update(CsvPhase::InstallReady, CsvReason::AllRequirementsMet, "all found"),
        Some(vec![crd_requirement(RequirementState::Present)]),
        Some(1),
        T1,
    );
    assert!(!semantically_equal(&pending, &ready));
    assert_eq!(ready.last_transition_time.as_deref(), Some(T1));
    assert_eq!(ready.conditions.len(), 2);
    assert_eq!(ready.conditions[1].type_, "InstallReady");
    assert_eq!(ready.conditions[1].reason, "AllRequirementsMet");
}

#[test]
fn test_reason_change_appends_history_without_transition() {
    let failed = next_status(
        None,
        &update(CsvPhase::Failed, CsvReason::ComponentUnhealthy, "unavailable"),
        None,
        Some(1),
        T0,
    );
    let conflict = next_status(
        Some(&failed),
        &update(CsvPhase::Failed, CsvReason::OwnerConflict, "owned elsewhere"),
        None,
        Some(1),
        T1,
    );
    assert_eq!(conflict.last_transition_time.as_deref(), Some(T0));
    assert_eq!(conflict.conditions.len(), 2);
}

#[test]
fn test_patch_targets_status() {
    let status = next_status(
        None,
        &update(CsvPhase::Pending, CsvReason::RequirementsUnknown, ""),
        None,
        None,
        T0,
    );
    let patch = status_patch(None, &status).unwrap();
    assert_eq!(patch["status"]["phase"], "Pending");
    assert_eq!(patch["status"]["reason"], "RequirementsUnknown");
}
