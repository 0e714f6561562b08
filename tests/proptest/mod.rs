// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for the ClusterServiceVersion lifecycle
//!
//! These tests use proptest to generate random observations and verify that:
//! 1. The state machine never panics on any event sequence
//! 2. The event chosen for a phase always has a transition that passes its guard
//! 3. Replacement chains terminate on arbitrary `replaces` graphs, cycles included
//! 4. Status history stays bounded and version parsing never panics

use std::collections::BTreeSet;

use proptest::prelude::*;

use olm_operator::controller::gc::{ReplaceGraph, chain_state};
use olm_operator::controller::requirements::PlatformVersion;
use olm_operator::controller::state_machine::{
    ComponentHealth, CsvEvent, CsvStateMachine, TransitionContext, TransitionResult,
    determine_event,
};
use olm_operator::controller::status::{MAX_CONDITION_HISTORY, PhaseUpdate, next_status};
use olm_operator::crd::{
    ClusterServiceVersion, ClusterServiceVersionSpec, CsvPhase, CsvReason, PhaseSet,
};

// =============================================================================
// Strategies
// =============================================================================

fn arb_phase() -> impl Strategy<Value = CsvPhase> {
    prop::sample::select(CsvPhase::ALL.to_vec())
}

fn arb_event() -> impl Strategy<Value = CsvEvent> {
    prop::sample::select(vec![
        CsvEvent::RequirementsNotMet,
        CsvEvent::RequirementsMet,
        CsvEvent::OwnerConflict,
        CsvEvent::StrategyApplied,
        CsvEvent::InstallFailed,
        CsvEvent::ComponentsReady,
        CsvEvent::ComponentsPending,
        CsvEvent::ComponentUnhealthy,
        CsvEvent::NeedsReinstall,
        CsvEvent::CertRotationDue,
        CsvEvent::SuccessorFound,
        CsvEvent::SuccessorGone,
        CsvEvent::ChainHeadSucceeded,
    ])
}

fn arb_reason() -> impl Strategy<Value = CsvReason> {
    prop::sample::select(vec![
        CsvReason::RequirementsUnknown,
        CsvReason::RequirementsNotMet,
        CsvReason::AllRequirementsMet,
        CsvReason::OwnerConflict,
        CsvReason::InstallWaiting,
        CsvReason::InstallSucceeded,
        CsvReason::ComponentUnhealthy,
        CsvReason::BeingReplaced,
    ])
}

fn arb_health() -> impl Strategy<Value = ComponentHealth> {
    prop_oneof![
        Just(ComponentHealth::Unknown),
        Just(ComponentHealth::Ready),
        "[a-z ]{0,12}".prop_map(ComponentHealth::RollingOut),
        "[a-z ]{0,12}".prop_map(ComponentHealth::Unavailable),
        "[a-z ]{0,12}".prop_map(ComponentHealth::Missing),
        "[a-z ]{0,12}".prop_map(ComponentHealth::Stale),
        "[a-z ]{0,12}".prop_map(ComponentHealth::Failed),
    ]
}

prop_compose! {
    fn arb_context()(
        requirements_met in any::<bool>(),
        owner_conflict in proptest::option::of("[a-z ]{1,12}"),
        install_error in proptest::option::of("[a-z ]{1,12}"),
        components in arb_health(),
        cert_rotation_due in any::<bool>(),
        has_successor in any::<bool>(),
        chain_head_succeeded in any::<bool>(),
    ) -> TransitionContext {
        TransitionContext {
            requirements_met,
            requirements_message: if requirements_met {
                String::new()
            } else {
                "missing requirement".to_string()
            },
            owner_conflict,
            install_error,
            components,
            cert_rotation_due,
            has_successor,
            chain_head_succeeded,
        }
    }
}

/// Up to six CSVs named `v0`..`v5`, each optionally replacing one of the others
fn arb_namespace() -> impl Strategy<Value = Vec<ClusterServiceVersion>> {
    proptest::collection::vec(proptest::option::of(0usize..6), 1..=6).prop_map(|links| {
        links
            .iter()
            .enumerate()
            .map(|(i, replaces)| {
                let mut csv = ClusterServiceVersion::new(
                    &format!("v{}", i),
                    ClusterServiceVersionSpec {
                        replaces: replaces.map(|r| format!("v{}", r)),
                        ..Default::default()
                    },
                );
                csv.metadata.namespace = Some("operators".to_string());
                csv
            })
            .collect()
    })
}

// =============================================================================
// State machine
// =============================================================================

proptest! {
    #[test]
    fn state_machine_never_panics(
        start in arb_phase(),
        steps in proptest::collection::vec((arb_event(), arb_context()), 0..30),
    ) {
        let sm = CsvStateMachine::new();
        let mut phase = start;
        for (event, ctx) in &steps {
            if let TransitionResult::Success { to, .. } = sm.transition(phase, *event, ctx) {
                phase = to;
            }
        }
        prop_assert!(CsvPhase::ALL.contains(&phase));
    }

    #[test]
    fn determined_event_is_always_in_the_table(phase in arb_phase(), ctx in arb_context()) {
        let sm = CsvStateMachine::new();
        if let Some(event) = determine_event(phase, &ctx) {
            prop_assert!(
                sm.can_transition(phase, event),
                "{} has no transition on {}", phase, event
            );
            let result = sm.transition(phase, event, &ctx);
            prop_assert!(
                matches!(result, TransitionResult::Success { .. }),
                "guard rejected {} on {}: {:?}", event, phase, result
            );
        }
    }

    #[test]
    fn deleting_is_terminal(ctx in arb_context(), event in arb_event()) {
        let sm = CsvStateMachine::new();
        prop_assert!(determine_event(CsvPhase::Deleting, &ctx).is_none());
        prop_assert!(!sm.can_transition(CsvPhase::Deleting, event));
    }

    #[test]
    fn successor_always_supersedes_active_phases(phase in arb_phase(), ctx in arb_context()) {
        let ctx = TransitionContext { has_successor: true, ..ctx };
        if !PhaseSet::SUPERSEDED.contains(phase) {
            prop_assert_eq!(determine_event(phase, &ctx), Some(CsvEvent::SuccessorFound));
        }
    }

    #[test]
    fn phase_set_matches_membership(phases in proptest::collection::vec(arb_phase(), 0..8)) {
        let set: PhaseSet = phases.iter().copied().collect();
        for phase in CsvPhase::ALL {
            prop_assert_eq!(set.contains(phase), phases.contains(&phase));
        }
        prop_assert_eq!(set.is_empty(), phases.is_empty());
        prop_assert_eq!(set.union(PhaseSet::EMPTY), set);
    }
}

// =============================================================================
// Replacement chains
// =============================================================================

proptest! {
    #[test]
    fn replacement_chains_terminate(csvs in arb_namespace()) {
        let graph = ReplaceGraph::new(&csvs);
        for csv in &csvs {
            let own = csv.metadata.name.clone().unwrap();

            let predecessors = graph.predecessors(csv);
            let unique: BTreeSet<_> = predecessors.iter().collect();
            prop_assert_eq!(unique.len(), predecessors.len());
            prop_assert!(!predecessors.contains(&own));

            let successors = graph.successors(csv);
            let unique: BTreeSet<_> = successors.iter().collect();
            prop_assert_eq!(unique.len(), successors.len());
            prop_assert!(!successors.contains(&own));

            prop_assert!(graph.in_chain(csv, &own));
        }
    }

    #[test]
    fn oldest_replacement_never_conflicts_with_itself(csvs in arb_namespace()) {
        let graph = ReplaceGraph::new(&csvs);
        for csv in &csvs {
            if let Some(replaces) = csv.spec.replaces.as_deref()
                && graph.replacement_conflict(csv).is_none()
                && graph.may_replace(csv)
            {
                let successor = graph.successor(replaces).unwrap();
                prop_assert_eq!(successor.metadata.name.as_ref(), csv.metadata.name.as_ref());
            }
        }
    }

    #[test]
    fn conflicting_csvs_are_never_superseded(csvs in arb_namespace()) {
        let graph = ReplaceGraph::new(&csvs);
        for csv in &csvs {
            if graph.replacement_conflict(csv).is_some() {
                prop_assert!(!chain_state(&graph, csv).has_successor);
            }
        }
    }

    #[test]
    fn every_cycle_keeps_one_member(csvs in arb_namespace()) {
        let graph = ReplaceGraph::new(&csvs);
        // members of a cycle form a closed loop of replaces links
        for csv in &csvs {
            let preds = graph.predecessors(csv);
            let own = csv.metadata.name.clone().unwrap();
            let closes = preds
                .last()
                .and_then(|last| graph.get(last))
                .and_then(|last| last.spec.replaces.clone())
                == Some(own);
            if closes {
                let loop_members: Vec<_> = std::iter::once(csv)
                    .chain(preds.iter().filter_map(|n| graph.get(n)))
                    .collect();
                let cycle_free = loop_members
                    .iter()
                    .filter(|m| {
                        graph
                            .replacement_conflict(m)
                            .is_none_or(|c| !c.contains("cycle"))
                    })
                    .count();
                prop_assert_eq!(cycle_free, 1);
            }
        }
    }
}

// =============================================================================
// Status and versions
// =============================================================================

proptest! {
    #[test]
    fn status_history_is_bounded(
        updates in proptest::collection::vec((arb_phase(), arb_reason()), 1..60),
    ) {
        let mut status = None;
        for (i, (phase, reason)) in updates.iter().enumerate() {
            let update = PhaseUpdate {
                phase: *phase,
                reason: *reason,
                message: format!("step {}", i),
            };
            let now = format!("2024-01-01T00:00:{:02}+00:00", i % 60);
            status = Some(next_status(status.as_ref(), &update, None, Some(1), &now));
        }
        let status = status.unwrap();
        prop_assert!(status.conditions.len() <= MAX_CONDITION_HISTORY);
        let (last_phase, last_reason) = updates.last().copied().unwrap();
        prop_assert_eq!(status.phase, last_phase);
        prop_assert_eq!(status.reason, Some(last_reason));
    }

    #[test]
    fn version_parse_never_panics(raw in "\\PC{0,24}") {
        let _ = PlatformVersion::parse(&raw);
    }

    #[test]
    fn version_parse_reads_semver(
        major in 0u64..100,
        minor in 0u64..100,
        patch in 0u64..100,
        suffix in prop::sample::select(vec!["", "-gke.100", "+k3s1", "-eks-1-28"]),
    ) {
        let raw = format!("v{}.{}.{}{}", major, minor, patch, suffix);
        prop_assert_eq!(PlatformVersion::parse(&raw), Some(PlatformVersion(major, minor, patch)));
    }
}
