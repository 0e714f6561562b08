//! Copies of ClusterServiceVersions installed for all namespaces

use olm_operator::controller::copied::{
    TARGET_NAMESPACES_ANNOTATION, copied_from, copied_status, copy_in_sync, generate_copy,
    is_copy_source,
};
use olm_operator::controller::olm_config::copied_csvs_condition;
use olm_operator::crd::{CsvPhase, CsvReason, InstallModeType};
use olm_operator::resources::common::is_copied;

use crate::common::*;

fn global_operator() -> olm_operator::ClusterServiceVersion {
    CsvBuilder::new("etcd.v1", "operators")
        .with_uid("uid-etcd")
        .supports(InstallModeType::AllNamespaces)
        .with_annotation(TARGET_NAMESPACES_ANNOTATION, "")
        .with_deployment("etcd-operator", "default")
        .in_phase(CsvPhase::Succeeded, CsvReason::InstallSucceeded)
        .build()
}

#[test]
fn test_only_all_namespace_installs_are_copied() {
    assert!(is_copy_source(&global_operator()));

    let scoped = CsvBuilder::new("etcd.v1", "operators")
        .supports(InstallModeType::AllNamespaces)
        .with_annotation(TARGET_NAMESPACES_ANNOTATION, "operators")
        .build();
    assert!(!is_copy_source(&scoped));
}

#[test]
fn test_copy_mirrors_source() {
    let source = global_operator();
    let mut copy = generate_copy(&source, "team-a");
    copy.status = Some(copied_status(&source));

    assert!(is_copied(&copy.metadata));
    assert_eq!(copied_from(&copy), Some("operators"));
    assert_eq!(copy.spec.install_strategy, source.spec.install_strategy);
    assert!(copy_in_sync(&copy, &source));

    let status = copy.status.as_ref().unwrap();
    assert_eq!(status.phase, CsvPhase::Succeeded);
    assert_eq!(status.reason, Some(CsvReason::Copied));
    assert!(status.message.as_deref().unwrap().contains("operators"));
}

#[test]
fn test_source_phase_change_puts_copy_out_of_sync() {
    let mut source = global_operator();
    let mut copy = generate_copy(&source, "team-a");
    copy.status = Some(copied_status(&source));

    source.status.as_mut().unwrap().phase = CsvPhase::Replacing;
    assert!(!copy_in_sync(&copy, &source));
}

#[test]
fn test_olm_config_condition_messages() {
    let (status, reason, message) = copied_csvs_condition(false, true);
    assert_eq!(status, "False");
    assert_eq!(reason, "CopiedCSVsFound");
    assert!(message.contains("at least one copied CSV was found"));

    let (status, reason, _) = copied_csvs_condition(false, false);
    assert_eq!(status, "True");
    assert_eq!(reason, "NoCopiedCSVsFound");
}
