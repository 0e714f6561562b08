//! Deployment generation, planning and health for the install strategy

use std::collections::BTreeSet;

use olm_operator::controller::install::{
    DeploymentAction, deployment_health, plan_deployment, validate_strategy,
};
use olm_operator::controller::state_machine::ComponentHealth;
use olm_operator::controller::Error;
use olm_operator::resources::deployment::{
    CA_HASH_ANNOTATION, Rollout, SPEC_HASH_ANNOTATION, generate_deployment, recorded_hash,
    rollout_status,
};

use crate::common::*;

fn first_strategy(
    csv: &olm_operator::ClusterServiceVersion,
) -> &olm_operator::crd::StrategyDeploymentSpec {
    &csv.spec.install_strategy.spec.deployments[0]
}

mod template_hash_tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        let csv = create_test_csv("etcd.v1", "operators");
        let a = generate_deployment(&csv, first_strategy(&csv), None).unwrap();
        let b = generate_deployment(&csv, first_strategy(&csv), None).unwrap();
        assert_eq!(a.template_hash, b.template_hash);
        assert_eq!(recorded_hash(&a.deployment), Some(a.template_hash.as_str()));
    }

    #[test]
    fn test_replica_change_does_not_change_hash() {
        let csv = create_test_csv("etcd.v1", "operators");
        let mut scaled = csv.clone();
        scaled.spec.install_strategy.spec.deployments[0].spec.replicas = Some(5);

        let a = generate_deployment(&csv, first_strategy(&csv), None).unwrap();
        let b = generate_deployment(&scaled, first_strategy(&scaled), None).unwrap();
        assert_eq!(a.template_hash, b.template_hash);
    }

    #[test]
    fn test_csv_annotations_reach_pod_template() {
        let plain = create_test_csv("etcd.v1", "operators");
        let annotated = CsvBuilder::new("etcd.v1", "operators")
            .with_deployment("operator", "default")
            .with_uid("uid-etcd.v1")
            .with_annotation("olm.targetNamespaces", "")
            .build();

        let a = generate_deployment(&plain, first_strategy(&plain), None).unwrap();
        let b = generate_deployment(&annotated, first_strategy(&annotated), None).unwrap();
        assert_ne!(a.template_hash, b.template_hash);

        let template_annotations = b
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .unwrap();
        assert_eq!(template_annotations.get("olm.targetNamespaces").unwrap(), "");
        assert!(!template_annotations.contains_key(SPEC_HASH_ANNOTATION));
    }

    #[test]
    fn test_ca_hash_changes_template() {
        let csv = create_test_csv("hats.v1", "operators");
        let a = generate_deployment(&csv, first_strategy(&csv), Some("ca-1")).unwrap();
        let b = generate_deployment(&csv, first_strategy(&csv), Some("ca-2")).unwrap();
        assert_ne!(a.template_hash, b.template_hash);
        let template = a.deployment.spec.unwrap().template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations.get(CA_HASH_ANNOTATION).unwrap(), "ca-1");
    }
}

mod planning_tests {
    use super::*;

    #[test]
    fn test_unowned_deployment_is_taken_over() {
        let csv = create_test_csv("etcd.v1", "operators");
        let desired = generate_deployment(&csv, first_strategy(&csv), None).unwrap();
        let mut existing = desired.deployment.clone();
        existing.metadata.labels = None;
        existing.metadata.owner_references = None;
        assert_eq!(
            plan_deployment(Some(&existing), &desired, &csv, &BTreeSet::new()),
            DeploymentAction::Update
        );
    }

    #[test]
    fn test_deployment_of_unrelated_csv_is_foreign() {
        let other = create_test_csv("other.v1", "operators");
        let csv = create_test_csv("etcd.v1", "operators");
        let existing = generate_deployment(&other, first_strategy(&other), None)
            .unwrap()
            .deployment;
        let desired = generate_deployment(&csv, first_strategy(&csv), None).unwrap();
        match plan_deployment(Some(&existing), &desired, &csv, &BTreeSet::new()) {
            DeploymentAction::Foreign(owner) => assert_eq!(owner.name, "other.v1"),
            action => panic!("expected foreign owner, got {:?}", action),
        }
    }

    #[test]
    fn test_invalid_strategy_is_rejected() {
        let csv = CsvBuilder::new("bad.v1", "operators")
            .with_strategy_name("helm")
            .build();
        assert!(matches!(validate_strategy(&csv), Err(Error::InvalidStrategy(_))));
        assert!(validate_strategy(&create_test_csv("ok.v1", "operators")).is_ok());
    }
}

mod rollout_tests {
    use super::*;

    #[test]
    fn test_rollout_states() {
        assert_eq!(
            rollout_status(&deployment_with_status("op", 2, 2, 2, true)),
            Rollout::Complete
        );
        assert!(matches!(
            rollout_status(&deployment_with_status("op", 2, 1, 2, true)),
            Rollout::Waiting(_)
        ));
        assert!(matches!(
            rollout_status(&deployment_with_status("op", 2, 2, 3, true)),
            Rollout::Waiting(_)
        ));
        assert!(matches!(
            rollout_status(&deployment_with_status("op", 2, 2, 2, false)),
            Rollout::Unavailable(_)
        ));
    }

    #[test]
    fn test_health_maps_rollout() {
        let csv = create_test_csv("etcd.v1", "operators");
        let desired = generate_deployment(&csv, first_strategy(&csv), None).unwrap();

        let mut live = deployment_with_status("operator", 1, 1, 1, false);
        live.metadata.annotations = desired.deployment.metadata.annotations.clone();
        assert!(matches!(
            deployment_health(Some(&live), &desired, None),
            ComponentHealth::Unavailable(_)
        ));

        let mut live = deployment_with_status("operator", 1, 1, 1, true);
        live.metadata.annotations = desired.deployment.metadata.annotations.clone();
        assert_eq!(deployment_health(Some(&live), &desired, None), ComponentHealth::Ready);
    }
}
