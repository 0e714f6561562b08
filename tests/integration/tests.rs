//! Fast integration tests for olm-operator
//!
//! These tests focus on controller logic: verifying that ClusterServiceVersions move
//! through the right phases and that the controller creates and removes the right
//! Kubernetes resources.
//!
//! They do NOT wait for operator pods to become ready (which would require pulling
//! container images). A CSV is expected to reach Installing, not Succeeded.
//!
//! Tests verify:
//! - Finalizers are added and removed correctly
//! - Unmet requirements keep a CSV Pending with per-requirement status
//! - Deployments from the install strategy are created with owner labels
//! - A CSV with a successor moves to Replacing
//! - Two CSVs replacing the same predecessor conflict
//! - Legacy API service objects are migrated only when owned by the chain
//! - Toggling copied CSVs removes and restores the copies
//!
//! Properties that need running pods live in `slow_tests`.

use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::rbac::v1::Role;
use kube::Api;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::ObjectMeta;
use kube::runtime::wait::conditions;
use olm_operator::controller::copied::TARGET_NAMESPACES_ANNOTATION;
use olm_operator::crd::{
    APIService, ClusterServiceVersion, CsvPhase, CsvReason, Features, InstallModeType,
    OLM_CONFIG_NAME, OLMConfig, OLMConfigSpec, PhaseSet, RequirementState,
};
use olm_operator::resources::common::{
    COPIED_FROM_LABEL, OWNER_LABEL, OWNER_NAMESPACE_LABEL, owner_labels,
};
use olm_operator::resources::secret::cert_secret_name;
use olm_operator::resources::service::{legacy_service_name, service_name};

use crate::{
    CsvBuilder, ScopedOperator, SharedTestCluster, TestNamespace, ensure_crds_installed,
    has_finalizer, has_reason, is_in, wait_for, wait_for_deletion,
};

/// Short timeout - we're testing controller logic, not pod readiness
const FAST_TIMEOUT: Duration = Duration::from_secs(30);

/// Test context that holds the operator for the test duration
struct TestContext {
    client: kube::Client,
    ns: TestNamespace,
    _operator: ScopedOperator,
    _cluster: std::sync::Arc<SharedTestCluster>,
}

impl TestContext {
    fn csvs(&self) -> Api<ClusterServiceVersion> {
        Api::namespaced(self.client.clone(), self.ns.name())
    }

    async fn create(&self, csv: &ClusterServiceVersion) -> ClusterServiceVersion {
        self.csvs()
            .create(&PostParams::default(), csv)
            .await
            .expect("create ClusterServiceVersion")
    }
}

/// Helper to set up test infrastructure
/// Returns a TestContext that keeps the operator alive for the test duration
async fn setup(prefix: &str) -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,kube=warn,olm_operator=debug")
        .with_test_writer()
        .try_init();

    let cluster = SharedTestCluster::get()
        .await
        .expect("Failed to get cluster");

    ensure_crds_installed(&cluster)
        .await
        .expect("Failed to install CRDs");

    let client = cluster.new_client().await.expect("Failed to create client");
    let ns = TestNamespace::create(client.clone(), prefix)
        .await
        .expect("create ns");
    let operator = ScopedOperator::start(client.clone(), ns.name()).await;

    TestContext {
        client,
        ns,
        _operator: operator,
        _cluster: cluster,
    }
}

/// Wait for a resource to exist with retry
async fn wait_for_resource<T>(api: &Api<T>, name: &str, timeout: Duration) -> Result<T, String>
where
    T: Clone + std::fmt::Debug + serde::de::DeserializeOwned + kube::Resource,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match api.get(name).await {
            Ok(resource) => return Ok(resource),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(format!("Timeout waiting for {}", name));
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Err(e) => return Err(format!("Error getting {}: {:?}", name, e)),
        }
    }
}

// =============================================================================
// LIFECYCLE TESTS
// =============================================================================

/// Test: A CSV gets the cleanup finalizer before anything else happens
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_finalizer_added() {
    let ctx = setup("csv-fin").await;
    let csv = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    ctx.create(&csv).await;

    wait_for(&ctx.csvs(), "etcd.v1", has_finalizer(), FAST_TIMEOUT)
        .await
        .expect("finalizer should be added");

    ctx.ns.cleanup().await.ok();
}

/// Test: A missing required CRD keeps the CSV Pending with a NotPresent requirement
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_missing_crd_keeps_pending() {
    let ctx = setup("csv-req").await;
    let csv = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .requires_crd("widgets.missing.example.com", "v1", "Widget")
        .build();
    ctx.create(&csv).await;

    let pending = wait_for(
        &ctx.csvs(),
        "etcd.v1",
        has_reason(CsvPhase::Pending, CsvReason::RequirementsNotMet),
        FAST_TIMEOUT,
    )
    .await
    .expect("CSV should wait for its requirements");

    let status = pending.status.expect("status");
    let crd = status
        .requirement_status
        .iter()
        .find(|r| r.name == "widgets.missing.example.com")
        .expect("requirement status for the missing CRD");
    assert_eq!(crd.status, RequirementState::NotPresent);

    // Nothing is installed while requirements are unmet
    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ctx.ns.name());
    assert!(deployments.get_opt("etcd-operator").await.unwrap().is_none());

    ctx.ns.cleanup().await.ok();
}

/// Test: A CSV without requirements installs its Deployment
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_install_creates_deployment() {
    let ctx = setup("csv-inst").await;
    let csv = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    ctx.create(&csv).await;

    wait_for(
        &ctx.csvs(),
        "etcd.v1",
        is_in(PhaseSet::of(&[CsvPhase::Installing, CsvPhase::Succeeded])),
        FAST_TIMEOUT,
    )
    .await
    .expect("CSV should start installing");

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ctx.ns.name());
    let deployment = wait_for_resource(&deployments, "etcd-operator", FAST_TIMEOUT)
        .await
        .expect("Deployment should exist");

    let labels = deployment.metadata.labels.unwrap_or_default();
    assert_eq!(labels.get(OWNER_LABEL).map(String::as_str), Some("etcd.v1"));
    assert_eq!(
        labels.get(OWNER_NAMESPACE_LABEL).map(String::as_str),
        Some(ctx.ns.name())
    );
    let owners = deployment.metadata.owner_references.unwrap_or_default();
    assert!(owners.iter().any(|o| o.kind == "ClusterServiceVersion" && o.name == "etcd.v1"));

    ctx.ns.cleanup().await.ok();
}

/// Test: Deleting a CSV runs cleanup and releases the finalizer
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_delete_releases_finalizer() {
    let ctx = setup("csv-del").await;
    let csv = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    let created = ctx.create(&csv).await;
    let uid = created.metadata.uid.clone().expect("uid");

    wait_for(&ctx.csvs(), "etcd.v1", has_finalizer(), FAST_TIMEOUT)
        .await
        .expect("finalizer should be added");

    ctx.csvs()
        .delete("etcd.v1", &DeleteParams::default())
        .await
        .expect("delete");

    wait_for_deletion(&ctx.csvs(), "etcd.v1", &uid, FAST_TIMEOUT)
        .await
        .expect("CSV should be removed once cleanup finishes");

    ctx.ns.cleanup().await.ok();
}

// =============================================================================
// REPLACEMENT TESTS
// =============================================================================

/// Test: A newer CSV replacing an installed one supersedes it
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_successor_moves_predecessor_to_replacing() {
    let ctx = setup("csv-upg").await;
    let v1 = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    ctx.create(&v1).await;

    wait_for(
        &ctx.csvs(),
        "etcd.v1",
        is_in(PhaseSet::of(&[CsvPhase::Installing, CsvPhase::Succeeded])),
        FAST_TIMEOUT,
    )
    .await
    .expect("v1 should start installing");

    let v2 = CsvBuilder::new("etcd.v2", ctx.ns.name())
        .replaces("etcd.v1")
        .with_deployment("etcd-operator-v2", "default")
        .build();
    ctx.create(&v2).await;

    wait_for(
        &ctx.csvs(),
        "etcd.v1",
        has_reason(CsvPhase::Replacing, CsvReason::BeingReplaced),
        FAST_TIMEOUT,
    )
    .await
    .expect("v1 should be superseded by v2");

    ctx.ns.cleanup().await.ok();
}

/// Test: The later of two CSVs replacing the same predecessor fails with a conflict
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_competing_replacements_conflict() {
    let ctx = setup("csv-cfl").await;
    let v1 = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    ctx.create(&v1).await;

    let first = CsvBuilder::new("etcd.v2", ctx.ns.name())
        .replaces("etcd.v1")
        .with_deployment("etcd-operator-v2", "default")
        .build();
    ctx.create(&first).await;

    // creationTimestamp has second resolution
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let second = CsvBuilder::new("etcd.v2-hotfix", ctx.ns.name())
        .replaces("etcd.v1")
        .with_deployment("etcd-operator-hotfix", "default")
        .build();
    ctx.create(&second).await;

    wait_for(
        &ctx.csvs(),
        "etcd.v2-hotfix",
        has_reason(CsvPhase::Failed, CsvReason::OwnerConflict),
        FAST_TIMEOUT,
    )
    .await
    .expect("second replacement should conflict");

    let v2 = ctx.csvs().get("etcd.v2").await.expect("get v2");
    assert_ne!(v2.status.map(|s| s.phase), Some(CsvPhase::Failed));

    ctx.ns.cleanup().await.ok();
}

/// Test: Deleting the only CSV in a namespace leaves no operator Deployment behind
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_delete_garbage_collects_deployment() {
    let ctx = setup("csv-gc").await;
    let csv = CsvBuilder::new("etcd.v1", ctx.ns.name())
        .with_deployment("etcd-operator", "default")
        .build();
    ctx.create(&csv).await;

    let deployments: Api<Deployment> = Api::namespaced(ctx.client.clone(), ctx.ns.name());
    let deployment = wait_for_resource(&deployments, "etcd-operator", FAST_TIMEOUT)
        .await
        .expect("Deployment should exist");
    let uid = deployment.metadata.uid.clone().expect("uid");

    ctx.csvs()
        .delete("etcd.v1", &DeleteParams::foreground())
        .await
        .expect("delete");

    let gone = kube::runtime::wait::await_condition(
        deployments.clone(),
        "etcd-operator",
        conditions::is_deleted(&uid),
    );
    tokio::time::timeout(FAST_TIMEOUT, gone)
        .await
        .expect("Deployment should be garbage collected")
        .expect("watch");

    ctx.ns.cleanup().await.ok();
}

// =============================================================================
// API SERVICE TESTS
// =============================================================================

/// Test: Legacy serving objects owned by the CSV are removed once the current set
/// exists; legacy objects with a foreign owner or no owner are left alone
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_legacy_api_service_resources_migrate() {
    let ctx = setup("csv-lgcy").await;
    let ns = ctx.ns.name().to_string();
    let group = format!("{}.olm.test", ns);
    let csv = CsvBuilder::new("hats.v1", &ns)
        .with_deployment("hat-server", "default")
        .owns_api_service(&group, "v1alpha1", "Hat", "hat-server")
        .build();
    let api_name = format!("v1alpha1.{}", group);

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), &ns);
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &ns);
    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), &ns);

    // owned by this CSV: migrated
    let legacy_service = Service {
        metadata: ObjectMeta {
            name: Some(legacy_service_name(&api_name)),
            labels: Some(owner_labels(&csv)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                port: 443,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };
    services
        .create(&PostParams::default(), &legacy_service)
        .await
        .expect("create legacy Service");

    // owned by an unrelated CSV: untouched
    let stranger = CsvBuilder::new("other.v1", &ns).build();
    let legacy_secret = Secret {
        metadata: ObjectMeta {
            name: Some(cert_secret_name(&api_name)),
            labels: Some(owner_labels(&stranger)),
            ..Default::default()
        },
        ..Default::default()
    };
    secrets
        .create(&PostParams::default(), &legacy_secret)
        .await
        .expect("create legacy Secret");

    // no owner at all: untouched
    let legacy_role = Role {
        metadata: ObjectMeta {
            name: Some(cert_secret_name(&api_name)),
            ..Default::default()
        },
        ..Default::default()
    };
    roles
        .create(&PostParams::default(), &legacy_role)
        .await
        .expect("create legacy Role");

    ctx.create(&csv).await;

    wait_for_resource(&services, &service_name("hat-server"), FAST_TIMEOUT)
        .await
        .expect("current Service should exist");

    let deadline = tokio::time::Instant::now() + FAST_TIMEOUT;
    while services
        .get_opt(&legacy_service_name(&api_name))
        .await
        .unwrap()
        .is_some()
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "legacy Service should be removed"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    assert!(secrets.get_opt(&cert_secret_name(&api_name)).await.unwrap().is_some());
    assert!(roles.get_opt(&cert_secret_name(&api_name)).await.unwrap().is_some());

    // an unavailable registration breaks discovery for the whole cluster
    let api_services: Api<APIService> = Api::all(ctx.client.clone());
    api_services.delete(&api_name, &DeleteParams::default()).await.ok();
    ctx.ns.cleanup().await.ok();
}

// =============================================================================
// COPIED CSV TESTS
// =============================================================================

/// Set `OLMConfig/cluster` to enable or disable copies
async fn set_copies_enabled(client: &kube::Client, enabled: bool) {
    let configs: Api<OLMConfig> = Api::all(client.clone());
    let config = OLMConfig::new(
        OLM_CONFIG_NAME,
        OLMConfigSpec {
            features: Some(Features {
                disable_copied_csvs: Some(!enabled),
            }),
        },
    );
    configs
        .patch(
            OLM_CONFIG_NAME,
            &PatchParams::apply("olm-operator-tests").force(),
            &Patch::Apply(&config),
        )
        .await
        .expect("apply OLMConfig");
}

/// Copies of `name` from `source_ns`, and how many there should be
async fn copy_counts(
    client: &kube::Client,
    source_ns: &str,
    name: &str,
    enabled: bool,
) -> (usize, usize) {
    let csvs: Api<ClusterServiceVersion> = Api::all(client.clone());
    let copies = csvs
        .list(&ListParams::default().labels(&format!("{}={}", COPIED_FROM_LABEL, source_ns)))
        .await
        .expect("list copies")
        .items
        .iter()
        .filter(|c| c.metadata.name.as_deref() == Some(name))
        .count();

    if !enabled {
        return (copies, 0);
    }
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let active = namespaces
        .list(&ListParams::default())
        .await
        .expect("list namespaces")
        .items
        .iter()
        .filter(|n| n.metadata.deletion_timestamp.is_none())
        .count();
    (copies, active - 1)
}

async fn wait_for_copies(client: &kube::Client, source_ns: &str, name: &str, enabled: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
    loop {
        let (copies, expected) = copy_counts(client, source_ns, name, enabled).await;
        if copies == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} copies, found {}",
            expected,
            copies
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Test: Disabling copies removes every copy; enabling restores one per other namespace
#[tokio::test]
#[ignore = "requires Kubernetes cluster"]
async fn test_copy_toggle() {
    let ctx = setup("csv-copy").await;
    let _copies = ScopedOperator::start_copies(ctx.client.clone()).await;
    set_copies_enabled(&ctx.client, true).await;

    let csv = CsvBuilder::new("global.v1", ctx.ns.name())
        .with_deployment("global-operator", "default")
        .supports(InstallModeType::AllNamespaces)
        .with_annotation(TARGET_NAMESPACES_ANNOTATION, "")
        .build();
    ctx.create(&csv).await;

    wait_for_copies(&ctx.client, ctx.ns.name(), "global.v1", true).await;

    set_copies_enabled(&ctx.client, false).await;
    wait_for_copies(&ctx.client, ctx.ns.name(), "global.v1", false).await;

    set_copies_enabled(&ctx.client, true).await;
    wait_for_copies(&ctx.client, ctx.ns.name(), "global.v1", true).await;

    ctx.csvs()
        .delete("global.v1", &DeleteParams::default())
        .await
        .ok();
    ctx.ns.cleanup().await.ok();
}
