pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{BackoffConfig, Context, Error, FINALIZER, Result, error_policy, reconcile};
pub use crd::{APIService, ClusterServiceVersion, CsvPhase, CsvReason, OLMConfig, PhaseSet};
pub use health::{HealthState, Metrics};

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use futures::channel::mpsc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::runtime::controller::{Action, Error as ControllerError};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::controller::{copied, olm_config, orphans};
use crate::resources::common::{OWNER_LABEL, is_copied};

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Log the outcome of one reconciliation.
///
/// NotFound errors are expected after deletion when related watch events trigger
/// reconciliation for a deleted object, so they are logged at debug level.
fn log_result<K>(
    kind: &str,
    result: std::result::Result<(ObjectRef<K>, Action), ControllerError<Error, watcher::Error>>,
) where
    K: Resource,
{
    match result {
        Ok((obj, _action)) => {
            tracing::debug!("Reconciled {}: {}", kind, obj.name);
        }
        Err(ControllerError::ReconcilerFailed(err, obj)) if err.is_not_found() => {
            tracing::debug!("{} {} no longer exists: {}", kind, obj.name, err);
        }
        Err(e) => {
            tracing::error!("{} reconciliation error: {:?}", kind, e);
        }
    }
}

/// Publish the number of ClusterServiceVersions in each phase, copies excluded
fn update_phase_gauges(store: &Store<ClusterServiceVersion>, health_state: &HealthState) {
    let mut counts: HashMap<CsvPhase, i64> = HashMap::new();
    for csv in store.state().iter().filter(|c| !is_copied(&c.metadata)) {
        *counts.entry(csv.phase()).or_default() += 1;
    }
    for phase in CsvPhase::ALL {
        health_state
            .metrics
            .set_csvs_by_phase(&phase.to_string(), counts.get(&phase).copied().unwrap_or(0));
    }
}

/// Run the ClusterServiceVersion controller (cluster-wide unless the config scopes it).
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    run_controller_scoped(client, config, health_state, namespace.as_deref()).await
}

/// Run the ClusterServiceVersion controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// Use the scoped version for integration tests to enable parallel test execution.
pub async fn run_controller_scoped(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for ClusterServiceVersion resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state.clone()));

    let csvs: Api<ClusterServiceVersion> = scoped_api(client.clone(), namespace);
    let replacing: Api<ClusterServiceVersion> = scoped_api(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);
    let secrets: Api<Secret> = scoped_api(client.clone(), namespace);
    let roles: Api<Role> = scoped_api(client.clone(), namespace);
    let role_bindings: Api<RoleBinding> = scoped_api(client.clone(), namespace);
    let service_accounts: Api<ServiceAccount> = scoped_api(client.clone(), namespace);

    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();

    let controller = Controller::new(csvs, watcher_config.clone())
        .owns(deployments, watcher_config.clone())
        .owns(services, watcher_config.clone())
        .owns(secrets, watcher_config.clone())
        .owns(roles, watcher_config.clone())
        .owns(role_bindings, watcher_config.clone())
        .owns(service_accounts, watcher_config.clone())
        // A new ClusterServiceVersion wakes the one it replaces
        .watches(replacing, watcher_config, |csv: ClusterServiceVersion| {
            let ns = csv.namespace();
            csv.spec
                .replaces
                .clone()
                .filter(|_| !is_copied(&csv.metadata))
                .map(|replaced| match ns {
                    Some(ns) => ObjectRef::new(&replaced).within(&ns),
                    None => ObjectRef::new(&replaced),
                })
        });
    let store = controller.store();

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| {
            if let Some(ref state) = health_state {
                update_phase_gauges(&store, state);
            }
            log_result("ClusterServiceVersion", result);
            futures::future::ready(())
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}

/// Run the controller maintaining copies of ClusterServiceVersions installed for all
/// namespaces.
///
/// Every ClusterServiceVersion is reconciled again when `OLMConfig` or the set of
/// namespaces changes.
pub async fn run_copy_controller(client: Client, config: OperatorConfig) {
    tracing::info!("Starting controller for copied ClusterServiceVersions");

    let ctx = Arc::new(Context::new(client.clone(), config, None));
    let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

    let olm_configs: Api<OLMConfig> = Api::all(client.clone());
    let mut config_tx = trigger_tx.clone();
    tokio::spawn(async move {
        let singleton = WatcherConfig::default().fields(&OLMConfig::singleton_selector());
        let mut changes = watcher::watcher(olm_configs, singleton)
            .touched_objects()
            .boxed();
        while let Some(change) = changes.next().await {
            match change {
                // a full channel already holds a pending trigger
                Ok(_) => {
                    let _ = config_tx.try_send(());
                }
                Err(e) => tracing::warn!("OLMConfig watch error: {}", e),
            }
        }
    });

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let mut namespace_tx = trigger_tx;
    tokio::spawn(async move {
        let mut changes = watcher::watcher(namespaces, WatcherConfig::default())
            .applied_objects()
            .boxed();
        while let Some(change) = changes.next().await {
            match change {
                Ok(_) => {
                    let _ = namespace_tx.try_send(());
                }
                Err(e) => tracing::warn!("Namespace watch error: {}", e),
            }
        }
    });

    let csvs: Api<ClusterServiceVersion> = Api::all(client);
    Controller::new(csvs, WatcherConfig::default().any_semantic())
        .reconcile_all_on(trigger_rx)
        .run(copied::reconcile, copied::error_policy, ctx)
        .for_each(|result| async move {
            log_result("copied ClusterServiceVersion", result);
        })
        .await;

    tracing::error!("Copy controller stream ended unexpectedly");
}

/// Run the controller reporting status on `OLMConfig/cluster`.
pub async fn run_config_controller(client: Client, config: OperatorConfig) {
    tracing::info!("Starting controller for OLMConfig resources");

    let ctx = Arc::new(Context::new(client.clone(), config, None));
    let olm_configs: Api<OLMConfig> = Api::all(client);

    let singleton = WatcherConfig::default().fields(&OLMConfig::singleton_selector());
    Controller::new(olm_configs, singleton.any_semantic())
        .run(olm_config::reconcile, olm_config::error_policy, ctx)
        .for_each(|result| async move {
            log_result("OLMConfig", result);
        })
        .await;

    tracing::error!("OLMConfig controller stream ended unexpectedly");
}

/// Run the controller deleting APIServices whose owning ClusterServiceVersion is gone.
pub async fn run_apiservice_gc_controller(client: Client, config: OperatorConfig) {
    tracing::info!("Starting controller for orphaned APIServices");

    let ctx = Arc::new(Context::new(client.clone(), config, None));
    let api_services: Api<APIService> = Api::all(client);

    Controller::new(api_services, WatcherConfig::default().labels(OWNER_LABEL))
        .run(orphans::reconcile, orphans::error_policy, ctx)
        .for_each(|result| async move {
            log_result("APIService", result);
        })
        .await;

    tracing::error!("APIService controller stream ended unexpectedly");
}
