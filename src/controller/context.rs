use std::sync::Arc;

use kube::{Api, Client};

use crate::config::OperatorConfig;
use crate::controller::error::Result;
use crate::controller::events::{EventPublisher, KubeEventPublisher};
use crate::crd::{OLM_CONFIG_NAME, OLMConfig};
use crate::health::HealthState;

/// Shared context for the controllers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    pub config: OperatorConfig,
    /// Health state for recording metrics
    pub health_state: Option<Arc<HealthState>>,
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let events = Arc::new(KubeEventPublisher::new(client.clone(), None));
        Self {
            client,
            config,
            health_state,
            events,
        }
    }

    /// Whether ClusterServiceVersions installed for all namespaces are mirrored.
    ///
    /// Read from `OLMConfig/cluster` on every call; a missing object means enabled.
    /// A failed read is returned so the caller requeues instead of guessing.
    pub async fn copied_resources_enabled(&self) -> Result<bool> {
        let api: Api<OLMConfig> = Api::all(self.client.clone());
        let config = api.get_opt(OLM_CONFIG_NAME).await?;
        Ok(OLMConfig::copies_enabled(config.as_ref()))
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        if let Some(ref state) = self.health_state {
            state
                .metrics
                .record_reconcile(namespace, name, duration_secs);
            state.touch_last_reconcile();
        }
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        if let Some(ref state) = self.health_state {
            state.metrics.record_error(namespace, name);
        }
    }
}
