//! Operator configuration read from the environment

use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    /// Restrict the ClusterServiceVersion controller to one namespace
    #[envconfig(from = "OLM_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Namespace holding the aggregated API authentication config
    #[envconfig(from = "OLM_SYSTEM_NAMESPACE", default = "kube-system")]
    pub system_namespace: String,

    /// Periodic requeue for healthy objects
    #[envconfig(from = "OLM_RESYNC_SECS", default = "30")]
    pub resync_secs: u64,

    /// Lifetime of issued serving certificates
    #[envconfig(from = "OLM_CERT_VALIDITY_DAYS", default = "730")]
    pub cert_validity_days: i64,

    /// Certificates are rotated this long before they expire
    #[envconfig(from = "OLM_CERT_MIN_FRESH_HOURS", default = "24")]
    pub cert_min_fresh_hours: i64,

    #[envconfig(from = "OLM_HEALTH_ADDR", default = "0.0.0.0:8080")]
    pub health_addr: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            system_namespace: "kube-system".to_string(),
            resync_secs: 30,
            cert_validity_days: 730,
            cert_min_fresh_hours: 24,
            health_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OperatorConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn cert_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.cert_validity_days)
    }

    /// Delay from issuance to the scheduled rotation
    pub fn cert_rotate_after(&self) -> chrono::Duration {
        self.cert_validity() - chrono::Duration::hours(self.cert_min_fresh_hours)
    }
}
