use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Name of the singleton OLMConfig the controller reads
pub const OLM_CONFIG_NAME: &str = "cluster";

/// Cluster-wide controller configuration
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[kube(
    group = "operators.coreos.com",
    version = "v1",
    kind = "OLMConfig",
    plural = "olmconfigs",
    status = "OLMConfigStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct OLMConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Features {
    /// Stop mirroring AllNamespaces ClusterServiceVersions into every namespace
    #[serde(default, rename = "disableCopiedCSVs", skip_serializing_if = "Option::is_none")]
    pub disable_copied_csvs: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OLMConfigStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl OLMConfig {
    /// Whether this is the singleton the controller reads
    pub fn is_singleton(&self) -> bool {
        self.metadata.name.as_deref() == Some(OLM_CONFIG_NAME)
    }

    /// Field selector restricting watches to the singleton
    pub fn singleton_selector() -> String {
        format!("metadata.name={}", OLM_CONFIG_NAME)
    }

    /// Copy setting for a possibly absent singleton; absence means enabled
    pub fn copies_enabled(config: Option<&OLMConfig>) -> bool {
        config.is_none_or(OLMConfig::copied_csvs_are_enabled)
    }

    /// Copies are enabled unless explicitly disabled
    pub fn copied_csvs_are_enabled(&self) -> bool {
        !self
            .spec
            .features
            .as_ref()
            .and_then(|f| f.disable_copied_csvs)
            .unwrap_or(false)
    }
}
