//! Typed view of the built-in `apiregistration.k8s.io/v1` APIService.
//!
//! k8s-openapi does not ship the kube-aggregator types, so the registration object is
//! derived here. It is never installed as a CRD.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use k8s_openapi::ByteString;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "apiregistration.k8s.io",
    version = "v1",
    kind = "APIService",
    plural = "apiservices",
    status = "APIServiceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceSpec {
    pub group: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,

    /// PEM bundle used to verify the serving certificate of the backing service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub ca_bundle: Option<ByteString>,

    pub group_priority_minimum: i32,
    pub version_priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    pub namespace: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<APIServiceCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct APIServiceCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl APIService {
    /// Whether the aggregator reports the backing service reachable
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
    }

    pub fn ca_bundle(&self) -> Option<&[u8]> {
        self.spec.ca_bundle.as_ref().map(|b| b.0.as_slice())
    }
}
