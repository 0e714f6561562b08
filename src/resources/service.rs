//! Service generation for Deployments serving aggregated API services
//!
//! The API server always dials port 443; the Service forwards it to the container
//! port declared in the APIService description.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::ClusterServiceVersion;
use crate::resources::common::{owner_reference, standard_labels};

/// Port the API server uses to reach aggregated API services
pub const SERVICE_PORT: i32 = 443;

/// Name of the Service fronting a serving Deployment
pub fn service_name(deployment_name: &str) -> String {
    format!("{}-service", deployment_name)
}

/// Name used by earlier releases: the API service name with dots replaced
pub fn legacy_service_name(api_service_name: &str) -> String {
    api_service_name.replace('.', "-")
}

/// Generate the Service for `deployment_name`
///
/// `selector` is the Deployment's pod selector so the Service follows whatever the
/// strategy declared.
pub fn generate_api_service_service(
    csv: &ClusterServiceVersion,
    deployment_name: &str,
    selector: BTreeMap<String, String>,
    container_port: i32,
) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(service_name(deployment_name)),
            namespace: csv.namespace(),
            labels: Some(standard_labels(csv)),
            owner_references: Some(vec![owner_reference(csv)]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(container_port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether an existing Service already routes to `container_port` with `selector`
pub fn service_matches(
    existing: &Service,
    selector: &BTreeMap<String, String>,
    container_port: i32,
) -> bool {
    let Some(spec) = existing.spec.as_ref() else {
        return false;
    };
    let port_ok = spec.ports.as_ref().is_some_and(|ports| {
        ports.iter().any(|p| {
            p.port == SERVICE_PORT && p.target_port == Some(IntOrString::Int(container_port))
        })
    });
    port_ok && spec.selector.as_ref() == Some(selector)
}
