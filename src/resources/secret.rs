use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::ClusterServiceVersion;
use crate::resources::certificate::ServingCertificate;
use crate::resources::common::{owner_reference, standard_labels};

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

/// Name of the serving certificate Secret for a Service
pub fn cert_secret_name(service_name: &str) -> String {
    format!("{}-cert", service_name)
}

/// Generate the serving certificate Secret
pub fn generate_cert_secret(
    csv: &ClusterServiceVersion,
    name: &str,
    cert: &ServingCertificate,
) -> Secret {
    let data = BTreeMap::from([
        (
            TLS_CERT_KEY.to_string(),
            ByteString(cert.cert_pem.clone().into_bytes()),
        ),
        (
            TLS_KEY_KEY.to_string(),
            ByteString(cert.key_pem.clone().into_bytes()),
        ),
        (
            CA_CERT_KEY.to_string(),
            ByteString(cert.ca_pem.clone().into_bytes()),
        ),
    ]);

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: csv.namespace(),
            labels: Some(standard_labels(csv)),
            owner_references: Some(vec![owner_reference(csv)]),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// CA bundle stored in a serving certificate Secret
pub fn secret_ca(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()?
        .get(CA_CERT_KEY)
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
}
