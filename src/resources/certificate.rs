//! Serving certificates for aggregated API services
//!
//! Each Deployment that serves owned API services gets its own self-signed CA.
//! A serving certificate for the Deployment's Service is signed by that CA, and the CA
//! is published as the `caBundle` of every APIService the Deployment serves. The
//! SHA-256 of the CA PEM is stamped on the pod template so a rotation rolls the pods.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Organization written into issued certificates
const ORGANIZATION: &str = "olm-operator";

#[derive(Debug, Error)]
pub enum CertError {
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    #[error("invalid DNS name '{0}'")]
    InvalidDnsName(String),
}

pub type Result<T> = std::result::Result<T, CertError>;

/// PEM material for one Deployment's API services
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServingCertificate {
    pub ca_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

impl ServingCertificate {
    pub fn ca_hash(&self) -> String {
        ca_hash(self.ca_pem.as_bytes())
    }
}

/// Hex SHA-256 of a CA bundle
pub fn ca_hash(ca_pem: &[u8]) -> String {
    hex::encode(Sha256::digest(ca_pem))
}

/// Names a Service is reachable under from inside the cluster
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{}.{}", service, namespace),
        format!("{}.{}.svc", service, namespace),
        format!("{}.{}.svc.cluster.local", service, namespace),
    ]
}

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Issue a fresh CA and a serving certificate for `service` in `namespace`
pub fn issue(service: &str, namespace: &str, validity_days: i64) -> Result<ServingCertificate> {
    let (not_before, not_after) = validity(validity_days);

    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = distinguished_name(&format!("olm-selfsigned-{}", service));
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_key = KeyPair::generate()
        .map_err(|e| CertError::KeyGenerationFailed(format!("CA key: {}", e)))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| CertError::CertificateGenerationFailed(format!("CA: {}", e)))?;
    let ca_pem = ca_cert.pem();

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(service);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    params.not_before = not_before;
    params.not_after = not_after;
    params.subject_alt_names = service_dns_names(service, namespace)
        .into_iter()
        .map(|name| {
            Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|_| CertError::InvalidDnsName(name))
        })
        .collect::<Result<Vec<_>>>()?;

    let key = KeyPair::generate()
        .map_err(|e| CertError::KeyGenerationFailed(format!("serving key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_pem, &ca_key)
        .map_err(|e| CertError::CertificateGenerationFailed(format!("issuer: {}", e)))?;
    let cert = params
        .signed_by(&key, &issuer)
        .map_err(|e| CertError::CertificateGenerationFailed(format!("serving cert: {}", e)))?;

    Ok(ServingCertificate {
        ca_pem,
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}
