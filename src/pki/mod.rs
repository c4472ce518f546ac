//! PKI primitives for the fleet trust layer
//!
//! This module generates and signs the X.509 material behind every device
//! connection: the self-signed fleet root, the server certificate used for
//! TLS termination, short-lived registration client certificates, and
//! device certificates signed from CSRs. Devices generate their own key
//! pairs and send only CSRs - the control plane never sees a device key.
//!
//! Verification here is deliberately split into two predicates: a
//! signature-only check used by the registration policy (a stale bootstrap
//! cert must still prove it came from our CA) and a full check used for
//! every other request.

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use ::time::{Duration, OffsetDateTime};
use x509_parser::prelude::*;

/// Sentinel Common Name carried by registration client certificates.
///
/// Never a valid device identity: the normal verification policy rejects any
/// peer certificate bearing it.
pub const REGISTRATION_COMMON_NAME: &str = "registration";

/// Organization name stamped into every certificate the fleet issues
const CERT_ORGANIZATION: &str = "Corral";

/// Root CA validity in whole days (~10 years)
const CA_VALIDITY_DAYS: i64 = 3650;

/// Issued certificate validity in whole days (1 year)
const CERT_VALIDITY_DAYS: i64 = 365;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// An X.509 certificate and its private key, held as PEM.
///
/// Constructed fresh per issuance and never mutated afterwards;
/// re-issuance creates a new instance.
#[derive(Clone)]
pub struct CertificateGroup {
    cert_pem: String,
    key_pem: String,
}

impl CertificateGroup {
    fn from_issued(cert_pem: String, key: &KeyPair) -> Self {
        Self {
            cert_pem,
            key_pem: key.serialize_pem(),
        }
    }

    /// Reconstruct a certificate group from persisted PEM material,
    /// validating that both parts parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// The certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// The certificate as DER bytes
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        parse_pem(&self.cert_pem)
    }

    fn key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load key: {}", e)))
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(CERT_ORGANIZATION.to_string()),
    );
    dn
}

/// Generate the self-signed fleet root CA.
///
/// IsCA with cert-sign and digital-signature usages, both client- and
/// server-auth extended usages, ~10 year validity.
pub fn generate_ca(common_name: &str) -> Result<CertificateGroup> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e)))?;

    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
    })?;

    Ok(CertificateGroup::from_issued(cert.pem(), &key_pair))
}

fn issuer_from(ca: &CertificateGroup) -> Result<(KeyPair, String)> {
    Ok((ca.key_pair()?, ca.cert_pem.clone()))
}

fn issue_signed(params: CertificateParams, ca: &CertificateGroup) -> Result<CertificateGroup> {
    let (ca_key, ca_cert_pem) = issuer_from(ca)?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate key: {}", e)))?;

    let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;

    Ok(CertificateGroup::from_issued(cert.pem(), &key_pair))
}

/// Generate the server certificate used for device-facing TLS termination.
///
/// SANs are the configured domain names plus the loopback addresses when
/// enabled. The wildcard Common Name matches nothing by itself; clients
/// match on SANs.
pub fn generate_server_certificate(
    domains: &[String],
    localhost_enabled: bool,
    ca: &CertificateGroup,
) -> Result<CertificateGroup> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name("*");

    let mut sans = Vec::new();
    for domain in domains {
        let name = Ia5String::try_from(domain.clone())
            .map_err(|e| PkiError::ParseError(format!("invalid SAN domain {}: {}", domain, e)))?;
        sans.push(SanType::DnsName(name));
    }
    if localhost_enabled {
        sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        sans.push(SanType::IpAddress(IpAddr::V6(Ipv6Addr::LOCALHOST)));
    }
    params.subject_alt_names = sans;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

    issue_signed(params, ca)
}

/// Generate a registration client certificate.
///
/// Carries the fixed sentinel Common Name so it can never pass the normal
/// verification policy, 1-year validity.
pub fn generate_registration_certificate(ca: &CertificateGroup) -> Result<CertificateGroup> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(REGISTRATION_COMMON_NAME);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

    issue_signed(params, ca)
}

/// Sign a device CSR and return the signed certificate in PEM format.
///
/// The subject is overridden so the certificate binds to the device id the
/// control plane authorized, not whatever the CSR asked for.
pub fn sign_device_csr(
    ca: &CertificateGroup,
    csr_pem: &str,
    device_id: &str,
) -> Result<String> {
    let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

    csr_params.params.distinguished_name = distinguished_name(device_id);
    csr_params.params.is_ca = IsCa::NoCa;
    csr_params.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    csr_params.params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];

    let now = OffsetDateTime::now_utc();
    csr_params.params.not_before = now;
    csr_params.params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);

    let (ca_key, ca_cert_pem) = issuer_from(ca)?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
    })?;

    Ok(signed_cert.pem())
}

/// What a single peer certificate looks like against a trust chain
#[derive(Debug, Clone)]
pub struct VerificationOutcome {
    /// Subject Common Name, when one is present
    pub common_name: Option<String>,
    /// The certificate's signature checks out against some chain member
    pub signed_by_chain: bool,
    /// The current time falls inside the certificate's validity window
    pub within_validity: bool,
}

/// Inspect one peer certificate against the CA chain.
///
/// Signature and validity are reported separately because the registration
/// policy accepts expired certificates while the normal policy does not.
pub fn verify_certificate(cert_der: &[u8], ca_ders: &[Vec<u8>]) -> Result<VerificationOutcome> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse peer cert: {}", e)))?;

    let mut signed_by_chain = false;
    for ca_der in ca_ders {
        let (_, ca_cert) = X509Certificate::from_der(ca_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        if cert.verify_signature(Some(ca_cert.public_key())).is_ok() {
            signed_by_chain = true;
            break;
        }
    }

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string());

    Ok(VerificationOutcome {
        common_name,
        signed_by_chain,
        within_validity: cert.validity().is_valid(),
    })
}

/// Extract the subject Common Name from a DER certificate.
///
/// Used to derive the request principal from the verified client
/// certificate.
pub fn peer_common_name(cert_der: &[u8]) -> Result<Option<String>> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse peer cert: {}", e)))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn.to_string());
    Ok(cn)
}

/// Issue a client certificate with an arbitrary subject and validity,
/// for exercising the verification policies in tests.
#[cfg(test)]
pub(crate) fn issue_test_client_cert(
    ca: &CertificateGroup,
    common_name: &str,
    valid_days: i64,
) -> CertificateGroup {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let now = OffsetDateTime::now_utc();
    // valid_days <= 0 produces an already-expired certificate
    params.not_before = now - Duration::days(30);
    params.not_after = now + Duration::days(valid_days);

    issue_signed(params, ca).expect("test cert issuance")
}

/// Generate a key pair and CSR with the given subject, as a device would.
#[cfg(test)]
pub(crate) fn generate_test_csr(common_name: &str) -> String {
    let key_pair = KeyPair::generate().expect("test key generation");
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    let csr = params
        .serialize_request(&key_pair)
        .expect("test CSR generation");
    csr.pem().expect("test CSR encoding")
}
