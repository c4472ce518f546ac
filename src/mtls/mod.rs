//! mTLS trust management for the device-facing surface
//!
//! [`TlsConfig`] orchestrates the configured CA providers: it aggregates
//! their roots into the trust chain, signs the server certificate with the
//! first provider's key, builds the rustls server configuration, issues
//! registration client secrets, and exposes the two request-verification
//! policies.
//!
//! The TLS layer itself only *requires* a client certificate; deciding
//! whether that certificate is acceptable happens per-request in
//! [`verify_request`], because the registration endpoint accepts stale
//! bootstrap certificates that every other endpoint must reject.

mod provider;

pub use provider::{
    CaProvider, CaSecretProvider, KubeSecretStore, SecretStore, CA_SECRET_NAME, CLIENT_CERT_KEY,
    CLIENT_KEY_KEY,
};

#[cfg(test)]
pub use provider::MockCaProvider;
#[cfg(test)]
pub use provider::MockSecretStore;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WantsServerCert;
use rustls::{DistinguishedName, ServerConfig, SignatureScheme};
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::pki::{self, CertificateGroup, REGISTRATION_COMMON_NAME};
use crate::Error;

/// Prefix of the secrets holding issued registration client certificates
const REG_CLIENT_SECRET_PREFIX: &str = "reg-client-ca";

/// Label marking registration client secrets for operational cleanup
const REG_CLIENT_SECRET_LABEL: &str = "reg-client-ca";

/// Length of the random suffix on registration client secret names
const REG_CLIENT_SECRET_RANDOM_LEN: usize = 10;

/// Which verification policy applies to an inbound request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthType {
    /// Registration endpoint: any certificate signed by our CA, even expired
    Registration,
    /// Every other endpoint: full verification, sentinel identity excluded
    Normal,
}

/// The ordered set of CA certificates currently trusted.
///
/// Rebuilt each time the mTLS manager initializes.
#[derive(Clone, Default, Debug)]
pub struct TrustChain {
    ders: Vec<Vec<u8>>,
}

impl TrustChain {
    /// Build a chain from DER-encoded CA certificates
    pub fn new(ders: Vec<Vec<u8>>) -> Self {
        Self { ders }
    }

    /// The chain members as DER
    pub fn ders(&self) -> &[Vec<u8>] {
        &self.ders
    }

    /// Number of trusted roots
    pub fn len(&self) -> usize {
        self.ders.len()
    }

    /// True when no roots are trusted
    pub fn is_empty(&self) -> bool {
        self.ders.is_empty()
    }
}

/// Check inbound peer certificates under the given policy.
///
/// Registration policy: accept iff the peer list is non-empty and every
/// certificate chains to some trust-chain member by signature alone -
/// expiry is deliberately ignored so that re-registration works with a
/// stale bootstrap certificate.
///
/// Normal policy: additionally require the validity window and reject the
/// sentinel registration identity outright.
///
/// Fails closed: an empty peer list or unparseable certificate is a reject.
pub fn verify_request(peer_certs: &[Vec<u8>], auth: AuthType, chain: &TrustChain) -> bool {
    if peer_certs.is_empty() {
        return false;
    }

    for der in peer_certs {
        let outcome = match pki::verify_certificate(der, chain.ders()) {
            Ok(outcome) => outcome,
            Err(_) => return false,
        };

        if !outcome.signed_by_chain {
            return false;
        }

        if auth == AuthType::Normal {
            if outcome.common_name.as_deref() == Some(REGISTRATION_COMMON_NAME) {
                return false;
            }
            if !outcome.within_validity {
                return false;
            }
        }
    }

    true
}

/// Capability to sign device CSRs against the fleet CA.
///
/// The protocol handler depends on this alone, not on the whole manager.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceCertificateSigner: Send + Sync {
    /// Sign the CSR with the device id as subject; returns the PEM cert
    async fn sign_device_csr(&self, csr_pem: &str, device_id: &str) -> Result<String, Error>;
}

/// mTLS manager for the device-facing server
pub struct TlsConfig {
    providers: Vec<Arc<dyn CaProvider>>,
    store: Arc<dyn SecretStore>,
    domains: Vec<String>,
    localhost_enabled: bool,
}

impl TlsConfig {
    /// Create a manager with the default secret-backed CA provider
    pub fn new(store: Arc<dyn SecretStore>, domains: Vec<String>, localhost_enabled: bool) -> Self {
        let secret_provider: Arc<dyn CaProvider> =
            Arc::new(CaSecretProvider::new(store.clone()));
        Self {
            providers: vec![secret_provider],
            store,
            domains,
            localhost_enabled,
        }
    }

    /// Replace the provider list. Extension point for future providers,
    /// and the seam tests use to inject mocks.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn CaProvider>>) -> Self {
        self.providers = providers;
        self
    }

    /// Initialize the trust material and build the server TLS configuration.
    ///
    /// Aggregates every provider's root into the trust chain and signs the
    /// server certificate with the first provider's key. Fails when no
    /// provider yields a CA; individual provider failures are collected and
    /// logged rather than silently dropped.
    pub async fn init_certificates(&self) -> Result<(Arc<ServerConfig>, TrustChain), Error> {
        if self.providers.is_empty() {
            return Err(Error::internal("no CA provider configured"));
        }

        let mut failures = Vec::new();
        let mut ca_certs = Vec::new();
        for provider in &self.providers {
            match provider.get_ca_certificate().await {
                Ok(ca) => ca_certs.push(ca),
                Err(e) => {
                    failures.push(format!(
                        "cannot get CA certificate for provider {}: {}",
                        provider.name(),
                        e
                    ));
                }
            }
        }

        if ca_certs.is_empty() {
            return Err(Error::internal(format!(
                "cannot get any CA certificate: {}",
                failures.join("; ")
            )));
        }
        for failure in &failures {
            warn!(%failure, "CA provider failed, continuing with the rest");
        }

        let mut chain_ders = Vec::with_capacity(ca_certs.len());
        for ca in &ca_certs {
            chain_ders.push(ca.cert_der()?);
        }
        let chain = TrustChain::new(chain_ders);

        // Certificates are always signed by the first provider's CA.
        let server_cert =
            pki::generate_server_certificate(&self.domains, self.localhost_enabled, &ca_certs[0])?;

        let config = build_server_config(&server_cert)?;
        info!(
            roots = chain.len(),
            domains = ?self.domains,
            "mTLS server configuration initialized"
        );
        Ok((Arc::new(config), chain))
    }

    /// Issue one registration client certificate and persist it to a
    /// uniquely named, labeled secret for operational bootstrap use.
    ///
    /// Returns the secret name.
    pub async fn create_registration_client(&self) -> Result<String, Error> {
        let provider = self
            .providers
            .first()
            .ok_or_else(|| Error::internal("no CA provider configured"))?;

        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(REG_CLIENT_SECRET_RANDOM_LEN)
            .map(char::from)
            .collect();
        let name = format!("{}-{}", REG_CLIENT_SECRET_PREFIX, suffix.to_lowercase());

        let data = provider.create_registration_certificate(&name).await?;

        let labels: BTreeMap<String, String> =
            [(REG_CLIENT_SECRET_LABEL.to_string(), "true".to_string())].into();
        self.store.create(&name, labels, data).await?;

        info!(secret = %name, "registration client certificate created");
        Ok(name)
    }
}

#[async_trait]
impl DeviceCertificateSigner for TlsConfig {
    async fn sign_device_csr(&self, csr_pem: &str, device_id: &str) -> Result<String, Error> {
        let provider = self
            .providers
            .first()
            .ok_or_else(|| Error::internal("no CA provider configured"))?;
        let ca = provider.get_ca_certificate().await?;
        Ok(pki::sign_device_csr(&ca, csr_pem, device_id)?)
    }
}

fn build_server_config(server_cert: &CertificateGroup) -> Result<ServerConfig, Error> {
    let cert_chain = vec![CertificateDer::from(server_cert.cert_der()?)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(pki::parse_pem(
        server_cert.key_pem(),
    )?));

    let builder = server_config_builder()?;
    builder
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::internal(format!("cannot build server TLS config: {}", e)))
}

fn server_config_builder(
) -> Result<rustls::ConfigBuilder<ServerConfig, WantsServerCert>, Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(AcceptAnyClientCert {
        supported: provider.signature_verification_algorithms,
    });
    ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::internal(format!("cannot select TLS 1.3: {}", e)))
        .map(|b| b.with_client_cert_verifier(verifier))
}

/// Require a client certificate at the handshake but accept any.
///
/// Chain verification happens per-request in [`verify_request`] where the
/// policy (registration vs. normal) is known; the handshake-level verifier
/// still checks proof of key possession via the TLS signature.
#[derive(Debug)]
struct AcceptAnyClientCert {
    supported: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::issue_test_client_cert;

    fn two_ca_chain() -> (CertificateGroup, CertificateGroup, TrustChain) {
        let first = pki::generate_ca("First CA").unwrap();
        let second = pki::generate_ca("Second CA").unwrap();
        let chain = TrustChain::new(vec![
            first.cert_der().unwrap(),
            second.cert_der().unwrap(),
        ]);
        (first, second, chain)
    }

    #[test]
    fn empty_peer_list_fails_closed() {
        let (_, _, chain) = two_ca_chain();
        assert!(!verify_request(&[], AuthType::Registration, &chain));
        assert!(!verify_request(&[], AuthType::Normal, &chain));
    }

    #[test]
    fn registration_policy_accepts_chain_signed_cert() {
        let (first, _, chain) = two_ca_chain();
        let cert = issue_test_client_cert(&first, REGISTRATION_COMMON_NAME, 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(verify_request(&peers, AuthType::Registration, &chain));
    }

    #[test]
    fn registration_policy_accepts_latest_chain_member() {
        let (_, second, chain) = two_ca_chain();
        let cert = issue_test_client_cert(&second, REGISTRATION_COMMON_NAME, 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(verify_request(&peers, AuthType::Registration, &chain));
    }

    #[test]
    fn registration_policy_rejects_foreign_ca() {
        let (_, _, chain) = two_ca_chain();
        let foreign = pki::generate_ca("Foreign CA").unwrap();
        let cert = issue_test_client_cert(&foreign, REGISTRATION_COMMON_NAME, 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(!verify_request(&peers, AuthType::Registration, &chain));
    }

    #[test]
    fn registration_policy_ignores_expiry() {
        let (_, second, chain) = two_ca_chain();
        let expired = issue_test_client_cert(&second, "stale-bootstrap", -1);
        let peers = vec![expired.cert_der().unwrap()];
        assert!(verify_request(&peers, AuthType::Registration, &chain));
    }

    #[test]
    fn normal_policy_rejects_registration_identity() {
        let (first, _, chain) = two_ca_chain();
        let cert = issue_test_client_cert(&first, REGISTRATION_COMMON_NAME, 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(!verify_request(&peers, AuthType::Normal, &chain));
    }

    #[test]
    fn normal_policy_accepts_valid_device_cert() {
        let (first, _, chain) = two_ca_chain();
        let cert = issue_test_client_cert(&first, "device-7f3a", 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(verify_request(&peers, AuthType::Normal, &chain));
    }

    #[test]
    fn normal_policy_accepts_any_chain_position() {
        let (_, second, chain) = two_ca_chain();
        let cert = issue_test_client_cert(&second, "device-7f3a", 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(verify_request(&peers, AuthType::Normal, &chain));
    }

    #[test]
    fn normal_policy_rejects_foreign_ca() {
        let (_, _, chain) = two_ca_chain();
        let foreign = pki::generate_ca("Foreign CA").unwrap();
        let cert = issue_test_client_cert(&foreign, "device-7f3a", 365);
        let peers = vec![cert.cert_der().unwrap()];
        assert!(!verify_request(&peers, AuthType::Normal, &chain));
    }

    #[test]
    fn normal_policy_rejects_expired_cert() {
        let (first, _, chain) = two_ca_chain();
        let expired = issue_test_client_cert(&first, "device-7f3a", -1);
        let peers = vec![expired.cert_der().unwrap()];
        assert!(!verify_request(&peers, AuthType::Normal, &chain));
    }

    #[test]
    fn garbage_peer_cert_fails_closed() {
        let (_, _, chain) = two_ca_chain();
        let peers = vec![b"not a certificate".to_vec()];
        assert!(!verify_request(&peers, AuthType::Registration, &chain));
        assert!(!verify_request(&peers, AuthType::Normal, &chain));
    }

    fn mock_provider_with_ca(ca: CertificateGroup) -> MockCaProvider {
        let mut provider = MockCaProvider::new();
        provider.expect_name().return_const("mock".to_string());
        provider
            .expect_get_ca_certificate()
            .returning(move || Ok(ca.clone()));
        provider
    }

    fn failing_provider() -> MockCaProvider {
        let mut provider = MockCaProvider::new();
        provider.expect_name().return_const("broken".to_string());
        provider
            .expect_get_ca_certificate()
            .returning(|| Err(Error::internal("secret store unavailable")));
        provider
    }

    #[tokio::test]
    async fn init_builds_config_and_chain() {
        let ca = pki::generate_ca("Init CA").unwrap();
        let tls = TlsConfig::new(
            Arc::new(MockSecretStore::new()),
            vec!["fleet.example.com".to_string()],
            true,
        )
        .with_providers(vec![Arc::new(mock_provider_with_ca(ca))]);

        let (_config, chain) = tls.init_certificates().await.unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn init_tolerates_partial_provider_failure() {
        let ca = pki::generate_ca("Init CA").unwrap();
        let tls = TlsConfig::new(Arc::new(MockSecretStore::new()), vec![], false)
            .with_providers(vec![
                Arc::new(failing_provider()),
                Arc::new(mock_provider_with_ca(ca)),
            ]);

        let (_, chain) = tls.init_certificates().await.unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[tokio::test]
    async fn init_fails_when_no_provider_succeeds() {
        let tls = TlsConfig::new(Arc::new(MockSecretStore::new()), vec![], false)
            .with_providers(vec![Arc::new(failing_provider())]);

        let err = tls.init_certificates().await.unwrap_err();
        assert!(err.to_string().contains("cannot get any CA certificate"));
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn init_fails_with_zero_providers() {
        let tls =
            TlsConfig::new(Arc::new(MockSecretStore::new()), vec![], false).with_providers(vec![]);
        assert!(tls.init_certificates().await.is_err());
    }

    #[tokio::test]
    async fn registration_client_secret_is_labeled_and_prefixed() {
        let ca = pki::generate_ca("Reg CA").unwrap();

        let mut provider = MockCaProvider::new();
        provider.expect_name().return_const("mock".to_string());
        {
            let ca = ca.clone();
            provider
                .expect_create_registration_certificate()
                .times(1)
                .returning(move |_| {
                    let cert = pki::generate_registration_certificate(&ca).unwrap();
                    Ok([
                        (
                            CLIENT_CERT_KEY.to_string(),
                            cert.cert_pem().as_bytes().to_vec(),
                        ),
                        (
                            CLIENT_KEY_KEY.to_string(),
                            cert.key_pem().as_bytes().to_vec(),
                        ),
                    ]
                    .into())
                });
        }

        let mut store = MockSecretStore::new();
        store
            .expect_create()
            .withf(|name, labels, data| {
                name.starts_with("reg-client-ca-")
                    && labels.get(REG_CLIENT_SECRET_LABEL).map(String::as_str) == Some("true")
                    && data.contains_key(CLIENT_CERT_KEY)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let tls = TlsConfig::new(Arc::new(store), vec![], false)
            .with_providers(vec![Arc::new(provider)]);

        let name = tls.create_registration_client().await.unwrap();
        assert!(name.starts_with(REG_CLIENT_SECRET_PREFIX));
        assert_eq!(
            name.len(),
            REG_CLIENT_SECRET_PREFIX.len() + 1 + REG_CLIENT_SECRET_RANDOM_LEN
        );
    }

    #[tokio::test]
    async fn csr_signing_goes_through_first_provider() {
        let ca = pki::generate_ca("Signer CA").unwrap();
        let tls = TlsConfig::new(Arc::new(MockSecretStore::new()), vec![], false)
            .with_providers(vec![Arc::new(mock_provider_with_ca(ca.clone()))]);

        let csr = pki::generate_test_csr("requested-name");
        let signed = tls.sign_device_csr(&csr, "kiosk-3").await.unwrap();

        let der = pki::parse_pem(&signed).unwrap();
        let cn = pki::peer_common_name(&der).unwrap();
        assert_eq!(cn.as_deref(), Some("kiosk-3"));
    }
}
