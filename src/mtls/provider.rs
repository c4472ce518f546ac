//! CA providers: where the fleet root of trust lives
//!
//! The interface exists to leave room for future certificate providers
//! (Vault, ACME) without touching the callers; today exactly one
//! implementation backs the CA key pair with a persisted secret.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::pki::{self, CertificateGroup};
use crate::Error;

/// Name of the secret holding the fleet root CA material
pub const CA_SECRET_NAME: &str = "corral-ca";

/// Key of the CA certificate inside the CA secret
pub const CA_CERT_KEY: &str = "ca.crt";

/// Key of the CA private key inside the CA secret
pub const CA_KEY_KEY: &str = "ca.key";

/// Key of the client certificate inside a registration secret
pub const CLIENT_CERT_KEY: &str = "client.crt";

/// Key of the client private key inside a registration secret
pub const CLIENT_KEY_KEY: &str = "client.key";

/// Key/value secret store used to persist CA and registration material
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret's data by name; Ok(None) when it does not exist
    async fn get(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;

    /// Create a secret with the given labels and data
    async fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error>;
}

/// Secret store backed by the Kubernetes API in a fixed namespace
pub struct KubeSecretStore {
    secrets: Api<Secret>,
    namespace: String,
}

impl KubeSecretStore {
    /// Create a store scoped to the given namespace
    pub fn new(client: kube::Client, namespace: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, name: &str) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        match self.secrets.get(name).await {
            Ok(secret) => Ok(Some(
                secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, ByteString(v))| (k, v))
                    .collect(),
            )),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        data: BTreeMap<String, Vec<u8>>,
    ) -> Result<(), Error> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: (!labels.is_empty()).then_some(labels),
                ..Default::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            ..Default::default()
        };
        self.secrets.create(&PostParams::default(), &secret).await?;
        Ok(())
    }
}

/// A source of CA material and registration certificates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CaProvider: Send + Sync {
    /// Provider name, for error reporting
    fn name(&self) -> String;

    /// The current CA cert+key bundle, created and persisted on first call
    async fn get_ca_certificate(&self) -> Result<CertificateGroup, Error>;

    /// Issue a registration client certificate, returned as secret data
    async fn create_registration_certificate(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error>;
}

/// CA provider persisting the root key pair in a secret, lazily creating it
pub struct CaSecretProvider {
    store: Arc<dyn SecretStore>,
}

impl CaSecretProvider {
    /// Create a provider over the given secret store
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    fn parse_ca(data: &BTreeMap<String, Vec<u8>>) -> Result<CertificateGroup, Error> {
        let cert = data
            .get(CA_CERT_KEY)
            .ok_or_else(|| Error::internal("CA secret is missing ca.crt"))?;
        let key = data
            .get(CA_KEY_KEY)
            .ok_or_else(|| Error::internal("CA secret is missing ca.key"))?;

        let cert_pem = String::from_utf8(cert.clone())
            .map_err(|_| Error::internal("CA certificate is not valid UTF-8"))?;
        let key_pem = String::from_utf8(key.clone())
            .map_err(|_| Error::internal("CA key is not valid UTF-8"))?;

        Ok(CertificateGroup::from_pem(&cert_pem, &key_pem)?)
    }
}

#[async_trait]
impl CaProvider for CaSecretProvider {
    fn name(&self) -> String {
        "secret".to_string()
    }

    async fn get_ca_certificate(&self) -> Result<CertificateGroup, Error> {
        if let Some(data) = self.store.get(CA_SECRET_NAME).await? {
            debug!(secret = CA_SECRET_NAME, "loaded existing CA");
            return Self::parse_ca(&data);
        }

        info!(secret = CA_SECRET_NAME, "no CA secret found, bootstrapping");
        let ca = pki::generate_ca("Corral Fleet CA")?;

        let data: BTreeMap<String, Vec<u8>> = [
            (CA_CERT_KEY.to_string(), ca.cert_pem().as_bytes().to_vec()),
            (CA_KEY_KEY.to_string(), ca.key_pem().as_bytes().to_vec()),
        ]
        .into();

        match self.store.create(CA_SECRET_NAME, BTreeMap::new(), data).await {
            Ok(()) => Ok(ca),
            // A concurrent creator winning the race is an acceptable CA:
            // discard ours and use theirs.
            Err(e) if e.is_conflict() => {
                debug!("lost CA creation race, using the winner's CA");
                let data = self
                    .store
                    .get(CA_SECRET_NAME)
                    .await?
                    .ok_or_else(|| Error::internal("CA secret vanished after conflict"))?;
                Self::parse_ca(&data)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_registration_certificate(
        &self,
        name: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let ca = self.get_ca_certificate().await?;
        let cert = pki::generate_registration_certificate(&ca)?;

        debug!(name, "issued registration client certificate");
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::REGISTRATION_COMMON_NAME;

    fn ca_secret_data() -> BTreeMap<String, Vec<u8>> {
        let ca = pki::generate_ca("Existing CA").unwrap();
        [
            (CA_CERT_KEY.to_string(), ca.cert_pem().as_bytes().to_vec()),
            (CA_KEY_KEY.to_string(), ca.key_pem().as_bytes().to_vec()),
        ]
        .into()
    }

    #[tokio::test]
    async fn existing_ca_is_loaded_without_create() {
        let mut store = MockSecretStore::new();
        store
            .expect_get()
            .withf(|name| name == CA_SECRET_NAME)
            .times(1)
            .returning(|_| Ok(Some(ca_secret_data())));
        store.expect_create().times(0);

        let provider = CaSecretProvider::new(Arc::new(store));
        let ca = provider.get_ca_certificate().await.unwrap();
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
    }

    #[tokio::test]
    async fn missing_ca_is_bootstrapped_and_persisted() {
        let mut store = MockSecretStore::new();
        store.expect_get().times(1).returning(|_| Ok(None));
        store
            .expect_create()
            .withf(|name, labels, data| {
                name == CA_SECRET_NAME
                    && labels.is_empty()
                    && data.contains_key(CA_CERT_KEY)
                    && data.contains_key(CA_KEY_KEY)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let provider = CaSecretProvider::new(Arc::new(store));
        let ca = provider.get_ca_certificate().await.unwrap();
        assert!(ca.key_pem().contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn creation_race_uses_the_winners_ca() {
        let mut store = MockSecretStore::new();
        let mut calls = 0u32;
        store.expect_get().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Ok(None)
            } else {
                Ok(Some(ca_secret_data()))
            }
        });
        store
            .expect_create()
            .times(1)
            .returning(|_, _, _| Err(Error::Conflict("already exists".to_string())));

        let provider = CaSecretProvider::new(Arc::new(store));
        assert!(provider.get_ca_certificate().await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_ca_secret_is_an_error() {
        let mut store = MockSecretStore::new();
        store.expect_get().returning(|_| {
            Ok(Some(
                [(CA_CERT_KEY.to_string(), b"garbage".to_vec())].into(),
            ))
        });

        let provider = CaSecretProvider::new(Arc::new(store));
        assert!(provider.get_ca_certificate().await.is_err());
    }

    #[tokio::test]
    async fn registration_certificate_data_carries_sentinel_identity() {
        let mut store = MockSecretStore::new();
        store.expect_get().returning(|_| Ok(Some(ca_secret_data())));

        let provider = CaSecretProvider::new(Arc::new(store));
        let data = provider
            .create_registration_certificate("reg-client-ca-abc")
            .await
            .unwrap();

        let cert_pem = String::from_utf8(data.get(CLIENT_CERT_KEY).unwrap().clone()).unwrap();
        let der = pki::parse_pem(&cert_pem).unwrap();
        let cn = pki::peer_common_name(&der).unwrap();
        assert_eq!(cn.as_deref(), Some(REGISTRATION_COMMON_NAME));
        assert!(data.contains_key(CLIENT_KEY_KEY));
    }
}
