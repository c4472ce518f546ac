//! Image registry credential resolution
//!
//! Deployments may reference a secret holding a registry auth file; the
//! protocol handler resolves it through this capability when assembling a
//! device configuration.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Key holding the auth file content inside the referenced secret
const AUTH_FILE_KEY: &str = ".dockerconfigjson";

/// Registry credential provider
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryAuth: Send + Sync {
    /// Resolve the auth file content from the referenced secret
    async fn get_auth_file_from_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, Error>;
}

/// Credential provider reading auth files from Kubernetes secrets
pub struct KubeRegistryAuth {
    client: kube::Client,
}

impl KubeRegistryAuth {
    /// Create a provider over the given client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RegistryAuth for KubeRegistryAuth {
    async fn get_auth_file_from_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<String, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(name).await?;

        let data = secret
            .data
            .and_then(|mut d| d.remove(AUTH_FILE_KEY))
            .ok_or_else(|| {
                Error::internal(format!(
                    "secret {namespace}/{name} has no {AUTH_FILE_KEY} entry"
                ))
            })?;

        String::from_utf8(data.0).map_err(|_| {
            Error::internal(format!("auth file in {namespace}/{name} is not valid UTF-8"))
        })
    }
}
