//! EdgeDeployment repository

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use super::metadata_merge_patch;
use crate::crd::{self, EdgeDeployment};
use crate::Error;

/// Store access for EdgeDeployment objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Read one deployment; `Error::NotFound` when absent
    async fn read(&self, name: &str, namespace: &str) -> Result<EdgeDeployment, Error>;

    /// Apply the metadata delta between two versions of a deployment
    async fn patch(&self, old: &EdgeDeployment, new: &EdgeDeployment) -> Result<(), Error>;

    /// Remove one finalizer from the deployment
    async fn remove_finalizer(
        &self,
        deployment: &EdgeDeployment,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// Repository backed by the Kubernetes API
pub struct KubeDeploymentRepository {
    client: kube::Client,
}

impl KubeDeploymentRepository {
    /// Create a repository over the given client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<EdgeDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DeploymentRepository for KubeDeploymentRepository {
    async fn read(&self, name: &str, namespace: &str) -> Result<EdgeDeployment, Error> {
        match self.api(namespace).get(name).await {
            Ok(deployment) => Ok(deployment),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::not_found(format!(
                "edgedeployment {namespace}/{name}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(&self, old: &EdgeDeployment, new: &EdgeDeployment) -> Result<(), Error> {
        let namespace = new.namespace().unwrap_or_default();
        let patch = metadata_merge_patch(&old.metadata, &new.metadata);
        self.api(&namespace)
            .patch(&new.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        deployment: &EdgeDeployment,
        finalizer: &str,
    ) -> Result<(), Error> {
        if !crd::has_finalizer(&deployment.metadata, finalizer) {
            return Ok(());
        }
        let mut updated = deployment.clone();
        crd::remove_finalizer(&mut updated.metadata, finalizer);
        self.patch(deployment, &updated).await
    }
}
