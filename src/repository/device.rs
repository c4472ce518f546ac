//! EdgeDevice repository

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde_json::json;

#[cfg(test)]
use mockall::automock;

use super::{metadata_merge_patch, selector_string};
use crate::crd::{self, EdgeDevice};
use crate::Error;

/// Store access for EdgeDevice objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Read one device; `Error::NotFound` when absent
    async fn read(&self, name: &str, namespace: &str) -> Result<EdgeDevice, Error>;

    /// List devices matching the label selector
    async fn list_for_selector(
        &self,
        selector: &LabelSelector,
        namespace: &str,
    ) -> Result<Vec<EdgeDevice>, Error>;

    /// Create a device
    async fn create(&self, device: &EdgeDevice) -> Result<(), Error>;

    /// Apply the metadata delta between two versions of a device
    async fn patch(&self, old: &EdgeDevice, new: &EdgeDevice) -> Result<(), Error>;

    /// Persist the device's status subresource
    async fn patch_status(&self, device: &EdgeDevice) -> Result<(), Error>;

    /// Remove one finalizer from the device
    async fn remove_finalizer(&self, device: &EdgeDevice, finalizer: &str) -> Result<(), Error>;
}

/// Repository backed by the Kubernetes API
pub struct KubeDeviceRepository {
    client: kube::Client,
}

impl KubeDeviceRepository {
    /// Create a repository over the given client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<EdgeDevice> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DeviceRepository for KubeDeviceRepository {
    async fn read(&self, name: &str, namespace: &str) -> Result<EdgeDevice, Error> {
        match self.api(namespace).get(name).await {
            Ok(device) => Ok(device),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(Error::not_found(format!("edgedevice {namespace}/{name}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_for_selector(
        &self,
        selector: &LabelSelector,
        namespace: &str,
    ) -> Result<Vec<EdgeDevice>, Error> {
        let params = ListParams::default().labels(&selector_string(selector));
        match self.api(namespace).list(&params).await {
            Ok(list) => Ok(list.items),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(Error::not_found(format!("edgedevices in {namespace}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, device: &EdgeDevice) -> Result<(), Error> {
        let namespace = device.namespace().unwrap_or_default();
        self.api(&namespace)
            .create(&PostParams::default(), device)
            .await?;
        Ok(())
    }

    async fn patch(&self, old: &EdgeDevice, new: &EdgeDevice) -> Result<(), Error> {
        let namespace = new.namespace().unwrap_or_default();
        let patch = metadata_merge_patch(&old.metadata, &new.metadata);
        self.api(&namespace)
            .patch(&new.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(&self, device: &EdgeDevice) -> Result<(), Error> {
        let namespace = device.namespace().unwrap_or_default();
        let patch = json!({ "status": device.status });
        self.api(&namespace)
            .patch_status(
                &device.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }

    async fn remove_finalizer(&self, device: &EdgeDevice, finalizer: &str) -> Result<(), Error> {
        if !crd::has_finalizer(&device.metadata, finalizer) {
            return Ok(());
        }
        let mut updated = device.clone();
        crd::remove_finalizer(&mut updated.metadata, finalizer);
        self.patch(device, &updated).await
    }
}
