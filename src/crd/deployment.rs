//! EdgeDeployment Custom Resource Definition
//!
//! An EdgeDeployment declares a workload and the rule for which devices run
//! it: either a label selector over the device population or one directly
//! named device.

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Specification for an EdgeDeployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "EdgeDeployment",
    plural = "edgedeployments",
    shortname = "edp",
    namespaced,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Device","type":"string","jsonPath":".spec.device"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeploymentSpec {
    /// Label selector over devices; every matching device runs the workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<LabelSelector>,

    /// Directly named target device, as an alternative to the selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Workload packaging type
    #[serde(rename = "type", default)]
    pub workload_type: WorkloadType,

    /// The workload itself
    #[serde(default)]
    pub pod: Pod,

    /// Host paths synchronized between device and workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataConfiguration>,

    /// Image registry access configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<ImageRegistriesConfiguration>,
}

/// Workload packaging supported on devices
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadType {
    /// A pod of one or more containers
    #[default]
    Pod,
}

/// Pod workload wrapper
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    /// The pod specification shipped to the device verbatim
    #[serde(default)]
    pub spec: PodSpec,
}

/// Data synchronization configuration for a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataConfiguration {
    /// Source/target path pairs to keep in sync
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<DataPath>,
}

/// One synchronized path pair
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataPath {
    /// Path on the device
    pub source: String,
    /// Path inside the workload
    pub target: String,
}

/// Image registry access for a workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistriesConfiguration {
    /// Secret holding the registry auth file to ship to the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_file_secret: Option<ObjectRef>,
}

/// Reference to a namespaced object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// Object name
    pub name: String,
    /// Object namespace; the referring object's namespace when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl EdgeDeploymentSpec {
    /// Validate the deployment specification.
    ///
    /// Exactly one of `deviceSelector` and `device` must determine the
    /// target device set.
    pub fn validate(&self) -> Result<(), Error> {
        match (&self.device_selector, &self.device) {
            (Some(_), Some(_)) => Err(Error::invalid_input(
                "deployment cannot set both 'deviceSelector' and 'device'",
            )),
            (None, None) => Err(Error::invalid_input(
                "deployment must set one of 'deviceSelector' or 'device'",
            )),
            _ => Ok(()),
        }
    }
}
