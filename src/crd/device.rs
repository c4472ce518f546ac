//! EdgeDevice Custom Resource Definition
//!
//! An EdgeDevice tracks one registered edge node: the desired OS image and
//! heartbeat cadence in spec, and the device-reported hardware facts plus
//! per-deployment workload phases in status.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an EdgeDevice
///
/// Created by the protocol handler when an unknown device registers; edited
/// by operators to steer the device afterwards.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "corral.dev",
    version = "v1alpha1",
    kind = "EdgeDevice",
    plural = "edgedevices",
    shortname = "edv",
    status = "EdgeDeviceStatus",
    namespaced,
    printcolumn = r#"{"name":"OsImage","type":"string","jsonPath":".spec.osImageId"}"#,
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".status.hardware.hostname"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceSpec {
    /// Target OS image id the device should be running
    pub os_image_id: String,

    /// When the device asked to join the fleet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_time: Option<Time>,

    /// Heartbeat cadence configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatConfiguration>,
}

/// How often the device should report back
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatConfiguration {
    /// Seconds between heartbeats
    #[serde(default)]
    pub period_seconds: i64,
}

/// Status for an EdgeDevice, written by the protocol handler and the
/// deployment reconciler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeDeviceStatus {
    /// Hardware facts last reported by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,

    /// One entry per deployment currently assigned to this device
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<DeploymentStatus>,

    /// When the device last checked in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_time: Option<Time>,
}

/// Per-deployment status entry embedded in the device status
///
/// Created when the reconciler assigns the deployment; the phase is a
/// free-form lifecycle label overwritten by heartbeat reports.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Deployment name
    pub name: String,

    /// Device-reported phase, e.g. "created", "running", "failing"
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
}

/// Hardware facts reported by a device at registration and in heartbeats
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HardwareInfo {
    /// Device hostname
    #[serde(default)]
    pub hostname: String,

    /// CPU architecture, e.g. "x86_64", "aarch64"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_architecture: Option<String>,

    /// Operating system identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,

    /// Total memory in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<i64>,
}

impl EdgeDeviceStatus {
    /// Find the status entry for the named deployment
    pub fn deployment(&self, name: &str) -> Option<&DeploymentStatus> {
        self.deployments.iter().find(|d| d.name == name)
    }

    /// Find the status entry for the named deployment, mutably
    pub fn deployment_mut(&mut self, name: &str) -> Option<&mut DeploymentStatus> {
        self.deployments.iter_mut().find(|d| d.name == name)
    }

    /// Drop the status entry for the named deployment, keeping the order of
    /// the remaining entries. Returns false when no entry matched.
    pub fn remove_deployment(&mut self, name: &str) -> bool {
        let before = self.deployments.len();
        self.deployments.retain(|d| d.name != name);
        self.deployments.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_with(names: &[&str]) -> EdgeDeviceStatus {
        EdgeDeviceStatus {
            deployments: names
                .iter()
                .map(|n| DeploymentStatus {
                    name: n.to_string(),
                    phase: String::new(),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn deployment_lookup_matches_by_name() {
        let status = status_with(&["one", "two"]);
        assert!(status.deployment("one").is_some());
        assert!(status.deployment("three").is_none());
    }

    #[test]
    fn remove_deployment_keeps_remaining_order() {
        let mut status = status_with(&["a", "b", "c"]);
        assert!(status.remove_deployment("b"));
        let names: Vec<_> = status.deployments.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert!(!status.remove_deployment("b"));
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = EdgeDeviceStatus {
            hardware: Some(HardwareInfo {
                hostname: "edge-1".to_string(),
                cpu_architecture: Some("aarch64".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["hardware"]["hostname"], "edge-1");
        assert_eq!(json["hardware"]["cpuArchitecture"], "aarch64");
    }
}
