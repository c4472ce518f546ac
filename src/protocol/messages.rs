//! Device protocol message envelope and directive payloads
//!
//! The envelope is directive + content; the content shape depends on the
//! directive. These types are constructed per request and never persisted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crd::{DataConfiguration, HardwareInfo, Pod};

/// Directive for device registration
pub const DIRECTIVE_REGISTRATION: &str = "registration";

/// Directive for device heartbeats
pub const DIRECTIVE_HEARTBEAT: &str = "heartbeat";

/// Response type for control commands
pub const MESSAGE_TYPE_COMMAND: &str = "command";

/// Response type for configuration data
pub const MESSAGE_TYPE_DATA: &str = "data";

/// Response type acknowledging a received report
pub const MESSAGE_TYPE_RECEIPT: &str = "receipt";

/// Command instructing a device to drop its connection
pub const COMMAND_DISCONNECT: &str = "disconnect";

/// Inbound message envelope posted by a device
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// What the device wants to do; the content shape depends on this
    pub directive: String,

    /// Directive-dependent payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    /// Correlation id chosen by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Outbound message envelope returned to a device
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    /// Response kind: "command", "data" or "receipt"
    #[serde(rename = "type")]
    pub message_type: String,

    /// Kind-dependent payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl MessageResponse {
    /// A control response, optionally carrying a command
    pub fn command(command: Option<&str>) -> Self {
        Self {
            message_type: MESSAGE_TYPE_COMMAND.to_string(),
            content: command.map(|c| serde_json::json!({ "command": c })),
        }
    }

    /// A configuration response
    pub fn data(configuration: &DeviceConfigurationMessage) -> Self {
        Self {
            message_type: MESSAGE_TYPE_DATA.to_string(),
            // configuration serializes infallibly: plain structs and strings
            content: serde_json::to_value(configuration).ok(),
        }
    }

    /// An acknowledgment with no payload
    pub fn receipt() -> Self {
        Self {
            message_type: MESSAGE_TYPE_RECEIPT.to_string(),
            content: None,
        }
    }

    /// A registration response carrying the signed certificate
    pub fn registration(response: &RegistrationResponse) -> Self {
        Self {
            message_type: DIRECTIVE_REGISTRATION.to_string(),
            content: serde_json::to_value(response).ok(),
        }
    }
}

/// Content of a registration directive
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationInfo {
    /// OS image the device is running
    #[serde(default)]
    pub os_image_id: String,

    /// PEM certificate signing request, for certificate re-issuance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_request: Option<String>,

    /// Hardware facts gathered by the device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,
}

/// Content of a successful certificate re-issuance
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// The signed certificate in PEM format
    pub certificate: String,
}

/// Content of a heartbeat directive
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Overall device status label
    #[serde(default)]
    pub status: String,

    /// Device software version
    #[serde(default)]
    pub version: String,

    /// Per-workload phase reports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<WorkloadStatus>,

    /// Current hardware facts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareInfo>,

    /// Discrete events observed since the last heartbeat
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventInfo>,
}

/// One workload's reported phase
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Workload name, matched against the device's status entries
    pub name: String,

    /// Reported phase, e.g. "running", "failing", "created"
    #[serde(default)]
    pub status: String,
}

/// A discrete device event reported in a heartbeat
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInfo {
    /// Human-readable description
    #[serde(default)]
    pub message: String,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Severity: "info" or "warn"
    #[serde(rename = "type", default)]
    pub severity: EventSeverityInfo,
}

/// Severity of a device-reported event
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverityInfo {
    /// Informational
    #[default]
    Info,
    /// Something went wrong on the device
    Warn,
}

/// Full workload configuration for one device
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfigurationMessage {
    /// The device this configuration is for
    pub device_id: String,

    /// Everything the device should be running
    #[serde(default)]
    pub workloads: Vec<WorkloadConfiguration>,
}

/// One workload entry in a device configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfiguration {
    /// Workload name
    pub name: String,

    /// The pod to run
    #[serde(default)]
    pub spec: Pod,

    /// Paths synchronized between device and workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataConfiguration>,

    /// Resolved registry credentials, when the deployment references any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registries: Option<ImageRegistries>,
}

/// Resolved registry credentials shipped to the device
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistries {
    /// Auth file content resolved from the referenced secret
    pub auth_file: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_parses_from_device_json() {
        let json = serde_json::json!({
            "status": "running",
            "version": "3",
            "workloads": [{"name": "camera-feed", "status": "running"}],
            "hardware": {"hostname": "kiosk-7"},
            "events": [{"message": "oom", "reason": "Killed", "type": "warn"}]
        });

        let heartbeat: Heartbeat = serde_json::from_value(json).unwrap();
        assert_eq!(heartbeat.workloads.len(), 1);
        assert_eq!(heartbeat.workloads[0].status, "running");
        assert_eq!(heartbeat.events[0].severity, EventSeverityInfo::Warn);
        assert_eq!(heartbeat.hardware.unwrap().hostname, "kiosk-7");
    }

    #[test]
    fn non_object_heartbeat_content_is_rejected() {
        let result: Result<Heartbeat, _> = serde_json::from_value(serde_json::json!("invalid"));
        assert!(result.is_err());
    }

    #[test]
    fn command_response_carries_the_command() {
        let response = MessageResponse::command(Some(COMMAND_DISCONNECT));
        assert_eq!(response.message_type, MESSAGE_TYPE_COMMAND);
        assert_eq!(response.content.unwrap()["command"], "disconnect");

        let empty = MessageResponse::command(None);
        assert!(empty.content.is_none());
    }

    #[test]
    fn data_response_round_trips_configuration() {
        let config = DeviceConfigurationMessage {
            device_id: "kiosk-7".to_string(),
            workloads: vec![WorkloadConfiguration {
                name: "camera-feed".to_string(),
                ..Default::default()
            }],
        };

        let response = MessageResponse::data(&config);
        assert_eq!(response.message_type, MESSAGE_TYPE_DATA);

        let parsed: DeviceConfigurationMessage =
            serde_json::from_value(response.content.unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
