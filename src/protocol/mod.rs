//! Device-facing protocol handler
//!
//! Owns registration and heartbeat processing and assembles configuration
//! messages. Every operation is keyed by the device id from both the
//! transport identity (the verified client certificate's Common Name,
//! threaded in as an explicit [`Principal`]) and the request path; the two
//! must agree before any repository access happens.

mod messages;

pub use messages::{
    DeviceConfigurationMessage, EventInfo, EventSeverityInfo, Heartbeat, ImageRegistries, Message,
    MessageResponse, RegistrationInfo, RegistrationResponse, WorkloadConfiguration,
    WorkloadStatus, COMMAND_DISCONNECT, DIRECTIVE_HEARTBEAT, DIRECTIVE_REGISTRATION,
    MESSAGE_TYPE_COMMAND, MESSAGE_TYPE_DATA, MESSAGE_TYPE_RECEIPT,
};

use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::ResourceExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crd::{
    self, EdgeDevice, EdgeDeviceSpec, EdgeDeviceStatus, HeartbeatConfiguration,
    CONNECTION_FINALIZER, WORKLOAD_FINALIZER,
};
use crate::events::{EventSeverity, EventSink};
use crate::mtls::DeviceCertificateSigner;
use crate::pki::PkiError;
use crate::registry::RegistryAuth;
use crate::repository::{DeploymentRepository, DeviceRepository};
use crate::retry::{retry_with_refetch, STATUS_UPDATE_ATTEMPTS};
use crate::Error;

/// Default heartbeat cadence written into newly registered devices
const DEFAULT_HEARTBEAT_PERIOD_SECONDS: i64 = 60;

/// The authenticated identity of a request, extracted from the verified
/// client certificate.
///
/// Threaded explicitly rather than through ambient request state so that
/// its absence is a checkable condition, not a silent type mismatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal(pub String);

/// True iff the authenticated identity is present and equals the requested
/// device id case-insensitively
pub fn device_matches_principal(principal: Option<&Principal>, device_id: &str) -> bool {
    match principal {
        Some(Principal(identity)) => identity.eq_ignore_ascii_case(device_id),
        None => false,
    }
}

/// The device protocol handler
pub struct Handler {
    devices: Arc<dyn DeviceRepository>,
    deployments: Arc<dyn DeploymentRepository>,
    namespace: String,
    events: Arc<dyn EventSink>,
    registry_auth: Arc<dyn RegistryAuth>,
    signer: Option<Arc<dyn DeviceCertificateSigner>>,
}

impl Handler {
    /// Create a handler serving devices in the given namespace
    pub fn new(
        devices: Arc<dyn DeviceRepository>,
        deployments: Arc<dyn DeploymentRepository>,
        namespace: &str,
        events: Arc<dyn EventSink>,
        registry_auth: Arc<dyn RegistryAuth>,
        signer: Option<Arc<dyn DeviceCertificateSigner>>,
    ) -> Self {
        Self {
            devices,
            deployments,
            namespace: namespace.to_string(),
            events,
            registry_auth,
            signer,
        }
    }

    /// Serve a control message: tells a deleting device to disconnect once
    /// only the connection finalizer (or none) is left on it.
    pub async fn get_control_message(
        &self,
        principal: Option<&Principal>,
        device_id: &str,
    ) -> Result<MessageResponse, Error> {
        if !device_matches_principal(principal, device_id) {
            return Err(Error::Forbidden);
        }

        let device = self.devices.read(device_id, &self.namespace).await?;

        if crd::is_marked_for_deletion(&device.metadata) {
            if has_finalizers_other_than(&device.metadata, CONNECTION_FINALIZER) {
                // other subsystems still hold the device; keep the
                // connection alive
                debug!(device = device_id, "deletion pending on other finalizers");
                return Ok(MessageResponse::command(None));
            }

            self.devices
                .remove_finalizer(&device, CONNECTION_FINALIZER)
                .await
                .map_err(|e| {
                    Error::internal(format!("cannot remove connection finalizer: {e}"))
                })?;
            info!(device = device_id, "device deleting, sending disconnect");
            return Ok(MessageResponse::command(Some(COMMAND_DISCONNECT)));
        }

        Ok(MessageResponse::command(None))
    }

    /// Serve a data message: the full workload configuration assigned to
    /// the device. A deleting device gets an empty configuration.
    pub async fn get_data_message(
        &self,
        principal: Option<&Principal>,
        device_id: &str,
    ) -> Result<MessageResponse, Error> {
        if !device_matches_principal(principal, device_id) {
            return Err(Error::Forbidden);
        }

        let device = self.devices.read(device_id, &self.namespace).await?;

        let mut configuration = DeviceConfigurationMessage {
            device_id: device_id.to_string(),
            workloads: Vec::new(),
        };

        if crd::is_marked_for_deletion(&device.metadata) {
            // a deleting device must stop running everything
            if crd::has_finalizer(&device.metadata, WORKLOAD_FINALIZER) {
                self.devices
                    .remove_finalizer(&device, WORKLOAD_FINALIZER)
                    .await
                    .map_err(|e| {
                        Error::internal(format!("cannot remove workload finalizer: {e}"))
                    })?;
            }
            return Ok(MessageResponse::data(&configuration));
        }

        for entry in device
            .status
            .as_ref()
            .map(|s| s.deployments.as_slice())
            .unwrap_or_default()
        {
            let deployment = match self.deployments.read(&entry.name, &self.namespace).await {
                Ok(deployment) => deployment,
                // deleted concurrently; omit it rather than failing the
                // whole configuration
                Err(e) if e.is_not_found() => {
                    debug!(device = device_id, deployment = %entry.name, "skipping vanished deployment");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut workload = WorkloadConfiguration {
                name: deployment.name_any(),
                spec: deployment.spec.pod.clone(),
                data: deployment.spec.data.clone(),
                image_registries: None,
            };

            if let Some(auth_ref) = deployment
                .spec
                .image_registries
                .as_ref()
                .and_then(|r| r.auth_file_secret.as_ref())
            {
                let secret_namespace = auth_ref
                    .namespace
                    .clone()
                    .or_else(|| deployment.namespace())
                    .unwrap_or_else(|| self.namespace.clone());

                let auth_file = match self
                    .registry_auth
                    .get_auth_file_from_secret(&secret_namespace, &auth_ref.name)
                    .await
                {
                    Ok(content) => content,
                    Err(e) => {
                        // surface the misconfiguration to operators instead
                        // of silently shipping a workload that cannot pull
                        self.events
                            .publish(
                                &device,
                                EventSeverity::Warning,
                                "RegistryAuthUnavailable",
                                &format!(
                                    "Auth file secret {}/{} cannot be resolved: {}",
                                    secret_namespace, auth_ref.name, e
                                ),
                            )
                            .await;
                        return Err(Error::internal(format!(
                            "cannot resolve auth file secret {}/{}: {}",
                            secret_namespace, auth_ref.name, e
                        )));
                    }
                };
                workload.image_registries = Some(ImageRegistries { auth_file });
            }

            configuration.workloads.push(workload);
        }

        Ok(MessageResponse::data(&configuration))
    }

    /// Process a posted data message by directive
    pub async fn post_data_message(
        &self,
        principal: Option<&Principal>,
        device_id: &str,
        message: &Message,
    ) -> Result<MessageResponse, Error> {
        if !device_matches_principal(principal, device_id) {
            return Err(Error::Forbidden);
        }

        match message.directive.as_str() {
            DIRECTIVE_REGISTRATION => {
                self.process_registration(device_id, message.content.as_ref())
                    .await
            }
            DIRECTIVE_HEARTBEAT => {
                self.process_heartbeat(device_id, message.content.as_ref())
                    .await
            }
            other => Err(Error::invalid_input(format!("unknown directive {other}"))),
        }
    }

    async fn process_heartbeat(
        &self,
        device_id: &str,
        content: Option<&Value>,
    ) -> Result<MessageResponse, Error> {
        let heartbeat: Heartbeat = match content {
            None => Heartbeat::default(),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::invalid_input(format!("malformed heartbeat: {e}")))?,
        };

        let device = self.devices.read(device_id, &self.namespace).await?;

        for event in &heartbeat.events {
            let severity = match event.severity {
                EventSeverityInfo::Warn => EventSeverity::Warning,
                EventSeverityInfo::Info => EventSeverity::Normal,
            };
            self.events
                .publish(&device, severity, &event.reason, &event.message)
                .await;
        }

        self.update_device_status(device, |device| {
            apply_heartbeat(device, &heartbeat);
        })
        .await?;

        Ok(MessageResponse::receipt())
    }

    async fn process_registration(
        &self,
        device_id: &str,
        content: Option<&Value>,
    ) -> Result<MessageResponse, Error> {
        match self.devices.read(device_id, &self.namespace).await {
            Ok(_) => self.reissue_certificate(device_id, content).await,
            Err(e) if e.is_not_found() => self.register_device(device_id, content).await,
            Err(e) => Err(e),
        }
    }

    /// A known device re-registering: sign its CSR so a stale bootstrap
    /// credential can be upgraded to a device credential.
    async fn reissue_certificate(
        &self,
        device_id: &str,
        content: Option<&Value>,
    ) -> Result<MessageResponse, Error> {
        let info = parse_registration(content)?;
        let csr = info
            .certificate_request
            .filter(|csr| !csr.is_empty())
            .ok_or_else(|| {
                Error::invalid_input("registration for a known device requires a certificate request")
            })?;

        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| Error::internal("certificate signing is not configured"))?;

        let certificate = signer.sign_device_csr(&csr, device_id).await.map_err(|e| {
            match e {
                Error::Pki(PkiError::InvalidCsr(msg)) => {
                    Error::invalid_input(format!("malformed certificate request: {msg}"))
                }
                other => other,
            }
        })?;

        info!(device = device_id, "re-issued device certificate");
        Ok(MessageResponse::registration(&RegistrationResponse {
            certificate,
        }))
    }

    async fn register_device(
        &self,
        device_id: &str,
        content: Option<&Value>,
    ) -> Result<MessageResponse, Error> {
        let info = parse_registration(content)?;

        let device = EdgeDevice {
            metadata: ObjectMeta {
                name: Some(device_id.to_string()),
                namespace: Some(self.namespace.clone()),
                finalizers: Some(vec![
                    WORKLOAD_FINALIZER.to_string(),
                    CONNECTION_FINALIZER.to_string(),
                ]),
                ..Default::default()
            },
            spec: EdgeDeviceSpec {
                os_image_id: info.os_image_id.clone(),
                request_time: None,
                heartbeat: Some(HeartbeatConfiguration {
                    period_seconds: DEFAULT_HEARTBEAT_PERIOD_SECONDS,
                }),
            },
            status: None,
        };

        self.devices.create(&device).await?;
        info!(device = device_id, os_image = %info.os_image_id, "device registered");

        let mut created = device;
        created.status = Some(EdgeDeviceStatus::default());
        let hardware = info.hardware;
        self.update_device_status(created, move |device| {
            let status = device.status.get_or_insert_with(Default::default);
            status.hardware = hardware.clone();
        })
        .await?;

        Ok(MessageResponse::receipt())
    }

    /// Apply a status mutation with the bounded, refetch-before-retry
    /// policy. This is the only write path that retries: device-driven and
    /// reconciler-driven status patches race on the same object.
    async fn update_device_status<F>(&self, device: EdgeDevice, mutate: F) -> Result<(), Error>
    where
        F: Fn(&mut EdgeDevice) + Send + Sync,
    {
        let name = device.name_any();
        retry_with_refetch(
            STATUS_UPDATE_ATTEMPTS,
            "update-device-status",
            device,
            || self.devices.read(&name, &self.namespace),
            |mut device| {
                mutate(&mut device);
                async move { self.devices.patch_status(&device).await }
            },
        )
        .await
        .map_err(|e| Error::internal(format!("cannot update device status: {e}")))
    }
}

/// True when any finalizer other than the given one is present
fn has_finalizers_other_than(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|existing| existing != finalizer))
        .unwrap_or(false)
}

/// Fold a heartbeat into the device status.
///
/// Reported workloads update the phase of a matching status entry; reports
/// for unknown workloads are ignored, since assignments only ever come from
/// the reconciler.
fn apply_heartbeat(device: &mut EdgeDevice, heartbeat: &Heartbeat) {
    let status = device.status.get_or_insert_with(Default::default);

    for reported in &heartbeat.workloads {
        if let Some(entry) = status.deployment_mut(&reported.name) {
            entry.phase = reported.status.clone();
        } else {
            warn!(workload = %reported.name, "heartbeat reports unassigned workload, ignoring");
        }
    }

    if heartbeat.hardware.is_some() {
        status.hardware = heartbeat.hardware.clone();
    }
}

fn parse_registration(content: Option<&Value>) -> Result<RegistrationInfo, Error> {
    match content {
        None => Ok(RegistrationInfo::default()),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|e| Error::invalid_input(format!("malformed registration info: {e}"))),
    }
}
