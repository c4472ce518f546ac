//! EdgeDeployment controller implementation
//!
//! Keeps "which devices run which deployments" consistent with the declared
//! selectors. Assignment is recorded twice on the device: a status entry
//! (what the protocol handler serves back as configuration) and a
//! "workload/<name>" marker label (what lets the reconciler find the
//! currently assigned set with one label query).
//!
//! Deletion cleanup walks every device that *records* the deployment, not
//! the current selector match: selector criteria may have been edited
//! concurrently with the deletion, and an orphaned status entry would pin
//! a workload to a device forever.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    self, DeploymentStatus, EdgeDeployment, EdgeDevice, DEVICE_REFERENCE_FINALIZER,
};
use crate::repository::{
    DeploymentRepository, DeviceRepository, KubeDeploymentRepository, KubeDeviceRepository,
};
use crate::Error;

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Controller context shared across all reconciliation calls
pub struct Context {
    /// Device store access
    pub devices: Arc<dyn DeviceRepository>,
    /// Deployment store access
    pub deployments: Arc<dyn DeploymentRepository>,
}

impl Context {
    /// Create a context over the Kubernetes-backed repositories
    pub fn new(client: kube::Client) -> Self {
        Self {
            devices: Arc::new(KubeDeviceRepository::new(client.clone())),
            deployments: Arc::new(KubeDeploymentRepository::new(client)),
        }
    }

    /// Create a context with injected repositories
    #[cfg(test)]
    pub fn for_testing(
        devices: Arc<dyn DeviceRepository>,
        deployments: Arc<dyn DeploymentRepository>,
    ) -> Self {
        Self {
            devices,
            deployments,
        }
    }
}

/// Reconcile one EdgeDeployment
#[instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(
    deployment: Arc<EdgeDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = deployment.name_any();
    let namespace = deployment.namespace().unwrap_or_default();

    // Re-read through the repository: the watch event may be stale.
    let deployment = match ctx.deployments.read(&name, &namespace).await {
        Ok(deployment) => deployment,
        Err(e) if e.is_not_found() => {
            debug!("deployment gone, nothing to reconcile");
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let deleting = crd::is_marked_for_deletion(&deployment.metadata);

    if !deleting && !crd::has_finalizer(&deployment.metadata, DEVICE_REFERENCE_FINALIZER) {
        let mut updated = deployment.clone();
        crd::add_finalizer(&mut updated.metadata, DEVICE_REFERENCE_FINALIZER);
        ctx.deployments.patch(&deployment, &updated).await?;
        debug!("device-reference finalizer added");
        return Ok(Action::requeue(Duration::ZERO));
    }

    // The currently assigned set comes from the marker label, not from
    // scanning every device's status.
    let assigned = list_devices(&ctx, &marker_selector(&name), &namespace).await?;

    if deleting {
        return cleanup_deleted(&ctx, &deployment, assigned, &namespace).await;
    }

    let target = resolve_target_devices(&ctx, &deployment, &namespace).await?;
    converge(&ctx, &name, assigned, target).await?;

    Ok(Action::await_change())
}

/// Error policy: requeue with a short delay; the framework layers its own
/// backoff on repeated failures
pub fn error_policy(deployment: Arc<EdgeDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        deployment = %deployment.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ERROR_REQUEUE)
}

fn marker_selector(deployment_name: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(
            [(crd::workload_label(deployment_name), "true".to_string())]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    }
}

/// List devices for a selector; an absent device collection is an empty set
async fn list_devices(
    ctx: &Context,
    selector: &LabelSelector,
    namespace: &str,
) -> Result<Vec<EdgeDevice>, Error> {
    match ctx.devices.list_for_selector(selector, namespace).await {
        Ok(devices) => Ok(devices),
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Resolve the devices the deployment should run on: the selector match, or
/// the single directly referenced device
async fn resolve_target_devices(
    ctx: &Context,
    deployment: &EdgeDeployment,
    namespace: &str,
) -> Result<Vec<EdgeDevice>, Error> {
    if let Some(selector) = &deployment.spec.device_selector {
        return list_devices(ctx, selector, namespace).await;
    }

    if let Some(device_name) = &deployment.spec.device {
        return match ctx.devices.read(device_name, namespace).await {
            Ok(device) => Ok(vec![device]),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        };
    }

    warn!("deployment has neither selector nor device reference");
    Ok(Vec::new())
}

/// Drive assigned-set membership towards the target set.
///
/// Patches are applied device-by-device, best-effort: a single device's
/// failure is recorded as the overall error but does not abort the
/// remaining devices.
async fn converge(
    ctx: &Context,
    deployment_name: &str,
    assigned: Vec<EdgeDevice>,
    target: Vec<EdgeDevice>,
) -> Result<(), Error> {
    let target_names: BTreeMap<String, ()> = target
        .iter()
        .map(|device| (device.name_any(), ()))
        .collect();

    let mut first_error = None;

    for device in assigned {
        if target_names.contains_key(&device.name_any()) {
            continue;
        }
        debug!(device = %device.name_any(), "device left the target set");
        if let Err(e) = unassign_deployment(ctx, &device, deployment_name).await {
            warn!(device = %device.name_any(), error = %e, "failed to unassign device");
            first_error.get_or_insert(e);
        }
    }

    for device in target {
        if let Err(e) = assign_deployment(ctx, &device, deployment_name).await {
            warn!(device = %device.name_any(), error = %e, "failed to assign device");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Add the status entry and marker label, each only when missing
async fn assign_deployment(
    ctx: &Context,
    device: &EdgeDevice,
    deployment_name: &str,
) -> Result<(), Error> {
    let has_entry = device
        .status
        .as_ref()
        .map(|s| s.deployment(deployment_name).is_some())
        .unwrap_or(false);

    if !has_entry {
        let mut updated = device.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.deployments.push(DeploymentStatus {
            name: deployment_name.to_string(),
            phase: String::new(),
        });
        ctx.devices.patch_status(&updated).await?;
        info!(device = %device.name_any(), deployment = deployment_name, "deployment assigned");
    }

    let label = crd::workload_label(deployment_name);
    let has_label = device.labels().get(&label).map(String::as_str) == Some("true");
    if !has_label {
        let mut updated = device.clone();
        updated
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(label, "true".to_string());
        ctx.devices.patch(device, &updated).await?;
    }

    Ok(())
}

/// Remove the status entry and marker label, each only when present
async fn unassign_deployment(
    ctx: &Context,
    device: &EdgeDevice,
    deployment_name: &str,
) -> Result<(), Error> {
    let has_entry = device
        .status
        .as_ref()
        .map(|s| s.deployment(deployment_name).is_some())
        .unwrap_or(false);

    if has_entry {
        let mut updated = device.clone();
        if let Some(status) = updated.status.as_mut() {
            status.remove_deployment(deployment_name);
        }
        ctx.devices.patch_status(&updated).await?;
        info!(device = %device.name_any(), deployment = deployment_name, "deployment unassigned");
    }

    let label = crd::workload_label(deployment_name);
    if device.labels().contains_key(&label) {
        let mut updated = device.clone();
        if let Some(labels) = updated.metadata.labels.as_mut() {
            labels.remove(&label);
        }
        ctx.devices.patch(device, &updated).await?;
    }

    Ok(())
}

/// Cleanup for a deleting deployment.
///
/// Every device that records the deployment is cleaned - the marker-labeled
/// set plus the current selector match, since either may have drifted. The
/// deployment's own finalizer is removed only once every device patch has
/// succeeded; the first failure wins but all devices are still attempted.
async fn cleanup_deleted(
    ctx: &Context,
    deployment: &EdgeDeployment,
    assigned: Vec<EdgeDevice>,
    namespace: &str,
) -> Result<Action, Error> {
    let name = deployment.name_any();
    let target = resolve_target_devices(ctx, deployment, namespace).await?;

    let mut devices: BTreeMap<String, EdgeDevice> = BTreeMap::new();
    for device in assigned.into_iter().chain(target) {
        devices.entry(device.name_any()).or_insert(device);
    }

    let mut first_error = None;
    for device in devices.values() {
        if let Err(e) = unassign_deployment(ctx, device, &name).await {
            warn!(device = %device.name_any(), error = %e, "cleanup patch failed");
            first_error.get_or_insert(e);
        }
    }

    if let Some(e) = first_error {
        // not safe to drop the finalizer yet; retry the whole cleanup
        return Err(e);
    }

    ctx.deployments
        .remove_finalizer(deployment, DEVICE_REFERENCE_FINALIZER)
        .await?;
    info!(deployment = %name, "cleanup complete, finalizer removed");
    Ok(Action::await_change())
}
