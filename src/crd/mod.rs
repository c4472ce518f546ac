//! Custom Resource Definitions for the Corral fleet
//!
//! Two resources make up the declarative model:
//! - [`EdgeDevice`] - a registered edge node with desired spec and reported status
//! - [`EdgeDeployment`] - a declared workload plus the rule for which devices run it
//!
//! Finalizers on both resources gate physical deletion until the owning
//! subsystem has completed its cleanup; the helpers here treat the finalizer
//! list as a set with stable ordering.

mod deployment;
mod device;

pub use deployment::{
    DataConfiguration, DataPath, EdgeDeployment, EdgeDeploymentSpec, ImageRegistriesConfiguration,
    ObjectRef, Pod, WorkloadType,
};
pub use device::{
    DeploymentStatus, EdgeDevice, EdgeDeviceSpec, EdgeDeviceStatus, HardwareInfo,
    HeartbeatConfiguration,
};

use kube::api::ObjectMeta;

/// Finalizer owned by the protocol handler's configuration path: the device
/// must stop running workloads before it can be deleted.
pub const WORKLOAD_FINALIZER: &str = "corral.dev/workload-finalizer";

/// Finalizer owned by the protocol handler's control path: the device must be
/// told to disconnect before it can be deleted.
pub const CONNECTION_FINALIZER: &str = "corral.dev/connection-finalizer";

/// Finalizer owned by the reconciler: device status entries referencing a
/// deployment must be cleaned up before the deployment can be deleted.
pub const DEVICE_REFERENCE_FINALIZER: &str = "corral.dev/device-reference-finalizer";

/// Marker label recorded on a device for each deployment assigned to it.
///
/// Listing by this label is how the reconciler finds the currently assigned
/// device set without scanning every device's status.
pub fn workload_label(deployment_name: &str) -> String {
    format!("workload/{deployment_name}")
}

/// True when the finalizer is present in the object's finalizer list
pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers
        .as_ref()
        .map(|f| f.iter().any(|existing| existing == finalizer))
        .unwrap_or(false)
}

/// Add a finalizer, guarding against duplicates.
///
/// Returns false (and leaves the list untouched) when the finalizer was
/// already present.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    if has_finalizer(meta, finalizer) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(finalizer.to_string());
    true
}

/// Remove a finalizer, preserving the relative order of the remaining ones.
///
/// Returns false when the finalizer was not present.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|existing| existing != finalizer);
    finalizers.len() != before
}

/// True when deletion has been requested for the object but finalizers may
/// still be holding it
pub fn is_marked_for_deletion(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with(finalizers: &[&str]) -> ObjectMeta {
        ObjectMeta {
            finalizers: Some(finalizers.iter().map(|f| f.to_string()).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn membership_checks_exact_names() {
        let meta = meta_with(&[WORKLOAD_FINALIZER, CONNECTION_FINALIZER]);
        assert!(has_finalizer(&meta, WORKLOAD_FINALIZER));
        assert!(has_finalizer(&meta, CONNECTION_FINALIZER));
        assert!(!has_finalizer(&meta, DEVICE_REFERENCE_FINALIZER));
        assert!(!has_finalizer(&ObjectMeta::default(), WORKLOAD_FINALIZER));
    }

    #[test]
    fn add_guards_against_duplicates() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, WORKLOAD_FINALIZER));
        assert!(!add_finalizer(&mut meta, WORKLOAD_FINALIZER));
        assert_eq!(meta.finalizers.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn remove_preserves_order_of_remaining() {
        let mut meta = meta_with(&["a", "b", "c"]);
        assert!(remove_finalizer(&mut meta, "b"));
        assert_eq!(meta.finalizers.as_ref().unwrap(), &["a", "c"]);

        // removing again is a no-op
        assert!(!remove_finalizer(&mut meta, "b"));
        assert_eq!(meta.finalizers.as_ref().unwrap(), &["a", "c"]);
    }

    #[test]
    fn removed_finalizer_can_be_re_added_once() {
        let mut meta = meta_with(&["a"]);
        assert!(remove_finalizer(&mut meta, "a"));
        assert!(add_finalizer(&mut meta, "a"));
        assert!(!add_finalizer(&mut meta, "a"));
        assert_eq!(meta.finalizers.as_ref().unwrap(), &["a"]);
    }

    #[test]
    fn workload_label_derives_from_deployment_name() {
        assert_eq!(workload_label("nginx"), "workload/nginx");
    }
}
