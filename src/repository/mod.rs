//! Repositories: thin CRUD+selector façades over the declarative store
//!
//! Every store access from the protocol handler and the reconciler goes
//! through these traits, so tests can drive both subsystems with mocks and
//! neither ever touches a raw client. The implementations map API 404s to
//! [`Error::NotFound`](crate::Error::NotFound) so callers can branch on
//! absence without inspecting status codes.

mod deployment;
mod device;

pub use deployment::{DeploymentRepository, KubeDeploymentRepository};
pub use device::{DeviceRepository, KubeDeviceRepository};

#[cfg(test)]
pub use deployment::MockDeploymentRepository;
#[cfg(test)]
pub use device::MockDeviceRepository;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use serde_json::{json, Map, Value};

/// Render a label selector as the API list-parameter string.
///
/// Only equality requirements are used by this control plane.
pub(crate) fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

/// Compute a metadata-scoped JSON merge patch between two versions of an
/// object: changed/added labels, explicit nulls for removed labels, and a
/// wholesale finalizer-list replacement when it changed.
///
/// This is the moral equivalent of a client-side merge-from diff, scoped to
/// the only metadata the control plane mutates.
pub(crate) fn metadata_merge_patch(old: &ObjectMeta, new: &ObjectMeta) -> Value {
    let empty = BTreeMap::new();
    let old_labels = old.labels.as_ref().unwrap_or(&empty);
    let new_labels = new.labels.as_ref().unwrap_or(&empty);

    let mut labels = Map::new();
    for (key, value) in new_labels {
        if old_labels.get(key) != Some(value) {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
    }
    for key in old_labels.keys() {
        if !new_labels.contains_key(key) {
            labels.insert(key.clone(), Value::Null);
        }
    }

    let mut metadata = Map::new();
    if !labels.is_empty() {
        metadata.insert("labels".to_string(), Value::Object(labels));
    }
    if old.finalizers != new.finalizers {
        metadata.insert(
            "finalizers".to_string(),
            json!(new.finalizers.clone().unwrap_or_default()),
        );
    }

    json!({ "metadata": metadata })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn selector_string_joins_match_labels() {
        let selector = LabelSelector {
            match_labels: labels(&[("tier", "edge"), ("zone", "west")])
                .map(|l| l.into_iter().collect()),
            ..Default::default()
        };
        assert_eq!(selector_string(&selector), "tier=edge,zone=west");
        assert_eq!(selector_string(&LabelSelector::default()), "");
    }

    #[test]
    fn label_removal_becomes_explicit_null() {
        let old = ObjectMeta {
            labels: labels(&[("workload/test", "true"), ("zone", "west")]),
            ..Default::default()
        };
        let new = ObjectMeta {
            labels: labels(&[("zone", "west")]),
            ..Default::default()
        };

        let patch = metadata_merge_patch(&old, &new);
        assert_eq!(patch["metadata"]["labels"]["workload/test"], Value::Null);
        assert!(patch["metadata"]["labels"].get("zone").is_none());
    }

    #[test]
    fn label_addition_is_included() {
        let old = ObjectMeta::default();
        let new = ObjectMeta {
            labels: labels(&[("workload/test", "true")]),
            ..Default::default()
        };

        let patch = metadata_merge_patch(&old, &new);
        assert_eq!(patch["metadata"]["labels"]["workload/test"], "true");
    }

    #[test]
    fn finalizer_change_replaces_the_list() {
        let old = ObjectMeta {
            finalizers: Some(vec!["a".to_string(), "b".to_string()]),
            ..Default::default()
        };
        let new = ObjectMeta {
            finalizers: Some(vec!["a".to_string()]),
            ..Default::default()
        };

        let patch = metadata_merge_patch(&old, &new);
        assert_eq!(patch["metadata"]["finalizers"], json!(["a"]));
    }

    #[test]
    fn unchanged_metadata_produces_empty_patch() {
        let meta = ObjectMeta {
            labels: labels(&[("zone", "west")]),
            finalizers: Some(vec!["a".to_string()]),
            ..Default::default()
        };

        let patch = metadata_merge_patch(&meta, &meta.clone());
        assert_eq!(patch, json!({ "metadata": {} }));
    }
}
