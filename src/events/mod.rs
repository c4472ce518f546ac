//! Operator-visible event emission
//!
//! Events are fire-and-forget: the sink logs and drops delivery failures,
//! because an event that cannot be recorded must never fail the device
//! request that produced it.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Resource, ResourceExt};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::crd::EdgeDevice;

/// Severity of an operator event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    /// Informational
    Normal,
    /// Needs operator attention
    Warning,
}

/// Append-only operator event sink
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit one event attached to the given device
    async fn publish(
        &self,
        device: &EdgeDevice,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    );
}

/// Event sink backed by the Kubernetes events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a sink reporting as the given controller name
    pub fn new(client: kube::Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        device: &EdgeDevice,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Report".to_string(),
            secondary: None,
        };

        let reference = device.object_ref(&());
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(
                device = %device.name_any(),
                reason,
                error = %e,
                "failed to publish event, dropping"
            );
        }
    }
}
