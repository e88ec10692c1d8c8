//! Kubernetes Event recording.
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation. The reconciliation core only sees [`EventRecorder`], an
//! event sink already bound to the object the events are about.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events on arbitrary objects.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// The controller name appears as the "reportingComponent" on Events.
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Drops every event. Used when running without a cluster.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event sink bound to a single object.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, type_: EventType, reason: &str, note: String);

    async fn warn(&self, reason: &str, note: String) {
        self.record(EventType::Warning, reason, note).await
    }

    async fn normal(&self, reason: &str, note: String) {
        self.record(EventType::Normal, reason, note).await
    }
}

/// [`EventRecorder`] publishing through an [`EventPublisher`] onto one object
pub struct ObjectEvents {
    publisher: Arc<dyn EventPublisher>,
    reference: ObjectReference,
    action: &'static str,
}

impl ObjectEvents {
    pub fn new(
        publisher: Arc<dyn EventPublisher>,
        reference: ObjectReference,
        action: &'static str,
    ) -> Self {
        Self {
            publisher,
            reference,
            action,
        }
    }
}

#[async_trait]
impl EventRecorder for ObjectEvents {
    async fn record(&self, type_: EventType, reason: &str, note: String) {
        self.publisher
            .publish(&self.reference, type_, reason, self.action, Some(note))
            .await
    }
}

/// Captures events in memory so tests can assert on them.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingEvents {
    events: parking_lot::Mutex<Vec<(EventType, String, String)>>,
}

#[cfg(test)]
impl RecordingEvents {
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|(_, r, _)| r.clone()).collect()
    }

    pub fn warnings(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _, _)| *t == EventType::Warning)
            .map(|(_, r, n)| (r.clone(), n.clone()))
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for RecordingEvents {
    async fn record(&self, type_: EventType, reason: &str, note: String) {
        self.events.lock().push((type_, reason.to_string(), note));
    }
}

#[cfg(test)]
#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        note: Option<String>,
    ) {
        let note = format!(
            "{}: {}",
            resource_ref.name.as_deref().unwrap_or_default(),
            note.unwrap_or_default()
        );
        self.events.lock().push((type_, reason.to_string(), note));
    }
}

/// Event reason strings, shown under REASON in `kubectl get events`.
pub mod reasons {
    /// Remote load balancer kept alive because preserve-on-delete is set
    pub const PRESERVED_ON_DELETE: &str = "PreservedOnDelete";
    /// A reused load balancer is not compatible with the desired state
    pub const REUSE_REJECTED: &str = "ReuseRejected";
    /// Scheme or IP family differ but cannot be changed in place
    pub const IMMUTABLE_ATTRIBUTE_DRIFT: &str = "ImmutableAttributeDrift";
    pub const SYNC_LOAD_BALANCER_FAILED: &str = "SyncLoadBalancerFailed";
    pub const LOAD_BALANCER_SYNCED: &str = "LoadBalancerSynced";
    /// A route overlapping a node's pod CIDR was removed
    pub const ROUTE_CONFLICT: &str = "RouteConflict";
    pub const FAILED_CREATE_ROUTE: &str = "FailedCreateRoute";
    pub const FAILED_DELETE_ROUTE: &str = "FailedDeleteRoute";
}

/// Event action strings, shown under ACTION in `kubectl get events`.
pub mod actions {
    pub const RECONCILE: &str = "Reconcile";
    pub const DELETE: &str = "Delete";
    pub const ROUTE: &str = "Route";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
        assert_send_sync::<ObjectEvents>();
    }

    #[tokio::test]
    async fn test_object_events_through_noop_publisher() {
        let events = ObjectEvents::new(
            Arc::new(NoopEventPublisher),
            ObjectReference::default(),
            actions::RECONCILE,
        );
        events
            .warn(reasons::REUSE_REJECTED, "tagged by another cluster".into())
            .await;
    }

    #[tokio::test]
    async fn test_recording_events() {
        let events = RecordingEvents::default();
        events.normal(reasons::LOAD_BALANCER_SYNCED, "ok".into()).await;
        events
            .warn(reasons::ROUTE_CONFLICT, "10.1.5.0/24".into())
            .await;
        assert_eq!(
            events.reasons(),
            vec!["LoadBalancerSynced".to_string(), "RouteConflict".to_string()]
        );
        assert_eq!(events.warnings().len(), 1);
    }
}
