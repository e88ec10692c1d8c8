//! Load Balancer Controller
//!
//! Reconciles CloudLoadBalancer custom resources. Each pass maps the spec to
//! the desired model, runs the applier, then writes the observed identity
//! and conditions back to status. Deletion runs one more pass with deletion
//! intent and releases the finalizer only once that pass succeeds.

use crate::applier::ModelApplier;
use crate::conditions::{
    build_condition, set_condition, ConditionFields, CONDITION_FALSE, CONDITION_TRUE,
    LB_CONDITION_READY, LB_CONDITION_SYNCED, LOAD_BALANCER_FINALIZER,
};
use crate::controllers::{error_policy_backoff, object_key, RequeueContext};
use crate::crd::{CloudLoadBalancer, CloudLoadBalancerStatus, LoadBalancerPhase};
use crate::error::{OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher, EventRecorder, ObjectEvents};
use crate::model::LoadBalancer;
use crate::requeue::{ExponentialRequeue, RequeueTracker};
use chrono::Utc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher::Config;
use kube::{Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Context for the load balancer controller
pub struct LoadBalancerController {
    client: Client,
    applier: ModelApplier,
    publisher: Arc<dyn EventPublisher>,
    requeue: ExponentialRequeue,
    namespace: String,
    resync_period: Duration,
}

impl RequeueContext for LoadBalancerController {
    fn requeue_tracker(&self) -> &dyn RequeueTracker {
        &self.requeue
    }
}

#[async_trait::async_trait]
impl super::Controller for LoadBalancerController {
    async fn run(self: Arc<Self>) -> Result<()> {
        let api: Api<CloudLoadBalancer> = if self.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.namespace)
        };

        info!("Starting CloudLoadBalancer controller");

        Controller::new(api, Config::default())
            .shutdown_on_signal()
            .run(
                |lb, ctx| async move { ctx.reconcile(lb).await },
                error_policy_backoff::<CloudLoadBalancer, Self>,
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!(object = %obj.name, "reconciled load balancer"),
                    Err(e) => error!(error = %e, "load balancer reconciliation failed"),
                }
            })
            .await;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "load-balancer"
    }
}

impl LoadBalancerController {
    pub fn new(
        client: Client,
        applier: ModelApplier,
        publisher: Arc<dyn EventPublisher>,
        namespace: impl Into<String>,
        resync_period: Duration,
    ) -> Self {
        Self {
            client,
            applier,
            publisher,
            requeue: ExponentialRequeue::default(),
            namespace: namespace.into(),
            resync_period,
        }
    }

    async fn reconcile(&self, lb: Arc<CloudLoadBalancer>) -> Result<Action> {
        let key = object_key(lb.as_ref());
        let namespace = lb.namespace().unwrap_or_else(|| "default".to_string());
        let deleting = lb.metadata.deletion_timestamp.is_some();

        if deleting && !has_finalizer(&lb) {
            return Ok(Action::await_change());
        }
        if !deleting {
            self.ensure_finalizer(&lb, &namespace).await?;
        }

        let events = ObjectEvents::new(
            Arc::clone(&self.publisher),
            lb.object_ref(&()),
            if deleting { actions::DELETE } else { actions::RECONCILE },
        );

        let local = match lb.to_model() {
            Ok(local) => local,
            Err(e) => {
                events.warn(reasons::SYNC_LOAD_BALANCER_FAILED, e.to_string()).await;
                let status = build_status(lb.status.as_ref(), &LoadBalancer::default(), Some(&e), lb.metadata.generation);
                self.patch_status(&lb, &namespace, &status).await?;
                return Err(e);
            }
        };

        info!(object = %key, deleting, "applying load balancer");
        let (remote, result) = self.applier.apply(local, &events).await;

        if deleting {
            return match result {
                Ok(()) => {
                    self.remove_finalizer(&lb, &namespace).await?;
                    self.requeue.forget(&key);
                    info!(object = %key, "load balancer released");
                    Ok(Action::await_change())
                }
                Err(e) => {
                    events.warn(reasons::SYNC_LOAD_BALANCER_FAILED, e.to_string()).await;
                    Err(e)
                }
            };
        }

        let status = build_status(lb.status.as_ref(), &remote, result.as_ref().err(), lb.metadata.generation);
        self.patch_status(&lb, &namespace, &status).await?;

        match result {
            Ok(()) => {
                let was_ready = lb.status.as_ref().is_some_and(|s| s.phase == LoadBalancerPhase::Ready);
                if !was_ready {
                    events
                        .normal(
                            reasons::LOAD_BALANCER_SYNCED,
                            format!("load balancer {} is in sync", remote.load_balancer_id()),
                        )
                        .await;
                }
                self.requeue.forget(&key);
                Ok(Action::requeue(self.resync_period))
            }
            Err(e) => {
                events.warn(reasons::SYNC_LOAD_BALANCER_FAILED, e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn ensure_finalizer(&self, lb: &CloudLoadBalancer, namespace: &str) -> Result<()> {
        if has_finalizer(lb) {
            return Ok(());
        }
        let mut finalizers = lb.finalizers().to_vec();
        finalizers.push(LOAD_BALANCER_FINALIZER.to_string());
        self.patch_finalizers(lb, namespace, finalizers).await
    }

    async fn remove_finalizer(&self, lb: &CloudLoadBalancer, namespace: &str) -> Result<()> {
        let finalizers: Vec<String> = lb
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != LOAD_BALANCER_FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(lb, namespace, finalizers).await
    }

    async fn patch_finalizers(&self, lb: &CloudLoadBalancer, namespace: &str, finalizers: Vec<String>) -> Result<()> {
        let api: Api<CloudLoadBalancer> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        api.patch(&lb.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        Ok(())
    }

    async fn patch_status(&self, lb: &CloudLoadBalancer, namespace: &str, status: &CloudLoadBalancerStatus) -> Result<()> {
        let api: Api<CloudLoadBalancer> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&lb.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        Ok(())
    }
}

fn has_finalizer(lb: &CloudLoadBalancer) -> bool {
    lb.finalizers().iter().any(|f| f == LOAD_BALANCER_FINALIZER)
}

/// Status after a pass that left the cloud at `remote` and failed with `error`, if any.
///
/// A failed pass with an existing load balancer is `Degraded`: it serves,
/// but some sub-resources did not converge.
pub fn build_status(
    previous: Option<&CloudLoadBalancerStatus>,
    remote: &LoadBalancer,
    error: Option<&OperatorError>,
    generation: Option<i64>,
) -> CloudLoadBalancerStatus {
    let mut conditions: Vec<ConditionFields> = previous
        .map(|s| s.conditions.iter().map(ConditionFields::from).collect())
        .unwrap_or_default();

    let exists = remote.exists();
    if exists {
        set_condition(
            &mut conditions,
            build_condition(LB_CONDITION_READY, CONDITION_TRUE, "LoadBalancerProvisioned", "load balancer exists"),
        );
    } else {
        set_condition(
            &mut conditions,
            build_condition(LB_CONDITION_READY, CONDITION_FALSE, "LoadBalancerMissing", "load balancer does not exist"),
        );
    }
    match error {
        None => set_condition(
            &mut conditions,
            build_condition(LB_CONDITION_SYNCED, CONDITION_TRUE, "Synced", "cloud resources match the spec"),
        ),
        Some(e) => set_condition(
            &mut conditions,
            build_condition(LB_CONDITION_SYNCED, CONDITION_FALSE, "SyncFailed", &e.to_string()),
        ),
    }

    let phase = match (error, exists) {
        (None, true) => LoadBalancerPhase::Ready,
        (None, false) => LoadBalancerPhase::Pending,
        (Some(_), true) => LoadBalancerPhase::Degraded,
        (Some(_), false) => LoadBalancerPhase::Failed,
    };
    let attribute = &remote.attribute;
    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

    CloudLoadBalancerStatus {
        load_balancer_id: non_empty(&attribute.load_balancer_id),
        address: non_empty(&attribute.address),
        dns_name: non_empty(&attribute.dns_name),
        phase,
        conditions: conditions
            .into_iter()
            .map(ConditionFields::into_load_balancer_condition)
            .collect(),
        observed_generation: generation,
        last_updated: Some(Utc::now().to_rfc3339()),
        last_error: error.map(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NamespacedName;

    fn provisioned() -> LoadBalancer {
        let mut lb = LoadBalancer::remote_for(NamespacedName::new("shop", "web"));
        lb.attribute.load_balancer_id = "lb-1".into();
        lb.attribute.address = "192.0.2.1".into();
        lb
    }

    fn condition<'a>(status: &'a CloudLoadBalancerStatus, type_: &str) -> &'a str {
        status
            .conditions
            .iter()
            .find(|c| c.r#type == type_)
            .map(|c| c.status.as_str())
            .unwrap_or_default()
    }

    #[test]
    fn test_status_after_successful_pass() {
        let status = build_status(None, &provisioned(), None, Some(3));
        assert_eq!(status.phase, LoadBalancerPhase::Ready);
        assert_eq!(status.load_balancer_id.as_deref(), Some("lb-1"));
        assert_eq!(status.address.as_deref(), Some("192.0.2.1"));
        assert_eq!(status.dns_name, None);
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(condition(&status, LB_CONDITION_READY), CONDITION_TRUE);
        assert_eq!(condition(&status, LB_CONDITION_SYNCED), CONDITION_TRUE);
        assert!(status.last_error.is_none());
    }

    #[test]
    fn test_partial_failure_is_degraded() {
        let err = OperatorError::Reconciliation("listener HTTP:80 failed".into());
        let status = build_status(None, &provisioned(), Some(&err), None);
        assert_eq!(status.phase, LoadBalancerPhase::Degraded);
        assert_eq!(condition(&status, LB_CONDITION_READY), CONDITION_TRUE);
        assert_eq!(condition(&status, LB_CONDITION_SYNCED), CONDITION_FALSE);
        assert!(status.last_error.unwrap().contains("HTTP:80"));
    }

    #[test]
    fn test_failure_without_load_balancer() {
        let err = OperatorError::reuse_conflict("lb-user", "not found");
        let status = build_status(None, &LoadBalancer::default(), Some(&err), None);
        assert_eq!(status.phase, LoadBalancerPhase::Failed);
        assert_eq!(status.load_balancer_id, None);
        assert_eq!(condition(&status, LB_CONDITION_READY), CONDITION_FALSE);
    }

    #[test]
    fn test_transition_time_kept_across_passes() {
        let first = build_status(None, &provisioned(), None, None);
        let mut previous = first.clone();
        previous.conditions[0].last_transition_time = Some("2024-01-01T00:00:00Z".into());
        let second = build_status(Some(&previous), &provisioned(), None, None);
        assert_eq!(
            second.conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }
}
