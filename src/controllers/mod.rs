//! Controllers for the cloudnet operator
//!
//! The load balancer controller watches CloudLoadBalancer objects and hands
//! each one to the applier. The route controller watches Nodes and keeps the
//! VPC route tables in line with their pod CIDRs.

mod load_balancer;
mod route;

pub use load_balancer::{build_status, LoadBalancerController};
pub use route::{KubeNodeNetworkStatus, RouteController};

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::warn;

use crate::error::OperatorError;
use crate::requeue::RequeueTracker;

/// Requeue delay after an error that only a spec or config change can fix
pub const NON_RETRYABLE_REQUEUE: Duration = Duration::from_secs(600);

/// Common trait for all controllers
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Start the controller's reconciliation loop
    async fn run(self: Arc<Self>) -> Result<(), OperatorError>;

    /// Get the controller name for logging
    fn name(&self) -> &'static str;
}

/// Controller context that remembers failures per object
pub trait RequeueContext {
    fn requeue_tracker(&self) -> &dyn RequeueTracker;
}

/// Key identifying an object in a requeue tracker.
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Error policy shared by the controllers: per-object exponential backoff
/// for retryable errors, a long fixed delay for the rest.
pub fn error_policy_backoff<K, C>(obj: Arc<K>, error: &OperatorError, ctx: Arc<C>) -> Action
where
    K: Resource,
    C: RequeueContext,
{
    let key = object_key(obj.as_ref());
    if !error.is_retryable() {
        warn!(object = %key, error = %error, "non-retryable error, waiting for a change");
        return Action::requeue(NON_RETRYABLE_REQUEUE);
    }
    let delay = ctx.requeue_tracker().remember(&key);
    warn!(object = %key, error = %error, retry_in = ?delay, "reconcile failed, requeueing");
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Node;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::requeue::ExponentialRequeue;

    struct Ctx(ExponentialRequeue);

    impl RequeueContext for Ctx {
        fn requeue_tracker(&self) -> &dyn RequeueTracker {
            &self.0
        }
    }

    fn node() -> Arc<Node> {
        Arc::new(Node {
            metadata: ObjectMeta {
                name: Some("n1".into()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_retryable_errors_back_off_per_object() {
        let ctx = Arc::new(Ctx(ExponentialRequeue::new(Duration::from_secs(1), Duration::from_secs(60))));
        let err = OperatorError::Reconciliation("identity mismatch".into());
        assert_eq!(
            error_policy_backoff(node(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(1))
        );
        assert_eq!(
            error_policy_backoff(node(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(2))
        );
        assert_eq!(ctx.0.failures("n1"), 2);
    }

    #[test]
    fn test_configuration_errors_wait() {
        let ctx = Arc::new(Ctx(ExponentialRequeue::default()));
        let err = OperatorError::Configuration("two route tables".into());
        assert_eq!(
            error_policy_backoff(node(), &err, ctx.clone()),
            Action::requeue(NON_RETRYABLE_REQUEUE)
        );
        assert_eq!(ctx.0.failures("n1"), 0);
    }
}
