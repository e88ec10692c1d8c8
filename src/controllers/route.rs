//! Route Controller
//!
//! Watches Nodes and keeps one route per node pod CIDR in the VPC route
//! tables. Besides per-node reconciles, a periodic task runs the full table
//! sync, which also removes conflicting and orphaned routes. Nodes whose
//! batch route call failed are fed back into the controller once their
//! backoff expires.

use crate::conditions::{network_is_ready, network_ready_condition};
use crate::controllers::{error_policy_backoff, RequeueContext};
use crate::error::{OperatorError, Result};
use crate::requeue::{ExponentialRequeue, NotifyingRequeue, RequeueTracker};
use crate::route::{NodeNetworkStatus, NodeRouteInfo, RouteReconciler};
use async_trait::async_trait;
use futures::channel::mpsc::UnboundedReceiver;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::Client;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Writes `NetworkUnavailable=False` on nodes through the API server
pub struct KubeNodeNetworkStatus {
    nodes: Api<Node>,
}

impl KubeNodeNetworkStatus {
    pub fn new(client: Client) -> Self {
        Self {
            nodes: Api::all(client),
        }
    }
}

#[async_trait]
impl NodeNetworkStatus for KubeNodeNetworkStatus {
    async fn mark_network_ready(&self, node: &str) -> Result<()> {
        let current = self.nodes.get_status(node).await?;
        let conditions = current
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref())
            .unwrap_or_default();
        if network_is_ready(conditions) {
            return Ok(());
        }
        // Node conditions merge by type under a strategic merge patch
        let patch = serde_json::json!({
            "status": {
                "conditions": [network_ready_condition()]
            }
        });
        self.nodes
            .patch_status(node, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(|e| OperatorError::KubeApi(e.to_string()))?;
        info!(node, "node network marked available");
        Ok(())
    }
}

/// Pending node retries waiting out their backoff at the same time
const MAX_PENDING_RETRIES: usize = 256;

type RetryReceiver = UnboundedReceiver<(String, Duration)>;

/// Give `reconciler` a tracker that shares its failure counts with the
/// controller's error policy and reports each failure for a retry.
fn wire_requeue(reconciler: RouteReconciler) -> (RouteReconciler, Arc<ExponentialRequeue>, RetryReceiver) {
    let requeue = Arc::new(ExponentialRequeue::default());
    let (notifying, retries) = NotifyingRequeue::new(requeue.clone());
    (reconciler.with_requeue(Arc::new(notifying)), requeue, retries)
}

/// Turn reported failures into node references once their delay has passed.
fn node_retries(retries: RetryReceiver) -> impl Stream<Item = ObjectRef<Node>> + Send + 'static {
    retries
        .map(|(node, delay)| async move {
            tokio::time::sleep(delay).await;
            ObjectRef::<Node>::new(&node)
        })
        .buffer_unordered(MAX_PENDING_RETRIES)
}

/// Context for the route controller
pub struct RouteController {
    client: Client,
    reconciler: Arc<RouteReconciler>,
    requeue: Arc<ExponentialRequeue>,
    retries: Mutex<Option<RetryReceiver>>,
    sync_period: Duration,
}

impl RequeueContext for RouteController {
    fn requeue_tracker(&self) -> &dyn RequeueTracker {
        self.requeue.as_ref()
    }
}

#[async_trait]
impl super::Controller for RouteController {
    async fn run(self: Arc<Self>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());

        info!(period = ?self.sync_period, "Starting route controller");

        let periodic = Arc::clone(&self).sync_loop();
        let mut controller = Controller::new(nodes, Config::default());
        let retries = self.retries.lock().take();
        if let Some(retries) = retries {
            controller = controller.reconcile_on(node_retries(retries));
        }
        let watch = controller
            .shutdown_on_signal()
            .run(
                |node, ctx| async move { ctx.reconcile(node).await },
                error_policy_backoff::<Node, Self>,
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => debug!(node = %obj.name, "reconciled node route"),
                    Err(e) => error!(error = %e, "node route reconciliation failed"),
                }
            });

        tokio::select! {
            _ = watch => {}
            _ = periodic => {}
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "route"
    }
}

impl RouteController {
    pub fn new(client: Client, reconciler: RouteReconciler, sync_period: Duration) -> Self {
        let (reconciler, requeue, retries) = wire_requeue(reconciler);
        Self {
            client,
            reconciler: Arc::new(reconciler),
            requeue,
            retries: Mutex::new(Some(retries)),
            sync_period,
        }
    }

    async fn reconcile(&self, node: Arc<Node>) -> Result<Action> {
        let info = NodeRouteInfo::from_node(&node);
        self.reconciler.reconcile_node(&info).await?;
        self.requeue.forget(&info.name);
        Ok(Action::requeue(self.sync_period))
    }

    /// Full sync of every route table, once per period.
    async fn sync_loop(self: Arc<Self>) {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let mut ticker = tokio::time::interval(self.sync_period);
        loop {
            ticker.tick().await;
            let list = match nodes.list(&ListParams::default()).await {
                Ok(list) => list,
                Err(e) => {
                    warn!(error = %e, "failed to list nodes, skip route sync");
                    continue;
                }
            };
            let infos: Vec<NodeRouteInfo> = list.items.iter().map(NodeRouteInfo::from_node).collect();
            match self.reconciler.sync(&infos).await {
                Ok(report) => info!(
                    nodes = infos.len(),
                    created = report.created.len(),
                    deleted = report.deleted.len(),
                    failed = report.failed.len(),
                    "route tables synced"
                ),
                Err(e) => error!(error = %e, "route sync failed"),
            }
        }
    }
}
