//! Pod CIDR routes in VPC route tables
//!
//! One route per eligible node sends the node's pod CIDR to its instance.
//! The full sync walks each table: routes outside the cluster CIDR are left
//! alone, routes conflicting with a node's pod CIDR are deleted first, then
//! missing routes are created in one batch. Every mutation goes through the
//! shared [`RouteMutationGuard`].

pub mod cidr;
pub mod guard;
pub mod node;

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::IpNet;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, instrument, warn};

pub use cidr::{conflicting_node, containment, Containment};
pub use guard::RouteMutationGuard;
pub use node::{NodeRouteInfo, SkipReason, EXCLUDE_NODE_LABEL};

use crate::config::ControllerConfig;
use crate::error::{aggregate, ErrorCode, OperatorError, Result};
use crate::events::{actions, reasons, EventPublisher};
use crate::model::Route;
use crate::provider::{CloudProvider, RouteUpdateStatus};
use crate::requeue::{ExponentialRequeue, RequeueTracker};

/// Marks a node's network as routed once its route exists.
#[async_trait]
pub trait NodeNetworkStatus: Send + Sync {
    async fn mark_network_ready(&self, node: &str) -> Result<()>;
}

/// Outcome of one table sync
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<Route>,
    pub deleted: Vec<Route>,
    pub failed: Vec<RouteUpdateStatus>,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.created.extend(other.created);
        self.deleted.extend(other.deleted);
        self.failed.extend(other.failed);
    }
}

fn create_succeeded(status: &RouteUpdateStatus) -> bool {
    matches!(
        status.error_code(),
        None | Some(ErrorCode::DuplicateCidr) | Some(ErrorCode::TransientState)
    )
}

fn delete_succeeded(status: &RouteUpdateStatus) -> bool {
    matches!(status.error_code(), None | Some(ErrorCode::NotFound))
}

fn requeue_key(route: &Route) -> &str {
    if route.node_name.is_empty() {
        &route.provider_id
    } else {
        &route.node_name
    }
}

pub struct RouteReconciler {
    cloud: Arc<dyn CloudProvider>,
    guard: Arc<RouteMutationGuard>,
    cluster_cidr: Option<IpNet>,
    vpc_id: String,
    route_table_ids: Vec<String>,
    requeue: Arc<dyn RequeueTracker>,
    network: Arc<dyn NodeNetworkStatus>,
    events: Arc<dyn EventPublisher>,
}

impl RouteReconciler {
    pub fn new(
        cloud: Arc<dyn CloudProvider>,
        config: &ControllerConfig,
        network: Arc<dyn NodeNetworkStatus>,
        events: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        Ok(Self {
            cloud,
            guard: Arc::new(RouteMutationGuard::new(config.route_create_backoff.clone())),
            cluster_cidr: config.cluster_cidr()?,
            vpc_id: config.vpc_id.clone(),
            route_table_ids: config.route_table_ids.clone(),
            requeue: Arc::new(ExponentialRequeue::default()),
            network,
            events,
        })
    }

    pub fn with_guard(mut self, guard: Arc<RouteMutationGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_requeue(mut self, requeue: Arc<dyn RequeueTracker>) -> Self {
        self.requeue = requeue;
        self
    }

    /// Configured table ids win. Otherwise the VPC must have exactly one table.
    pub async fn resolve_route_tables(&self) -> Result<Vec<String>> {
        if !self.route_table_ids.is_empty() {
            return Ok(self.route_table_ids.clone());
        }
        let tables = self
            .cloud
            .list_route_tables(&self.vpc_id)
            .await
            .map_err(|e| OperatorError::lookup(format!("route tables of {}", self.vpc_id), e))?;
        match tables.len() {
            1 => Ok(tables),
            0 => Err(OperatorError::Configuration(format!(
                "no route table found in vpc {}",
                self.vpc_id
            ))),
            n => Err(OperatorError::Configuration(format!(
                "vpc {} has {} route tables, set the route table ids explicitly",
                self.vpc_id, n
            ))),
        }
    }

    /// Sync every resolved table against `nodes`.
    pub async fn sync(&self, nodes: &[NodeRouteInfo]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let mut errors = Vec::new();
        for table in self.resolve_route_tables().await? {
            match self.sync_table_routes(&table, nodes).await {
                Ok(r) => report.merge(r),
                Err(e) => {
                    error!(table = %table, error = %e, "route table sync failed");
                    errors.push(e);
                }
            }
        }
        aggregate(errors).map(|()| report)
    }

    /// Routes of `table` inside the cluster CIDR. Unparsable entries are skipped.
    async fn in_scope_routes(&self, table: &str) -> Result<Vec<Route>> {
        let routes = self
            .cloud
            .list_routes(table)
            .await
            .map_err(|e| OperatorError::lookup(format!("routes of {}", table), e))?;
        Ok(routes
            .into_iter()
            .filter(|route| match containment(self.cluster_cidr.as_ref(), &route.destination_cidr) {
                Ok(c) => c.in_scope(),
                Err(e) => {
                    warn!(route = %route, error = %e, "skip route");
                    false
                }
            })
            .collect())
    }

    /// Delete `route` if it overlaps the pod CIDR of one of `nodes`.
    /// `None` when there is no conflict.
    async fn delete_conflicting(
        &self,
        table: &str,
        route: &Route,
        nodes: &[NodeRouteInfo],
    ) -> Option<Result<()>> {
        let node = conflicting_node(route, nodes)?;
        let deleted = self
            .guard
            .delete_route(self.cloud.as_ref(), table, &route.provider_id, &route.destination_cidr)
            .await;
        if deleted.is_ok() {
            info!(route = %route, node = %node.name, "deleted conflicting route");
            self.publish(
                node,
                EventType::Normal,
                reasons::ROUTE_CONFLICT,
                format!("deleted route {} conflicting with node pod CIDR", route),
            )
            .await;
        }
        Some(deleted)
    }

    /// Converge one table: delete conflicting and orphaned routes, then
    /// create the missing ones.
    #[instrument(skip(self, nodes), fields(nodes = nodes.len()))]
    pub async fn sync_table_routes(&self, table: &str, nodes: &[NodeRouteInfo]) -> Result<SyncReport> {
        let routes = self.in_scope_routes(table).await?;

        let mut report = SyncReport::default();
        let mut kept = Vec::with_capacity(routes.len());
        let mut orphaned = Vec::new();

        for route in routes {
            match self.delete_conflicting(table, &route, nodes).await {
                Some(Ok(())) => {
                    report.deleted.push(route);
                    continue;
                }
                Some(Err(e)) => {
                    error!(route = %route, error = %e, "failed to delete conflicting route");
                    continue;
                }
                None => {}
            }

            // Without a cluster CIDR every route is in scope, gateways included
            if self.cluster_cidr.is_some() && !nodes.iter().any(|n| n.provider_id == route.provider_id) {
                orphaned.push(route);
                continue;
            }
            kept.push(route);
        }

        if !orphaned.is_empty() {
            report.merge(self.delete_routes(table, orphaned).await?);
        }

        let missing: Vec<Route> = nodes
            .iter()
            .filter(|n| n.needs_route())
            .filter_map(|n| {
                let cidr = n.pod_cidr.as_ref()?.to_string();
                let present = kept
                    .iter()
                    .any(|r| r.destination_cidr == cidr && r.provider_id == n.provider_id);
                if present {
                    debug!(node = %n.name, cidr = %cidr, "route exists");
                    None
                } else {
                    Some(Route::new(table, n.provider_id.as_str(), cidr).for_node(n.name.as_str()))
                }
            })
            .collect();

        for node in nodes.iter().filter(|n| n.skip_reason().is_none()) {
            let routed = kept.iter().any(|r| r.provider_id == node.provider_id);
            if routed {
                self.mark_ready(&node.name).await;
            }
        }

        report.merge(self.create_routes(table, missing, nodes).await?);
        Ok(report)
    }

    /// Batch create, classifying each entry.
    pub async fn create_routes(&self, table: &str, routes: Vec<Route>, nodes: &[NodeRouteInfo]) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for status in self.guard.create_routes(self.cloud.as_ref(), table, &routes).await? {
            let key = requeue_key(&status.route).to_string();
            if create_succeeded(&status) {
                if !status.route.node_name.is_empty() {
                    self.mark_ready(&status.route.node_name).await;
                }
                self.requeue.forget(&key);
                report.created.push(status.route);
                continue;
            }
            let delay = self.requeue.remember(&key);
            warn!(
                route = %status.route,
                code = %status.failure_code,
                message = %status.failure_message,
                retry_in = ?delay,
                "failed to create route"
            );
            if let Some(node) = nodes.iter().find(|n| n.name == status.route.node_name) {
                self.publish(
                    node,
                    EventType::Warning,
                    reasons::FAILED_CREATE_ROUTE,
                    format!(
                        "create route {} failed: [{}] {}",
                        status.route, status.failure_code, status.failure_message
                    ),
                )
                .await;
            }
            report.failed.push(status);
        }
        Ok(report)
    }

    /// Batch delete, classifying each entry. A missing route counts as deleted.
    pub async fn delete_routes(&self, table: &str, routes: Vec<Route>) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for status in self.guard.delete_routes(self.cloud.as_ref(), table, &routes).await? {
            let key = requeue_key(&status.route).to_string();
            if delete_succeeded(&status) {
                info!(route = %status.route, "deleted route");
                self.requeue.forget(&key);
                report.deleted.push(status.route);
                continue;
            }
            let delay = self.requeue.remember(&key);
            warn!(
                route = %status.route,
                code = %status.failure_code,
                message = %status.failure_message,
                retry_in = ?delay,
                "failed to delete route"
            );
            if !status.route.node_name.is_empty() {
                let node = NodeRouteInfo {
                    name: status.route.node_name.clone(),
                    ..Default::default()
                };
                self.publish(
                    &node,
                    EventType::Warning,
                    reasons::FAILED_DELETE_ROUTE,
                    format!(
                        "delete route {} failed: [{}] {}",
                        status.route, status.failure_code, status.failure_message
                    ),
                )
                .await;
            }
            report.failed.push(status);
        }
        Ok(report)
    }

    /// Ensure `node` has its route in `table`, consulting `cached` before the cloud.
    pub async fn add_route_for_node(&self, table: &str, node: &NodeRouteInfo, cached: &[Route]) -> Result<Route> {
        let cidr = node.pod_cidr.as_ref().map(ToString::to_string).ok_or_else(|| {
            OperatorError::Reconciliation(format!("node {} has no IPv4 pod CIDR", node.name))
        })?;
        if let Some(route) = cached
            .iter()
            .find(|r| r.destination_cidr == cidr && r.provider_id == node.provider_id)
        {
            return Ok(route.clone());
        }
        self.guard
            .create_route(self.cloud.as_ref(), table, &node.provider_id, &cidr)
            .await
            .map(|route| route.for_node(node.name.as_str()))
    }

    /// Remove every route in `table` owned by `node`'s instance.
    pub async fn delete_route_for_node(&self, table: &str, node: &NodeRouteInfo) -> Result<()> {
        if node.provider_id.is_empty() {
            return Ok(());
        }
        let route = self
            .cloud
            .find_route(table, &node.provider_id, "")
            .await
            .map_err(|e| OperatorError::lookup(format!("route of node {}", node.name), e))?;
        match route {
            Some(route) => {
                self.guard
                    .delete_route(self.cloud.as_ref(), table, &route.provider_id, &route.destination_cidr)
                    .await
            }
            None => Ok(()),
        }
    }

    /// Per-node reconcile: remove the route of a deleting node, otherwise
    /// ensure it exists in every table.
    #[instrument(skip(self, node), fields(node = %node.name))]
    pub async fn reconcile_node(&self, node: &NodeRouteInfo) -> Result<()> {
        let tables = self.resolve_route_tables().await?;
        let mut errors = Vec::new();

        if node.deleting {
            for table in &tables {
                if let Err(e) = self.delete_route_for_node(table, node).await {
                    errors.push(e);
                }
            }
            return aggregate(errors);
        }
        if !node.needs_route() {
            return Ok(());
        }

        for table in &tables {
            if let Err(e) = self.ensure_node_route(table, node).await {
                self.publish(node, EventType::Warning, reasons::FAILED_CREATE_ROUTE, e.to_string())
                    .await;
                errors.push(e);
            }
        }
        // Failure memory for this path belongs to the caller's error policy
        if errors.is_empty() {
            self.mark_ready(&node.name).await;
        }
        aggregate(errors)
    }

    /// Clear routes conflicting with `node` from `table`, then add its own.
    async fn ensure_node_route(&self, table: &str, node: &NodeRouteInfo) -> Result<Route> {
        let mut cached = Vec::new();
        for route in self.in_scope_routes(table).await? {
            match self.delete_conflicting(table, &route, std::slice::from_ref(node)).await {
                Some(result) => result?,
                None => cached.push(route),
            }
        }
        self.add_route_for_node(table, node, &cached).await
    }

    async fn mark_ready(&self, node: &str) {
        if let Err(e) = self.network.mark_network_ready(node).await {
            error!(node, error = %e, "failed to update node network condition");
        }
    }

    async fn publish(&self, node: &NodeRouteInfo, type_: EventType, reason: &str, note: String) {
        self.events
            .publish(&node.object_ref(), type_, reason, actions::ROUTE, Some(note))
            .await
    }
}
