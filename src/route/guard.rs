//! Serialized route table mutations
//!
//! The provider rejects concurrent writes to one route table, so every
//! create and delete, single or batch, runs under one lock. Single creates
//! also retry under the lock with the configured backoff.

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ErrorCode, OperatorError, Result};
use crate::model::Route;
use crate::provider::{RouteApi, RouteUpdateStatus};
use crate::retry::{retry_with_backoff, Attempt, RetryConfig};

/// Owns the route mutation lock. Share one instance per process.
#[derive(Debug)]
pub struct RouteMutationGuard {
    lock: Mutex<()>,
    backoff: RetryConfig,
}

impl Default for RouteMutationGuard {
    fn default() -> Self {
        Self::new(RetryConfig::route_create())
    }
}

impl RouteMutationGuard {
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            lock: Mutex::new(()),
            backoff,
        }
    }

    /// Create the route `cidr -> provider_id`.
    ///
    /// A duplicate CIDR is success when the existing entry already points at
    /// `provider_id`. Otherwise it fails at once: another owner holds the
    /// CIDR and retrying cannot change that.
    pub async fn create_route<C>(&self, cloud: &C, table: &str, provider_id: &str, cidr: &str) -> Result<Route>
    where
        C: RouteApi + ?Sized,
    {
        let _held = self.lock.lock().await;
        retry_with_backoff(&self.backoff, "create route", || async move {
            match cloud.create_route(table, provider_id, cidr).await {
                Ok(route) => Ok(route),
                Err(e) if e.code == ErrorCode::DuplicateCidr => {
                    match cloud.find_route(table, provider_id, cidr).await {
                        Ok(Some(existing)) => {
                            debug!(route = %existing, "route already exists");
                            Ok(existing)
                        }
                        _ => Err(Attempt::Abort(e)),
                    }
                }
                Err(e) => Err(Attempt::Retry(e)),
            }
        })
        .await
        .map(|route| {
            info!(table, cidr, provider_id, "created route");
            route
        })
        .map_err(|e| OperatorError::provider_action("create", format!("route {} -> {}", cidr, provider_id), e))
    }

    /// Delete the route `cidr -> provider_id`. A missing route is success.
    pub async fn delete_route<C>(&self, cloud: &C, table: &str, provider_id: &str, cidr: &str) -> Result<()>
    where
        C: RouteApi + ?Sized,
    {
        let _held = self.lock.lock().await;
        match cloud.delete_route(table, provider_id, cidr).await {
            Ok(()) => {
                info!(table, cidr, provider_id, "deleted route");
                Ok(())
            }
            Err(e) if e.code == ErrorCode::NotFound => Ok(()),
            Err(e) => Err(OperatorError::provider_action(
                "delete",
                format!("route {} -> {}", cidr, provider_id),
                e,
            )),
        }
    }

    /// Batch create. Per-entry outcomes come back for the caller to classify.
    pub async fn create_routes<C>(&self, cloud: &C, table: &str, routes: &[Route]) -> Result<Vec<RouteUpdateStatus>>
    where
        C: RouteApi + ?Sized,
    {
        if routes.is_empty() {
            return Ok(Vec::new());
        }
        let _held = self.lock.lock().await;
        cloud
            .create_routes(table, routes)
            .await
            .map_err(|e| OperatorError::provider_action("create", format!("{} routes in {}", routes.len(), table), e))
    }

    /// Batch delete. Per-entry outcomes come back for the caller to classify.
    pub async fn delete_routes<C>(&self, cloud: &C, table: &str, routes: &[Route]) -> Result<Vec<RouteUpdateStatus>>
    where
        C: RouteApi + ?Sized,
    {
        if routes.is_empty() {
            return Ok(Vec::new());
        }
        let _held = self.lock.lock().await;
        cloud
            .delete_routes(table, routes)
            .await
            .map_err(|e| OperatorError::provider_action("delete", format!("{} routes in {}", routes.len(), table), e))
    }
}
