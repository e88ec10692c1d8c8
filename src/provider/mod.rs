//! Cloud provider interfaces
//!
//! The reconciliation core talks to the cloud only through these traits. One
//! trait per resource family; [`CloudProvider`] bundles them. Implementations
//! own transport, auth and pagination, and must map provider error codes into
//! [`ErrorCode`](crate::error::ErrorCode) before returning.

pub mod memory;

use async_trait::async_trait;

use crate::error::{CloudError, ErrorCode};
use crate::model::{
    BackendGroup, BackendServer, Listener, LoadBalancerAttribute, LoadBalancerUpdate, Route, Tag,
};

pub use memory::InMemoryCloud;

/// Result of a single provider call
pub type CloudResult<T> = std::result::Result<T, CloudError>;

/// Load balancer attribute calls
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Look up a load balancer by id. `Ok(None)` when it does not exist.
    async fn find_load_balancer(&self, id: &str) -> CloudResult<Option<LoadBalancerAttribute>>;

    /// Look up the single load balancer carrying all of `tags`.
    async fn find_load_balancer_by_tags(
        &self,
        tags: &[Tag],
    ) -> CloudResult<Option<LoadBalancerAttribute>>;

    /// Create a load balancer, returning its new id.
    async fn create_load_balancer(&self, attribute: &LoadBalancerAttribute) -> CloudResult<String>;

    async fn update_load_balancer(&self, id: &str, update: &LoadBalancerUpdate) -> CloudResult<()>;

    async fn delete_load_balancer(&self, id: &str) -> CloudResult<()>;

    async fn list_load_balancer_tags(&self, id: &str) -> CloudResult<Vec<Tag>>;

    async fn untag_load_balancer(&self, id: &str, keys: &[String]) -> CloudResult<()>;

    async fn set_deletion_protection(&self, id: &str, enabled: bool) -> CloudResult<()>;
}

/// Backend (server) group calls
#[async_trait]
pub trait BackendGroupApi: Send + Sync {
    /// List groups carrying all of `tags`, with their members.
    async fn list_backend_groups(&self, tags: &[Tag]) -> CloudResult<Vec<BackendGroup>>;

    async fn find_backend_group(&self, id: &str) -> CloudResult<Option<BackendGroup>>;

    /// List groups with at least one member whose description is `description`.
    async fn list_backend_groups_with_member(
        &self,
        description: &str,
    ) -> CloudResult<Vec<BackendGroup>>;

    /// Create an empty group, returning its new id. Members are attached separately.
    async fn create_backend_group(&self, group: &BackendGroup) -> CloudResult<String>;

    async fn delete_backend_group(&self, id: &str) -> CloudResult<()>;

    async fn add_backend_servers(&self, id: &str, servers: &[BackendServer]) -> CloudResult<()>;

    async fn remove_backend_servers(&self, id: &str, servers: &[BackendServer])
        -> CloudResult<()>;

    async fn update_backend_servers(&self, id: &str, servers: &[BackendServer])
        -> CloudResult<()>;

    async fn untag_backend_group(&self, id: &str, keys: &[String]) -> CloudResult<()>;
}

/// Listener calls
#[async_trait]
pub trait ListenerApi: Send + Sync {
    async fn list_listeners(&self, load_balancer_id: &str) -> CloudResult<Vec<Listener>>;

    /// Create a listener, returning its new id.
    async fn create_listener(&self, load_balancer_id: &str, listener: &Listener)
        -> CloudResult<String>;

    async fn update_listener(&self, load_balancer_id: &str, listener: &Listener)
        -> CloudResult<()>;

    async fn delete_listener(&self, load_balancer_id: &str, listener: &Listener)
        -> CloudResult<()>;
}

/// Per-entry outcome of a batch route call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdateStatus {
    pub route: Route,
    pub failed: bool,
    /// Raw provider code, empty on success
    pub failure_code: String,
    pub failure_message: String,
}

impl RouteUpdateStatus {
    pub fn succeeded(route: Route) -> Self {
        Self {
            route,
            failed: false,
            failure_code: String::new(),
            failure_message: String::new(),
        }
    }

    pub fn failed(route: Route, code: &str, message: impl Into<String>) -> Self {
        Self {
            route,
            failed: true,
            failure_code: code.to_string(),
            failure_message: message.into(),
        }
    }

    /// Classified failure code, `None` when the entry succeeded.
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.failed
            .then(|| ErrorCode::from_provider_code(&self.failure_code))
    }
}

/// VPC route table calls
#[async_trait]
pub trait RouteApi: Send + Sync {
    async fn list_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<String>>;

    async fn list_routes(&self, table: &str) -> CloudResult<Vec<Route>>;

    /// Find a route by owner and/or destination. Empty arguments match anything.
    async fn find_route(&self, table: &str, provider_id: &str, cidr: &str)
        -> CloudResult<Option<Route>>;

    async fn create_route(&self, table: &str, provider_id: &str, cidr: &str)
        -> CloudResult<Route>;

    async fn delete_route(&self, table: &str, provider_id: &str, cidr: &str) -> CloudResult<()>;

    async fn create_routes(&self, table: &str, routes: &[Route])
        -> CloudResult<Vec<RouteUpdateStatus>>;

    async fn delete_routes(&self, table: &str, routes: &[Route])
        -> CloudResult<Vec<RouteUpdateStatus>>;
}

/// Everything the operator needs from a cloud
pub trait CloudProvider: LoadBalancerApi + BackendGroupApi + ListenerApi + RouteApi {}

impl<T> CloudProvider for T where T: LoadBalancerApi + BackendGroupApi + ListenerApi + RouteApi {}
