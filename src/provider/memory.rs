//! In-memory cloud
//!
//! A self-contained simulated cloud implementing every provider trait. It
//! enforces the constraints the reconciliation core has to respect (listener
//! forwarding dependencies, groups in use, duplicate route CIDRs, deletion
//! protection) and records every mutating call, so it doubles as a dry-run
//! backend for the binary and as the test double for the core.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    BackendGroupApi, CloudResult, ListenerApi, LoadBalancerApi, RouteApi, RouteUpdateStatus,
};
use crate::error::{CloudError, ErrorCode};
use crate::model::{
    BackendGroup, BackendGroupType, BackendServer, Listener, LoadBalancerAttribute,
    LoadBalancerUpdate, Route, Tag,
};

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    FindLoadBalancer,
    CreateLoadBalancer,
    UpdateLoadBalancer,
    DeleteLoadBalancer,
    ListBackendGroups,
    CreateBackendGroup,
    DeleteBackendGroup,
    AddBackendServers,
    RemoveBackendServers,
    ListListeners,
    CreateListener,
    UpdateListener,
    DeleteListener,
    ListRoutes,
    CreateRoute,
    DeleteRoute,
}

#[derive(Debug, Clone)]
struct InjectedFailure {
    op: Op,
    /// Matched against the operation's target (name, id, listener key or CIDR)
    target: String,
    code: String,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct StoredLoadBalancer {
    attribute: LoadBalancerAttribute,
    listeners: Vec<Listener>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    load_balancers: BTreeMap<String, StoredLoadBalancer>,
    backend_groups: BTreeMap<String, BackendGroup>,
    route_tables: BTreeMap<String, Vec<String>>,
    routes: BTreeMap<String, Vec<Route>>,
    failures: Vec<InjectedFailure>,
    mutations: Vec<String>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:04}", prefix, self.next_id)
    }

    fn check_failure(&mut self, op: Op, target: &str) -> CloudResult<()> {
        let Some(pos) = self
            .failures
            .iter()
            .position(|f| f.op == op && (f.target.is_empty() || f.target == target))
        else {
            return Ok(());
        };
        let failure = &mut self.failures[pos];
        let err = CloudError::from_provider(
            &failure.code,
            format!("injected failure for {:?} on {}", op, target),
        );
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                self.failures.remove(pos);
            }
        }
        Err(err)
    }

    fn record(&mut self, entry: String) {
        debug!(mutation = %entry, "in-memory cloud mutation");
        self.mutations.push(entry);
    }

    fn lb_mut(&mut self, id: &str) -> CloudResult<&mut StoredLoadBalancer> {
        self.load_balancers.get_mut(id).ok_or_else(|| {
            CloudError::from_provider(
                "ResourceNotFound.LoadBalancer",
                format!("load balancer {} not found", id),
            )
        })
    }

    fn group_mut(&mut self, id: &str) -> CloudResult<&mut BackendGroup> {
        self.backend_groups.get_mut(id).ok_or_else(|| {
            CloudError::from_provider(
                "ResourceNotFound.ServerGroup",
                format!("server group {} not found", id),
            )
        })
    }

    fn group_in_use(&self, id: &str) -> bool {
        self.load_balancers
            .values()
            .flat_map(|lb| lb.listeners.iter())
            .any(|l| l.backend_group_id == id)
    }
}

/// Simulated cloud backed by in-process maps
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    state: Mutex<State>,
    route_latency: Mutex<Option<Duration>>,
    route_mutations_in_flight: AtomicUsize,
    max_route_mutations_in_flight: AtomicUsize,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` on `target` fail with the raw provider `code` until cleared.
    /// An empty target matches every call of `op`.
    pub fn fail(&self, op: Op, target: &str, code: &str) {
        self.state.lock().failures.push(InjectedFailure {
            op,
            target: target.to_string(),
            code: code.to_string(),
            remaining: None,
        });
    }

    /// Like [`fail`](Self::fail) but only for the next `times` matching calls.
    pub fn fail_times(&self, op: Op, target: &str, code: &str, times: u32) {
        self.state.lock().failures.push(InjectedFailure {
            op,
            target: target.to_string(),
            code: code.to_string(),
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Hold every route mutation for `latency`, so overlapping calls can be observed.
    pub fn set_route_latency(&self, latency: Duration) {
        *self.route_latency.lock() = Some(latency);
    }

    /// Every mutating call so far, in order, e.g. `create_listener HTTPS:443`.
    pub fn mutations(&self) -> Vec<String> {
        self.state.lock().mutations.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().mutations.len()
    }

    pub fn reset_mutations(&self) {
        self.state.lock().mutations.clear();
    }

    /// Highest number of route mutations ever observed running at once.
    pub fn max_concurrent_route_mutations(&self) -> usize {
        self.max_route_mutations_in_flight.load(Ordering::SeqCst)
    }

    /// Seed a load balancer, returning its id.
    pub fn insert_load_balancer(&self, mut attribute: LoadBalancerAttribute) -> String {
        let mut state = self.state.lock();
        if attribute.load_balancer_id.is_empty() {
            attribute.load_balancer_id = state.next_id("lb");
        }
        let id = attribute.load_balancer_id.clone();
        if attribute.deletion_protection.is_none() {
            attribute.deletion_protection = Some(false);
        }
        state.load_balancers.insert(
            id.clone(),
            StoredLoadBalancer {
                attribute,
                listeners: Vec::new(),
            },
        );
        id
    }

    /// Seed a backend group, returning its id.
    pub fn insert_backend_group(&self, mut group: BackendGroup) -> String {
        let mut state = self.state.lock();
        if group.group_id.is_empty() {
            group.group_id = state.next_id("sg");
        }
        if group.group_type.is_none() {
            group.group_type = Some(BackendGroupType::Instance);
        }
        let id = group.group_id.clone();
        state.backend_groups.insert(id.clone(), group);
        id
    }

    /// Seed a listener on an existing load balancer, returning its id.
    pub fn insert_listener(&self, load_balancer_id: &str, mut listener: Listener) -> String {
        let mut state = self.state.lock();
        if listener.listener_id.is_empty() {
            listener.listener_id = state.next_id("lsn");
        }
        let id = listener.listener_id.clone();
        if let Some(lb) = state.load_balancers.get_mut(load_balancer_id) {
            lb.listeners.push(listener);
        }
        id
    }

    pub fn insert_route_table(&self, vpc_id: &str, table: &str) {
        let mut state = self.state.lock();
        state
            .route_tables
            .entry(vpc_id.to_string())
            .or_default()
            .push(table.to_string());
        state.routes.entry(table.to_string()).or_default();
    }

    pub fn insert_route(&self, mut route: Route) {
        let mut state = self.state.lock();
        if route.name.is_empty() {
            route.name = state.next_id("rte");
        }
        state
            .routes
            .entry(route.route_table_id.clone())
            .or_default()
            .push(route);
    }

    pub fn load_balancer(&self, id: &str) -> Option<LoadBalancerAttribute> {
        self.state
            .lock()
            .load_balancers
            .get(id)
            .map(|lb| lb.attribute.clone())
    }

    pub fn load_balancer_ids(&self) -> Vec<String> {
        self.state.lock().load_balancers.keys().cloned().collect()
    }

    pub fn listeners(&self, load_balancer_id: &str) -> Vec<Listener> {
        self.state
            .lock()
            .load_balancers
            .get(load_balancer_id)
            .map(|lb| lb.listeners.clone())
            .unwrap_or_default()
    }

    pub fn backend_group(&self, id: &str) -> Option<BackendGroup> {
        self.state.lock().backend_groups.get(id).cloned()
    }

    pub fn backend_groups(&self) -> Vec<BackendGroup> {
        self.state.lock().backend_groups.values().cloned().collect()
    }

    pub fn routes(&self, table: &str) -> Vec<Route> {
        self.state
            .lock()
            .routes
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    async fn enter_route_mutation(&self) {
        let now = self.route_mutations_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_route_mutations_in_flight
            .fetch_max(now, Ordering::SeqCst);
        let latency = *self.route_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn leave_route_mutation(&self) {
        self.route_mutations_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    fn create_route_locked(state: &mut State, route: &Route) -> CloudResult<Route> {
        let table = state.routes.entry(route.route_table_id.clone()).or_default();
        if table
            .iter()
            .any(|r| r.destination_cidr == route.destination_cidr)
        {
            return Err(CloudError::from_provider(
                "InvalidCIDRBlock.Duplicate",
                format!("route for {} already exists", route.destination_cidr),
            ));
        }
        let mut created = route.clone();
        state.next_id += 1;
        created.name = format!("rte-{:04}", state.next_id);
        state
            .routes
            .entry(route.route_table_id.clone())
            .or_default()
            .push(created.clone());
        state.record(format!(
            "create_route {} {}",
            created.destination_cidr, created.provider_id
        ));
        Ok(created)
    }

    fn delete_route_locked(state: &mut State, table: &str, provider_id: &str, cidr: &str) -> CloudResult<()> {
        let routes = state.routes.entry(table.to_string()).or_default();
        let before = routes.len();
        routes.retain(|r| !(r.destination_cidr == cidr && r.provider_id == provider_id));
        if routes.len() == before {
            return Err(CloudError::from_provider(
                "VPC_ROUTER_ENTRY_NOT_EXIST",
                format!("route {} -> {} not found", cidr, provider_id),
            ));
        }
        state.record(format!("delete_route {} {}", cidr, provider_id));
        Ok(())
    }
}

fn has_all_tags(have: &[Tag], want: &[Tag]) -> bool {
    want.iter().all(|w| have.contains(w))
}

#[async_trait]
impl LoadBalancerApi for InMemoryCloud {
    async fn find_load_balancer(&self, id: &str) -> CloudResult<Option<LoadBalancerAttribute>> {
        let mut state = self.state.lock();
        state.check_failure(Op::FindLoadBalancer, id)?;
        Ok(state.load_balancers.get(id).map(|lb| lb.attribute.clone()))
    }

    async fn find_load_balancer_by_tags(
        &self,
        tags: &[Tag],
    ) -> CloudResult<Option<LoadBalancerAttribute>> {
        let mut state = self.state.lock();
        state.check_failure(Op::FindLoadBalancer, "")?;
        Ok(state
            .load_balancers
            .values()
            .find(|lb| has_all_tags(&lb.attribute.tags, tags))
            .map(|lb| lb.attribute.clone()))
    }

    async fn create_load_balancer(&self, attribute: &LoadBalancerAttribute) -> CloudResult<String> {
        let mut state = self.state.lock();
        state.check_failure(Op::CreateLoadBalancer, &attribute.name)?;
        let id = state.next_id("lb");
        let mut stored = attribute.clone();
        stored.load_balancer_id = id.clone();
        stored.address = format!("192.0.2.{}", state.next_id % 250 + 1);
        stored.dns_name = format!("{}.lb.example.internal", id);
        stored.deletion_protection = Some(attribute.deletion_protection.unwrap_or(false));
        state.load_balancers.insert(
            id.clone(),
            StoredLoadBalancer {
                attribute: stored,
                listeners: Vec::new(),
            },
        );
        state.record(format!("create_load_balancer {}", id));
        Ok(id)
    }

    async fn update_load_balancer(&self, id: &str, update: &LoadBalancerUpdate) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::UpdateLoadBalancer, id)?;
        let lb = state.lb_mut(id)?;
        if let Some(name) = &update.name {
            lb.attribute.name = name.clone();
        }
        if update.bandwidth_mbps.is_some() {
            lb.attribute.bandwidth_mbps = update.bandwidth_mbps;
        }
        if update.deletion_protection.is_some() {
            lb.attribute.deletion_protection = update.deletion_protection;
        }
        state.record(format!("update_load_balancer {}", id));
        Ok(())
    }

    async fn delete_load_balancer(&self, id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::DeleteLoadBalancer, id)?;
        let lb = state.lb_mut(id)?;
        if lb.attribute.deletion_protection == Some(true) {
            return Err(CloudError::from_provider(
                "OperationDenied.DeletionProtection",
                format!("load balancer {} has deletion protection enabled", id),
            ));
        }
        state.load_balancers.remove(id);
        state.record(format!("delete_load_balancer {}", id));
        Ok(())
    }

    async fn list_load_balancer_tags(&self, id: &str) -> CloudResult<Vec<Tag>> {
        let mut state = self.state.lock();
        Ok(state.lb_mut(id)?.attribute.tags.clone())
    }

    async fn untag_load_balancer(&self, id: &str, keys: &[String]) -> CloudResult<()> {
        let mut state = self.state.lock();
        let lb = state.lb_mut(id)?;
        lb.attribute.tags.retain(|t| !keys.contains(&t.key));
        state.record(format!("untag_load_balancer {}", id));
        Ok(())
    }

    async fn set_deletion_protection(&self, id: &str, enabled: bool) -> CloudResult<()> {
        let mut state = self.state.lock();
        let lb = state.lb_mut(id)?;
        lb.attribute.deletion_protection = Some(enabled);
        state.record(format!("set_deletion_protection {} {}", id, enabled));
        Ok(())
    }
}

#[async_trait]
impl BackendGroupApi for InMemoryCloud {
    async fn list_backend_groups(&self, tags: &[Tag]) -> CloudResult<Vec<BackendGroup>> {
        let mut state = self.state.lock();
        state.check_failure(Op::ListBackendGroups, "")?;
        Ok(state
            .backend_groups
            .values()
            .filter(|g| has_all_tags(&g.tags, tags))
            .cloned()
            .collect())
    }

    async fn find_backend_group(&self, id: &str) -> CloudResult<Option<BackendGroup>> {
        Ok(self.state.lock().backend_groups.get(id).cloned())
    }

    async fn list_backend_groups_with_member(
        &self,
        description: &str,
    ) -> CloudResult<Vec<BackendGroup>> {
        let mut state = self.state.lock();
        state.check_failure(Op::ListBackendGroups, description)?;
        Ok(state
            .backend_groups
            .values()
            .filter(|g| g.servers.iter().any(|s| s.description == description))
            .cloned()
            .collect())
    }

    async fn create_backend_group(&self, group: &BackendGroup) -> CloudResult<String> {
        let mut state = self.state.lock();
        state.check_failure(Op::CreateBackendGroup, &group.name)?;
        let id = state.next_id("sg");
        let mut stored = group.clone();
        stored.group_id = id.clone();
        stored.servers.clear();
        if stored.group_type.is_none() {
            stored.group_type = Some(BackendGroupType::Instance);
        }
        state.backend_groups.insert(id.clone(), stored);
        state.record(format!("create_backend_group {}", group.name));
        Ok(id)
    }

    async fn delete_backend_group(&self, id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::DeleteBackendGroup, id)?;
        if !state.backend_groups.contains_key(id) {
            return Err(CloudError::from_provider(
                "ResourceNotFound.ServerGroup",
                format!("server group {} not found", id),
            ));
        }
        if state.group_in_use(id) {
            return Err(CloudError::from_provider(
                "ResourceInUse.ServerGroup",
                format!("server group {} is referenced by a listener", id),
            ));
        }
        state.backend_groups.remove(id);
        state.record(format!("delete_backend_group {}", id));
        Ok(())
    }

    async fn add_backend_servers(&self, id: &str, servers: &[BackendServer]) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::AddBackendServers, id)?;
        let group = state.group_mut(id)?;
        for server in servers {
            if !group.servers.iter().any(|s| s.key() == server.key()) {
                group.servers.push(server.clone());
            }
        }
        state.record(format!("add_backend_servers {} {}", id, servers.len()));
        Ok(())
    }

    async fn remove_backend_servers(
        &self,
        id: &str,
        servers: &[BackendServer],
    ) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::RemoveBackendServers, id)?;
        let group = state.group_mut(id)?;
        group
            .servers
            .retain(|s| !servers.iter().any(|r| r.key() == s.key()));
        state.record(format!("remove_backend_servers {} {}", id, servers.len()));
        Ok(())
    }

    async fn update_backend_servers(
        &self,
        id: &str,
        servers: &[BackendServer],
    ) -> CloudResult<()> {
        let mut state = self.state.lock();
        let group = state.group_mut(id)?;
        for server in servers {
            if let Some(existing) = group.servers.iter_mut().find(|s| s.key() == server.key()) {
                existing.weight = server.weight;
            }
        }
        state.record(format!("update_backend_servers {} {}", id, servers.len()));
        Ok(())
    }

    async fn untag_backend_group(&self, id: &str, keys: &[String]) -> CloudResult<()> {
        let mut state = self.state.lock();
        let group = state.group_mut(id)?;
        group.tags.retain(|t| !keys.contains(&t.key));
        state.record(format!("untag_backend_group {}", id));
        Ok(())
    }
}

#[async_trait]
impl ListenerApi for InMemoryCloud {
    async fn list_listeners(&self, load_balancer_id: &str) -> CloudResult<Vec<Listener>> {
        let mut state = self.state.lock();
        state.check_failure(Op::ListListeners, load_balancer_id)?;
        Ok(state.lb_mut(load_balancer_id)?.listeners.clone())
    }

    async fn create_listener(
        &self,
        load_balancer_id: &str,
        listener: &Listener,
    ) -> CloudResult<String> {
        let mut state = self.state.lock();
        state.check_failure(Op::CreateListener, &listener.to_string())?;
        if !listener.backend_group_id.is_empty()
            && !state.backend_groups.contains_key(&listener.backend_group_id)
        {
            return Err(CloudError::from_provider(
                "ResourceNotFound.ServerGroup",
                format!("server group {} not found", listener.backend_group_id),
            ));
        }
        let id = state.next_id("lsn");
        let lb = state.lb_mut(load_balancer_id)?;
        if lb.listeners.iter().any(|l| l.key() == listener.key()) {
            return Err(CloudError::from_provider(
                "ResourceAlreadyExist.Listener",
                format!("listener {} already exists", listener),
            ));
        }
        if let Some(forward) = listener.forward_port {
            let target_exists = lb.listeners.iter().any(|l| {
                l.protocol.is_encrypted() && l.port == crate::model::ListenerPort::Single(forward)
            });
            if !target_exists {
                return Err(CloudError::from_provider(
                    "InvalidParameter.ForwardPort",
                    format!("no encrypted listener on port {} to forward to", forward),
                ));
            }
        }
        let mut stored = listener.clone();
        stored.listener_id = id.clone();
        lb.listeners.push(stored);
        state.record(format!("create_listener {}", listener));
        Ok(id)
    }

    async fn update_listener(&self, load_balancer_id: &str, listener: &Listener) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::UpdateListener, &listener.to_string())?;
        let lb = state.lb_mut(load_balancer_id)?;
        let Some(existing) = lb.listeners.iter_mut().find(|l| l.key() == listener.key()) else {
            return Err(CloudError::from_provider(
                "ResourceNotFound.Listener",
                format!("listener {} not found", listener),
            ));
        };
        let id = existing.listener_id.clone();
        *existing = listener.clone();
        existing.listener_id = id;
        state.record(format!("update_listener {}", listener));
        Ok(())
    }

    async fn delete_listener(&self, load_balancer_id: &str, listener: &Listener) -> CloudResult<()> {
        let mut state = self.state.lock();
        state.check_failure(Op::DeleteListener, &listener.to_string())?;
        let lb = state.lb_mut(load_balancer_id)?;
        if !lb.listeners.iter().any(|l| l.key() == listener.key()) {
            return Err(CloudError::from_provider(
                "ResourceNotFound.Listener",
                format!("listener {} not found", listener),
            ));
        }
        if listener.protocol.is_encrypted() {
            let forwarded_from = lb.listeners.iter().find(|l| {
                matches!(listener.port, crate::model::ListenerPort::Single(p) if l.forward_port == Some(p))
            });
            if let Some(source) = forwarded_from {
                return Err(CloudError::from_provider(
                    "DependencyViolation.Listener",
                    format!("listener {} forwards to {}", source, listener),
                ));
            }
        }
        lb.listeners.retain(|l| l.key() != listener.key());
        state.record(format!("delete_listener {}", listener));
        Ok(())
    }
}

#[async_trait]
impl RouteApi for InMemoryCloud {
    async fn list_route_tables(&self, vpc_id: &str) -> CloudResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .route_tables
            .get(vpc_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_routes(&self, table: &str) -> CloudResult<Vec<Route>> {
        let mut state = self.state.lock();
        state.check_failure(Op::ListRoutes, table)?;
        Ok(state.routes.get(table).cloned().unwrap_or_default())
    }

    async fn find_route(
        &self,
        table: &str,
        provider_id: &str,
        cidr: &str,
    ) -> CloudResult<Option<Route>> {
        let state = self.state.lock();
        Ok(state.routes.get(table).and_then(|routes| {
            routes
                .iter()
                .find(|r| {
                    (provider_id.is_empty() || r.provider_id == provider_id)
                        && (cidr.is_empty() || r.destination_cidr == cidr)
                })
                .cloned()
        }))
    }

    async fn create_route(&self, table: &str, provider_id: &str, cidr: &str) -> CloudResult<Route> {
        self.enter_route_mutation().await;
        let result = {
            let mut state = self.state.lock();
            state
                .check_failure(Op::CreateRoute, cidr)
                .and_then(|_| {
                    Self::create_route_locked(&mut state, &Route::new(table, provider_id, cidr))
                })
        };
        self.leave_route_mutation();
        result
    }

    async fn delete_route(&self, table: &str, provider_id: &str, cidr: &str) -> CloudResult<()> {
        self.enter_route_mutation().await;
        let result = {
            let mut state = self.state.lock();
            state
                .check_failure(Op::DeleteRoute, cidr)
                .and_then(|_| Self::delete_route_locked(&mut state, table, provider_id, cidr))
        };
        self.leave_route_mutation();
        result
    }

    async fn create_routes(
        &self,
        table: &str,
        routes: &[Route],
    ) -> CloudResult<Vec<RouteUpdateStatus>> {
        self.enter_route_mutation().await;
        let statuses = {
            let mut state = self.state.lock();
            routes
                .iter()
                .map(|route| {
                    let mut route = route.clone();
                    route.route_table_id = table.to_string();
                    let result = state
                        .check_failure(Op::CreateRoute, &route.destination_cidr)
                        .and_then(|_| Self::create_route_locked(&mut state, &route));
                    match result {
                        Ok(created) => {
                            route.name = created.name;
                            RouteUpdateStatus::succeeded(route)
                        }
                        Err(e) => {
                            let code = match e.code {
                                ErrorCode::DuplicateCidr => {
                                    "VPC_ROUTE_ENTRY_CIDR_BLOCK_DUPLICATE".to_string()
                                }
                                other => other.to_string(),
                            };
                            RouteUpdateStatus::failed(route, &code, e.message)
                        }
                    }
                })
                .collect()
        };
        self.leave_route_mutation();
        Ok(statuses)
    }

    async fn delete_routes(
        &self,
        table: &str,
        routes: &[Route],
    ) -> CloudResult<Vec<RouteUpdateStatus>> {
        self.enter_route_mutation().await;
        let statuses = {
            let mut state = self.state.lock();
            routes
                .iter()
                .map(|route| {
                    let result = state
                        .check_failure(Op::DeleteRoute, &route.destination_cidr)
                        .and_then(|_| {
                            Self::delete_route_locked(
                                &mut state,
                                table,
                                &route.provider_id,
                                &route.destination_cidr,
                            )
                        });
                    match result {
                        Ok(()) => RouteUpdateStatus::succeeded(route.clone()),
                        Err(e) => {
                            let code = match e.code {
                                ErrorCode::NotFound => "VPC_ROUTER_ENTRY_NOT_EXIST".to_string(),
                                other => other.to_string(),
                            };
                            RouteUpdateStatus::failed(route.clone(), &code, e.message)
                        }
                    }
                })
                .collect()
        };
        self.leave_route_mutation();
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ListenerPort, Protocol};

    #[tokio::test]
    async fn test_forwarding_dependency_enforced() {
        let cloud = InMemoryCloud::new();
        let lb = cloud.insert_load_balancer(LoadBalancerAttribute::default());

        let mut http = Listener::new(Protocol::Http, ListenerPort::Single(80));
        http.forward_port = Some(443);
        let err = cloud.create_listener(&lb, &http).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Other("InvalidParameter.ForwardPort".into()));

        let https = Listener::new(Protocol::Https, ListenerPort::Single(443));
        cloud.create_listener(&lb, &https).await.unwrap();
        cloud.create_listener(&lb, &http).await.unwrap();

        let err = cloud.delete_listener(&lb, &https).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Other("DependencyViolation.Listener".into()));
    }

    #[tokio::test]
    async fn test_duplicate_route_cidr() {
        let cloud = InMemoryCloud::new();
        cloud.insert_route_table("vpc-1", "vtb-1");
        cloud.create_route("vtb-1", "i-1", "10.1.0.0/24").await.unwrap();
        let err = cloud
            .create_route("vtb-1", "i-2", "10.1.0.0/24")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateCidr);
    }

    #[tokio::test]
    async fn test_injected_failure_expires() {
        let cloud = InMemoryCloud::new();
        cloud.fail_times(Op::CreateBackendGroup, "g", "Throttling", 1);
        let group = BackendGroup::new("g");
        assert_eq!(
            cloud.create_backend_group(&group).await.unwrap_err().code,
            ErrorCode::Throttled
        );
        assert!(cloud.create_backend_group(&group).await.is_ok());
    }
}
