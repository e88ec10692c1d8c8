//! Single-action execution and provider error classification
//!
//! Every mutating call of the load balancer family goes through here. A
//! create that fails with a duplicate or transient-state code, and a delete
//! that fails with not-found, count as success. Each method returns the
//! observed state after the action instead of patching shared models.

use tracing::{info, warn};

use crate::error::{CloudError, ErrorCode, OperatorError, Result};
use crate::model::{BackendGroup, BackendServer, Listener, ServerChanges};
use crate::provider::CloudProvider;

/// Outcome classification for a failed provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Create,
    Delete,
    Other,
}

/// Whether a provider error on a call of `kind` means the work is already done.
pub fn is_ignorable(kind: CallKind, err: &CloudError) -> bool {
    match kind {
        CallKind::Create => matches!(
            err.code,
            ErrorCode::DuplicateResource | ErrorCode::TransientState
        ),
        CallKind::Delete => err.code == ErrorCode::NotFound,
        CallKind::Other => false,
    }
}

/// Planned backend group action
#[derive(Debug, Clone)]
pub enum GroupAction {
    /// Create the group, then attach every desired server
    CreateAndAttach { local: BackendGroup },
    /// Reconcile membership of an existing group
    Update {
        local: BackendGroup,
        changes: ServerChanges,
    },
}

impl GroupAction {
    pub fn group_name(&self) -> &str {
        match self {
            GroupAction::CreateAndAttach { local } | GroupAction::Update { local, .. } => {
                &local.name
            }
        }
    }
}

/// Planned listener action
#[derive(Debug, Clone)]
pub enum ListenerAction {
    Create(Listener),
    /// Desired listener carrying the matched remote id
    Update(Listener),
    Delete(Listener),
}

impl ListenerAction {
    pub fn listener(&self) -> &Listener {
        match self {
            ListenerAction::Create(l) | ListenerAction::Update(l) | ListenerAction::Delete(l) => l,
        }
    }
}

/// Applies planned actions against the cloud
pub struct Executor<'a> {
    cloud: &'a dyn CloudProvider,
}

impl<'a> Executor<'a> {
    pub fn new(cloud: &'a dyn CloudProvider) -> Self {
        Self { cloud }
    }

    /// Apply one backend group action, returning the group as it now exists.
    pub async fn apply_group(&self, action: GroupAction) -> Result<BackendGroup> {
        match action {
            GroupAction::CreateAndAttach { mut local } => {
                local.group_id = self.create_backend_group(&local).await?;
                if !local.servers.is_empty() && !local.group_id.is_empty() {
                    self.add_servers(&local, &local.servers).await?;
                }
                Ok(local)
            }
            GroupAction::Update { local, changes } => {
                if !changes.add.is_empty() {
                    self.add_servers(&local, &changes.add).await?;
                }
                if !changes.remove.is_empty() {
                    self.remove_servers(&local, &changes.remove).await?;
                }
                if !changes.update.is_empty() {
                    info!(group = %local.group_id, count = changes.update.len(), "reweighting backend servers");
                    self.cloud
                        .update_backend_servers(&local.group_id, &changes.update)
                        .await
                        .map_err(|e| {
                            OperatorError::provider_action(
                                "update",
                                format!("servers of backend group {}", local.name),
                                e,
                            )
                        })?;
                }
                Ok(local)
            }
        }
    }

    async fn create_backend_group(&self, group: &BackendGroup) -> Result<String> {
        info!(group = %group.name, "creating backend group");
        match self.cloud.create_backend_group(group).await {
            Ok(id) => Ok(id),
            Err(e) if is_ignorable(CallKind::Create, &e) => {
                info!(group = %group.name, code = %e.code, "backend group already exists, resolving by name");
                let existing = self
                    .cloud
                    .list_backend_groups(&group.tags)
                    .await
                    .map_err(|e| OperatorError::lookup(format!("backend group {}", group.name), e))?;
                match existing.into_iter().find(|g| g.name == group.name) {
                    Some(found) => Ok(found.group_id),
                    None => {
                        warn!(group = %group.name, "backend group not visible yet");
                        Ok(String::new())
                    }
                }
            }
            Err(e) => Err(OperatorError::provider_action(
                "create",
                format!("backend group {}", group.name),
                e,
            )),
        }
    }

    async fn add_servers(&self, group: &BackendGroup, servers: &[BackendServer]) -> Result<()> {
        info!(group = %group.group_id, count = servers.len(), "attaching backend servers");
        match self.cloud.add_backend_servers(&group.group_id, servers).await {
            Ok(()) => Ok(()),
            Err(e) if is_ignorable(CallKind::Create, &e) => Ok(()),
            Err(e) => Err(OperatorError::provider_action(
                "attach",
                format!("servers to backend group {}", group.name),
                e,
            )),
        }
    }

    /// Detach `servers` from `group`.
    pub async fn remove_servers(&self, group: &BackendGroup, servers: &[BackendServer]) -> Result<()> {
        info!(group = %group.group_id, count = servers.len(), "detaching backend servers");
        match self.cloud.remove_backend_servers(&group.group_id, servers).await {
            Ok(()) => Ok(()),
            Err(e) if is_ignorable(CallKind::Delete, &e) => Ok(()),
            Err(e) => Err(OperatorError::provider_action(
                "detach",
                format!("servers from backend group {}", group.name),
                e,
            )),
        }
    }

    pub async fn delete_backend_group(&self, group: &BackendGroup) -> Result<()> {
        info!(group = %group.group_id, name = %group.name, "deleting backend group");
        match self.cloud.delete_backend_group(&group.group_id).await {
            Ok(()) => Ok(()),
            Err(e) if is_ignorable(CallKind::Delete, &e) => {
                info!(group = %group.group_id, "backend group already gone");
                Ok(())
            }
            Err(e) => Err(OperatorError::provider_action(
                "delete",
                format!("backend group {} ({})", group.name, group.group_id),
                e,
            )),
        }
    }

    pub async fn untag_backend_group(&self, group: &BackendGroup, keys: &[String]) -> Result<()> {
        info!(group = %group.group_id, "removing ownership tags from backend group");
        self.cloud
            .untag_backend_group(&group.group_id, keys)
            .await
            .map_err(|e| {
                OperatorError::provider_action(
                    "untag",
                    format!("backend group {} ({})", group.name, group.group_id),
                    e,
                )
            })
    }

    /// Apply one listener action. Returns the listener as it now exists, or
    /// `None` after a delete.
    pub async fn apply_listener(
        &self,
        load_balancer_id: &str,
        action: ListenerAction,
    ) -> Result<Option<Listener>> {
        match action {
            ListenerAction::Create(mut listener) => {
                info!(load_balancer = %load_balancer_id, listener = %listener, "creating listener");
                match self.cloud.create_listener(load_balancer_id, &listener).await {
                    Ok(id) => listener.listener_id = id,
                    Err(e) if is_ignorable(CallKind::Create, &e) => {
                        info!(listener = %listener, code = %e.code, "listener already exists");
                        let existing = self.cloud.list_listeners(load_balancer_id).await.map_err(|e| {
                            OperatorError::lookup(format!("listeners of {}", load_balancer_id), e)
                        })?;
                        if let Some(found) = existing.iter().find(|l| l.key() == listener.key()) {
                            listener.listener_id = found.listener_id.clone();
                        }
                    }
                    Err(e) => {
                        return Err(OperatorError::provider_action(
                            "create",
                            format!("listener {}", listener),
                            e,
                        ))
                    }
                }
                Ok(Some(listener))
            }
            ListenerAction::Update(listener) => {
                info!(load_balancer = %load_balancer_id, listener = %listener, "updating listener");
                self.cloud
                    .update_listener(load_balancer_id, &listener)
                    .await
                    .map_err(|e| {
                        OperatorError::provider_action("update", format!("listener {}", listener), e)
                    })?;
                Ok(Some(listener))
            }
            ListenerAction::Delete(listener) => {
                info!(load_balancer = %load_balancer_id, listener = %listener, "deleting listener");
                match self.cloud.delete_listener(load_balancer_id, &listener).await {
                    Ok(()) => Ok(None),
                    Err(e) if is_ignorable(CallKind::Delete, &e) => Ok(None),
                    Err(e) => Err(OperatorError::provider_action(
                        "delete",
                        format!("listener {}", listener),
                        e,
                    )),
                }
            }
        }
    }
}
