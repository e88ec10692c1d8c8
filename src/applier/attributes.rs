//! Load balancer attribute phase
//!
//! Four states: absent (create), present (update), present and deleting
//! (delete), present, deleting and preserved (strip tags). Deletion intent
//! wins over update intent.

use tracing::{debug, info, warn};

use super::executor::{is_ignorable, CallKind};
use super::PassContext;
use crate::error::{OperatorError, Result};
use crate::events::reasons;
use crate::model::tags::{has_ownership_tag, CLUSTER_TAG_KEY, SERVICE_TAG_KEY};
use crate::model::LoadBalancer;

pub async fn apply(
    ctx: &PassContext<'_>,
    local: &mut LoadBalancer,
    remote: &mut LoadBalancer,
) -> Result<()> {
    if local.namespaced_name != remote.namespaced_name {
        return Err(OperatorError::Reconciliation(format!(
            "models for different services, local [{}], remote [{}]",
            local.namespaced_name, remote.namespaced_name
        )));
    }

    if local.deletion_requested {
        return delete(ctx, local, remote).await;
    }
    if !remote.exists() {
        return create(ctx, local, remote).await;
    }
    update(ctx, local, remote).await
}

async fn delete(ctx: &PassContext<'_>, local: &LoadBalancer, remote: &mut LoadBalancer) -> Result<()> {
    if local.attribute.is_user_managed {
        info!(load_balancer = %remote.load_balancer_id(), "load balancer is reused, skip delete");
        return Ok(());
    }
    if !remote.exists() {
        debug!(service = %local.namespaced_name, "no load balancer to delete");
        return Ok(());
    }

    let id = remote.load_balancer_id().to_string();
    if local.attribute.preserve_on_delete {
        if remote.attribute.deletion_protection != Some(false) {
            ctx.cloud
                .set_deletion_protection(&id, false)
                .await
                .map_err(|e| {
                    OperatorError::provider_action("disable deletion protection on", format!("load balancer {}", id), e)
                })?;
        }
        let tags = ctx
            .cloud
            .list_load_balancer_tags(&id)
            .await
            .map_err(|e| OperatorError::lookup(format!("tags of load balancer {}", id), e))?;
        let keys: Vec<String> = tags
            .iter()
            .filter(|t| t.key == SERVICE_TAG_KEY || t.key == CLUSTER_TAG_KEY)
            .map(|t| t.key.clone())
            .collect();
        if !keys.is_empty() {
            ctx.cloud
                .untag_load_balancer(&id, &keys)
                .await
                .map_err(|e| OperatorError::provider_action("untag", format!("load balancer {}", id), e))?;
        }
        info!(load_balancer = %id, "cleaned up preserved load balancer");
    } else {
        if remote.attribute.deletion_protection == Some(true) {
            ctx.cloud
                .set_deletion_protection(&id, false)
                .await
                .map_err(|e| {
                    OperatorError::provider_action("disable deletion protection on", format!("load balancer {}", id), e)
                })?;
        }
        match ctx.cloud.delete_load_balancer(&id).await {
            Ok(()) => info!(load_balancer = %id, "deleted load balancer"),
            Err(e) if is_ignorable(CallKind::Delete, &e) => {
                info!(load_balancer = %id, "load balancer already gone")
            }
            Err(e) => {
                return Err(OperatorError::provider_action(
                    "delete",
                    format!("load balancer {}", id),
                    e,
                ))
            }
        }
    }

    remote.attribute.load_balancer_id.clear();
    remote.attribute.address.clear();
    remote.attribute.dns_name.clear();
    Ok(())
}

async fn create(ctx: &PassContext<'_>, local: &mut LoadBalancer, remote: &mut LoadBalancer) -> Result<()> {
    if local.attribute.is_user_managed {
        let err = OperatorError::reuse_conflict(
            local.attribute.load_balancer_id.clone(),
            "the load balancer to reuse does not exist",
        );
        ctx.events.warn(reasons::REUSE_REJECTED, err.to_string()).await;
        return Err(err);
    }
    if !local.bound_endpoints.is_empty() {
        return Err(OperatorError::Reconciliation(format!(
            "can not find load balancer, but {} is already bound to {}; it may have been deleted out-of-band",
            local.namespaced_name,
            local.bound_endpoints.join(",")
        )));
    }

    let builder = ctx.builder();
    info!(service = %local.namespaced_name, name = %local.attribute.name, "creating load balancer");
    let id = match ctx.cloud.create_load_balancer(&local.attribute).await {
        Ok(id) => id,
        Err(e) if is_ignorable(CallKind::Create, &e) => {
            info!(code = %e.code, "load balancer already exists, resolving by ownership tag");
            builder.build_attribute("", remote).await?;
            if !remote.exists() {
                return Err(OperatorError::provider_action(
                    "create",
                    format!("load balancer {}", local.attribute.name),
                    e,
                ));
            }
            remote.load_balancer_id().to_string()
        }
        Err(e) => {
            return Err(OperatorError::provider_action(
                "create",
                format!("load balancer {}", local.attribute.name),
                e,
            ))
        }
    };
    info!(load_balancer = %id, "created load balancer");

    local.attribute.load_balancer_id = id.clone();
    builder.refresh_attribute(&id, remote).await
}

async fn update(ctx: &PassContext<'_>, local: &mut LoadBalancer, remote: &mut LoadBalancer) -> Result<()> {
    let id = remote.load_balancer_id().to_string();
    remote.attribute.tags = ctx
        .cloud
        .list_load_balancer_tags(&id)
        .await
        .map_err(|e| OperatorError::lookup(format!("tags of load balancer {}", id), e))?;

    if local.attribute.is_user_managed {
        if let Err(err) = check_reusable(local, remote) {
            ctx.events.warn(reasons::REUSE_REJECTED, err.to_string()).await;
            return Err(err);
        }
    }

    let drift = local.attribute.immutable_drift(&remote.attribute);
    if !drift.is_empty() {
        let note = format!(
            "load balancer {} can not change {} in place",
            id,
            drift.join(", ")
        );
        warn!(load_balancer = %id, drift = ?drift, "immutable attributes differ");
        ctx.events
            .warn(reasons::IMMUTABLE_ATTRIBUTE_DRIFT, note)
            .await;
    }

    local.attribute.load_balancer_id = id.clone();
    let update = local.attribute.update_against(&remote.attribute);
    if update.is_empty() {
        debug!(load_balancer = %id, "load balancer attributes up to date");
        return Ok(());
    }

    info!(load_balancer = %id, update = ?update, "updating load balancer attributes");
    ctx.cloud
        .update_load_balancer(&id, &update)
        .await
        .map_err(|e| OperatorError::provider_action("update", format!("load balancer {}", id), e))?;

    if let Some(name) = update.name {
        remote.attribute.name = name;
    }
    if update.bandwidth_mbps.is_some() {
        remote.attribute.bandwidth_mbps = update.bandwidth_mbps;
    }
    if update.deletion_protection.is_some() {
        remote.attribute.deletion_protection = update.deletion_protection;
    }
    Ok(())
}

/// A reused load balancer must not belong to any cluster, and must be the one
/// the object is already published on, if any.
fn check_reusable(local: &LoadBalancer, remote: &LoadBalancer) -> Result<()> {
    let id = remote.load_balancer_id();
    if has_ownership_tag(&remote.attribute.tags) {
        return Err(OperatorError::reuse_conflict(
            id,
            "it was created by kubernetes and carries ownership tags",
        ));
    }
    if local.bound_endpoints.is_empty() {
        return Ok(());
    }
    let matches = local.bound_endpoints.iter().any(|endpoint| {
        (!remote.attribute.address.is_empty() && *endpoint == remote.attribute.address)
            || (!remote.attribute.dns_name.is_empty() && *endpoint == remote.attribute.dns_name)
    });
    if !matches {
        return Err(OperatorError::reuse_conflict(
            id,
            format!(
                "the object is already bound to [{}], can not rebind to {}",
                local.bound_endpoints.join(","),
                remote.attribute.address
            ),
        ));
    }
    Ok(())
}
