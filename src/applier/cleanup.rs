//! Cleanup pass: observed backend groups no longer desired

use tracing::info;

use super::executor::Executor;
use super::PassContext;
use crate::error::{aggregate, Result};
use crate::model::tags::{CLUSTER_TAG_KEY, SERVICE_TAG_KEY};
use crate::model::{BackendServer, LoadBalancer};

/// Remove or release every observed group `local` no longer references.
///
/// Preserved load balancers only lose ownership tags. Groups this service
/// does not own keep existing, minus the servers it attached. Failures are
/// collected.
pub async fn apply(ctx: &PassContext<'_>, local: &LoadBalancer, remote: &mut LoadBalancer) -> Result<()> {
    let executor = Executor::new(ctx.cloud);
    let mut errors = Vec::new();
    let mut kept = Vec::with_capacity(remote.backend_groups.len());

    for mut group in std::mem::take(&mut remote.backend_groups) {
        let desired = local
            .backend_groups
            .iter()
            .any(|l| !l.group_id.is_empty() && l.group_id == group.group_id);
        if desired {
            kept.push(group);
            continue;
        }

        if local.attribute.preserve_on_delete {
            let keys: Vec<String> = group
                .tags
                .iter()
                .filter(|t| t.key == SERVICE_TAG_KEY || t.key == CLUSTER_TAG_KEY)
                .map(|t| t.key.clone())
                .collect();
            if !keys.is_empty() {
                match executor.untag_backend_group(&group, &keys).await {
                    Ok(()) => group.tags.retain(|t| !keys.contains(&t.key)),
                    Err(e) => errors.push(e),
                }
            }
            kept.push(group);
            continue;
        }

        if group.is_user_managed || !group.is_managed_by(ctx.service, ctx.cluster_id) {
            info!(
                group = %group.group_id,
                name = %group.name,
                "backend group is managed by user, skip delete"
            );
            let detach: Vec<BackendServer> = group
                .servers
                .iter()
                .filter(|s| !s.is_user_managed)
                .cloned()
                .collect();
            if !detach.is_empty() {
                match executor.remove_servers(&group, &detach).await {
                    Ok(()) => group.servers.retain(|s| s.is_user_managed),
                    Err(e) => errors.push(e),
                }
            }
            kept.push(group);
            continue;
        }

        if let Err(e) = executor.delete_backend_group(&group).await {
            errors.push(e);
            kept.push(group);
        }
    }

    remote.backend_groups = kept;
    aggregate(errors)
}
