//! Backend group phase
//!
//! Desired groups are matched against observed ones by id when known,
//! otherwise by name. Matched groups get a membership update, unmatched ones
//! are created with their servers attached. A group whose type changed can
//! not be updated in place and is created again; the stale group is left for
//! the cleanup pass.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::executor::{Executor, GroupAction};
use super::parallel::{partition, run_bounded};
use super::PassContext;
use crate::error::{aggregate, OperatorError, Result};
use crate::model::{BackendGroup, LoadBalancer};

/// Planned actions, each paired with the index of its desired group
#[derive(Debug, Default)]
pub struct GroupPlan {
    pub actions: Vec<(usize, GroupAction)>,
    pub errors: Vec<OperatorError>,
}

fn type_changed(local: &BackendGroup, observed: &BackendGroup) -> bool {
    local.group_type.is_some() && local.group_type != observed.group_type
}

/// Plan group actions. Copies matched remote ids into `local`.
pub fn plan(local: &mut [BackendGroup], remote: &[BackendGroup], vpc_id: &str) -> GroupPlan {
    let mut plan = GroupPlan::default();
    let mut processed: HashSet<String> = HashSet::new();

    for (i, group) in local.iter_mut().enumerate() {
        let key = group.match_key();
        if processed.contains(&key) {
            debug!(group = %group.name, "backend group already planned, skip");
            continue;
        }

        let matched = if group.group_id.is_empty() {
            // Groups we did not create are only ever matched by id
            remote.iter().find(|r| r.name == group.name && !r.is_user_managed)
        } else {
            remote.iter().find(|r| r.group_id == group.group_id)
        };

        match matched {
            Some(observed) if type_changed(group, observed) => {
                if group.is_user_managed {
                    plan.errors.push(OperatorError::Configuration(format!(
                        "user managed backend group {} has type {:?}, want {:?}",
                        observed.group_id, observed.group_type, group.group_type
                    )));
                    continue;
                }
                info!(
                    group = %observed.group_id,
                    name = %observed.name,
                    from = ?observed.group_type,
                    to = ?group.group_type,
                    "backend group type changed, recreating"
                );
                group.group_id.clear();
                if !vpc_id.is_empty() {
                    group.vpc_id = vpc_id.to_string();
                }
                processed.insert(key);
                plan.actions
                    .push((i, GroupAction::CreateAndAttach { local: group.clone() }));
            }
            Some(observed) => {
                if group.group_id.is_empty() {
                    group.group_id = observed.group_id.clone();
                }
                processed.insert(key);
                let changes = group.server_changes(observed);
                if changes.is_empty() {
                    debug!(group = %group.group_id, "backend group up to date");
                } else {
                    plan.actions.push((
                        i,
                        GroupAction::Update {
                            local: group.clone(),
                            changes,
                        },
                    ));
                }
            }
            None if group.is_user_managed && !group.group_id.is_empty() => {
                plan.errors.push(OperatorError::Configuration(format!(
                    "user managed backend group {} not found",
                    group.group_id
                )));
            }
            None => {
                info!(group = %group.name, "backend group not found, creating");
                if !vpc_id.is_empty() {
                    group.vpc_id = vpc_id.to_string();
                }
                processed.insert(key);
                plan.actions
                    .push((i, GroupAction::CreateAndAttach { local: group.clone() }));
            }
        }
    }
    plan
}

/// Converge backend groups, back-filling ids into `local` and returning the
/// created groups in `remote`.
pub async fn apply(
    ctx: &PassContext<'_>,
    local: &mut LoadBalancer,
    remote: &mut LoadBalancer,
) -> Result<()> {
    let GroupPlan { actions, mut errors } =
        plan(&mut local.backend_groups, &remote.backend_groups, &remote.attribute.vpc_id);

    let (indices, actions): (Vec<usize>, Vec<GroupAction>) = actions.into_iter().unzip();
    let executor = Executor::new(ctx.cloud);
    let executor = &executor;
    let results = run_bounded(actions, ctx.parallelism, move |action| executor.apply_group(action)).await;
    let (applied, result) = partition(results);
    if let Err(e) = result {
        warn!(error = %e, "some backend groups failed to converge");
        errors.push(e);
    }

    for (pos, observed) in applied {
        let idx = indices[pos];
        local.backend_groups[idx].group_id = observed.group_id.clone();
        let existing = remote
            .backend_groups
            .iter_mut()
            .find(|r| !observed.group_id.is_empty() && r.group_id == observed.group_id);
        match existing {
            Some(existing) => {
                let kept: Vec<_> = existing
                    .servers
                    .iter()
                    .filter(|s| s.is_user_managed && !observed.servers.iter().any(|o| o.key() == s.key()))
                    .cloned()
                    .collect();
                existing.servers = observed.servers;
                existing.servers.extend(kept);
            }
            None => remote.backend_groups.push(observed),
        }
    }

    aggregate(errors)
}
