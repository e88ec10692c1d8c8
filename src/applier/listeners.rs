//! Listener phase
//!
//! Listeners are matched by (protocol, port), never by id. A plain listener
//! may forward to an encrypted one, so actions run in fixed stages: plain
//! deletes, encrypted deletes, encrypted creates, plain creates, updates.
//! Within a stage actions run in parallel.

use tracing::{debug, info, warn};

use super::executor::{Executor, ListenerAction};
use super::parallel::{partition, run_bounded};
use super::PassContext;
use crate::error::{aggregate, OperatorError, Result};
use crate::model::{BackendGroup, Listener, ListenerKey, LoadBalancer, NamespacedName};

/// Fill in `backend_group_id` of every listener that references its group by name.
pub fn resolve_backend_groups(listeners: &mut [Listener], groups: &[BackendGroup]) -> Result<()> {
    for listener in listeners
        .iter_mut()
        .filter(|l| l.backend_group_id.is_empty() && !l.backend_group_name.is_empty())
    {
        let group = groups
            .iter()
            .find(|g| g.name == listener.backend_group_name)
            .ok_or_else(|| {
                OperatorError::Reconciliation(format!(
                    "listener {} references unknown backend group {}",
                    listener, listener.backend_group_name
                ))
            })?;
        if group.group_id.is_empty() {
            return Err(OperatorError::Reconciliation(format!(
                "backend group {} of listener {} has no id yet",
                group.name, listener
            )));
        }
        listener.backend_group_id = group.group_id.clone();
    }
    Ok(())
}

/// Listener actions grouped by execution stage
#[derive(Debug, Default)]
pub struct ListenerPlan {
    pub delete_plain: Vec<Listener>,
    pub delete_encrypted: Vec<Listener>,
    pub create_encrypted: Vec<Listener>,
    pub create_plain: Vec<Listener>,
    pub update: Vec<Listener>,
}

impl ListenerPlan {
    pub fn is_empty(&self) -> bool {
        self.delete_plain.is_empty()
            && self.delete_encrypted.is_empty()
            && self.create_encrypted.is_empty()
            && self.create_plain.is_empty()
            && self.update.is_empty()
    }

    /// Stages in execution order.
    pub fn stages(self) -> Vec<(&'static str, Vec<ListenerAction>)> {
        vec![
            (
                "delete plain",
                self.delete_plain.into_iter().map(ListenerAction::Delete).collect(),
            ),
            (
                "delete encrypted",
                self.delete_encrypted.into_iter().map(ListenerAction::Delete).collect(),
            ),
            (
                "create encrypted",
                self.create_encrypted.into_iter().map(ListenerAction::Create).collect(),
            ),
            (
                "create plain",
                self.create_plain.into_iter().map(ListenerAction::Create).collect(),
            ),
            (
                "update",
                self.update.into_iter().map(ListenerAction::Update).collect(),
            ),
        ]
    }
}

/// Diff desired against observed listeners.
///
/// On a reused load balancer, an unmatched observed listener is only deleted
/// when its named key says this service and cluster created it.
pub fn plan(
    local: &[Listener],
    remote: &[Listener],
    reused: bool,
    service: &NamespacedName,
    cluster_id: &str,
) -> ListenerPlan {
    let mut plan = ListenerPlan::default();

    for observed in remote {
        if local.iter().any(|l| l.key() == observed.key()) {
            continue;
        }
        if reused
            && !observed
                .named_key()
                .is_some_and(|k| k.is_managed_by(service, cluster_id))
        {
            debug!(listener = %observed, "listener is managed by user, skip delete");
            continue;
        }
        info!(listener = %observed, "planning listener delete");
        if observed.protocol.is_encrypted() {
            plan.delete_encrypted.push(observed.clone());
        } else {
            plan.delete_plain.push(observed.clone());
        }
    }

    for desired in local {
        match remote.iter().find(|r| r.key() == desired.key()) {
            Some(observed) => {
                let mut desired = desired.clone();
                desired.listener_id = observed.listener_id.clone();
                if desired.differs_from(observed) {
                    info!(listener = %desired, "planning listener update");
                    plan.update.push(desired);
                }
            }
            None => {
                info!(listener = %desired, "planning listener create");
                if desired.protocol.is_encrypted() {
                    plan.create_encrypted.push(desired.clone());
                } else {
                    plan.create_plain.push(desired.clone());
                }
            }
        }
    }
    plan
}

pub async fn apply(
    ctx: &PassContext<'_>,
    local: &mut LoadBalancer,
    remote: &mut LoadBalancer,
) -> Result<()> {
    if local.attribute.is_user_managed && !local.attribute.force_override_listeners {
        info!(load_balancer = %remote.load_balancer_id(), "listener override is off, skip reconcile listeners");
        return Ok(());
    }

    resolve_backend_groups(&mut local.listeners, &local.backend_groups)?;

    let plan = plan(
        &local.listeners,
        &remote.listeners,
        local.attribute.is_user_managed,
        ctx.service,
        ctx.cluster_id,
    );
    if plan.is_empty() {
        debug!(load_balancer = %remote.load_balancer_id(), "listeners up to date");
        return Ok(());
    }

    let executor = Executor::new(ctx.cloud);
    let executor = &executor;
    let lb_id = remote.load_balancer_id().to_string();
    let lb_id = lb_id.as_str();
    let mut errors = Vec::new();

    for (stage, actions) in plan.stages() {
        if actions.is_empty() {
            continue;
        }
        debug!(stage, count = actions.len(), "applying listener stage");
        let keys: Vec<ListenerKey> = actions.iter().map(|a| a.listener().key()).collect();
        let results = run_bounded(actions, ctx.parallelism, move |action| {
            executor.apply_listener(lb_id, action)
        })
        .await;
        let (applied, result) = partition(results);
        if let Err(e) = result {
            warn!(stage, error = %e, "listener stage had failures");
            errors.push(e);
        }

        for (pos, outcome) in applied {
            let key = keys[pos];
            remote.listeners.retain(|l| l.key() != key);
            if let Some(listener) = outcome {
                if let Some(desired) = local.listeners.iter_mut().find(|l| l.key() == key) {
                    desired.listener_id = listener.listener_id.clone();
                }
                remote.listeners.push(listener);
            }
        }
    }

    aggregate(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ListenerPort, NamedKey, Protocol};

    fn svc() -> NamespacedName {
        NamespacedName::new("default", "web")
    }

    fn listener(protocol: Protocol, port: u16) -> Listener {
        Listener::new(protocol, ListenerPort::Single(port))
    }

    #[test]
    fn test_resolve_by_name() {
        let mut group = BackendGroup::new("web-80");
        group.group_id = "sg-1".into();
        let mut l = listener(Protocol::Tcp, 80);
        l.backend_group_name = "web-80".into();
        let mut listeners = vec![l];
        resolve_backend_groups(&mut listeners, &[group]).unwrap();
        assert_eq!(listeners[0].backend_group_id, "sg-1");
    }

    #[test]
    fn test_unresolved_reference_is_hard_error() {
        let mut l = listener(Protocol::Tcp, 80);
        l.backend_group_name = "missing".into();
        let err = resolve_backend_groups(&mut [l], &[]).unwrap_err();
        assert!(err.aborts_pass());
    }

    #[test]
    fn test_stage_ordering() {
        let remote = vec![
            listener(Protocol::Https, 8443),
            listener(Protocol::Http, 8080),
        ];
        let local = vec![listener(Protocol::Http, 80), listener(Protocol::Https, 443)];
        let plan = plan(&local, &remote, false, &svc(), "c1");
        let order: Vec<(&str, Vec<String>)> = plan
            .stages()
            .into_iter()
            .map(|(stage, actions)| {
                (
                    stage,
                    actions.iter().map(|a| a.listener().to_string()).collect::<Vec<_>>(),
                )
            })
            .filter(|(_, a)| !a.is_empty())
            .collect();
        assert_eq!(
            order,
            vec![
                ("delete plain", vec!["HTTP:8080".to_string()]),
                ("delete encrypted", vec!["HTTPS:8443".to_string()]),
                ("create encrypted", vec!["HTTPS:443".to_string()]),
                ("create plain", vec!["HTTP:80".to_string()]),
            ]
        );
    }

    #[test]
    fn test_reused_lb_only_deletes_owned_listeners() {
        let mut owned = listener(Protocol::Tcp, 80);
        owned.description = NamedKey::for_port(&svc(), "c1", 80).key();
        let foreign = listener(Protocol::Tcp, 81);
        let mut other_cluster = listener(Protocol::Tcp, 82);
        other_cluster.description = NamedKey::for_port(&svc(), "c2", 82).key();

        let plan = plan(&[], &[owned, foreign, other_cluster], true, &svc(), "c1");
        assert_eq!(plan.delete_plain.len(), 1);
        assert_eq!(plan.delete_plain[0].port, ListenerPort::Single(80));
    }

    #[test]
    fn test_unchanged_listener_needs_no_update() {
        let mut observed = listener(Protocol::Tcp, 80);
        observed.listener_id = "lsn-1".into();
        observed.backend_group_id = "sg-1".into();
        let mut desired = listener(Protocol::Tcp, 80);
        desired.backend_group_id = "sg-1".into();
        assert!(plan(&[desired.clone()], &[observed.clone()], false, &svc(), "c1").is_empty());

        desired.backend_group_id = "sg-2".into();
        let plan = plan(&[desired], &[observed], false, &svc(), "c1");
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].listener_id, "lsn-1");
    }
}
