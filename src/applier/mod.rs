//! Desired-state reconciliation for load balancers
//!
//! [`ModelApplier::apply`] converges one load balancer: attributes, then
//! backend groups, then listeners, then the cleanup pass. Phases run strictly
//! in that order. Action failures are collected and the pass continues; a
//! failure that leaves later phases without a trustworthy view stops it.

mod attributes;
mod backend_groups;
mod cleanup;
pub mod executor;
mod listeners;
pub mod parallel;
mod remote;

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::{aggregate, OperatorError, Result};
use crate::events::{reasons, EventRecorder};
use crate::model::tags::ownership_tags;
use crate::model::{dedup_by_key, ListenerPort, LoadBalancer, NamedKey, NamespacedName, Tag};
use crate::provider::CloudProvider;

pub use remote::RemoteBuilder;

/// Everything one reconciliation pass needs
pub(crate) struct PassContext<'a> {
    pub cloud: &'a dyn CloudProvider,
    pub service: &'a NamespacedName,
    pub cluster_id: &'a str,
    pub parallelism: usize,
    pub events: &'a dyn EventRecorder,
}

impl<'a> PassContext<'a> {
    fn builder(&self) -> RemoteBuilder<'a> {
        RemoteBuilder::new(self.cloud, self.service, self.cluster_id)
    }
}

/// Converges load balancers against a cloud provider
#[derive(Clone)]
pub struct ModelApplier {
    cloud: Arc<dyn CloudProvider>,
    cluster_id: String,
    max_parallelism: usize,
}

impl ModelApplier {
    pub fn new(cloud: Arc<dyn CloudProvider>, cluster_id: impl Into<String>, max_parallelism: usize) -> Self {
        Self {
            cloud,
            cluster_id: cluster_id.into(),
            max_parallelism: max_parallelism.max(1),
        }
    }

    /// Converge the cloud towards `local`.
    ///
    /// Always returns the observed model as it stands after the pass, along
    /// with every error collected on the way.
    #[instrument(skip_all, fields(service = %local.namespaced_name))]
    pub async fn apply(&self, local: LoadBalancer, events: &dyn EventRecorder) -> (LoadBalancer, Result<()>) {
        let mut remote = LoadBalancer::remote_for(local.namespaced_name.clone());
        let service = local.namespaced_name.clone();
        let ctx = PassContext {
            cloud: self.cloud.as_ref(),
            service: &service,
            cluster_id: &self.cluster_id,
            parallelism: self.max_parallelism,
            events,
        };
        let result = run(&ctx, prepare(local, &self.cluster_id), &mut remote).await;
        (remote, result)
    }
}

/// Stamp ownership marks on everything this cluster will create, and drop
/// duplicate listeners and groups before diffing.
fn prepare(mut local: LoadBalancer, cluster_id: &str) -> LoadBalancer {
    if local.deletion_requested {
        local.listeners.clear();
        local.backend_groups.clear();
    }

    let service = local.namespaced_name.clone();
    let tags = ownership_tags(&service, cluster_id);
    if !local.attribute.is_user_managed {
        merge_tags(&mut local.attribute.tags, &tags);
    }
    let server_key = NamedKey::for_service(&service, cluster_id).key();
    for group in &mut local.backend_groups {
        if !group.is_user_managed {
            merge_tags(&mut group.tags, &tags);
        }
        for server in group.servers.iter_mut().filter(|s| s.description.is_empty()) {
            server.description = server_key.clone();
        }
    }
    for listener in local.listeners.iter_mut().filter(|l| l.description.is_empty()) {
        listener.description = match listener.port {
            ListenerPort::Single(port) => NamedKey::for_port(&service, cluster_id, port).key(),
            ListenerPort::Range { .. } => server_key.clone(),
        };
    }

    local.listeners = dedup_by_key(std::mem::take(&mut local.listeners), "listener", |l| l.key());
    local.backend_groups = dedup_by_key(
        std::mem::take(&mut local.backend_groups),
        "backend group",
        |g| g.match_key(),
    );
    local
}

fn merge_tags(into: &mut Vec<Tag>, tags: &[Tag]) {
    for tag in tags {
        if !into.iter().any(|t| t.key == tag.key) {
            into.push(tag.clone());
        }
    }
}

fn abort(mut errors: Vec<OperatorError>, err: OperatorError) -> Result<()> {
    errors.push(err);
    aggregate(errors)
}

async fn run(ctx: &PassContext<'_>, mut local: LoadBalancer, remote: &mut LoadBalancer) -> Result<()> {
    let builder = ctx.builder();
    builder
        .build_attribute(local.load_balancer_id(), remote)
        .await?;

    if remote.exists() && local.attribute.preserve_on_delete {
        ctx.events
            .warn(
                reasons::PRESERVED_ON_DELETE,
                format!(
                    "The load balancer [{}] will be preserved after the object is deleted.",
                    remote.load_balancer_id()
                ),
            )
            .await;
    }

    let mut errors = Vec::new();
    if let Err(e) = attributes::apply(ctx, &mut local, remote).await {
        if e.aborts_pass() {
            return abort(errors, e);
        }
        errors.push(e);
    }

    if !remote.exists() && !local.deletion_requested {
        return abort(
            errors,
            OperatorError::Reconciliation(format!(
                "can not find load balancer for {}",
                local.namespaced_name
            )),
        );
    }

    if let Err(e) = builder.build_backend_groups(&local, remote).await {
        return abort(errors, e);
    }
    if let Err(e) = backend_groups::apply(ctx, &mut local, remote).await {
        errors.push(e);
    }

    if remote.exists() {
        if let Err(e) = builder.build_listeners(remote).await {
            return abort(errors, e);
        }
        if let Err(e) = listeners::apply(ctx, &mut local, remote).await {
            if e.aborts_pass() {
                return abort(errors, e);
            }
            errors.push(e);
        }
    }

    if let Err(e) = cleanup::apply(ctx, &local, remote).await {
        errors.push(e);
    }

    if errors.is_empty() {
        info!(load_balancer = %remote.load_balancer_id(), "load balancer converged");
    } else {
        debug!(count = errors.len(), "load balancer pass finished with errors");
    }
    aggregate(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEvents;
    use crate::model::{
        BackendGroup, BackendGroupType, BackendServer, Listener, LoadBalancerAttribute, Protocol,
        ServerType,
    };
    use crate::provider::memory::Op;
    use crate::provider::InMemoryCloud;

    const CLUSTER: &str = "c1";

    fn svc() -> NamespacedName {
        NamespacedName::new("default", "web")
    }

    fn server(id: &str) -> BackendServer {
        BackendServer {
            server_id: id.into(),
            server_ip: String::new(),
            server_type: ServerType::Instance,
            port: 8080,
            weight: 100,
            description: String::new(),
            is_user_managed: false,
        }
    }

    fn group(name: &str, servers: &[&str]) -> BackendGroup {
        let mut g = BackendGroup::new(name);
        g.servers = servers.iter().map(|s| server(s)).collect();
        g
    }

    fn listener(protocol: Protocol, port: u16, group: &str) -> Listener {
        let mut l = Listener::new(protocol, ListenerPort::Single(port));
        l.backend_group_name = group.into();
        l
    }

    fn desired() -> LoadBalancer {
        let mut lb = LoadBalancer::remote_for(svc());
        lb.attribute = LoadBalancerAttribute {
            name: "web-lb".into(),
            vpc_id: "vpc-1".into(),
            ..Default::default()
        };
        lb.backend_groups = vec![group("web-443", &["i-1", "i-2"]), group("web-80", &["i-1"])];
        let mut http = listener(Protocol::Http, 80, "web-80");
        http.forward_port = Some(443);
        lb.listeners = vec![http, listener(Protocol::Https, 443, "web-443")];
        lb
    }

    fn applier(cloud: &Arc<InMemoryCloud>) -> ModelApplier {
        ModelApplier::new(cloud.clone(), CLUSTER, 4)
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let cloud = Arc::new(InMemoryCloud::new());
        let events = RecordingEvents::default();
        let applier = applier(&cloud);

        let (remote, result) = applier.apply(desired(), &events).await;
        result.unwrap();
        assert!(remote.exists());
        assert_eq!(remote.listeners.len(), 2);
        assert_eq!(remote.backend_groups.len(), 2);

        cloud.reset_mutations();
        let (again, result) = applier.apply(desired(), &events).await;
        result.unwrap();
        assert_eq!(cloud.mutations(), Vec::<String>::new());
        assert_eq!(again.load_balancer_id(), remote.load_balancer_id());
    }

    #[tokio::test]
    async fn test_encrypted_listener_created_before_forwarding_listener() {
        let cloud = Arc::new(InMemoryCloud::new());
        let (_, result) = applier(&cloud).apply(desired(), &RecordingEvents::default()).await;
        result.unwrap();

        let listener_ops: Vec<String> = cloud
            .mutations()
            .into_iter()
            .filter(|m| m.contains("listener"))
            .collect();
        assert_eq!(
            listener_ops,
            vec!["create_listener HTTPS:443", "create_listener HTTP:80"]
        );

        let phases: Vec<String> = cloud
            .mutations()
            .into_iter()
            .map(|m| m.split(' ').next().unwrap_or_default().to_string())
            .collect();
        let first_group = phases.iter().position(|m| m == "create_backend_group").unwrap();
        let first_listener = phases.iter().position(|m| m == "create_listener").unwrap();
        assert_eq!(phases[0], "create_load_balancer");
        assert!(first_group < first_listener);
    }

    #[tokio::test]
    async fn test_forwarding_listener_deleted_before_its_target() {
        let cloud = Arc::new(InMemoryCloud::new());
        let events = RecordingEvents::default();
        let applier = applier(&cloud);
        applier.apply(desired(), &events).await.1.unwrap();

        let mut smaller = desired();
        smaller.listeners.clear();
        cloud.reset_mutations();
        applier.apply(smaller, &events).await.1.unwrap();

        let listener_ops: Vec<String> = cloud
            .mutations()
            .into_iter()
            .filter(|m| m.contains("listener"))
            .collect();
        assert_eq!(
            listener_ops,
            vec!["delete_listener HTTP:80", "delete_listener HTTPS:443"]
        );
    }

    #[tokio::test]
    async fn test_partial_group_failure_is_isolated() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.fail(Op::CreateBackendGroup, "web-80", "QuotaExceeded.ServerGroup");
        let mut local = desired();
        local.listeners.clear();

        let (remote, result) = applier(&cloud).apply(local, &RecordingEvents::default()).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("web-80"));
        assert!(!err.to_string().contains("web-443"));

        let names: Vec<&str> = remote.backend_groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["web-443"]);
        assert_eq!(remote.backend_groups[0].servers.len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_listener_group_stops_the_pass() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.fail(Op::CreateBackendGroup, "web-80", "QuotaExceeded.ServerGroup");

        let (remote, result) = applier(&cloud).apply(desired(), &RecordingEvents::default()).await;
        let err = result.unwrap_err();
        assert!(matches!(err, OperatorError::Aggregate(_)));
        assert!(err.to_string().contains("has no id yet") || err.to_string().contains("unknown backend group"));
        assert!(remote.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_groups_are_never_deleted() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        applier.apply(desired(), &events).await.1.unwrap();

        // A group tagged for this service by another cluster, with one of our servers in it
        let mut foreign = group("shared", &[]);
        foreign.tags = ownership_tags(&svc(), "c2");
        foreign.tags[0].value = NamedKey::for_service(&svc(), CLUSTER).key();
        let mut ours = server("i-9");
        ours.description = NamedKey::for_service(&svc(), CLUSTER).key();
        let mut theirs = server("i-10");
        theirs.description = "manual".into();
        foreign.servers = vec![ours, theirs];
        let foreign_id = cloud.insert_backend_group(foreign);

        cloud.reset_mutations();
        applier.apply(desired(), &events).await.1.unwrap();

        let still_there = cloud.backend_group(&foreign_id).unwrap();
        assert_eq!(still_there.servers.len(), 1);
        assert_eq!(still_there.servers[0].server_id, "i-10");
        assert!(!cloud.mutations().iter().any(|m| m.starts_with("delete_backend_group")));
    }

    fn with_reused_group(cloud: &InMemoryCloud) -> (LoadBalancer, String) {
        let mut legacy = group("legacy", &[]);
        let mut manual = server("i-manual");
        manual.description = "added by hand".into();
        legacy.servers = vec![manual];
        let id = cloud.insert_backend_group(legacy);

        let mut local = desired();
        let mut reused = group("legacy", &["i-1"]);
        reused.group_id = id.clone();
        reused.is_user_managed = true;
        local.backend_groups.push(reused);
        (local, id)
    }

    fn member_ids(cloud: &InMemoryCloud, group_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = cloud
            .backend_group(group_id)
            .unwrap()
            .servers
            .iter()
            .map(|s| s.server_id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_delete_detaches_our_servers_from_reused_group() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        let (mut local, legacy) = with_reused_group(&cloud);
        applier.apply(local.clone(), &events).await.1.unwrap();
        assert_eq!(member_ids(&cloud, &legacy), vec!["i-1", "i-manual"]);

        local.deletion_requested = true;
        let (remote, result) = applier.apply(local, &events).await;
        result.unwrap();
        assert!(!remote.exists());
        assert_eq!(member_ids(&cloud, &legacy), vec!["i-manual"]);
        assert_eq!(cloud.backend_groups().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_reused_group_releases_our_servers() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        let (local, legacy) = with_reused_group(&cloud);
        applier.apply(local, &events).await.1.unwrap();
        assert_eq!(member_ids(&cloud, &legacy), vec!["i-1", "i-manual"]);

        cloud.reset_mutations();
        applier.apply(desired(), &events).await.1.unwrap();
        assert_eq!(member_ids(&cloud, &legacy), vec!["i-manual"]);
        assert!(!cloud.mutations().iter().any(|m| m.starts_with("delete_backend_group")));

        // Nothing of ours is left in it, so the group drops out of view
        cloud.reset_mutations();
        applier.apply(desired(), &events).await.1.unwrap();
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_reuse_of_cluster_owned_load_balancer_is_rejected() {
        let cloud = Arc::new(InMemoryCloud::new());
        let owned = cloud.insert_load_balancer(LoadBalancerAttribute {
            tags: ownership_tags(&NamespacedName::new("default", "api"), CLUSTER),
            ..Default::default()
        });

        let mut local = desired();
        local.attribute.load_balancer_id = owned;
        local.attribute.is_user_managed = true;
        let events = RecordingEvents::default();
        let (_, result) = applier(&cloud).apply(local, &events).await;

        let err = result.unwrap_err();
        assert!(matches!(err, OperatorError::ReuseConflict { .. }));
        assert!(!err.is_retryable());
        assert_eq!(events.reasons(), vec![reasons::REUSE_REJECTED.to_string()]);
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_reused_load_balancer_is_rejected() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut local = desired();
        local.attribute.load_balancer_id = "lb-gone".into();
        local.attribute.is_user_managed = true;

        let (_, result) = applier(&cloud).apply(local, &RecordingEvents::default()).await;
        assert!(matches!(result, Err(OperatorError::ReuseConflict { .. })));
    }

    #[tokio::test]
    async fn test_reused_load_balancer_keeps_user_listeners() {
        let cloud = Arc::new(InMemoryCloud::new());
        let reused = cloud.insert_load_balancer(LoadBalancerAttribute::default());
        cloud.insert_listener(&reused, Listener::new(Protocol::Tcp, ListenerPort::Single(22)));

        let mut local = desired();
        local.attribute.load_balancer_id = reused.clone();
        local.attribute.is_user_managed = true;
        local.attribute.force_override_listeners = true;
        applier(&cloud)
            .apply(local, &RecordingEvents::default())
            .await
            .1
            .unwrap();

        let ports: Vec<String> = cloud.listeners(&reused).iter().map(|l| l.to_string()).collect();
        assert!(ports.contains(&"TCP:22".to_string()));
        assert_eq!(ports.len(), 3);
    }

    #[tokio::test]
    async fn test_bound_address_without_load_balancer_fails() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut local = desired();
        local.bound_endpoints = vec!["192.0.2.44".into()];
        let (_, result) = applier(&cloud).apply(local, &RecordingEvents::default()).await;
        assert!(matches!(result, Err(OperatorError::Reconciliation(_))));
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        let (remote, result) = applier.apply(desired(), &events).await;
        result.unwrap();
        let id = remote.load_balancer_id().to_string();

        let mut deleting = desired();
        deleting.deletion_requested = true;
        let (remote, result) = applier.apply(deleting.clone(), &events).await;
        result.unwrap();
        assert!(!remote.exists());
        assert!(cloud.load_balancer(&id).is_none());
        assert!(cloud.backend_groups().is_empty());

        cloud.reset_mutations();
        applier.apply(deleting, &events).await.1.unwrap();
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_preserve_on_delete_strips_ownership() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        let mut local = desired();
        local.attribute.preserve_on_delete = true;
        local.attribute.deletion_protection = Some(true);
        let (remote, result) = applier.apply(local.clone(), &events).await;
        result.unwrap();
        let id = remote.load_balancer_id().to_string();
        assert!(events.reasons().is_empty());

        local.deletion_requested = true;
        let (remote, result) = applier.apply(local, &events).await;
        result.unwrap();
        assert!(!remote.exists());
        assert_eq!(events.reasons(), vec![reasons::PRESERVED_ON_DELETE.to_string()]);

        let kept = cloud.load_balancer(&id).unwrap();
        assert!(!crate::model::tags::has_ownership_tag(&kept.tags));
        assert_eq!(kept.deletion_protection, Some(false));
        assert_eq!(cloud.listeners(&id).len(), 2);
        let groups = cloud.backend_groups();
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| !crate::model::tags::has_ownership_tag(&g.tags)));
    }

    #[tokio::test]
    async fn test_group_type_change_replaces_group_in_one_pass() {
        let cloud = Arc::new(InMemoryCloud::new());
        let applier = applier(&cloud);
        let events = RecordingEvents::default();
        applier.apply(desired(), &events).await.1.unwrap();
        let old: Vec<String> = cloud.backend_groups().iter().map(|g| g.group_id.clone()).collect();

        let mut changed = desired();
        changed.backend_groups[1].group_type = Some(BackendGroupType::Ip);
        let (remote, result) = applier.apply(changed, &events).await;
        result.unwrap();

        let groups = cloud.backend_groups();
        assert_eq!(groups.len(), 2);
        let replacement = groups.iter().find(|g| g.name == "web-80").unwrap();
        assert!(!old.contains(&replacement.group_id));
        assert_eq!(replacement.group_type, Some(BackendGroupType::Ip));
        let http = remote
            .listeners
            .iter()
            .find(|l| l.protocol == Protocol::Http)
            .unwrap();
        assert_eq!(http.backend_group_id, replacement.group_id);
    }

    #[tokio::test]
    async fn test_failed_listener_create_does_not_block_siblings() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.fail(Op::CreateListener, "HTTPS:443", "CertificateNotFound");
        let (remote, result) = applier(&cloud).apply(desired(), &RecordingEvents::default()).await;

        let err = result.unwrap_err();
        assert!(err.is_retryable());
        // HTTP:80 forwards to the missing HTTPS listener, so both fail; groups still converge
        assert!(remote.listeners.is_empty());
        assert_eq!(remote.backend_groups.len(), 2);
        match err {
            OperatorError::Aggregate(agg) => assert_eq!(agg.len(), 2),
            other => panic!("expected two failures, got {other}"),
        }
    }
}
