//! Remote-state builder
//!
//! Reads the observed state of one resource family into a remote
//! [`LoadBalancer`]. Only the fields of that family are touched; the local
//! model is never modified. Read failures are `Lookup` errors.

use tracing::debug;

use crate::error::{OperatorError, Result};
use crate::model::tags::{has_ownership_tag, ownership_tags, SERVICE_TAG_KEY};
use crate::model::{dedup_by_key, BackendGroup, LoadBalancer, NamedKey, NamespacedName, Tag};
use crate::provider::CloudProvider;

pub struct RemoteBuilder<'a> {
    cloud: &'a dyn CloudProvider,
    service: &'a NamespacedName,
    cluster_id: &'a str,
}

impl<'a> RemoteBuilder<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, service: &'a NamespacedName, cluster_id: &'a str) -> Self {
        Self {
            cloud,
            service,
            cluster_id,
        }
    }

    /// Service ownership tag used to find resources this cluster created
    fn service_tag(&self) -> Vec<Tag> {
        ownership_tags(self.service, self.cluster_id)
            .into_iter()
            .filter(|t| t.key == SERVICE_TAG_KEY)
            .collect()
    }

    /// Populate `remote.attribute`.
    ///
    /// A known id is looked up directly. Without one, the load balancer is
    /// resolved by ownership tag; finding nothing leaves the remote id empty.
    pub async fn build_attribute(&self, id_hint: &str, remote: &mut LoadBalancer) -> Result<()> {
        let found = if id_hint.is_empty() {
            self.cloud
                .find_load_balancer_by_tags(&self.service_tag())
                .await
                .map_err(|e| OperatorError::lookup("load balancer by ownership tag", e))?
        } else {
            self.cloud
                .find_load_balancer(id_hint)
                .await
                .map_err(|e| OperatorError::lookup(format!("load balancer {}", id_hint), e))?
        };
        match found {
            Some(attribute) => {
                debug!(load_balancer = %attribute.load_balancer_id, "found remote load balancer");
                remote.attribute = attribute;
            }
            None => debug!(service = %self.service, "no remote load balancer found"),
        }
        Ok(())
    }

    /// Re-read the attribute of a load balancer that must exist.
    pub async fn refresh_attribute(&self, id: &str, remote: &mut LoadBalancer) -> Result<()> {
        let found = self
            .cloud
            .find_load_balancer(id)
            .await
            .map_err(|e| OperatorError::lookup(format!("load balancer {}", id), e))?;
        match found {
            Some(attribute) => {
                remote.attribute = attribute;
                Ok(())
            }
            None => Err(OperatorError::Reconciliation(format!(
                "load balancer {} not found right after creation",
                id
            ))),
        }
    }

    /// Populate `remote.backend_groups`: every group tagged for this service,
    /// every group holding a server this service attached, plus the reused
    /// groups `local` references by id.
    pub async fn build_backend_groups(
        &self,
        local: &LoadBalancer,
        remote: &mut LoadBalancer,
    ) -> Result<()> {
        let mut groups = self
            .cloud
            .list_backend_groups(&self.service_tag())
            .await
            .map_err(|e| OperatorError::lookup("backend groups by ownership tag", e))?;

        // Reused groups dropped from `local` are only reachable through our servers
        let server_key = NamedKey::for_service(self.service, self.cluster_id).key();
        let attached = self
            .cloud
            .list_backend_groups_with_member(&server_key)
            .await
            .map_err(|e| OperatorError::lookup("backend groups holding our servers", e))?;
        groups.extend(attached);

        for wanted in local.backend_groups.iter().filter(|g| !g.group_id.is_empty()) {
            if groups.iter().any(|g| g.group_id == wanted.group_id) {
                continue;
            }
            let found = self
                .cloud
                .find_backend_group(&wanted.group_id)
                .await
                .map_err(|e| OperatorError::lookup(format!("backend group {}", wanted.group_id), e))?;
            if let Some(group) = found {
                groups.push(group);
            }
        }

        for group in &mut groups {
            self.mark_user_managed(group);
        }
        remote.backend_groups = dedup_by_key(groups, "remote backend group", |g| g.group_id.clone());
        Ok(())
    }

    /// Groups and servers without this service's ownership marks belong to someone else.
    fn mark_user_managed(&self, group: &mut BackendGroup) {
        group.is_user_managed = !has_ownership_tag(&group.tags);
        for server in &mut group.servers {
            server.is_user_managed = !NamedKey::parse(&server.description)
                .is_some_and(|k| k.is_managed_by(self.service, self.cluster_id));
        }
    }

    /// Populate `remote.listeners`. Requires `remote` to exist.
    pub async fn build_listeners(&self, remote: &mut LoadBalancer) -> Result<()> {
        let id = remote.attribute.load_balancer_id.clone();
        let listeners = self
            .cloud
            .list_listeners(&id)
            .await
            .map_err(|e| OperatorError::lookup(format!("listeners of {}", id), e))?;
        remote.listeners = dedup_by_key(listeners, "remote listener", |l| l.key());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendServer, LoadBalancerAttribute, ServerType};
    use crate::provider::InMemoryCloud;

    fn svc() -> NamespacedName {
        NamespacedName::new("default", "web")
    }

    #[tokio::test]
    async fn test_missing_load_balancer_is_not_an_error() {
        let cloud = InMemoryCloud::new();
        let service = svc();
        let builder = RemoteBuilder::new(&cloud, &service, "c1");
        let mut remote = LoadBalancer::remote_for(svc());
        builder.build_attribute("", &mut remote).await.unwrap();
        assert!(!remote.exists());
    }

    #[tokio::test]
    async fn test_resolves_by_ownership_tag() {
        let cloud = InMemoryCloud::new();
        cloud.insert_load_balancer(LoadBalancerAttribute {
            tags: ownership_tags(&NamespacedName::new("default", "other"), "c1"),
            ..Default::default()
        });
        let ours = cloud.insert_load_balancer(LoadBalancerAttribute {
            tags: ownership_tags(&svc(), "c1"),
            ..Default::default()
        });

        let service = svc();
        let builder = RemoteBuilder::new(&cloud, &service, "c1");
        let mut remote = LoadBalancer::remote_for(svc());
        builder.build_attribute("", &mut remote).await.unwrap();
        assert_eq!(remote.load_balancer_id(), ours);
    }

    #[tokio::test]
    async fn test_reused_groups_and_foreign_servers_are_user_managed() {
        let cloud = InMemoryCloud::new();
        let mut reused = BackendGroup::new("legacy");
        reused.servers.push(BackendServer {
            server_id: "i-manual".into(),
            server_ip: String::new(),
            server_type: ServerType::Instance,
            port: 80,
            weight: 100,
            description: "added by hand".into(),
            is_user_managed: false,
        });
        let reused_id = cloud.insert_backend_group(reused);

        let mut local = LoadBalancer::remote_for(svc());
        let mut wanted = BackendGroup::new("legacy");
        wanted.group_id = reused_id.clone();
        local.backend_groups.push(wanted);

        let service = svc();
        let builder = RemoteBuilder::new(&cloud, &service, "c1");
        let mut remote = LoadBalancer::remote_for(svc());
        builder.build_backend_groups(&local, &mut remote).await.unwrap();

        assert_eq!(remote.backend_groups.len(), 1);
        let group = &remote.backend_groups[0];
        assert_eq!(group.group_id, reused_id);
        assert!(group.is_user_managed);
        assert!(group.servers[0].is_user_managed);
    }

    #[tokio::test]
    async fn test_unreferenced_group_holding_our_server_is_found() {
        let cloud = InMemoryCloud::new();
        let service = svc();
        let mut reused = BackendGroup::new("legacy");
        reused.servers.push(BackendServer {
            server_id: "i-1".into(),
            server_ip: String::new(),
            server_type: ServerType::Instance,
            port: 80,
            weight: 100,
            description: NamedKey::for_service(&service, "c1").key(),
            is_user_managed: false,
        });
        let reused_id = cloud.insert_backend_group(reused);
        cloud.insert_backend_group(BackendGroup::new("unrelated"));

        let builder = RemoteBuilder::new(&cloud, &service, "c1");
        let mut remote = LoadBalancer::remote_for(svc());
        let local = LoadBalancer::remote_for(svc());
        builder.build_backend_groups(&local, &mut remote).await.unwrap();

        assert_eq!(remote.backend_groups.len(), 1);
        let group = &remote.backend_groups[0];
        assert_eq!(group.group_id, reused_id);
        assert!(group.is_user_managed);
        assert!(!group.servers[0].is_user_managed);
    }
}
