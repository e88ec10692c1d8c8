//! CloudLoadBalancer Custom Resource Definition
//!
//! The spec is the declared desired state of one cloud load balancer, its
//! listeners and its backend groups. [`CloudLoadBalancer::to_model`] maps it
//! onto the model the applier converges.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{OperatorError, Result};
use crate::model::{
    AddressScheme, BackendGroup, BackendGroupType, BackendServer, IpFamily, Listener, ListenerPort,
    LoadBalancer, LoadBalancerAttribute, NamespacedName, Protocol, ServerType, Tag,
};

/// CloudLoadBalancer is the Schema for the cloudloadbalancers API
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "cloudnet.io",
    version = "v1alpha1",
    kind = "CloudLoadBalancer",
    namespaced,
    status = "CloudLoadBalancerStatus",
    shortname = "clb",
    printcolumn = r#"{"name":"ID","type":"string","jsonPath":".status.loadBalancerId"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.address"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudLoadBalancerSpec {
    /// Reuse this existing load balancer instead of creating one
    #[serde(default)]
    pub load_balancer_id: Option<String>,

    /// Load balancer name; defaults to `<namespace>-<name>`
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub scheme: AddressScheme,

    #[serde(default)]
    pub ip_family: IpFamily,

    #[serde(default)]
    pub vpc_id: Option<String>,

    #[serde(default)]
    pub bandwidth_mbps: Option<u32>,

    #[serde(default)]
    pub deletion_protection: Option<bool>,

    /// Keep the load balancer, minus ownership tags, when this object is deleted
    #[serde(default)]
    pub preserve_on_delete: bool,

    /// Reconcile listeners of a reused load balancer
    #[serde(default)]
    pub force_override_listeners: bool,

    /// Extra tags on the load balancer
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    #[serde(default)]
    pub listeners: Vec<ListenerSpec>,

    #[serde(default)]
    pub backend_groups: Vec<BackendGroupSpec>,
}

/// One listener; set either `port` or both `startPort` and `endPort`
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListenerSpec {
    pub protocol: Protocol,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub start_port: Option<u16>,

    #[serde(default)]
    pub end_port: Option<u16>,

    /// Name of a backend group in this spec
    #[serde(default)]
    pub backend_group: String,

    /// Redirect to the encrypted listener on this port
    #[serde(default)]
    pub forward_port: Option<u16>,

    #[serde(default)]
    pub certificate_id: Option<String>,

    #[serde(default)]
    pub idle_timeout_secs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupSpec {
    pub name: String,

    /// Reuse this existing group; the cluster never deletes it
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub r#type: Option<BackendGroupType>,

    #[serde(default)]
    pub servers: Vec<BackendServerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendServerSpec {
    /// Instance id, ENI id, or IP address depending on `type`
    pub id: String,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default = "default_server_type")]
    pub r#type: ServerType,

    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

/// Status of the CloudLoadBalancer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudLoadBalancerStatus {
    #[serde(default)]
    pub load_balancer_id: Option<String>,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub dns_name: Option<String>,

    #[serde(default)]
    pub phase: LoadBalancerPhase,

    #[serde(default)]
    pub conditions: Vec<LoadBalancerCondition>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub last_updated: Option<String>,

    /// Error of the last failed pass
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum LoadBalancerPhase {
    #[default]
    Pending,
    Ready,
    /// Some sub-resources failed to converge
    Degraded,
    Failed,
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerCondition {
    pub r#type: String,
    /// True, False or Unknown
    pub status: String,
    #[serde(default)]
    pub last_transition_time: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ListenerSpec {
    fn port(&self) -> Result<ListenerPort> {
        match (self.port, self.start_port, self.end_port) {
            (Some(port), None, None) => Ok(ListenerPort::Single(port)),
            (None, Some(start), Some(end)) if start <= end => Ok(ListenerPort::Range { start, end }),
            _ => Err(OperatorError::Configuration(format!(
                "{} listener needs either port or a startPort <= endPort range",
                self.protocol
            ))),
        }
    }

    fn to_model(&self) -> Result<Listener> {
        let mut listener = Listener::new(self.protocol, self.port()?);
        listener.backend_group_name = self.backend_group.clone();
        listener.forward_port = self.forward_port;
        listener.certificate_id = self.certificate_id.clone();
        listener.idle_timeout_secs = self.idle_timeout_secs;
        Ok(listener)
    }
}

impl BackendGroupSpec {
    fn to_model(&self, vpc_id: &str) -> BackendGroup {
        let mut group = BackendGroup::new(self.name.as_str());
        if let Some(id) = self.id.as_deref().filter(|id| !id.is_empty()) {
            group.group_id = id.to_string();
            group.is_user_managed = true;
        }
        group.group_type = self.r#type;
        group.vpc_id = vpc_id.to_string();
        group.servers = self
            .servers
            .iter()
            .map(|s| BackendServer {
                server_id: s.id.clone(),
                server_ip: s.ip.clone().unwrap_or_default(),
                server_type: s.r#type,
                port: s.port,
                weight: s.weight,
                description: String::new(),
                is_user_managed: false,
            })
            .collect();
        group
    }
}

impl CloudLoadBalancer {
    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace().unwrap_or_else(|| "default".to_string()), self.name_any())
    }

    /// Desired state for one apply pass.
    ///
    /// A deleting object yields a model with deletion intent. An address
    /// already recorded in status is carried as a bound endpoint, so a load
    /// balancer removed out-of-band is not silently replaced.
    pub fn to_model(&self) -> Result<LoadBalancer> {
        let spec = &self.spec;
        let namespaced_name = self.namespaced_name();
        let reuse_id = spec.load_balancer_id.clone().filter(|id| !id.is_empty());
        let vpc_id = spec.vpc_id.clone().unwrap_or_default();

        let attribute = LoadBalancerAttribute {
            is_user_managed: reuse_id.is_some(),
            load_balancer_id: reuse_id.unwrap_or_default(),
            name: spec
                .name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", namespaced_name.namespace, namespaced_name.name)),
            scheme: spec.scheme,
            ip_family: spec.ip_family,
            vpc_id: vpc_id.clone(),
            bandwidth_mbps: spec.bandwidth_mbps,
            deletion_protection: spec.deletion_protection,
            preserve_on_delete: spec.preserve_on_delete,
            force_override_listeners: spec.force_override_listeners,
            tags: spec.tags.iter().map(|(k, v)| Tag::new(k.as_str(), v.as_str())).collect(),
            ..Default::default()
        };

        let listeners = spec
            .listeners
            .iter()
            .map(ListenerSpec::to_model)
            .collect::<Result<Vec<_>>>()?;
        let backend_groups = spec.backend_groups.iter().map(|g| g.to_model(&vpc_id)).collect();
        let bound_endpoints = self
            .status
            .as_ref()
            .and_then(|s| s.address.clone())
            .filter(|a| !a.is_empty())
            .into_iter()
            .collect();

        Ok(LoadBalancer {
            namespaced_name,
            attribute,
            listeners,
            backend_groups,
            deletion_requested: self.metadata.deletion_timestamp.is_some(),
            bound_endpoints,
        })
    }
}

fn default_server_type() -> ServerType {
    ServerType::Instance
}

fn default_weight() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(spec_json: serde_json::Value) -> CloudLoadBalancer {
        let spec: CloudLoadBalancerSpec = serde_json::from_value(spec_json).unwrap();
        let mut lb = CloudLoadBalancer::new("web", spec);
        lb.metadata.namespace = Some("shop".into());
        lb
    }

    #[test]
    fn test_spec_defaults() {
        let spec: CloudLoadBalancerSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec.scheme, AddressScheme::Internet);
        assert!(!spec.preserve_on_delete);
        assert!(spec.listeners.is_empty());
    }

    #[test]
    fn test_to_model() {
        let lb = object(serde_json::json!({
            "vpcId": "vpc-1",
            "listeners": [
                {"protocol": "HTTPS", "port": 443, "backendGroup": "web", "certificateId": "cert-1"},
                {"protocol": "HTTP", "port": 80, "forwardPort": 443},
                {"protocol": "TCP", "startPort": 30000, "endPort": 30010, "backendGroup": "web"}
            ],
            "backendGroups": [
                {"name": "web", "type": "Instance", "servers": [{"id": "i-1", "port": 8080}]}
            ]
        }));
        let model = lb.to_model().unwrap();
        assert_eq!(model.namespaced_name, NamespacedName::new("shop", "web"));
        assert_eq!(model.attribute.name, "shop-web");
        assert!(!model.attribute.is_user_managed);
        assert_eq!(model.listeners.len(), 3);
        assert_eq!(model.listeners[1].forward_port, Some(443));
        assert_eq!(model.listeners[2].port, ListenerPort::Range { start: 30000, end: 30010 });
        assert_eq!(model.backend_groups[0].vpc_id, "vpc-1");
        assert_eq!(model.backend_groups[0].servers[0].weight, 100);
        assert!(model.bound_endpoints.is_empty());
        assert!(!model.deletion_requested);
    }

    #[test]
    fn test_reuse_ids_mark_user_managed() {
        let lb = object(serde_json::json!({
            "loadBalancerId": "lb-user",
            "backendGroups": [{"name": "legacy", "id": "sg-user"}]
        }));
        let model = lb.to_model().unwrap();
        assert!(model.attribute.is_user_managed);
        assert_eq!(model.attribute.load_balancer_id, "lb-user");
        assert!(model.backend_groups[0].is_user_managed);
        assert_eq!(model.backend_groups[0].group_id, "sg-user");
    }

    #[test]
    fn test_ambiguous_listener_port() {
        let lb = object(serde_json::json!({
            "listeners": [{"protocol": "TCP", "port": 80, "startPort": 80, "endPort": 90}]
        }));
        assert!(matches!(lb.to_model(), Err(OperatorError::Configuration(_))));

        let lb = object(serde_json::json!({
            "listeners": [{"protocol": "TCP", "startPort": 90, "endPort": 80}]
        }));
        assert!(lb.to_model().is_err());
    }

    #[test]
    fn test_status_address_becomes_bound_endpoint() {
        let mut lb = object(serde_json::json!({}));
        lb.status = Some(CloudLoadBalancerStatus {
            address: Some("192.0.2.10".into()),
            ..Default::default()
        });
        assert_eq!(lb.to_model().unwrap().bound_endpoints, vec!["192.0.2.10".to_string()]);
    }

    #[test]
    fn test_phase_default() {
        assert_eq!(LoadBalancerPhase::default(), LoadBalancerPhase::Pending);
    }
}
