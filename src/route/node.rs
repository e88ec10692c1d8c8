//! Route-relevant view of a Kubernetes Node

use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use tracing::debug;

/// Nodes carrying this label never get a route.
pub const EXCLUDE_NODE_LABEL: &str = "service.beta.kubernetes.io/exclude-node";

/// Why a node is left out of route creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Excluded,
    ReadyUnknown,
    Deleting,
    NoProviderId,
    NoPodCidr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRouteInfo {
    pub name: String,
    pub uid: Option<String>,
    pub provider_id: String,
    /// First IPv4 pod CIDR
    pub pod_cidr: Option<IpNet>,
    pub excluded: bool,
    pub ready_unknown: bool,
    pub deleting: bool,
}

impl NodeRouteInfo {
    pub fn from_node(node: &Node) -> Self {
        let meta = &node.metadata;
        let spec = node.spec.as_ref();
        let excluded = meta
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(EXCLUDE_NODE_LABEL));
        let ready_unknown = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
            .is_some_and(|c| c.status == "Unknown");

        Self {
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
            provider_id: spec.and_then(|s| s.provider_id.clone()).unwrap_or_default(),
            pod_cidr: spec.and_then(|s| first_ipv4_cidr(s.pod_cidrs.as_deref(), s.pod_cidr.as_deref())),
            excluded,
            ready_unknown,
            deleting: meta.deletion_timestamp.is_some(),
        }
    }

    /// `None` when a route should exist for this node.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        if self.excluded {
            Some(SkipReason::Excluded)
        } else if self.ready_unknown {
            Some(SkipReason::ReadyUnknown)
        } else if self.deleting {
            Some(SkipReason::Deleting)
        } else if self.provider_id.is_empty() {
            Some(SkipReason::NoProviderId)
        } else if self.pod_cidr.is_none() {
            Some(SkipReason::NoPodCidr)
        } else {
            None
        }
    }

    pub fn needs_route(&self) -> bool {
        match self.skip_reason() {
            None => true,
            Some(reason) => {
                debug!(node = %self.name, ?reason, "skip creating route");
                false
            }
        }
    }

    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some("v1".to_string()),
            kind: Some("Node".to_string()),
            name: Some(self.name.clone()),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

/// First parsable IPv4 entry of `pod_cidrs`, falling back to `pod_cidr`.
fn first_ipv4_cidr(pod_cidrs: Option<&[String]>, pod_cidr: Option<&str>) -> Option<IpNet> {
    let candidates = pod_cidrs.unwrap_or_default().iter().map(String::as_str);
    candidates
        .chain(pod_cidr)
        .filter_map(|c| c.parse::<IpNet>().ok())
        .find(|net| matches!(net, IpNet::V4(_)))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{NodeCondition, NodeSpec, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;

    fn node(name: &str, provider_id: Option<&str>, pod_cidrs: &[&str]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                provider_id: provider_id.map(String::from),
                pod_cidrs: Some(pod_cidrs.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_eligible_node() {
        let info = NodeRouteInfo::from_node(&node("n1", Some("i-1"), &["10.1.0.0/24"]));
        assert_eq!(info.skip_reason(), None);
        assert_eq!(info.pod_cidr, Some("10.1.0.0/24".parse().unwrap()));
    }

    #[test]
    fn test_first_ipv4_cidr_wins() {
        let info = NodeRouteInfo::from_node(&node("n1", Some("i-1"), &["fd00::/64", "10.1.0.0/24"]));
        assert_eq!(info.pod_cidr, Some("10.1.0.0/24".parse().unwrap()));

        let info = NodeRouteInfo::from_node(&node("n1", Some("i-1"), &["fd00::/64"]));
        assert_eq!(info.skip_reason(), Some(SkipReason::NoPodCidr));
    }

    #[test]
    fn test_skip_reasons() {
        let mut n = node("n1", Some("i-1"), &["10.1.0.0/24"]);
        n.metadata.labels = Some(BTreeMap::from([(EXCLUDE_NODE_LABEL.to_string(), "true".to_string())]));
        assert_eq!(NodeRouteInfo::from_node(&n).skip_reason(), Some(SkipReason::Excluded));

        let mut n = node("n1", Some("i-1"), &["10.1.0.0/24"]);
        n.status = Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".into(),
                status: "Unknown".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(NodeRouteInfo::from_node(&n).skip_reason(), Some(SkipReason::ReadyUnknown));

        let mut n = node("n1", Some("i-1"), &["10.1.0.0/24"]);
        n.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(NodeRouteInfo::from_node(&n).skip_reason(), Some(SkipReason::Deleting));

        let n = node("n1", None, &["10.1.0.0/24"]);
        assert_eq!(NodeRouteInfo::from_node(&n).skip_reason(), Some(SkipReason::NoProviderId));
    }
}
