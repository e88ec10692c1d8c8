//! Ownership tags and named keys
//!
//! A cloud resource created by this operator carries two tags: the service
//! tag (value = the service's [`NamedKey`]) and the cluster tag (value = the
//! cluster id). Listeners and backend groups cannot always be tagged, so they
//! carry the named key in their description/name instead.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag key holding the owning service's named key
pub const SERVICE_TAG_KEY: &str = "kubernetes.do.not.delete";

/// Tag key holding the owning cluster id
pub const CLUSTER_TAG_KEY: &str = "cloudnet.io/cluster-id";

const NAMED_KEY_PREFIX: &str = "k8s";
const NAMED_KEY_ANY_PORT: &str = "-";

/// A `(key, value)` tag on a cloud resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Whether any tag marks the resource as owned by some cluster.
pub fn has_ownership_tag(tags: &[Tag]) -> bool {
    tags.iter()
        .any(|t| t.key == SERVICE_TAG_KEY || t.key == CLUSTER_TAG_KEY)
}

/// `namespace/name` of the workload object a model was derived from
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Structured identity encoding `cluster/service[/port]`.
///
/// Rendered as `k8s/<port>/<service>/<namespace>/<cluster>` where `<port>` is
/// `-` when the key names the whole service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamedKey {
    pub port: Option<u16>,
    pub service: String,
    pub namespace: String,
    pub cluster_id: String,
}

impl NamedKey {
    /// Key naming a whole service
    pub fn for_service(service: &NamespacedName, cluster_id: &str) -> Self {
        Self {
            port: None,
            service: service.name.clone(),
            namespace: service.namespace.clone(),
            cluster_id: cluster_id.to_string(),
        }
    }

    /// Key naming one port of a service
    pub fn for_port(service: &NamespacedName, cluster_id: &str, port: u16) -> Self {
        Self {
            port: Some(port),
            ..Self::for_service(service, cluster_id)
        }
    }

    pub fn key(&self) -> String {
        let port = self
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| NAMED_KEY_ANY_PORT.to_string());
        format!(
            "{}/{}/{}/{}/{}",
            NAMED_KEY_PREFIX, port, self.service, self.namespace, self.cluster_id
        )
    }

    /// Parse a rendered key. Anything that is not a well-formed key yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() != 5 || parts[0] != NAMED_KEY_PREFIX {
            return None;
        }
        if parts[2..].iter().any(|p| p.is_empty()) {
            return None;
        }
        let port = match parts[1] {
            NAMED_KEY_ANY_PORT => None,
            p => Some(p.parse::<u16>().ok()?),
        };
        Some(Self {
            port,
            service: parts[2].to_string(),
            namespace: parts[3].to_string(),
            cluster_id: parts[4].to_string(),
        })
    }

    pub fn is_managed_by(&self, service: &NamespacedName, cluster_id: &str) -> bool {
        self.cluster_id == cluster_id
            && self.service == service.name
            && self.namespace == service.namespace
    }
}

impl fmt::Display for NamedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Ownership tags stamped on resources this operator creates for `service`.
pub fn ownership_tags(service: &NamespacedName, cluster_id: &str) -> Vec<Tag> {
    vec![
        Tag::new(
            SERVICE_TAG_KEY,
            NamedKey::for_service(service, cluster_id).key(),
        ),
        Tag::new(CLUSTER_TAG_KEY, cluster_id),
    ]
}
