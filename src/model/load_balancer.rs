//! Load balancer model: attributes, listeners, backend groups
//!
//! Every type here exists twice per reconciliation: a `local` copy built
//! from the declared state and a `remote` copy read from the cloud. Identity
//! fields are empty until the cloud has assigned them.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::tags::{NamedKey, NamespacedName, Tag, CLUSTER_TAG_KEY, SERVICE_TAG_KEY};

/// Whether the load balancer is reachable from the internet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AddressScheme {
    #[default]
    Internet,
    Intranet,
}

/// IP family of the load balancer frontend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    Ipv4,
    DualStack,
}

/// Listener protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
    #[serde(rename = "TCPSSL")]
    TcpSsl,
}

impl Protocol {
    /// Encryption-terminating protocols. Plain listeners may forward to these,
    /// so they are created first and deleted last.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::TcpSsl)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
            Protocol::TcpSsl => "TCPSSL",
        };
        f.write_str(s)
    }
}

/// Single port or port range; the two addressing modes are mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerPort {
    Single(u16),
    Range { start: u16, end: u16 },
}

impl fmt::Display for ListenerPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerPort::Single(p) => write!(f, "{}", p),
            ListenerPort::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

/// Attributes of the load balancer itself
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadBalancerAttribute {
    /// Cloud id; empty until created
    pub load_balancer_id: String,
    pub name: String,
    pub scheme: AddressScheme,
    pub ip_family: IpFamily,
    pub vpc_id: String,
    /// Provider assigned frontend address
    pub address: String,
    /// Provider assigned DNS name
    pub dns_name: String,
    pub bandwidth_mbps: Option<u32>,
    /// `None` on the local side means "leave as is"
    pub deletion_protection: Option<bool>,
    pub preserve_on_delete: bool,
    /// Reused load balancer the cluster did not create
    pub is_user_managed: bool,
    /// Reconcile listeners even on a reused load balancer
    pub force_override_listeners: bool,
    pub tags: Vec<Tag>,
}

/// Mutable attribute changes to push to the cloud
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadBalancerUpdate {
    pub name: Option<String>,
    pub bandwidth_mbps: Option<u32>,
    pub deletion_protection: Option<bool>,
}

impl LoadBalancerUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.bandwidth_mbps.is_none() && self.deletion_protection.is_none()
    }
}

impl LoadBalancerAttribute {
    /// Mutable differences between this (desired) attribute set and `remote`.
    pub fn update_against(&self, remote: &LoadBalancerAttribute) -> LoadBalancerUpdate {
        let mut update = LoadBalancerUpdate::default();
        if !self.name.is_empty() && self.name != remote.name {
            update.name = Some(self.name.clone());
        }
        if self.bandwidth_mbps.is_some() && self.bandwidth_mbps != remote.bandwidth_mbps {
            update.bandwidth_mbps = self.bandwidth_mbps;
        }
        if let Some(protection) = self.deletion_protection {
            if remote.deletion_protection != Some(protection) {
                update.deletion_protection = Some(protection);
            }
        }
        update
    }

    /// Attributes that differ but cannot be changed in place.
    pub fn immutable_drift(&self, remote: &LoadBalancerAttribute) -> Vec<String> {
        let mut drift = Vec::new();
        if self.scheme != remote.scheme {
            drift.push(format!(
                "address scheme {:?} -> {:?}",
                remote.scheme, self.scheme
            ));
        }
        if self.ip_family != remote.ip_family {
            drift.push(format!(
                "ip family {:?} -> {:?}",
                remote.ip_family, self.ip_family
            ));
        }
        drift
    }
}

/// Matching key for listeners across local and remote
pub type ListenerKey = (Protocol, ListenerPort);

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    /// Cloud id; empty until created
    pub listener_id: String,
    pub protocol: Protocol,
    pub port: ListenerPort,
    /// Backend group reference by name, resolved to an id before apply
    pub backend_group_name: String,
    pub backend_group_id: String,
    /// HTTP only: port of the encrypted listener requests are forwarded to
    pub forward_port: Option<u16>,
    pub certificate_id: Option<String>,
    pub idle_timeout_secs: Option<u32>,
    /// Owned listeners carry their [`NamedKey`] here
    pub description: String,
}

impl Listener {
    pub fn new(protocol: Protocol, port: ListenerPort) -> Self {
        Self {
            listener_id: String::new(),
            protocol,
            port,
            backend_group_name: String::new(),
            backend_group_id: String::new(),
            forward_port: None,
            certificate_id: None,
            idle_timeout_secs: None,
            description: String::new(),
        }
    }

    pub fn key(&self) -> ListenerKey {
        (self.protocol, self.port)
    }

    pub fn named_key(&self) -> Option<NamedKey> {
        NamedKey::parse(&self.description)
    }

    /// Whether applying `self` over `remote` would change anything.
    pub fn differs_from(&self, remote: &Listener) -> bool {
        (!self.backend_group_id.is_empty() && self.backend_group_id != remote.backend_group_id)
            || self.forward_port != remote.forward_port
            || (self.certificate_id.is_some() && self.certificate_id != remote.certificate_id)
            || (self.idle_timeout_secs.is_some()
                && self.idle_timeout_secs != remote.idle_timeout_secs)
            || (!self.description.is_empty() && self.description != remote.description)
    }
}

impl fmt::Display for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum BackendGroupType {
    /// Members are referenced by instance id
    Instance,
    /// Members are referenced by IP address
    Ip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum ServerType {
    Instance,
    Eni,
    Ip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendServer {
    /// Instance id, ENI id, or IP address depending on `server_type`
    pub server_id: String,
    pub server_ip: String,
    pub server_type: ServerType,
    pub port: u16,
    pub weight: u32,
    pub description: String,
    /// Attached by someone other than this cluster; never detached
    pub is_user_managed: bool,
}

impl BackendServer {
    pub fn key(&self) -> (&str, u16) {
        (self.server_id.as_str(), self.port)
    }
}

/// Attach/detach/reweight sets for one backend group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerChanges {
    pub add: Vec<BackendServer>,
    pub remove: Vec<BackendServer>,
    pub update: Vec<BackendServer>,
}

impl ServerChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendGroup {
    /// Cloud id; empty until created (or set up front for a reused group)
    pub group_id: String,
    pub name: String,
    /// `None` on the local side means "any type"
    pub group_type: Option<BackendGroupType>,
    pub vpc_id: String,
    pub servers: Vec<BackendServer>,
    pub is_user_managed: bool,
    pub tags: Vec<Tag>,
}

impl BackendGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            group_id: String::new(),
            name: name.into(),
            group_type: None,
            vpc_id: String::new(),
            servers: Vec::new(),
            is_user_managed: false,
            tags: Vec::new(),
        }
    }

    /// Matching key: by id when known (reuse), else by name.
    pub fn match_key(&self) -> String {
        if self.group_id.is_empty() {
            format!("name-{}", self.name)
        } else {
            format!("id-{}", self.group_id)
        }
    }

    /// Named key from the service ownership tag, if any.
    pub fn named_key(&self) -> Option<NamedKey> {
        self.tags
            .iter()
            .find(|t| t.key == SERVICE_TAG_KEY)
            .and_then(|t| NamedKey::parse(&t.value))
    }

    /// Whether the ownership tags name `service` in `cluster_id`.
    pub fn is_managed_by(&self, service: &NamespacedName, cluster_id: &str) -> bool {
        let cluster_tagged = self
            .tags
            .iter()
            .any(|t| t.key == CLUSTER_TAG_KEY && t.value == cluster_id);
        cluster_tagged
            && self
                .named_key()
                .is_some_and(|k| k.is_managed_by(service, cluster_id))
    }

    /// Changes needed to turn `remote`'s membership into `self`'s.
    ///
    /// User-managed remote servers are never scheduled for removal.
    pub fn server_changes(&self, remote: &BackendGroup) -> ServerChanges {
        let mut changes = ServerChanges::default();
        for desired in &self.servers {
            match remote.servers.iter().find(|r| r.key() == desired.key()) {
                None => changes.add.push(desired.clone()),
                Some(observed) if observed.weight != desired.weight => {
                    changes.update.push(desired.clone())
                }
                Some(_) => {}
            }
        }
        for observed in &remote.servers {
            if observed.is_user_managed {
                continue;
            }
            if !self.servers.iter().any(|d| d.key() == observed.key()) {
                changes.remove.push(observed.clone());
            }
        }
        changes
    }
}

/// Desired or observed state of one load balancer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadBalancer {
    /// Stable identity of the owning workload, carried on both local and remote
    pub namespaced_name: NamespacedName,
    pub attribute: LoadBalancerAttribute,
    pub listeners: Vec<Listener>,
    pub backend_groups: Vec<BackendGroup>,
    /// The owning object is going away (local only)
    pub deletion_requested: bool,
    /// Addresses/hostnames already published for the owning object (local only)
    pub bound_endpoints: Vec<String>,
}

impl LoadBalancer {
    /// Empty remote skeleton for `namespaced_name`
    pub fn remote_for(namespaced_name: NamespacedName) -> Self {
        Self {
            namespaced_name,
            ..Default::default()
        }
    }

    pub fn load_balancer_id(&self) -> &str {
        &self.attribute.load_balancer_id
    }

    pub fn exists(&self) -> bool {
        !self.attribute.load_balancer_id.is_empty()
    }
}
