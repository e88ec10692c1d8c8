//! Route table entry model

use std::fmt;

/// One route table entry routing a node's pod CIDR to the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Provider-side entry name, empty until created
    pub name: String,
    pub destination_cidr: String,
    /// Provider instance id of the owning node
    pub provider_id: String,
    pub route_table_id: String,
    /// Name of the node this route serves, empty for routes read from the cloud
    /// that no node claims
    pub node_name: String,
}

impl Route {
    pub fn new(
        route_table_id: impl Into<String>,
        provider_id: impl Into<String>,
        destination_cidr: impl Into<String>,
    ) -> Self {
        Self {
            name: String::new(),
            destination_cidr: destination_cidr.into(),
            provider_id: provider_id.into(),
            route_table_id: route_table_id.into(),
            node_name: String::new(),
        }
    }

    pub fn for_node(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = node_name.into();
        self
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.destination_cidr, self.provider_id, self.route_table_id
        )
    }
}
