//! CIDR containment and route conflict detection

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

use super::node::NodeRouteInfo;
use crate::error::{OperatorError, Result};
use crate::model::Route;

/// How a route's destination relates to an enclosing network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Containment {
    /// Identical networks
    pub equal: bool,
    /// `outside` strictly contains the route
    pub contains: bool,
}

impl Containment {
    /// Inside the boundary, equal or strictly contained.
    pub fn in_scope(&self) -> bool {
        self.equal || self.contains
    }
}

/// Relate `inside` to `outside`. A missing boundary contains everything.
///
/// Containment holds when both the first and the last address of `inside`
/// fall in `outside`.
pub fn containment(outside: Option<&IpNet>, inside: &str) -> Result<Containment> {
    let Some(outside) = outside else {
        return Ok(Containment {
            equal: true,
            contains: true,
        });
    };
    let inside: IpNet = inside.trim().parse().map_err(|e| {
        OperatorError::Configuration(format!("ignoring route {}, unparsable CIDR: {}", inside, e))
    })?;

    if *outside == inside {
        return Ok(Containment {
            equal: true,
            contains: false,
        });
    }
    let first: IpAddr = inside.network();
    let last: IpAddr = inside.broadcast();
    Ok(Containment {
        equal: false,
        contains: outside.contains(&first) && outside.contains(&last),
    })
}

/// The first node whose pod CIDR overlaps `route` in a way only one of them may own.
///
/// A node conflicts when its pod CIDR strictly contains the route, or when
/// the two are equal but owned by different instances.
pub fn conflicting_node<'a>(route: &Route, nodes: &'a [NodeRouteInfo]) -> Option<&'a NodeRouteInfo> {
    nodes.iter().find(|node| {
        let Some(pod_cidr) = node.pod_cidr.as_ref() else {
            return false;
        };
        match containment(Some(pod_cidr), &route.destination_cidr) {
            Ok(c) => {
                let conflict = c.contains || (c.equal && route.provider_id != node.provider_id);
                if conflict {
                    warn!(node = %node.name, pod_cidr = %pod_cidr, route = %route, "route conflicts with node");
                }
                conflict
            }
            Err(e) => {
                warn!(node = %node.name, route = %route, error = %e, "can not compare route with node");
                false
            }
        }
    })
}
