//! Value types describing load balancers and routes
//!
//! Plain data. Reconciliation code clones and rebuilds these rather than
//! sharing them mutably across tasks.

mod load_balancer;
mod route;
pub mod tags;

use std::collections::HashSet;
use std::hash::Hash;

use tracing::warn;

pub use load_balancer::{
    AddressScheme, BackendGroup, BackendGroupType, BackendServer, IpFamily, Listener,
    ListenerKey, ListenerPort, LoadBalancer, LoadBalancerAttribute, LoadBalancerUpdate, Protocol,
    ServerChanges, ServerType,
};
pub use route::Route;
pub use tags::{NamedKey, NamespacedName, Tag};

/// Keep the first item for every key, dropping later duplicates.
pub fn dedup_by_key<T, K, F>(items: Vec<T>, what: &str, key: F) -> Vec<T>
where
    K: Eq + Hash + std::fmt::Debug,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let k = key(&item);
        if seen.contains(&k) {
            warn!(kind = what, key = ?k, "duplicate entry dropped before diffing");
            continue;
        }
        seen.insert(k);
        out.push(item);
    }
    out
}
