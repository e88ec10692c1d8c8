//! Custom Resource Definitions for the cloudnet operator
//!
//! - CloudLoadBalancer: a cloud load balancer with its listeners and backend groups

mod load_balancer;

pub use load_balancer::{
    BackendGroupSpec, BackendServerSpec, CloudLoadBalancer, CloudLoadBalancerSpec,
    CloudLoadBalancerStatus, ListenerSpec, LoadBalancerCondition, LoadBalancerPhase,
};
