//! Cloudnet Kubernetes Operator
//!
//! Converges cloud load balancers (attributes, listeners, backend groups)
//! and VPC route table entries to the state declared in the cluster.
//!
//! ## Custom Resources
//!
//! - `CloudLoadBalancer`: a load balancer with its listeners and backend groups
//!
//! Node pod CIDR routes need no custom resource; the route controller
//! watches Nodes directly.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: cloudnet.io/v1alpha1
//! kind: CloudLoadBalancer
//! metadata:
//!   name: web
//! spec:
//!   listeners:
//!     - protocol: HTTPS
//!       port: 443
//!       backendGroup: web
//!       certificateId: cert-123
//!     - protocol: HTTP
//!       port: 80
//!       forwardPort: 443
//!   backendGroups:
//!     - name: web
//!       servers:
//!         - id: i-0abc
//!           port: 8080
//! ```

pub mod applier;
pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod model;
pub mod provider;
pub mod requeue;
pub mod retry;
pub mod route;

pub use applier::ModelApplier;
pub use config::ControllerConfig;
pub use controllers::{LoadBalancerController, RouteController};
pub use crd::{CloudLoadBalancer, CloudLoadBalancerSpec, CloudLoadBalancerStatus};
pub use error::{OperatorError, Result};
pub use route::{RouteMutationGuard, RouteReconciler};
