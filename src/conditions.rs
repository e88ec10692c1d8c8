//! Kubernetes-standard status condition helpers
//!
//! Constants and builders for CloudLoadBalancer status conditions and the
//! node network condition written by the route controller.

use chrono::Utc;
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::crd::LoadBalancerCondition;

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";
pub const CONDITION_UNKNOWN: &str = "Unknown";

// CloudLoadBalancer condition types
pub const LB_CONDITION_READY: &str = "Ready";
pub const LB_CONDITION_SYNCED: &str = "Synced";

pub const LOAD_BALANCER_FINALIZER: &str = "cloudnet.io/load-balancer-cleanup";

/// Node condition the route controller clears once a node's route exists
pub const NODE_CONDITION_NETWORK_UNAVAILABLE: &str = "NetworkUnavailable";
pub const ROUTE_CREATED_REASON: &str = "RouteCreated";

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> ConditionFields {
    ConditionFields {
        condition_type: condition_type.to_string(),
        status: status.to_string(),
        last_transition_time: Some(Utc::now().to_rfc3339()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
    }
}

/// Generic condition fields, convertible into the CRD condition type.
#[derive(Debug, Clone)]
pub struct ConditionFields {
    pub condition_type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl ConditionFields {
    pub fn into_load_balancer_condition(self) -> LoadBalancerCondition {
        LoadBalancerCondition {
            r#type: self.condition_type,
            status: self.status,
            last_transition_time: self.last_transition_time,
            reason: self.reason,
            message: self.message,
        }
    }
}

impl From<&LoadBalancerCondition> for ConditionFields {
    fn from(c: &LoadBalancerCondition) -> Self {
        Self {
            condition_type: c.r#type.clone(),
            status: c.status.clone(),
            last_transition_time: c.last_transition_time.clone(),
            reason: c.reason.clone(),
            message: c.message.clone(),
        }
    }
}

/// Set or update a condition in a list, preserving lastTransitionTime when status hasn't changed.
pub fn set_condition(conditions: &mut Vec<ConditionFields>, new: ConditionFields) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == new.condition_type)
    {
        if existing.status != new.status {
            *existing = new;
        } else {
            existing.reason = new.reason;
            existing.message = new.message;
        }
    } else {
        conditions.push(new);
    }
}

/// `NetworkUnavailable=False`, written once the node's pod CIDR is routed.
pub fn network_ready_condition() -> NodeCondition {
    let now = Time(Utc::now());
    NodeCondition {
        type_: NODE_CONDITION_NETWORK_UNAVAILABLE.to_string(),
        status: CONDITION_FALSE.to_string(),
        reason: Some(ROUTE_CREATED_REASON.to_string()),
        message: Some("route created for the node pod CIDR".to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

/// Whether `conditions` already report the node network as available.
pub fn network_is_ready(conditions: &[NodeCondition]) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == NODE_CONDITION_NETWORK_UNAVAILABLE && c.status == CONDITION_FALSE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_condition() {
        let cond = build_condition(LB_CONDITION_READY, CONDITION_TRUE, "Synced", "load balancer converged");
        assert_eq!(cond.condition_type, "Ready");
        assert_eq!(cond.status, "True");
        assert!(cond.last_transition_time.is_some());
        assert_eq!(cond.reason.as_deref(), Some("Synced"));
    }

    #[test]
    fn test_set_condition_preserves_transition_time_on_same_status() {
        let mut conditions = vec![ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_TRUE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: Some("First".to_string()),
            message: Some("first".to_string()),
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "Second", "second"));

        assert_eq!(conditions.len(), 1);
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(conditions[0].reason.as_deref(), Some("Second"));
    }

    #[test]
    fn test_set_condition_updates_transition_time_on_status_change() {
        let mut conditions = vec![ConditionFields {
            condition_type: "Ready".to_string(),
            status: CONDITION_FALSE.to_string(),
            last_transition_time: Some("2024-01-01T00:00:00Z".to_string()),
            reason: None,
            message: None,
        }];

        set_condition(&mut conditions, build_condition("Ready", CONDITION_TRUE, "Synced", "ok"));

        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_round_trip_through_crd_condition() {
        let cond = build_condition(LB_CONDITION_SYNCED, CONDITION_FALSE, "SyncFailed", "boom");
        let crd = cond.into_load_balancer_condition();
        assert_eq!(crd.r#type, "Synced");
        let back = ConditionFields::from(&crd);
        assert_eq!(back.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_network_condition() {
        let cond = network_ready_condition();
        assert!(network_is_ready(&[cond]));
        assert!(!network_is_ready(&[]));
    }
}
