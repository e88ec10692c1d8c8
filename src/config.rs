//! Runtime configuration for the controllers

use std::time::Duration;

use ipnet::IpNet;

use crate::error::{OperatorError, Result};
use crate::retry::RetryConfig;

/// Default fan-out for backend group, listener and route batch operations
pub const DEFAULT_MAX_PARALLELISM: usize = 5;

/// Settings shared by the load balancer and route controllers
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Identity of this cluster, stamped into ownership tags
    pub cluster_id: String,
    /// Routes outside this CIDR are never touched; `None` means every route is in scope
    pub cluster_cidr: Option<String>,
    pub vpc_id: String,
    /// Explicit route tables; discovered from the VPC when empty
    pub route_table_ids: Vec<String>,
    pub configure_cloud_routes: bool,
    /// Interval of the full route table sync
    pub route_reconcile_period: Duration,
    pub max_parallelism: usize,
    pub route_create_backoff: RetryConfig,
    /// Namespace to watch; empty for all namespaces
    pub namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "kubernetes".to_string(),
            cluster_cidr: None,
            vpc_id: String::new(),
            route_table_ids: Vec::new(),
            configure_cloud_routes: true,
            route_reconcile_period: Duration::from_secs(300),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            route_create_backoff: RetryConfig::route_create(),
            namespace: String::new(),
        }
    }
}

impl ControllerConfig {
    /// Parsed cluster CIDR.
    pub fn cluster_cidr(&self) -> Result<Option<IpNet>> {
        match self.cluster_cidr.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<IpNet>().map(Some).map_err(|e| {
                OperatorError::Configuration(format!("invalid cluster CIDR {:?}: {}", raw, e))
            }),
        }
    }

    /// Reject settings the controllers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(OperatorError::Configuration(
                "cluster id must not be empty".to_string(),
            ));
        }
        if self.max_parallelism == 0 {
            return Err(OperatorError::Configuration(
                "max parallelism must be at least 1".to_string(),
            ));
        }
        self.cluster_cidr()?;
        if self.configure_cloud_routes && self.vpc_id.is_empty() && self.route_table_ids.is_empty()
        {
            return Err(OperatorError::Configuration(
                "cloud routes need a VPC id or explicit route table ids".to_string(),
            ));
        }
        Ok(())
    }
}

/// Split a comma separated flag value, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routed() -> ControllerConfig {
        ControllerConfig {
            vpc_id: "vpc-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_validates_with_vpc() {
        assert!(routed().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_err());
    }

    #[test]
    fn test_invalid_cluster_cidr() {
        let config = ControllerConfig {
            cluster_cidr: Some("10.0.0.0/33".into()),
            ..routed()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, OperatorError::Configuration(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cluster_cidr_parsing() {
        let config = ControllerConfig {
            cluster_cidr: Some(" 172.16.0.0/16 ".into()),
            ..routed()
        };
        assert_eq!(
            config.cluster_cidr().unwrap(),
            Some("172.16.0.0/16".parse().unwrap())
        );
        assert_eq!(routed().cluster_cidr().unwrap(), None);
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list("vtb-1, vtb-2,,"), vec!["vtb-1", "vtb-2"]);
        assert!(split_list("").is_empty());
    }
}
