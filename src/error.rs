//! Error types for the cloudnet operator
//!
//! Two layers live here. [`CloudError`] is what a provider call returns, with
//! the raw provider code already mapped into an [`ErrorCode`]. [`OperatorError`]
//! is what the reconciliation core hands back to the scheduler.

use std::fmt;

use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Provider error codes the core knows how to reason about.
///
/// Raw provider strings are mapped exactly once, in
/// [`ErrorCode::from_provider_code`]. Nothing above the provider boundary
/// inspects error text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The resource being created already exists
    DuplicateResource,
    /// The resource exists but is still converging on the provider side
    TransientState,
    /// The resource does not exist
    NotFound,
    /// A route with the same destination CIDR already exists in the table
    DuplicateCidr,
    /// The provider rejected the call because of rate limiting
    Throttled,
    /// Anything else, carrying the original provider code
    Other(String),
}

impl ErrorCode {
    /// Map a raw provider code onto the taxonomy.
    pub fn from_provider_code(code: &str) -> Self {
        match code {
            "ResourceAlreadyExist"
            | "ResourceAlreadyExist.Listener"
            | "ResourceAlreadyExist.ServerGroup"
            | "ResourceAlreadyAssociated"
            | "DuplicatedParam.ServerGroupName" => ErrorCode::DuplicateResource,
            "VPC_ROUTE_ENTRY_STATUS_ERROR" | "IncorrectStatus.LoadBalancer" | "Conflict.Lock" => {
                ErrorCode::TransientState
            }
            "ResourceNotFound"
            | "ResourceNotFound.Listener"
            | "ResourceNotFound.ServerGroup"
            | "ResourceNotFound.LoadBalancer"
            | "VPC_ROUTER_ENTRY_NOT_EXIST"
            | "InvalidRouteEntry.NotFound" => ErrorCode::NotFound,
            "InvalidCIDRBlock.Duplicate" | "VPC_ROUTE_ENTRY_CIDR_BLOCK_DUPLICATE" => {
                ErrorCode::DuplicateCidr
            }
            "Throttling" | "Throttling.User" | "ServiceUnavailable" => ErrorCode::Throttled,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::DuplicateResource => write!(f, "DuplicateResource"),
            ErrorCode::TransientState => write!(f, "TransientState"),
            ErrorCode::NotFound => write!(f, "NotFound"),
            ErrorCode::DuplicateCidr => write!(f, "DuplicateCidr"),
            ErrorCode::Throttled => write!(f, "Throttled"),
            ErrorCode::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Error returned by a cloud provider call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct CloudError {
    /// Classified provider code
    pub code: ErrorCode,
    /// Provider message
    pub message: String,
}

impl CloudError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build from a raw provider code string.
    pub fn from_provider(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::from_provider_code(code), message)
    }
}

/// Errors that can occur while converging cloud resources
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeApi(String),

    /// Remote state could not be read; retried by the scheduler
    #[error("lookup {resource} failed: {source}")]
    Lookup {
        /// What was being read (e.g. "load balancer", "listeners of lb-123")
        resource: String,
        source: CloudError,
    },

    /// Invalid or ambiguous configuration; surfaced to the operator, not retried
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A reuse target is incompatible with the desired state
    #[error("load balancer {load_balancer_id} can not be reused: {reason}")]
    ReuseConflict {
        load_balancer_id: String,
        reason: String,
    },

    /// A create/update/delete failed with a non-ignorable provider code
    #[error("{action} {resource} failed: {source}")]
    ProviderAction {
        /// Action verb ("create", "update", "delete", ...)
        action: &'static str,
        /// Human readable sub-resource identity
        resource: String,
        source: CloudError,
    },

    /// Whole-phase invariant violation (identity mismatch, unresolved reference)
    #[error("Reconciliation error: {0}")]
    Reconciliation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Independent failures collected from parallel phases
    #[error(transparent)]
    Aggregate(AggregateError),
}

impl OperatorError {
    pub fn lookup(resource: impl Into<String>, source: CloudError) -> Self {
        OperatorError::Lookup {
            resource: resource.into(),
            source,
        }
    }

    pub fn provider_action(
        action: &'static str,
        resource: impl Into<String>,
        source: CloudError,
    ) -> Self {
        OperatorError::ProviderAction {
            action,
            resource: resource.into(),
            source,
        }
    }

    pub fn reuse_conflict(load_balancer_id: impl Into<String>, reason: impl Into<String>) -> Self {
        OperatorError::ReuseConflict {
            load_balancer_id: load_balancer_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error stops the remaining phases of a reconciliation pass.
    ///
    /// Action-level failures are collected and the pass continues; anything
    /// that leaves later phases without a trustworthy view of the world stops it.
    pub fn aborts_pass(&self) -> bool {
        match self {
            OperatorError::ProviderAction { .. } | OperatorError::Aggregate(_) => false,
            OperatorError::KubeApi(_)
            | OperatorError::Lookup { .. }
            | OperatorError::Configuration(_)
            | OperatorError::ReuseConflict { .. }
            | OperatorError::Reconciliation(_)
            | OperatorError::Serialization(_) => true,
        }
    }

    /// Whether re-queueing the object can fix this error without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperatorError::Configuration(_) | OperatorError::ReuseConflict { .. } => false,
            OperatorError::Aggregate(agg) => agg.errors().iter().any(|e| e.is_retryable()),
            _ => true,
        }
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        OperatorError::KubeApi(err.to_string())
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

/// A flat collection of independent failures.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<OperatorError>,
}

impl AggregateError {
    pub fn errors(&self) -> &[OperatorError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<OperatorError> {
        self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => Ok(()),
            [single] => write!(f, "{}", single),
            many => {
                write!(f, "[")?;
                for (i, err) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl std::error::Error for AggregateError {}

/// Fold a list of errors into a single result.
///
/// Nested aggregates are flattened. An empty list is success and a single
/// error is returned as is.
pub fn aggregate(errors: Vec<OperatorError>) -> Result<()> {
    let mut flat = Vec::with_capacity(errors.len());
    for err in errors {
        match err {
            OperatorError::Aggregate(inner) => flat.extend(inner.errors),
            other => flat.push(other),
        }
    }
    match flat.len() {
        0 => Ok(()),
        1 => Err(flat.remove(0)),
        _ => Err(OperatorError::Aggregate(AggregateError { errors: flat })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::KubeApi("test error".to_string());
        assert!(err.to_string().contains("Kubernetes API error"));

        let err = OperatorError::provider_action(
            "create",
            "backend group sg-a",
            CloudError::from_provider("Forbidden", "no quota"),
        );
        assert_eq!(
            err.to_string(),
            "create backend group sg-a failed: [Forbidden] no quota"
        );
    }

    #[test]
    fn test_provider_code_mapping() {
        assert_eq!(
            ErrorCode::from_provider_code("InvalidCIDRBlock.Duplicate"),
            ErrorCode::DuplicateCidr
        );
        assert_eq!(
            ErrorCode::from_provider_code("VPC_ROUTE_ENTRY_CIDR_BLOCK_DUPLICATE"),
            ErrorCode::DuplicateCidr
        );
        assert_eq!(
            ErrorCode::from_provider_code("VPC_ROUTE_ENTRY_STATUS_ERROR"),
            ErrorCode::TransientState
        );
        assert_eq!(
            ErrorCode::from_provider_code("VPC_ROUTER_ENTRY_NOT_EXIST"),
            ErrorCode::NotFound
        );
        assert_eq!(
            ErrorCode::from_provider_code("SomethingElse"),
            ErrorCode::Other("SomethingElse".to_string())
        );
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(aggregate(vec![]).is_ok());
    }

    #[test]
    fn test_aggregate_flattens_nested() {
        let inner = aggregate(vec![
            OperatorError::Reconciliation("a".into()),
            OperatorError::Reconciliation("b".into()),
        ])
        .unwrap_err();
        let outer = aggregate(vec![inner, OperatorError::Configuration("c".into())]).unwrap_err();

        match outer {
            OperatorError::Aggregate(agg) => {
                assert_eq!(agg.len(), 3);
                assert!(agg.to_string().starts_with('['));
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_single_error_is_not_wrapped() {
        let err = aggregate(vec![OperatorError::Configuration("bad cidr".into())]).unwrap_err();
        assert!(matches!(err, OperatorError::Configuration(_)));
        assert_eq!(err.to_string(), "Configuration error: bad cidr");
    }

    #[test]
    fn test_aggregate_retryable_if_any_member_is() {
        let err = aggregate(vec![
            OperatorError::Configuration("bad".into()),
            OperatorError::Reconciliation("later".into()),
        ])
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_aborts_pass() {
        assert!(OperatorError::Reconciliation("x".into()).aborts_pass());
        assert!(OperatorError::reuse_conflict("lb-1", "tagged").aborts_pass());
        assert!(!OperatorError::provider_action(
            "delete",
            "listener TCP:80",
            CloudError::new(ErrorCode::Throttled, "slow down"),
        )
        .aborts_pass());
        assert!(!OperatorError::Configuration("x".into()).is_retryable());
    }
}
