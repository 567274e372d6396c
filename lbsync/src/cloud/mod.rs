//! Remote load balancer API capability.
//!
//! The reconcilers only see these traits; transport, authentication and
//! request signing live behind them. Every call is a single remote request.
//! Cancellation happens by dropping the returned future.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{ElasticLoadBalancer, Filter, Instance, LoadBalancer, SecurityGroupRule};

const CODE_LOAD_BALANCER_NOT_FOUND: &str = "Client.InvalidParameterNotFound.LoadBalancer";
const CODE_ELASTIC_LOAD_BALANCER_NOT_FOUND: &str =
    "Client.InvalidParameterNotFound.ElasticLoadBalancer";
const CODE_INSTANCE_NOT_FOUND: &str = "Client.InvalidParameterNotFound.Instance";
const CODE_SECURITY_GROUP_INGRESS_NOT_FOUND: &str =
    "Client.InvalidParameterNotFound.SecurityGroupIngress";
const CODE_DUPLICATE_SECURITY_GROUP_RULE: &str = "Client.InvalidParameterDuplicate.SecurityGroupRule";

/// Machine-readable code carried by a remote error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    LoadBalancerNotFound,
    ElasticLoadBalancerNotFound,
    InstanceNotFound,
    SecurityGroupIngressNotFound,
    DuplicateSecurityGroupRule,
    Other(String),
}

impl ErrorCode {
    /// Map a wire code to its typed form.
    pub fn from_code(code: &str) -> Self {
        match code {
            CODE_LOAD_BALANCER_NOT_FOUND => ErrorCode::LoadBalancerNotFound,
            CODE_ELASTIC_LOAD_BALANCER_NOT_FOUND => ErrorCode::ElasticLoadBalancerNotFound,
            CODE_INSTANCE_NOT_FOUND => ErrorCode::InstanceNotFound,
            CODE_SECURITY_GROUP_INGRESS_NOT_FOUND => ErrorCode::SecurityGroupIngressNotFound,
            CODE_DUPLICATE_SECURITY_GROUP_RULE => ErrorCode::DuplicateSecurityGroupRule,
            other => ErrorCode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::LoadBalancerNotFound => CODE_LOAD_BALANCER_NOT_FOUND,
            ErrorCode::ElasticLoadBalancerNotFound => CODE_ELASTIC_LOAD_BALANCER_NOT_FOUND,
            ErrorCode::InstanceNotFound => CODE_INSTANCE_NOT_FOUND,
            ErrorCode::SecurityGroupIngressNotFound => CODE_SECURITY_GROUP_INGRESS_NOT_FOUND,
            ErrorCode::DuplicateSecurityGroupRule => CODE_DUPLICATE_SECURITY_GROUP_RULE,
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error answered by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result type for remote calls.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Operations on L4 balancers. Each `LoadBalancer` value addresses one port.
#[async_trait]
pub trait L4Api: Send + Sync {
    /// All ports of the balancer; `LoadBalancerNotFound` when it does not exist.
    async fn describe_load_balancers(&self, name: &str) -> ApiResult<Vec<LoadBalancer>>;

    /// Create the balancer with its first port, returning the assigned VIP.
    async fn create_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<String>;

    /// Add a port to an existing balancer.
    async fn register_port_with_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()>;

    /// Apply network volume, accounting, balancing and policy settings.
    async fn update_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()>;

    /// Delete one port. The balancer goes away with its last port.
    async fn delete_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()>;

    async fn configure_health_check(&self, lb: &LoadBalancer) -> ApiResult<()>;

    async fn register_instances_with_load_balancer(
        &self,
        lb: &LoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()>;

    async fn deregister_instances_from_load_balancer(
        &self,
        lb: &LoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()>;

    async fn set_filter_for_load_balancer(
        &self,
        lb: &LoadBalancer,
        filters: &[Filter],
    ) -> ApiResult<()>;
}

/// Operations on elastic balancers and the security groups of their backends.
#[async_trait]
pub trait ElasticApi: Send + Sync {
    /// All ports of the balancer; `ElasticLoadBalancerNotFound` when it does not exist.
    async fn describe_elastic_load_balancers(
        &self,
        name: &str,
    ) -> ApiResult<Vec<ElasticLoadBalancer>>;

    /// Create the balancer with its first port, returning the assigned VIP.
    async fn create_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<String>;

    async fn register_port_with_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
    ) -> ApiResult<()>;

    async fn update_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<()>;

    async fn delete_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<()>;

    async fn configure_elastic_health_check(&self, lb: &ElasticLoadBalancer) -> ApiResult<()>;

    async fn register_instances_with_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()>;

    async fn deregister_instances_from_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()>;

    async fn set_filter_for_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        filters: &[Filter],
    ) -> ApiResult<()>;

    /// Names of the security groups the given instances belong to.
    async fn describe_security_groups_by_instance_ids(
        &self,
        instance_ids: &[String],
    ) -> ApiResult<Vec<String>>;

    async fn authorize_security_group_ingress(
        &self,
        group: &str,
        rule: &SecurityGroupRule,
    ) -> ApiResult<()>;

    async fn revoke_security_group_ingress(
        &self,
        group: &str,
        rule: &SecurityGroupRule,
    ) -> ApiResult<()>;

    /// Block until pending rule changes of the group are applied.
    async fn wait_security_group_applied(&self, group: &str) -> ApiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::LoadBalancerNotFound,
            ErrorCode::ElasticLoadBalancerNotFound,
            ErrorCode::InstanceNotFound,
            ErrorCode::SecurityGroupIngressNotFound,
            ErrorCode::DuplicateSecurityGroupRule,
        ] {
            assert_eq!(ErrorCode::from_code(code.as_str()), code);
        }
    }

    #[test]
    fn test_unknown_code_is_kept() {
        let code = ErrorCode::from_code("Server.InternalError");
        assert_eq!(code, ErrorCode::Other("Server.InternalError".to_string()));
        assert_eq!(code.to_string(), "Server.InternalError");
    }
}
