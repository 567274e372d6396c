//! Reconcilers for the two load balancer variants.
//!
//! Each reconciler describes the remote balancer, compares it with the
//! desired ports and issues only the calls needed to converge. Nothing is
//! cached between invocations: the remote API is the source of truth, and it
//! is re-described after every mutation whose outcome later steps read.

pub mod elastic;
pub mod l4;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::cloud::ApiResult;
use crate::error::{Error, Result, Target};
use crate::model::{BalancerPort, LoadBalancerStatus};

pub use elastic::ElasticReconciler;
pub use l4::L4Reconciler;

/// Trait for load balancer reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// One desired port of the balancer.
    type Spec: BalancerPort;

    /// Converge the balancer `name` toward `desired` and report its VIP.
    async fn reconcile(&self, name: &str, desired: &[Self::Spec]) -> Result<LoadBalancerStatus>;

    /// Current status, or `None` when the balancer does not exist.
    async fn status(&self, name: &str) -> Result<Option<LoadBalancerStatus>>;

    /// Handle balancer deletion. Deleting a missing balancer succeeds.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Run one remote call under a deadline, attaching operation context to
/// failures.
pub(crate) async fn remote<T, F>(limit: Duration, op: &'static str, target: Target, call: F) -> Result<T>
where
    F: Future<Output = ApiResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(Error::Remote { op, target, source }),
        Err(_) => Err(Error::Timeout { op, target }),
    }
}

/// Status reported for a described balancer: all ports share one VIP.
pub(crate) fn status_of<T: BalancerPort>(name: &str, ports: &[T]) -> Result<LoadBalancerStatus> {
    ports
        .first()
        .map(|port| LoadBalancerStatus {
            vip: port.vip().to_string(),
        })
        .ok_or_else(|| Error::Vanished(name.to_string()))
}

/// Desired counterpart of a described port.
pub(crate) fn desired_for<'a, T: BalancerPort>(desired: &'a [T], current: &T) -> Result<&'a T> {
    desired
        .iter()
        .find(|d| d.same_port(current))
        .ok_or_else(|| Error::DesiredPortMissing(Target::port(current.name(), current.port_pair())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ApiError, ErrorCode};
    use crate::model::LoadBalancer;

    #[tokio::test]
    async fn test_remote_wraps_api_error() {
        let err = remote::<(), _>(
            Duration::from_secs(1),
            "DeleteLoadBalancer",
            Target::balancer("abc"),
            async { Err(ApiError::new(ErrorCode::LoadBalancerNotFound, "missing")) },
        )
        .await
        .unwrap_err();
        assert!(err.is_api(&ErrorCode::LoadBalancerNotFound));
        assert!(err.to_string().starts_with("DeleteLoadBalancer failed for load balancer abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_times_out() {
        let err = remote::<(), _>(
            Duration::from_secs(5),
            "WaitSecurityGroupApplied",
            Target::balancer("abc"),
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { op: "WaitSecurityGroupApplied", .. }));
    }

    #[test]
    fn test_desired_for_missing_port() {
        let desired = vec![LoadBalancer {
            name: "abc".into(),
            load_balancer_port: 80,
            instance_port: 30000,
            ..Default::default()
        }];
        let current = LoadBalancer {
            name: "abc".into(),
            load_balancer_port: 80,
            instance_port: 30001,
            ..Default::default()
        };
        assert!(matches!(
            desired_for(&desired, &current),
            Err(Error::DesiredPortMissing(_))
        ));
    }
}
