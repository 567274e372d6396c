//! Orchestrator-facing load balancer provider.
//!
//! Picks the balancer kind from the service annotations, builds the desired
//! ports and hands them to the matching reconciler.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use crate::annotations;
use crate::audit::AuditLogger;
use crate::cloud::{ElasticApi, L4Api};
use crate::config::ReconcilerConfig;
use crate::desired::{
    BuildError, ServiceDescriptor, build_elastic_load_balancers, build_load_balancers,
};
use crate::error::Result;
use crate::model::{Instance, LoadBalancerStatus};
use crate::reconciler::{ElasticReconciler, L4Reconciler, Reconciler};

/// Balancer variant backing a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalancerKind {
    #[default]
    L4,
    Elastic,
}

impl LoadBalancerKind {
    /// Kind requested by the service; L4 unless annotated otherwise.
    pub fn of(service: &ServiceDescriptor) -> std::result::Result<Self, BuildError> {
        match annotations::get(&service.annotations, annotations::LB_TYPE) {
            Some(value) => value.parse(),
            None => Ok(Self::default()),
        }
    }
}

impl FromStr for LoadBalancerKind {
    type Err = BuildError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "l4" => Ok(LoadBalancerKind::L4),
            "elastic" => Ok(LoadBalancerKind::Elastic),
            other => Err(BuildError::InvalidLoadBalancerType(other.to_string())),
        }
    }
}

impl fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerKind::L4 => write!(f, "l4"),
            LoadBalancerKind::Elastic => write!(f, "elastic"),
        }
    }
}

/// Entry point used by the orchestrator integration.
pub struct LoadBalancerProvider {
    l4: L4Reconciler,
    elastic: ElasticReconciler,
}

impl LoadBalancerProvider {
    pub fn new(l4: L4Reconciler, elastic: ElasticReconciler) -> Self {
        Self { l4, elastic }
    }

    /// Provider whose reconcilers share one API client, configuration and
    /// audit logger.
    pub fn with_api<A>(api: Arc<A>, config: ReconcilerConfig, audit: AuditLogger) -> Self
    where
        A: L4Api + ElasticApi + 'static,
    {
        Self {
            l4: L4Reconciler::new(api.clone(), config.clone(), audit.clone()),
            elastic: ElasticReconciler::new(api, config, audit),
        }
    }

    /// Status of the balancer backing `service`, `None` when it does not exist.
    pub async fn get_load_balancer(
        &self,
        service: &ServiceDescriptor,
    ) -> Result<Option<LoadBalancerStatus>> {
        let name = service.load_balancer_name();
        match LoadBalancerKind::of(service)? {
            LoadBalancerKind::L4 => self.l4.status(&name).await,
            LoadBalancerKind::Elastic => self.elastic.status(&name).await,
        }
    }

    /// Create or converge the balancer backing `service` onto `instances`.
    pub async fn ensure_load_balancer(
        &self,
        service: &ServiceDescriptor,
        instances: &[Instance],
    ) -> Result<LoadBalancerStatus> {
        let name = service.load_balancer_name();
        let kind = LoadBalancerKind::of(service)?;
        info!(
            "Ensuring {} load balancer {} for service {}/{} ({} backend(s))",
            kind,
            name,
            service.namespace,
            service.name,
            instances.len()
        );

        match kind {
            LoadBalancerKind::L4 => {
                let desired = build_load_balancers(&name, instances, service)?;
                self.l4.reconcile(&name, &desired).await
            }
            LoadBalancerKind::Elastic => {
                let desired = build_elastic_load_balancers(&name, instances, service)?;
                self.elastic.reconcile(&name, &desired).await
            }
        }
    }

    /// Backend set changed. Runs the full reconciliation so settings and
    /// filter drift is repaired along the way.
    pub async fn update_load_balancer(
        &self,
        service: &ServiceDescriptor,
        instances: &[Instance],
    ) -> Result<()> {
        self.ensure_load_balancer(service, instances).await?;
        Ok(())
    }

    /// Delete the balancer backing `service`. Succeeds when it is already gone.
    pub async fn ensure_load_balancer_deleted(&self, service: &ServiceDescriptor) -> Result<()> {
        let name = service.load_balancer_name();
        match LoadBalancerKind::of(service)? {
            LoadBalancerKind::L4 => self.l4.delete(&name).await,
            LoadBalancerKind::Elastic => self.elastic.delete(&name).await,
        }
    }
}
