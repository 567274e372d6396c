//! L4 load balancer reconciler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Reconciler, desired_for, remote, status_of};
use crate::audit::AuditLogger;
use crate::cloud::{ApiResult, ErrorCode, L4Api};
use crate::config::ReconcilerConfig;
use crate::diff::{filter_changes, instance_differences, port_differences};
use crate::error::{Error, Result, Target};
use crate::model::{BalancerPort, Instance, LoadBalancer, LoadBalancerStatus};

/// Reconciler for L4 balancers.
pub struct L4Reconciler {
    api: Arc<dyn L4Api>,
    config: ReconcilerConfig,
    audit: AuditLogger,
}

impl L4Reconciler {
    pub fn new(api: Arc<dyn L4Api>, config: ReconcilerConfig, audit: AuditLogger) -> Self {
        Self { api, config, audit }
    }

    async fn call<T, F>(&self, op: &'static str, target: Target, call: F) -> Result<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        remote(self.config.api_timeout(), op, target, call).await
    }

    /// Describe all ports, `None` when the balancer does not exist.
    async fn describe(&self, name: &str) -> Result<Option<Vec<LoadBalancer>>> {
        match self
            .call(
                "DescribeLoadBalancers",
                Target::balancer(name),
                self.api.describe_load_balancers(name),
            )
            .await
        {
            Ok(ports) if ports.is_empty() => Ok(None),
            Ok(ports) => Ok(Some(ports)),
            Err(e) if e.is_api(&ErrorCode::LoadBalancerNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn describe_existing(&self, name: &str) -> Result<Vec<LoadBalancer>> {
        self.describe(name)
            .await?
            .ok_or_else(|| Error::Vanished(name.to_string()))
    }

    /// Create the balancer port by port. A failure leaves the ports created
    /// so far in place; the next reconciliation picks up from there.
    async fn create(&self, name: &str, desired: &[LoadBalancer]) -> Result<()> {
        for (index, lb) in desired.iter().enumerate() {
            let target = Target::port(name, lb.port_pair());
            if index == 0 {
                let vip = self
                    .call(
                        "CreateLoadBalancer",
                        target,
                        self.api.create_load_balancer(lb),
                    )
                    .await?;
                self.audit.port_created(name, lb.port_pair(), &vip);
            } else {
                self.call(
                    "RegisterPortWithLoadBalancer",
                    target,
                    self.api.register_port_with_load_balancer(lb),
                )
                .await?;
                self.audit.port_registered(name, lb.port_pair());
            }
            self.configure_new_port(lb).await?;
        }
        Ok(())
    }

    /// Health check, backends and filter of a freshly created port.
    async fn configure_new_port(&self, lb: &LoadBalancer) -> Result<()> {
        self.configure_health_check(lb).await?;
        if !lb.instances.is_empty() {
            self.register(lb, &lb.instances).await?;
        }
        self.set_filter(lb, &[]).await
    }

    /// Register missing ports and delete stale ones. Returns the port set as
    /// described afterwards.
    async fn sync_ports(
        &self,
        name: &str,
        desired: &[LoadBalancer],
        current: Vec<LoadBalancer>,
    ) -> Result<Vec<LoadBalancer>> {
        let to_create = port_differences(desired, &current);
        let to_delete = port_differences(&current, desired);
        if to_create.is_empty() && to_delete.is_empty() {
            return Ok(current);
        }

        for lb in &to_create {
            info!("Registering port {} on load balancer {}", lb.port_pair(), name);
            self.call(
                "RegisterPortWithLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.register_port_with_load_balancer(lb),
            )
            .await?;
            self.audit.port_registered(name, lb.port_pair());
            self.configure_health_check(lb).await?;
        }
        for lb in &to_delete {
            info!("Deleting port {} from load balancer {}", lb.port_pair(), name);
            self.call(
                "DeleteLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.delete_load_balancer(lb),
            )
            .await?;
            self.audit.port_deleted(name, lb.port_pair());
        }

        self.describe_existing(name).await
    }

    /// Converge settings, backends and filter of one existing port.
    async fn sync_port(&self, desired: &LoadBalancer, current: &LoadBalancer) -> Result<()> {
        if settings_differ(desired, current) {
            info!(
                "Updating settings of load balancer {} port {}",
                current.name,
                current.port_pair()
            );
            self.call(
                "UpdateLoadBalancer",
                Target::port(&current.name, current.port_pair()),
                self.api.update_load_balancer(desired),
            )
            .await?;
        }

        if desired.health_check != current.health_check {
            self.configure_health_check(desired).await?;
        }

        let to_register = instance_differences(&desired.instances, &current.instances);
        let to_deregister = instance_differences(&current.instances, &desired.instances);
        if !to_register.is_empty() {
            self.register(current, &to_register).await?;
        }
        if !to_deregister.is_empty() {
            self.deregister(current, &to_deregister).await?;
        }

        self.set_filter(desired, &current.filters).await
    }

    async fn configure_health_check(&self, lb: &LoadBalancer) -> Result<()> {
        self.call(
            "ConfigureHealthCheck",
            Target::port(&lb.name, lb.port_pair()),
            self.api.configure_health_check(lb),
        )
        .await?;
        self.audit
            .health_check_configured(&lb.name, lb.port_pair(), &lb.health_check.target);
        Ok(())
    }

    async fn register(&self, lb: &LoadBalancer, instances: &[Instance]) -> Result<()> {
        self.call(
            "RegisterInstancesWithLoadBalancer",
            Target::port(&lb.name, lb.port_pair()),
            self.api.register_instances_with_load_balancer(lb, instances),
        )
        .await?;
        self.audit
            .instances_registered(&lb.name, lb.port_pair(), &instance_ids(instances));
        Ok(())
    }

    async fn deregister(&self, lb: &LoadBalancer, instances: &[Instance]) -> Result<()> {
        self.call(
            "DeregisterInstancesFromLoadBalancer",
            Target::port(&lb.name, lb.port_pair()),
            self.api.deregister_instances_from_load_balancer(lb, instances),
        )
        .await?;
        self.audit
            .instances_deregistered(&lb.name, lb.port_pair(), &instance_ids(instances));
        Ok(())
    }

    /// Apply the filter changes from `current` to the filters of `desired` as
    /// one call; nothing is sent when they already match.
    async fn set_filter(&self, desired: &LoadBalancer, current: &[String]) -> Result<()> {
        let filters = filter_changes(&desired.filters, current);
        if filters.is_empty() {
            return Ok(());
        }

        self.call(
            "SetFilterForLoadBalancer",
            Target::port(&desired.name, desired.port_pair()),
            self.api.set_filter_for_load_balancer(desired, &filters),
        )
        .await?;
        let added = filters.iter().filter(|f| f.add_on_filter).count();
        self.audit
            .filters_set(&desired.name, desired.port_pair(), added, filters.len() - added);
        Ok(())
    }

    async fn converge(&self, name: &str, desired: &[LoadBalancer]) -> Result<LoadBalancerStatus> {
        let current = match self.describe(name).await? {
            Some(current) => current,
            None => {
                info!(
                    "Load balancer {} not found, creating {} port(s)",
                    name,
                    desired.len()
                );
                self.create(name, desired).await?;
                return status_of(name, &self.describe_existing(name).await?);
            }
        };

        let current = self.sync_ports(name, desired, current).await?;
        for port in &current {
            let want = desired_for(desired, port)?;
            self.sync_port(want, port).await?;
        }
        status_of(name, &current)
    }
}

fn instance_ids(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|i| i.instance_id.clone()).collect()
}

/// Whether balancer-wide settings of `current` lag behind `desired`.
fn settings_differ(desired: &LoadBalancer, current: &LoadBalancer) -> bool {
    desired.network_volume != current.network_volume
        || desired.accounting_type != current.accounting_type
        || desired.balancing_type != current.balancing_type
        || desired.policy_type != current.policy_type
}

#[async_trait]
impl Reconciler for L4Reconciler {
    type Spec = LoadBalancer;

    async fn reconcile(&self, name: &str, desired: &[LoadBalancer]) -> Result<LoadBalancerStatus> {
        if desired.is_empty() {
            return Err(Error::NoPorts(name.to_string()));
        }
        info!("Reconciling load balancer {} ({} port(s))", name, desired.len());

        let result = self.converge(name, desired).await;
        if let Err(e) = &result {
            self.audit.reconcile_failed(name, &e.to_string());
        }
        result
    }

    async fn status(&self, name: &str) -> Result<Option<LoadBalancerStatus>> {
        match self.describe(name).await? {
            Some(ports) => status_of(name, &ports).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let Some(ports) = self.describe(name).await? else {
            debug!("Load balancer {} already deleted", name);
            return Ok(());
        };

        info!("Deleting load balancer {} ({} port(s))", name, ports.len());
        for lb in &ports {
            self.call(
                "DeleteLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.delete_load_balancer(lb),
            )
            .await?;
            self.audit.port_deleted(name, lb.port_pair());
        }
        Ok(())
    }
}
