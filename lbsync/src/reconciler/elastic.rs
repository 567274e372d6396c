//! Elastic load balancer reconciler.
//!
//! Same convergence as the L4 reconciler, plus security group upkeep: every
//! backend registration authorizes the rules derived from the balancer
//! topology on the backends' security groups, every deregistration revokes
//! them again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Reconciler, desired_for, remote, status_of};
use crate::audit::AuditLogger;
use crate::cloud::{ApiResult, ElasticApi, ErrorCode};
use crate::config::ReconcilerConfig;
use crate::diff::{differences, filter_changes, instance_differences, port_differences};
use crate::error::{Error, Result, Target};
use crate::model::{
    BalancerPort, ElasticLoadBalancer, Instance, LoadBalancerStatus, SecurityGroupRule,
};
use crate::security_group::derive_rules;

/// A rule granted on one security group.
type Grant = (String, SecurityGroupRule);

/// Reconciler for elastic balancers.
pub struct ElasticReconciler {
    api: Arc<dyn ElasticApi>,
    config: ReconcilerConfig,
    audit: AuditLogger,
}

impl ElasticReconciler {
    pub fn new(api: Arc<dyn ElasticApi>, config: ReconcilerConfig, audit: AuditLogger) -> Self {
        Self { api, config, audit }
    }

    async fn call<T, F>(&self, op: &'static str, target: Target, call: F) -> Result<T>
    where
        F: Future<Output = ApiResult<T>>,
    {
        remote(self.config.api_timeout(), op, target, call).await
    }

    /// Describe all ports, `None` when the balancer does not exist.
    async fn describe(&self, name: &str) -> Result<Option<Vec<ElasticLoadBalancer>>> {
        match self
            .call(
                "DescribeElasticLoadBalancers",
                Target::balancer(name),
                self.api.describe_elastic_load_balancers(name),
            )
            .await
        {
            Ok(ports) if ports.is_empty() => Ok(None),
            Ok(ports) => Ok(Some(ports)),
            Err(e) if e.is_api(&ErrorCode::ElasticLoadBalancerNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn describe_existing(&self, name: &str) -> Result<Vec<ElasticLoadBalancer>> {
        self.describe(name)
            .await?
            .ok_or_else(|| Error::Vanished(name.to_string()))
    }

    /// Create every port, then configure each of them from the freshly
    /// described balancer, which is what carries the VIP and interface
    /// addresses the security group rules are derived from.
    async fn create(
        &self,
        name: &str,
        desired: &[ElasticLoadBalancer],
    ) -> Result<Vec<ElasticLoadBalancer>> {
        for (index, lb) in desired.iter().enumerate() {
            let target = Target::port(name, lb.port_pair());
            if index == 0 {
                let vip = self
                    .call(
                        "CreateElasticLoadBalancer",
                        target,
                        self.api.create_elastic_load_balancer(lb),
                    )
                    .await?;
                self.audit.port_created(name, lb.port_pair(), &vip);
            } else {
                self.call(
                    "RegisterPortWithElasticLoadBalancer",
                    target,
                    self.api.register_port_with_elastic_load_balancer(lb),
                )
                .await?;
                self.audit.port_registered(name, lb.port_pair());
            }
        }

        let current = self.describe_existing(name).await?;
        for port in &current {
            let want = desired_for(desired, port)?;
            self.configure_new_port(want, port)
                .await
                .map_err(|e| Error::SideEffect {
                    target: Target::port(name, port.port_pair()),
                    source: Box::new(e),
                })?;
        }
        Ok(current)
    }

    /// Health check, backends and filter of a new port, issued concurrently.
    /// The first failure drops the remaining calls.
    async fn configure_new_port(
        &self,
        desired: &ElasticLoadBalancer,
        current: &ElasticLoadBalancer,
    ) -> Result<()> {
        let view = rule_view(desired, current);
        let health_check = self.configure_health_check(desired);
        let registration = async {
            if desired.instances.is_empty() {
                return Ok(());
            }
            self.register_targets(&view, &desired.instances).await
        };
        let filter = self.set_filter(desired, &[]);

        tokio::try_join!(health_check, registration, filter)?;
        Ok(())
    }

    /// Register missing ports and delete stale ones. Returns the port set as
    /// described afterwards.
    async fn sync_ports(
        &self,
        name: &str,
        desired: &[ElasticLoadBalancer],
        current: Vec<ElasticLoadBalancer>,
    ) -> Result<Vec<ElasticLoadBalancer>> {
        let to_create = port_differences(desired, &current);
        let to_delete = port_differences(&current, desired);
        if to_create.is_empty() && to_delete.is_empty() {
            return Ok(current);
        }

        for lb in &to_create {
            info!(
                "Registering port {} on elastic load balancer {}",
                lb.port_pair(),
                name
            );
            self.call(
                "RegisterPortWithElasticLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.register_port_with_elastic_load_balancer(lb),
            )
            .await?;
            self.audit.port_registered(name, lb.port_pair());
            self.configure_health_check(lb).await?;
        }
        for lb in &to_delete {
            info!(
                "Deleting port {} from elastic load balancer {}",
                lb.port_pair(),
                name
            );
            if !lb.instances.is_empty() {
                let retained = self.retained_grants(desired, lb, lb).await?;
                self.deregister_targets(lb, &lb.instances, &[], &retained)
                    .await?;
            }
            self.call(
                "DeleteElasticLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.delete_elastic_load_balancer(lb),
            )
            .await?;
            self.audit.port_deleted(name, lb.port_pair());
        }

        self.describe_existing(name).await
    }

    /// Converge settings, health check, backends and filter of one port.
    /// `all` is the full desired port set of the balancer.
    async fn sync_port(
        &self,
        all: &[ElasticLoadBalancer],
        desired: &ElasticLoadBalancer,
        current: &ElasticLoadBalancer,
    ) -> Result<()> {
        if settings_differ(desired, current) {
            info!(
                "Updating settings of elastic load balancer {} port {}",
                current.name,
                current.port_pair()
            );
            self.call(
                "UpdateElasticLoadBalancer",
                Target::port(&current.name, current.port_pair()),
                self.api.update_elastic_load_balancer(desired),
            )
            .await?;
        }

        let view = rule_view(desired, current);
        let health_check_changed = desired.health_check != current.health_check;
        let to_register = instance_differences(&desired.instances, &current.instances);
        let to_deregister = instance_differences(&current.instances, &desired.instances);
        let retained = if (health_check_changed && !current.instances.is_empty())
            || !to_deregister.is_empty()
        {
            self.retained_grants(all, current, desired).await?
        } else {
            Vec::new()
        };

        if health_check_changed {
            self.configure_health_check(desired).await?;
            if !current.instances.is_empty() {
                self.refresh_rules(current, &view, &retained).await?;
            }
        }

        if !to_register.is_empty() {
            self.register_targets(&view, &to_register).await?;
        }
        if !to_deregister.is_empty() {
            self.deregister_targets(&view, &to_deregister, &desired.instances, &retained)
                .await?;
        }

        self.set_filter(desired, &current.filters).await
    }

    async fn configure_health_check(&self, lb: &ElasticLoadBalancer) -> Result<()> {
        self.call(
            "ConfigureElasticHealthCheck",
            Target::port(&lb.name, lb.port_pair()),
            self.api.configure_elastic_health_check(lb),
        )
        .await?;
        self.audit
            .health_check_configured(&lb.name, lb.port_pair(), &lb.health_check.target);
        Ok(())
    }

    async fn set_filter(&self, desired: &ElasticLoadBalancer, current: &[String]) -> Result<()> {
        let filters = filter_changes(&desired.filters, current);
        if filters.is_empty() {
            return Ok(());
        }

        self.call(
            "SetFilterForElasticLoadBalancer",
            Target::port(&desired.name, desired.port_pair()),
            self.api.set_filter_for_elastic_load_balancer(desired, &filters),
        )
        .await?;
        let added = filters.iter().filter(|f| f.add_on_filter).count();
        self.audit
            .filters_set(&desired.name, desired.port_pair(), added, filters.len() - added);
        Ok(())
    }

    /// Register `instances` and open their security groups to the balancer.
    async fn register_targets(
        &self,
        view: &ElasticLoadBalancer,
        instances: &[Instance],
    ) -> Result<()> {
        let target = Target::port(&view.name, view.port_pair());
        self.call(
            "RegisterInstancesWithElasticLoadBalancer",
            target.clone(),
            self.api
                .register_instances_with_elastic_load_balancer(view, instances),
        )
        .await?;
        self.audit
            .instances_registered(&view.name, view.port_pair(), &instance_ids(instances));

        let rules = derive_rules(view)?;
        let groups = self.security_groups_of(&target, instances).await?;
        self.authorize(&target, &groups, &rules).await
    }

    /// Deregister `instances` and revoke the balancer rules from security
    /// groups that no longer protect any backend in `remaining`. Grants in
    /// `retained` stay in place.
    async fn deregister_targets(
        &self,
        view: &ElasticLoadBalancer,
        instances: &[Instance],
        remaining: &[Instance],
        retained: &[Grant],
    ) -> Result<()> {
        let target = Target::port(&view.name, view.port_pair());
        match self
            .call(
                "DeregisterInstancesFromElasticLoadBalancer",
                target.clone(),
                self.api
                    .deregister_instances_from_elastic_load_balancer(view, instances),
            )
            .await
        {
            Ok(()) => self.audit.instances_deregistered(
                &view.name,
                view.port_pair(),
                &instance_ids(instances),
            ),
            Err(e) if e.is_api(&ErrorCode::InstanceNotFound) => {
                debug!("Instances of {} already gone: {}", target, e);
            }
            Err(e) => return Err(e),
        }

        let rules = granted_rules(view)?;
        let groups = match self.security_groups_of(&target, instances).await {
            Ok(groups) => groups,
            Err(e) if e.is_api(&ErrorCode::InstanceNotFound) => {
                debug!("Security groups of {} already gone: {}", target, e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let still_used = self.security_groups_of(&target, remaining).await?;
        let groups = differences(&groups, &still_used, |a, b| a == b);
        self.revoke(&target, &groups, &rules, retained).await
    }

    /// Swap the rules derived from `current` for those derived from `view` on
    /// the security groups of the registered backends.
    async fn refresh_rules(
        &self,
        current: &ElasticLoadBalancer,
        view: &ElasticLoadBalancer,
        retained: &[Grant],
    ) -> Result<()> {
        let target = Target::port(&view.name, view.port_pair());
        let old_rules = granted_rules(current)?;
        let new_rules = derive_rules(view)?;
        let stale = differences(&old_rules, &new_rules, |a, b| a == b);
        let fresh = differences(&new_rules, &old_rules, |a, b| a == b);
        if stale.is_empty() && fresh.is_empty() {
            return Ok(());
        }

        let groups = self.security_groups_of(&target, &current.instances).await?;
        self.authorize(&target, &groups, &fresh).await?;
        self.revoke(&target, &groups, &stale, retained).await
    }

    /// Grants the other desired ports keep needing once converged: their
    /// derived rules on the security groups of their backends. Rules without a
    /// port (ICMP, interface sources) are shared by every port of a balancer.
    async fn retained_grants(
        &self,
        all: &[ElasticLoadBalancer],
        topology: &ElasticLoadBalancer,
        except: &ElasticLoadBalancer,
    ) -> Result<Vec<Grant>> {
        let target = Target::port(&except.name, except.port_pair());
        let mut retained = Vec::new();
        for port in all
            .iter()
            .filter(|p| !p.same_port(except) && !p.instances.is_empty())
        {
            let view = ElasticLoadBalancer {
                name: port.name.clone(),
                protocol: port.protocol.clone(),
                load_balancer_port: port.load_balancer_port,
                instance_port: port.instance_port,
                health_check: port.health_check.clone(),
                ..topology.clone()
            };
            let rules = derive_rules(&view)?;
            for group in self.security_groups_of(&target, &port.instances).await? {
                for rule in &rules {
                    retained.push((group.clone(), rule.clone()));
                }
            }
        }
        Ok(retained)
    }

    async fn security_groups_of(
        &self,
        target: &Target,
        instances: &[Instance],
    ) -> Result<Vec<String>> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }

        let ids = instance_ids(instances);
        let groups = self
            .call(
                "DescribeSecurityGroupsByInstanceIds",
                target.clone(),
                self.api.describe_security_groups_by_instance_ids(&ids),
            )
            .await?;

        let mut unique = Vec::with_capacity(groups.len());
        for group in groups {
            if !unique.contains(&group) {
                unique.push(group);
            }
        }
        Ok(unique)
    }

    async fn authorize(
        &self,
        target: &Target,
        groups: &[String],
        rules: &[SecurityGroupRule],
    ) -> Result<()> {
        if rules.is_empty() {
            return Ok(());
        }
        for group in groups {
            for rule in rules {
                match self
                    .call(
                        "AuthorizeSecurityGroupIngress",
                        target.clone(),
                        self.api.authorize_security_group_ingress(group, rule),
                    )
                    .await
                {
                    Ok(()) => self.audit.ingress_authorized(group, rule),
                    Err(e) if e.is_api(&ErrorCode::DuplicateSecurityGroupRule) => {
                        debug!("Security group {} already allows {}", group, rule);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.wait_applied(target, group).await?;
        }
        Ok(())
    }

    async fn revoke(
        &self,
        target: &Target,
        groups: &[String],
        rules: &[SecurityGroupRule],
        retained: &[Grant],
    ) -> Result<()> {
        for group in groups {
            let rules: Vec<&SecurityGroupRule> = rules
                .iter()
                .filter(|rule| !retained.iter().any(|(g, r)| g == group && r == *rule))
                .collect();
            if rules.is_empty() {
                continue;
            }
            for rule in rules {
                match self
                    .call(
                        "RevokeSecurityGroupIngress",
                        target.clone(),
                        self.api.revoke_security_group_ingress(group, rule),
                    )
                    .await
                {
                    Ok(()) => self.audit.ingress_revoked(group, rule),
                    Err(e) if e.is_api(&ErrorCode::SecurityGroupIngressNotFound) => {
                        debug!("Security group {} has no rule {}", group, rule);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.wait_applied(target, group).await?;
        }
        Ok(())
    }

    async fn wait_applied(&self, target: &Target, group: &str) -> Result<()> {
        remote(
            self.config.security_group_apply_timeout(),
            "WaitSecurityGroupApplied",
            target.clone(),
            self.api.wait_security_group_applied(group),
        )
        .await
    }

    async fn converge(
        &self,
        name: &str,
        desired: &[ElasticLoadBalancer],
    ) -> Result<LoadBalancerStatus> {
        let current = match self.describe(name).await? {
            Some(current) => current,
            None => {
                info!(
                    "Elastic load balancer {} not found, creating {} port(s)",
                    name,
                    desired.len()
                );
                let created = self.create(name, desired).await?;
                return status_of(name, &created);
            }
        };

        let current = self.sync_ports(name, desired, current).await?;
        for port in &current {
            let want = desired_for(desired, port)?;
            self.sync_port(desired, want, port).await?;
        }
        status_of(name, &current)
    }
}

/// Rule source for a port: topology (VIP, interfaces) as described remotely,
/// health check and protocol as desired.
fn rule_view(desired: &ElasticLoadBalancer, current: &ElasticLoadBalancer) -> ElasticLoadBalancer {
    ElasticLoadBalancer {
        protocol: desired.protocol.clone(),
        health_check: desired.health_check.clone(),
        ..current.clone()
    }
}

/// Rules a described port has granted so far. A port whose health check was
/// never configured granted nothing.
fn granted_rules(lb: &ElasticLoadBalancer) -> Result<Vec<SecurityGroupRule>> {
    if lb.health_check.target.is_empty() {
        return Ok(Vec::new());
    }
    derive_rules(lb)
}

fn instance_ids(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|i| i.instance_id.clone()).collect()
}

/// Whether balancer-wide settings of `current` lag behind `desired`.
fn settings_differ(desired: &ElasticLoadBalancer, current: &ElasticLoadBalancer) -> bool {
    desired.network_volume != current.network_volume
        || desired.accounting_type != current.accounting_type
        || desired.balancing_type != current.balancing_type
        || desired.policy_type != current.policy_type
}

#[async_trait]
impl Reconciler for ElasticReconciler {
    type Spec = ElasticLoadBalancer;

    async fn reconcile(
        &self,
        name: &str,
        desired: &[ElasticLoadBalancer],
    ) -> Result<LoadBalancerStatus> {
        if desired.is_empty() {
            return Err(Error::NoPorts(name.to_string()));
        }
        info!(
            "Reconciling elastic load balancer {} ({} port(s))",
            name,
            desired.len()
        );

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
            debug!("Elastic load balancer {} already deleted", name);
            return Ok(());
        };

        info!(
            "Deleting elastic load balancer {} ({} port(s))",
            name,
            ports.len()
        );
        for lb in &ports {
            if !lb.instances.is_empty() {
                self.deregister_targets(lb, &lb.instances, &[], &[]).await?;
            }
            self.call(
                "DeleteElasticLoadBalancer",
                Target::port(name, lb.port_pair()),
                self.api.delete_elastic_load_balancer(lb),
            )
            .await?;
            self.audit.port_deleted(name, lb.port_pair());
        }
        Ok(())
    }
}
