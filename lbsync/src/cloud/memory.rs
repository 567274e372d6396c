//! In-memory cloud backend.
//!
//! Implements both API traits against a local state table and records every
//! call it receives. The CLI runs reconciliations against it from a JSON
//! snapshot, and the tests use it to assert on the exact calls issued.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{ApiError, ApiResult, ElasticApi, ErrorCode, L4Api};
use crate::model::{
    BalancerPort, ElasticLoadBalancer, Filter, HealthCheck, Instance, LoadBalancer, PortPair,
    SecurityGroupRule,
};

const CODE_DUPLICATE_LOAD_BALANCER: &str = "Client.InvalidParameterDuplicate.LoadBalancer";
const CODE_DUPLICATE_PORT: &str = "Client.InvalidParameterDuplicate.Port";

/// Security group with its members and ingress rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityGroup {
    pub instance_ids: Vec<String>,
    pub rules: Vec<SecurityGroupRule>,
}

/// Serializable state of a `MemoryCloud`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudSnapshot {
    pub load_balancers: Vec<LoadBalancer>,
    pub elastic_load_balancers: Vec<ElasticLoadBalancer>,
    pub security_groups: BTreeMap<String, SecurityGroup>,
}

/// One call received by a `MemoryCloud`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "operation", rename_all_fields = "camelCase")]
pub enum Call {
    DescribeLoadBalancers {
        name: String,
    },
    CreateLoadBalancer {
        name: String,
        ports: PortPair,
    },
    RegisterPortWithLoadBalancer {
        name: String,
        ports: PortPair,
    },
    UpdateLoadBalancer {
        name: String,
        ports: PortPair,
    },
    DeleteLoadBalancer {
        name: String,
        ports: PortPair,
    },
    ConfigureHealthCheck {
        name: String,
        ports: PortPair,
        target: String,
    },
    RegisterInstancesWithLoadBalancer {
        name: String,
        ports: PortPair,
        instance_ids: Vec<String>,
    },
    DeregisterInstancesFromLoadBalancer {
        name: String,
        ports: PortPair,
        instance_ids: Vec<String>,
    },
    SetFilterForLoadBalancer {
        name: String,
        ports: PortPair,
        filters: Vec<Filter>,
    },
    DescribeElasticLoadBalancers {
        name: String,
    },
    CreateElasticLoadBalancer {
        name: String,
        ports: PortPair,
    },
    RegisterPortWithElasticLoadBalancer {
        name: String,
        ports: PortPair,
    },
    UpdateElasticLoadBalancer {
        name: String,
        ports: PortPair,
    },
    DeleteElasticLoadBalancer {
        name: String,
        ports: PortPair,
    },
    ConfigureElasticHealthCheck {
        name: String,
        ports: PortPair,
        target: String,
    },
    RegisterInstancesWithElasticLoadBalancer {
        name: String,
        ports: PortPair,
        instance_ids: Vec<String>,
    },
    DeregisterInstancesFromElasticLoadBalancer {
        name: String,
        ports: PortPair,
        instance_ids: Vec<String>,
    },
    SetFilterForElasticLoadBalancer {
        name: String,
        ports: PortPair,
        filters: Vec<Filter>,
    },
    DescribeSecurityGroupsByInstanceIds {
        instance_ids: Vec<String>,
    },
    AuthorizeSecurityGroupIngress {
        group: String,
        rule: SecurityGroupRule,
    },
    RevokeSecurityGroupIngress {
        group: String,
        rule: SecurityGroupRule,
    },
    WaitSecurityGroupApplied {
        group: String,
    },
}

impl Call {
    /// Remote operation name.
    pub fn operation(&self) -> &'static str {
        match self {
            Call::DescribeLoadBalancers { .. } => "DescribeLoadBalancers",
            Call::CreateLoadBalancer { .. } => "CreateLoadBalancer",
            Call::RegisterPortWithLoadBalancer { .. } => "RegisterPortWithLoadBalancer",
            Call::UpdateLoadBalancer { .. } => "UpdateLoadBalancer",
            Call::DeleteLoadBalancer { .. } => "DeleteLoadBalancer",
            Call::ConfigureHealthCheck { .. } => "ConfigureHealthCheck",
            Call::RegisterInstancesWithLoadBalancer { .. } => "RegisterInstancesWithLoadBalancer",
            Call::DeregisterInstancesFromLoadBalancer { .. } => {
                "DeregisterInstancesFromLoadBalancer"
            }
            Call::SetFilterForLoadBalancer { .. } => "SetFilterForLoadBalancer",
            Call::DescribeElasticLoadBalancers { .. } => "DescribeElasticLoadBalancers",
            Call::CreateElasticLoadBalancer { .. } => "CreateElasticLoadBalancer",
            Call::RegisterPortWithElasticLoadBalancer { .. } => {
                "RegisterPortWithElasticLoadBalancer"
            }
            Call::UpdateElasticLoadBalancer { .. } => "UpdateElasticLoadBalancer",
            Call::DeleteElasticLoadBalancer { .. } => "DeleteElasticLoadBalancer",
            Call::ConfigureElasticHealthCheck { .. } => "ConfigureElasticHealthCheck",
            Call::RegisterInstancesWithElasticLoadBalancer { .. } => {
                "RegisterInstancesWithElasticLoadBalancer"
            }
            Call::DeregisterInstancesFromElasticLoadBalancer { .. } => {
                "DeregisterInstancesFromElasticLoadBalancer"
            }
            Call::SetFilterForElasticLoadBalancer { .. } => "SetFilterForElasticLoadBalancer",
            Call::DescribeSecurityGroupsByInstanceIds { .. } => {
                "DescribeSecurityGroupsByInstanceIds"
            }
            Call::AuthorizeSecurityGroupIngress { .. } => "AuthorizeSecurityGroupIngress",
            Call::RevokeSecurityGroupIngress { .. } => "RevokeSecurityGroupIngress",
            Call::WaitSecurityGroupApplied { .. } => "WaitSecurityGroupApplied",
        }
    }

    /// Whether the call changes remote state.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Call::DescribeLoadBalancers { .. }
                | Call::DescribeElasticLoadBalancers { .. }
                | Call::DescribeSecurityGroupsByInstanceIds { .. }
                | Call::WaitSecurityGroupApplied { .. }
        )
    }
}

#[derive(Default)]
struct State {
    load_balancers: BTreeMap<String, Vec<LoadBalancer>>,
    elastic_load_balancers: BTreeMap<String, Vec<ElasticLoadBalancer>>,
    security_groups: BTreeMap<String, SecurityGroup>,
    calls: Vec<Call>,
    failures: HashMap<String, ApiError>,
    next_vip: u32,
    next_address: u32,
}

impl State {
    /// Record `call` and return the failure injected for its operation, if
    /// any. Injected failures fire once.
    fn enter(&mut self, call: Call) -> ApiResult<()> {
        let op = call.operation();
        self.calls.push(call);
        match self.failures.remove(op) {
            Some(err) => {
                debug!("Injected failure for {}: {}", op, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn allocate_vip(&mut self) -> String {
        self.next_vip += 1;
        offset_address(VIP_POOL, self.next_vip).to_string()
    }

    fn allocate_address(&mut self) -> String {
        self.next_address += 1;
        offset_address(INTERFACE_POOL, self.next_address).to_string()
    }

    /// Resume both allocators after the highest addresses already in use.
    fn seed_allocators(&mut self) {
        let l4 = self.load_balancers.values().flatten().map(|lb| lb.vip.as_str());
        let elastic = self.elastic_load_balancers.values().flatten();
        let vips = l4.chain(elastic.clone().map(|lb| lb.vip.as_str()));
        let interfaces = elastic
            .flat_map(|lb| &lb.network_interfaces)
            .filter_map(|ni| ni.ip_address.as_deref());
        let (next_vip, next_address) = (
            highest_offset(VIP_POOL, vips),
            highest_offset(INTERFACE_POOL, interfaces),
        );
        self.next_vip = next_vip;
        self.next_address = next_address;
    }
}

const VIP_POOL: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 0);
const INTERFACE_POOL: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 0);
const POOL_SPAN: u32 = u16::MAX as u32;

fn highest_offset<'a>(base: Ipv4Addr, addresses: impl Iterator<Item = &'a str>) -> u32 {
    addresses
        .filter_map(|address| address.parse::<Ipv4Addr>().ok())
        .filter_map(|address| u32::from(address).checked_sub(u32::from(base)))
        .filter(|offset| *offset <= POOL_SPAN)
        .max()
        .unwrap_or(0)
}

/// Address `offset` positions past `base`. Carries into the next octet
/// instead of printing an out-of-range one.
fn offset_address(base: Ipv4Addr, offset: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).saturating_add(offset))
}

/// Cloud API backed by process memory.
#[derive(Default)]
pub struct MemoryCloud {
    state: Mutex<State>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cloud preloaded with the balancers and security groups of `snapshot`.
    pub fn from_snapshot(snapshot: CloudSnapshot) -> Self {
        let mut state = State {
            security_groups: snapshot.security_groups,
            ..Default::default()
        };
        for lb in snapshot.load_balancers {
            state
                .load_balancers
                .entry(lb.name.clone())
                .or_default()
                .push(lb);
        }
        for lb in snapshot.elastic_load_balancers {
            state
                .elastic_load_balancers
                .entry(lb.name.clone())
                .or_default()
                .push(lb);
        }
        state.seed_allocators();
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> CloudSnapshot {
        let state = self.state.lock().await;
        CloudSnapshot {
            load_balancers: state.load_balancers.values().flatten().cloned().collect(),
            elastic_load_balancers: state
                .elastic_load_balancers
                .values()
                .flatten()
                .cloned()
                .collect(),
            security_groups: state.security_groups.clone(),
        }
    }

    /// Every call received so far, in order.
    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn mutating_calls(&self) -> Vec<Call> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.is_mutating())
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Fail the next call of operation `op` with `error`.
    pub async fn fail_on(&self, op: &str, error: ApiError) {
        self.state
            .lock()
            .await
            .failures
            .insert(op.to_string(), error);
    }

    /// Create (or extend) a security group holding `instance_ids`.
    pub async fn add_security_group(&self, group: &str, instance_ids: &[&str]) {
        let mut state = self.state.lock().await;
        let entry = state.security_groups.entry(group.to_string()).or_default();
        for id in instance_ids {
            if !entry.instance_ids.iter().any(|i| i == id) {
                entry.instance_ids.push(id.to_string());
            }
        }
    }

    /// Rules currently granted by `group`.
    pub async fn security_group_rules(&self, group: &str) -> Vec<SecurityGroupRule> {
        self.state
            .lock()
            .await
            .security_groups
            .get(group)
            .map(|g| g.rules.clone())
            .unwrap_or_default()
    }
}

fn not_found(code: &ErrorCode, what: &str) -> ApiError {
    ApiError::new(code.clone(), format!("{} not found", what))
}

fn ports_of<'a, T>(
    table: &'a mut BTreeMap<String, Vec<T>>,
    name: &str,
    code: &ErrorCode,
) -> ApiResult<&'a mut Vec<T>> {
    table
        .get_mut(name)
        .ok_or_else(|| not_found(code, &format!("load balancer {}", name)))
}

fn port_mut<'a, T: BalancerPort>(
    table: &'a mut BTreeMap<String, Vec<T>>,
    lb: &T,
    code: &ErrorCode,
) -> ApiResult<&'a mut T> {
    ports_of(table, lb.name(), code)?
        .iter_mut()
        .find(|p| p.same_port(lb))
        .ok_or_else(|| {
            not_found(
                code,
                &format!("port {} of load balancer {}", lb.port_pair(), lb.name()),
            )
        })
}

/// Store a new port with the VIP assigned. Health check, backends and
/// filters start out unconfigured.
fn insert_port<T: BalancerPort>(
    table: &mut BTreeMap<String, Vec<T>>,
    lb: &T,
    vip: String,
) -> ApiResult<()> {
    let ports = table.entry(lb.name().to_string()).or_default();
    if ports.iter().any(|p| p.same_port(lb)) {
        return Err(ApiError::new(
            ErrorCode::Other(CODE_DUPLICATE_PORT.to_string()),
            format!("port {} already exists on {}", lb.port_pair(), lb.name()),
        ));
    }
    let mut port = lb.clone();
    port.set_vip(vip);
    *port.health_check_mut() = HealthCheck::default();
    port.instances_mut().clear();
    port.filters_mut().clear();
    ports.push(port);
    Ok(())
}

fn delete_port<T: BalancerPort>(
    table: &mut BTreeMap<String, Vec<T>>,
    lb: &T,
    code: &ErrorCode,
) -> ApiResult<()> {
    let ports = ports_of(table, lb.name(), code)?;
    let before = ports.len();
    ports.retain(|p| !p.same_port(lb));
    if ports.len() == before {
        return Err(not_found(
            code,
            &format!("port {} of load balancer {}", lb.port_pair(), lb.name()),
        ));
    }
    if ports.is_empty() {
        table.remove(lb.name());
    }
    Ok(())
}

fn register_instances<T: BalancerPort>(port: &mut T, instances: &[Instance]) {
    for instance in instances {
        if !port.instances().iter().any(|i| i.same_backend(instance)) {
            port.instances_mut().push(instance.clone());
        }
    }
}

fn deregister_instances<T: BalancerPort>(port: &mut T, instances: &[Instance]) -> ApiResult<()> {
    if let Some(missing) = instances
        .iter()
        .find(|i| !port.instances().iter().any(|r| r.same_backend(i)))
    {
        return Err(not_found(
            &ErrorCode::InstanceNotFound,
            &format!("instance {}", missing.instance_id),
        ));
    }
    port.instances_mut()
        .retain(|r| !instances.iter().any(|i| i.same_backend(r)));
    Ok(())
}

fn apply_filters<T: BalancerPort>(port: &mut T, filters: &[Filter]) {
    for filter in filters {
        let current = port.filters_mut();
        if filter.add_on_filter {
            if !current.contains(&filter.ip_address) {
                current.push(filter.ip_address.clone());
            }
        } else {
            current.retain(|ip| ip != &filter.ip_address);
        }
    }
}

fn instance_ids(instances: &[Instance]) -> Vec<String> {
    instances.iter().map(|i| i.instance_id.clone()).collect()
}

#[async_trait]
impl L4Api for MemoryCloud {
    async fn describe_load_balancers(&self, name: &str) -> ApiResult<Vec<LoadBalancer>> {
        let mut state = self.state.lock().await;
        state.enter(Call::DescribeLoadBalancers {
            name: name.to_string(),
        })?;
        state
            .load_balancers
            .get(name)
            .cloned()
            .ok_or_else(|| {
                not_found(
                    &ErrorCode::LoadBalancerNotFound,
                    &format!("load balancer {}", name),
                )
            })
    }

    async fn create_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<String> {
        let mut state = self.state.lock().await;
        state.enter(Call::CreateLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        if state.load_balancers.contains_key(&lb.name) {
            return Err(ApiError::new(
                ErrorCode::Other(CODE_DUPLICATE_LOAD_BALANCER.to_string()),
                format!("load balancer {} already exists", lb.name),
            ));
        }
        let vip = state.allocate_vip();
        insert_port(&mut state.load_balancers, lb, vip.clone())?;
        Ok(vip)
    }

    async fn register_port_with_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::RegisterPortWithLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        let vip = ports_of(
            &mut state.load_balancers,
            &lb.name,
            &ErrorCode::LoadBalancerNotFound,
        )?
        .first()
        .map(|p| p.vip.clone())
        .unwrap_or_default();
        insert_port(&mut state.load_balancers, lb, vip)
    }

    async fn update_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::UpdateLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        let port = port_mut(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )?;
        port.network_volume = lb.network_volume;
        port.accounting_type = lb.accounting_type;
        port.balancing_type = lb.balancing_type;
        port.policy_type = lb.policy_type.clone();
        Ok(())
    }

    async fn delete_load_balancer(&self, lb: &LoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::DeleteLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        delete_port(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )
    }

    async fn configure_health_check(&self, lb: &LoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::ConfigureHealthCheck {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            target: lb.health_check.target.clone(),
        })?;
        let port = port_mut(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )?;
        port.health_check = lb.health_check.clone();
        Ok(())
    }

    async fn register_instances_with_load_balancer(
        &self,
        lb: &LoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::RegisterInstancesWithLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            instance_ids: instance_ids(instances),
        })?;
        let port = port_mut(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )?;
        register_instances(port, instances);
        Ok(())
    }

    async fn deregister_instances_from_load_balancer(
        &self,
        lb: &LoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::DeregisterInstancesFromLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            instance_ids: instance_ids(instances),
        })?;
        let port = port_mut(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )?;
        deregister_instances(port, instances)
    }

    async fn set_filter_for_load_balancer(
        &self,
        lb: &LoadBalancer,
        filters: &[Filter],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::SetFilterForLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            filters: filters.to_vec(),
        })?;
        let port = port_mut(
            &mut state.load_balancers,
            lb,
            &ErrorCode::LoadBalancerNotFound,
        )?;
        apply_filters(port, filters);
        Ok(())
    }
}

#[async_trait]
impl ElasticApi for MemoryCloud {
    async fn describe_elastic_load_balancers(
        &self,
        name: &str,
    ) -> ApiResult<Vec<ElasticLoadBalancer>> {
        let mut state = self.state.lock().await;
        state.enter(Call::DescribeElasticLoadBalancers {
            name: name.to_string(),
        })?;
        state
            .elastic_load_balancers
            .get(name)
            .cloned()
            .ok_or_else(|| {
                not_found(
                    &ErrorCode::ElasticLoadBalancerNotFound,
                    &format!("elastic load balancer {}", name),
                )
            })
    }

    async fn create_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<String> {
        let mut state = self.state.lock().await;
        state.enter(Call::CreateElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        if state.elastic_load_balancers.contains_key(&lb.name) {
            return Err(ApiError::new(
                ErrorCode::Other(CODE_DUPLICATE_LOAD_BALANCER.to_string()),
                format!("elastic load balancer {} already exists", lb.name),
            ));
        }

        let vip = state.allocate_vip();
        let mut interfaces = lb.network_interfaces.clone();
        for interface in &mut interfaces {
            if interface.ip_address.as_deref().unwrap_or_default().is_empty() {
                interface.ip_address = Some(if interface.is_vip_network {
                    vip.clone()
                } else {
                    state.allocate_address()
                });
            }
        }
        let lb = ElasticLoadBalancer {
            network_interfaces: interfaces,
            ..lb.clone()
        };
        insert_port(&mut state.elastic_load_balancers, &lb, vip.clone())?;
        Ok(vip)
    }

    async fn register_port_with_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::RegisterPortWithElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        let (vip, interfaces) = ports_of(
            &mut state.elastic_load_balancers,
            &lb.name,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?
        .first()
        .map(|p| (p.vip.clone(), p.network_interfaces.clone()))
        .unwrap_or_default();
        let lb = ElasticLoadBalancer {
            network_interfaces: interfaces,
            ..lb.clone()
        };
        insert_port(&mut state.elastic_load_balancers, &lb, vip)
    }

    async fn update_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::UpdateElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        let port = port_mut(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?;
        port.network_volume = lb.network_volume;
        port.accounting_type = lb.accounting_type;
        port.balancing_type = lb.balancing_type;
        port.policy_type = lb.policy_type.clone();
        Ok(())
    }

    async fn delete_elastic_load_balancer(&self, lb: &ElasticLoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::DeleteElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
        })?;
        delete_port(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )
    }

    async fn configure_elastic_health_check(&self, lb: &ElasticLoadBalancer) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::ConfigureElasticHealthCheck {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            target: lb.health_check.target.clone(),
        })?;
        let port = port_mut(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?;
        port.health_check = lb.health_check.clone();
        Ok(())
    }

    async fn register_instances_with_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::RegisterInstancesWithElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            instance_ids: instance_ids(instances),
        })?;
        let port = port_mut(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?;
        register_instances(port, instances);
        Ok(())
    }

    async fn deregister_instances_from_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        instances: &[Instance],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::DeregisterInstancesFromElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            instance_ids: instance_ids(instances),
        })?;
        let port = port_mut(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?;
        deregister_instances(port, instances)
    }

    async fn set_filter_for_elastic_load_balancer(
        &self,
        lb: &ElasticLoadBalancer,
        filters: &[Filter],
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::SetFilterForElasticLoadBalancer {
            name: lb.name.clone(),
            ports: lb.port_pair(),
            filters: filters.to_vec(),
        })?;
        let port = port_mut(
            &mut state.elastic_load_balancers,
            lb,
            &ErrorCode::ElasticLoadBalancerNotFound,
        )?;
        apply_filters(port, filters);
        Ok(())
    }

    async fn describe_security_groups_by_instance_ids(
        &self,
        instance_ids: &[String],
    ) -> ApiResult<Vec<String>> {
        let mut state = self.state.lock().await;
        state.enter(Call::DescribeSecurityGroupsByInstanceIds {
            instance_ids: instance_ids.to_vec(),
        })?;
        Ok(state
            .security_groups
            .iter()
            .filter(|(_, group)| group.instance_ids.iter().any(|i| instance_ids.contains(i)))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn authorize_security_group_ingress(
        &self,
        group: &str,
        rule: &SecurityGroupRule,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::AuthorizeSecurityGroupIngress {
            group: group.to_string(),
            rule: rule.clone(),
        })?;
        let entry = state.security_groups.entry(group.to_string()).or_default();
        if entry.rules.contains(rule) {
            return Err(ApiError::new(
                ErrorCode::DuplicateSecurityGroupRule,
                format!("security group {} already has rule {}", group, rule),
            ));
        }
        entry.rules.push(rule.clone());
        Ok(())
    }

    async fn revoke_security_group_ingress(
        &self,
        group: &str,
        rule: &SecurityGroupRule,
    ) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::RevokeSecurityGroupIngress {
            group: group.to_string(),
            rule: rule.clone(),
        })?;
        let removed = match state.security_groups.get_mut(group) {
            Some(entry) => {
                let before = entry.rules.len();
                entry.rules.retain(|r| r != rule);
                entry.rules.len() != before
            }
            None => false,
        };
        if !removed {
            return Err(not_found(
                &ErrorCode::SecurityGroupIngressNotFound,
                &format!("rule {} of security group {}", rule, group),
            ));
        }
        Ok(())
    }

    async fn wait_security_group_applied(&self, group: &str) -> ApiResult<()> {
        let mut state = self.state.lock().await;
        state.enter(Call::WaitSecurityGroupApplied {
            group: group.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lb(lb_port: u16, instance_port: u16) -> LoadBalancer {
        LoadBalancer {
            name: "abc".to_string(),
            load_balancer_port: lb_port,
            instance_port,
            ..Default::default()
        }
    }

    fn worker(id: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_ports_share_vip() {
        let cloud = MemoryCloud::new();
        let vip = cloud.create_load_balancer(&lb(80, 30000)).await.unwrap();
        cloud
            .register_port_with_load_balancer(&lb(443, 30443))
            .await
            .unwrap();

        let ports = cloud.describe_load_balancers("abc").await.unwrap();
        assert_eq!(ports.len(), 2);
        assert!(ports.iter().all(|p| p.vip == vip));
    }

    #[tokio::test]
    async fn test_deleting_last_port_removes_balancer() {
        let cloud = MemoryCloud::new();
        cloud.create_load_balancer(&lb(80, 30000)).await.unwrap();
        cloud.delete_load_balancer(&lb(80, 30000)).await.unwrap();

        let err = cloud.describe_load_balancers("abc").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LoadBalancerNotFound);
    }

    #[tokio::test]
    async fn test_deregister_unknown_instance() {
        let cloud = MemoryCloud::new();
        cloud.create_load_balancer(&lb(80, 30000)).await.unwrap();
        cloud
            .register_instances_with_load_balancer(&lb(80, 30000), &[worker("worker1")])
            .await
            .unwrap();

        let err = cloud
            .deregister_instances_from_load_balancer(&lb(80, 30000), &[worker("worker2")])
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InstanceNotFound);
    }

    #[tokio::test]
    async fn test_filter_changes_apply_in_order() {
        let cloud = MemoryCloud::new();
        let port = lb(80, 30000);
        cloud.create_load_balancer(&port).await.unwrap();
        cloud
            .set_filter_for_load_balancer(
                &port,
                &[Filter::add("192.0.2.0/24"), Filter::add("198.51.100.0/24")],
            )
            .await
            .unwrap();
        cloud
            .set_filter_for_load_balancer(&port, &[Filter::remove("198.51.100.0/24")])
            .await
            .unwrap();

        let ports = cloud.describe_load_balancers("abc").await.unwrap();
        assert_eq!(ports[0].filters, vec!["192.0.2.0/24"]);
    }

    #[tokio::test]
    async fn test_duplicate_rule_and_missing_ingress() {
        let cloud = MemoryCloud::new();
        let rule = SecurityGroupRule::inbound("TCP", Some(30000), "203.0.113.1");
        cloud
            .authorize_security_group_ingress("sg-1", &rule)
            .await
            .unwrap();

        let err = cloud
            .authorize_security_group_ingress("sg-1", &rule)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateSecurityGroupRule);

        cloud.revoke_security_group_ingress("sg-1", &rule).await.unwrap();
        let err = cloud
            .revoke_security_group_ingress("sg-1", &rule)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::SecurityGroupIngressNotFound);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let cloud = MemoryCloud::new();
        cloud
            .fail_on(
                "CreateLoadBalancer",
                ApiError::new(ErrorCode::Other("Server.Unavailable".into()), "try again"),
            )
            .await;

        assert!(cloud.create_load_balancer(&lb(80, 30000)).await.is_err());
        assert!(cloud.create_load_balancer(&lb(80, 30000)).await.is_ok());
        assert_eq!(cloud.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_elastic_create_assigns_interface_addresses() {
        let cloud = MemoryCloud::new();
        let elb = ElasticLoadBalancer {
            name: "abc".to_string(),
            load_balancer_port: 80,
            instance_port: 30000,
            network_interfaces: vec![crate::model::NetworkInterface {
                network_id: crate::model::NETWORK_COMMON_GLOBAL.to_string(),
                is_vip_network: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let vip = cloud.create_elastic_load_balancer(&elb).await.unwrap();

        let ports = cloud.describe_elastic_load_balancers("abc").await.unwrap();
        assert_eq!(ports[0].vip, vip);
        assert_eq!(
            ports[0].network_interfaces[0].ip_address.as_deref(),
            Some(vip.as_str())
        );
    }

    #[tokio::test]
    async fn test_restored_cloud_allocates_unused_vip() {
        let cloud = MemoryCloud::new();
        cloud.create_load_balancer(&lb(80, 30000)).await.unwrap();
        let mut other = lb(80, 30000);
        other.name = "def".to_string();
        cloud.create_load_balancer(&other).await.unwrap();
        cloud.delete_load_balancer(&lb(80, 30000)).await.unwrap();

        // One balancer left, holding the second VIP
        let restored = MemoryCloud::from_snapshot(cloud.snapshot().await);
        let mut third = lb(80, 30000);
        third.name = "ghi".to_string();
        let vip = restored.create_load_balancer(&third).await.unwrap();
        assert_eq!(vip, "203.0.113.3");
    }

    #[test]
    fn test_vip_allocation_carries_past_last_octet() {
        let mut state = State {
            next_vip: 255,
            ..Default::default()
        };
        assert_eq!(state.allocate_vip(), "203.0.114.0");
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let cloud = MemoryCloud::new();
        cloud.create_load_balancer(&lb(80, 30000)).await.unwrap();
        cloud.add_security_group("sg-1", &["worker1"]).await;

        let snapshot = cloud.snapshot().await;
        let restored = MemoryCloud::from_snapshot(snapshot.clone());
        assert_eq!(restored.snapshot().await, snapshot);
        assert!(restored.calls().await.is_empty());
    }
}
