//! Desired-state builder.
//!
//! Turns an orchestrator service (ports, annotations, source ranges) and the
//! resolved backend list into one balancer value per exposed port.

use std::collections::BTreeMap;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::annotations::{self, NetworkInterfaceKeys};
use crate::model::{
    ElasticLoadBalancer, HealthCheck, Instance, LoadBalancer, MAX_PORTS, NETWORK_COMMON_GLOBAL,
    NetworkInterface, PROTOCOL_ICMP, PROTOCOL_TCP,
};

/// Length of a balancer name.
pub const LOAD_BALANCER_NAME_LEN: usize = 15;

/// Builder errors.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("port {port} uses protocol {protocol}, only TCP is supported")]
    UnsupportedProtocol { port: u16, protocol: String },

    #[error("{0} ports requested, a load balancer supports at most {max}", max = MAX_PORTS)]
    TooManyPorts(usize),

    #[error("annotation {key}={value:?} is invalid: {reason}")]
    InvalidAnnotation {
        key: String,
        value: String,
        reason: String,
    },

    #[error("health check protocol {0:?} is not supported, use TCP or ICMP")]
    InvalidHealthCheckProtocol(String),

    #[error("load balancer type {0:?} is not supported, use l4 or elastic")]
    InvalidLoadBalancerType(String),

    #[error("invalid source range {0:?}")]
    InvalidSourceRange(String),

    #[error("network interface {index} on private network {network_id} requires an IP address")]
    IpAddressRequired { index: usize, network_id: String },

    #[error(
        "network interface {index} on private network {network_id} requires exactly 2 system IP addresses, got {count}"
    )]
    SystemIpAddressCount {
        index: usize,
        network_id: String,
        count: usize,
    },

    #[error("exactly one of two network interfaces must be the VIP network, got {0}")]
    VipNetworkCount(usize),
}

/// One port exposed by a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub protocol: String,
    pub port: u16,
    /// Port opened on every backend; unassigned ports are skipped.
    pub node_port: Option<u16>,
}

/// Orchestrator-level view of a service exposed through a balancer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceDescriptor {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub ports: Vec<ServicePort>,
    pub annotations: BTreeMap<String, String>,
    pub load_balancer_source_ranges: Vec<String>,
}

impl ServiceDescriptor {
    /// Name of the balancer backing this service.
    pub fn load_balancer_name(&self) -> String {
        load_balancer_name(&self.uid)
    }
}

/// Balancer name for an orchestrator-assigned unique id.
pub fn load_balancer_name(uid: &str) -> String {
    uid.chars()
        .filter(|c| *c != '-')
        .take(LOAD_BALANCER_NAME_LEN)
        .collect()
}

/// Settings shared by every port of one balancer.
struct Common {
    balancing_type: u32,
    accounting_type: u32,
    network_volume: u32,
    policy_type: String,
    interval: u32,
    unhealthy_threshold: u32,
    icmp_health_check: bool,
}

impl Common {
    fn parse(annotations: &BTreeMap<String, String>) -> Result<Self, BuildError> {
        let icmp_health_check = match annotations::get(annotations, annotations::LB_HEALTHCHECK_PROTOCOL)
        {
            None | Some(PROTOCOL_TCP) => false,
            Some(PROTOCOL_ICMP) => true,
            Some(other) => return Err(BuildError::InvalidHealthCheckProtocol(other.to_string())),
        };

        Ok(Self {
            balancing_type: annotations::parse_or(
                annotations,
                annotations::LB_BALANCING_TYPE,
                annotations::DEFAULT_BALANCING_TYPE,
            )?,
            accounting_type: annotations::parse_or(
                annotations,
                annotations::LB_ACCOUNTING_TYPE,
                annotations::DEFAULT_ACCOUNTING_TYPE,
            )?,
            network_volume: annotations::parse_or(
                annotations,
                annotations::LB_NETWORK_VOLUME,
                annotations::DEFAULT_NETWORK_VOLUME,
            )?,
            policy_type: annotations::get(annotations, annotations::LB_POLICY_TYPE)
                .unwrap_or(annotations::DEFAULT_POLICY_TYPE)
                .to_string(),
            interval: annotations::parse_or(
                annotations,
                annotations::LB_HEALTHCHECK_INTERVAL,
                annotations::DEFAULT_HEALTHCHECK_INTERVAL,
            )?,
            unhealthy_threshold: annotations::parse_or(
                annotations,
                annotations::LB_HEALTHCHECK_UNHEALTHY_THRESHOLD,
                annotations::DEFAULT_HEALTHCHECK_UNHEALTHY_THRESHOLD,
            )?,
            icmp_health_check,
        })
    }

    fn health_check(&self, node_port: u16) -> HealthCheck {
        let target = if self.icmp_health_check {
            PROTOCOL_ICMP.to_string()
        } else {
            format!("{}:{}", PROTOCOL_TCP, node_port)
        };
        HealthCheck {
            target,
            interval: self.interval,
            unhealthy_threshold: self.unhealthy_threshold,
        }
    }
}

/// `(service port, node port)` of every usable port.
fn usable_ports(service: &ServiceDescriptor) -> Result<Vec<(u16, u16)>, BuildError> {
    let mut ports = Vec::new();
    for port in &service.ports {
        if port.protocol != PROTOCOL_TCP {
            return Err(BuildError::UnsupportedProtocol {
                port: port.port,
                protocol: port.protocol.clone(),
            });
        }
        match port.node_port {
            Some(node_port) if node_port != 0 => ports.push((port.port, node_port)),
            _ => warn!(
                "Skipping port {} of service {}/{}: no node port assigned",
                port.port, service.namespace, service.name
            ),
        }
    }

    if ports.len() > MAX_PORTS {
        return Err(BuildError::TooManyPorts(ports.len()));
    }
    Ok(ports)
}

/// Desired L4 balancer ports for `service`.
pub fn build_load_balancers(
    name: &str,
    instances: &[Instance],
    service: &ServiceDescriptor,
) -> Result<Vec<LoadBalancer>, BuildError> {
    let common = Common::parse(&service.annotations)?;
    let filters = source_filters(service)?;

    Ok(usable_ports(service)?
        .into_iter()
        .map(|(port, node_port)| LoadBalancer {
            name: name.to_string(),
            accounting_type: common.accounting_type,
            policy_type: common.policy_type.clone(),
            balancing_type: common.balancing_type,
            network_volume: common.network_volume,
            load_balancer_port: port,
            instance_port: node_port,
            health_check: common.health_check(node_port),
            instances: instances.to_vec(),
            filters: filters.clone(),
            vip: String::new(),
        })
        .collect())
}

/// Desired elastic balancer ports for `service`.
pub fn build_elastic_load_balancers(
    name: &str,
    instances: &[Instance],
    service: &ServiceDescriptor,
) -> Result<Vec<ElasticLoadBalancer>, BuildError> {
    let common = Common::parse(&service.annotations)?;
    let network_interfaces = network_interfaces(&service.annotations)?;
    let availability_zone = annotations::get(&service.annotations, annotations::ELB_AVAILABILITY_ZONE)
        .map(str::to_string)
        .or_else(|| instances.first().map(|i| i.zone.clone()))
        .unwrap_or_default();

    Ok(usable_ports(service)?
        .into_iter()
        .map(|(port, node_port)| ElasticLoadBalancer {
            name: name.to_string(),
            accounting_type: common.accounting_type,
            policy_type: common.policy_type.clone(),
            balancing_type: common.balancing_type,
            network_volume: common.network_volume,
            protocol: PROTOCOL_TCP.to_string(),
            load_balancer_port: port,
            instance_port: node_port,
            health_check: common.health_check(node_port),
            instances: instances.to_vec(),
            filters: Vec::new(),
            availability_zone: availability_zone.clone(),
            vip: String::new(),
            network_interfaces: network_interfaces.clone(),
        })
        .collect())
}

/// Filter addresses admitted by the service's source ranges.
///
/// The service field wins over the annotation. An allow-all range means no
/// filter at all, and host routes are written as bare addresses.
fn source_filters(service: &ServiceDescriptor) -> Result<Vec<String>, BuildError> {
    let ranges = if service.load_balancer_source_ranges.is_empty() {
        annotations::list(&service.annotations, annotations::LB_SOURCE_RANGES)
    } else {
        service.load_balancer_source_ranges.clone()
    };

    let mut filters = Vec::new();
    for range in ranges {
        let range = range.trim();
        let net: IpNet = range
            .parse()
            .map_err(|_| BuildError::InvalidSourceRange(range.to_string()))?;
        // A zero-length prefix admits every address
        if net.prefix_len() == 0 {
            return Ok(Vec::new());
        }
        let filter = match net {
            IpNet::V4(v4) if v4.prefix_len() == 32 => v4.addr().to_string(),
            _ => range.to_string(),
        };
        if !filters.contains(&filter) {
            filters.push(filter);
        }
    }
    Ok(filters)
}

/// Network interfaces declared through the elastic annotation slots.
fn network_interfaces(
    annotations: &BTreeMap<String, String>,
) -> Result<Vec<NetworkInterface>, BuildError> {
    let mut interfaces = Vec::new();
    for index in 1..=annotations::ELB_NETWORK_INTERFACE_SLOTS {
        let keys = NetworkInterfaceKeys::slot(index);
        let Some(network_id) = annotations::get(annotations, &keys.network_id) else {
            continue;
        };

        let ip_address = annotations::get(annotations, &keys.ip_address)
            .map(|ip| parse_ip(&keys.ip_address, ip))
            .transpose()?;
        let system_ip_addresses = annotations::list(annotations, &keys.system_ip_addresses)
            .iter()
            .map(|ip| parse_ip(&keys.system_ip_addresses, ip))
            .collect::<Result<Vec<_>, _>>()?;
        let is_vip_network = annotations::parse_or(annotations, &keys.vip_network, false)?;

        let interface = NetworkInterface {
            network_id: network_id.to_string(),
            ip_address,
            system_ip_addresses,
            is_vip_network,
        };

        if !interface.is_shared() {
            if interface.ip_address.is_none() {
                return Err(BuildError::IpAddressRequired {
                    index,
                    network_id: interface.network_id,
                });
            }
            if interface.system_ip_addresses.len() != 2 {
                return Err(BuildError::SystemIpAddressCount {
                    index,
                    network_id: interface.network_id,
                    count: interface.system_ip_addresses.len(),
                });
            }
        }
        interfaces.push(interface);
    }

    match interfaces.len() {
        0 => Ok(vec![NetworkInterface {
            network_id: NETWORK_COMMON_GLOBAL.to_string(),
            ip_address: None,
            system_ip_addresses: Vec::new(),
            is_vip_network: true,
        }]),
        1 => {
            interfaces[0].is_vip_network = true;
            Ok(interfaces)
        }
        _ => {
            let vip_networks = interfaces.iter().filter(|i| i.is_vip_network).count();
            if vip_networks != 1 {
                return Err(BuildError::VipNetworkCount(vip_networks));
            }
            Ok(interfaces)
        }
    }
}

fn parse_ip(key: &str, value: &str) -> Result<String, BuildError> {
    value
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|e| BuildError::InvalidAnnotation {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}
