//! Security group rules derived from elastic balancer topology.
//!
//! Backends must admit data traffic from the VIP and health checks from
//! wherever the balancer sends them. With a single interface everything comes
//! from the VIP plus the interface's system addresses; with two interfaces the
//! health checks originate from the interface that does not carry the VIP.

use tracing::warn;

use crate::error::{Error, Result};
use crate::model::{ElasticLoadBalancer, PROTOCOL_ICMP, SecurityGroupRule};

/// Split a health check target into protocol and port.
///
/// `TCP:30000` yields `("TCP", Some(30000))`, `ICMP` yields `("ICMP", None)`.
pub fn parse_health_check_target(target: &str) -> Result<(String, Option<u16>)> {
    if target == PROTOCOL_ICMP {
        return Ok((PROTOCOL_ICMP.to_string(), None));
    }

    let (protocol, port) = target
        .split_once(':')
        .ok_or_else(|| Error::InvalidHealthCheckTarget(target.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidHealthCheckTarget(target.to_string()))?;
    if protocol.is_empty() {
        return Err(Error::InvalidHealthCheckTarget(target.to_string()));
    }
    Ok((protocol.to_string(), Some(port)))
}

/// Full ingress rule set protecting the backends of `lb`.
///
/// `lb` must carry the VIP and network interfaces as reported by the remote
/// API.
pub fn derive_rules(lb: &ElasticLoadBalancer) -> Result<Vec<SecurityGroupRule>> {
    let (hc_protocol, hc_port) = parse_health_check_target(&lb.health_check.target)?;
    let hc_rule_port = |data_port: u16| -> Option<u16> {
        if hc_protocol == PROTOCOL_ICMP {
            None
        } else {
            hc_port.or(Some(data_port))
        }
    };

    let mut rules = Vec::new();
    match lb.network_interfaces.as_slice() {
        [interface] => {
            rules.push(SecurityGroupRule::inbound(
                &lb.protocol,
                Some(lb.instance_port),
                &lb.vip,
            ));
            if hc_protocol != lb.protocol {
                rules.push(SecurityGroupRule::inbound(
                    &hc_protocol,
                    hc_rule_port(lb.instance_port),
                    &lb.vip,
                ));
            }
            for system_ip in &interface.system_ip_addresses {
                rules.push(SecurityGroupRule::inbound(
                    &hc_protocol,
                    hc_rule_port(lb.instance_port),
                    system_ip,
                ));
            }
        }
        [_, _] => {
            let Some(interface) = lb.network_interfaces.iter().find(|i| !i.is_vip_network) else {
                return Err(Error::NetworkInterfaceCount {
                    name: lb.name.clone(),
                    count: lb.network_interfaces.len(),
                });
            };
            // Data port is used for TCP checks here, not the health check port.
            let port = if hc_protocol == PROTOCOL_ICMP {
                None
            } else {
                Some(lb.instance_port)
            };
            match interface.ip_address.as_deref() {
                Some(ip) if !ip.is_empty() => {
                    rules.push(SecurityGroupRule::inbound(&hc_protocol, port, ip));
                }
                _ => warn!(
                    "Network interface {} of elastic load balancer {} has no IP address yet",
                    interface.network_id, lb.name
                ),
            }
            for system_ip in &interface.system_ip_addresses {
                rules.push(SecurityGroupRule::inbound(&hc_protocol, port, system_ip));
            }
        }
        other => {
            return Err(Error::NetworkInterfaceCount {
                name: lb.name.clone(),
                count: other.len(),
            });
        }
    }
    Ok(rules)
}
