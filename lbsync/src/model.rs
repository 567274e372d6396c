//! Load balancer entity model.
//!
//! These are plain values describing one exposed port of a balancer, its
//! backends and the rules derived from it. Desired values are built per
//! reconciliation; current values come straight from the remote API.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport protocol carried by balancer data traffic.
pub const PROTOCOL_TCP: &str = "TCP";

/// Health check target (and rule protocol) for ICMP echo checks.
pub const PROTOCOL_ICMP: &str = "ICMP";

/// Filter address the remote API uses for "any source".
pub const FILTER_WILDCARD: &str = "*.*.*.*";

/// Shared global network.
pub const NETWORK_COMMON_GLOBAL: &str = "net-COMMON_GLOBAL";

/// Shared private network.
pub const NETWORK_COMMON_PRIVATE: &str = "net-COMMON_PRIVATE";

/// Direction of every security group rule managed here.
pub const RULE_DIRECTION_IN: &str = "IN";

/// Maximum number of ports a single balancer accepts.
pub const MAX_PORTS: usize = 3;

/// One backend compute instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub instance_id: String,
    pub instance_unique_id: String,
    pub instance_type: String,
    pub public_ip: String,
    pub private_ip: String,
    pub zone: String,
    pub state: String,
}

impl Instance {
    /// Whether both values refer to the same backend.
    ///
    /// The unique id survives instance replacement, so it wins whenever both
    /// sides carry one.
    pub fn same_backend(&self, other: &Instance) -> bool {
        if !self.instance_unique_id.is_empty() && !other.instance_unique_id.is_empty() {
            return self.instance_unique_id == other.instance_unique_id;
        }
        self.instance_id == other.instance_id
    }
}

/// One filter change applied to a balancer port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// `true` adds the address to the filter, `false` removes it.
    pub add_on_filter: bool,
    pub ip_address: String,
}

impl Filter {
    pub fn add(ip_address: impl Into<String>) -> Self {
        Self {
            add_on_filter: true,
            ip_address: ip_address.into(),
        }
    }

    pub fn remove(ip_address: impl Into<String>) -> Self {
        Self {
            add_on_filter: false,
            ip_address: ip_address.into(),
        }
    }
}

/// The `(load balancer port, instance port)` pair identifying one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortPair {
    pub load_balancer_port: u16,
    pub instance_port: u16,
}

impl PortPair {
    pub fn new(load_balancer_port: u16, instance_port: u16) -> Self {
        Self {
            load_balancer_port,
            instance_port,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.load_balancer_port, self.instance_port)
    }
}

/// Health check settings of one balancer port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealthCheck {
    /// `TCP:<port>` or `ICMP`.
    pub target: String,
    /// Seconds between checks.
    pub interval: u32,
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            target: String::new(),
            interval: 10,
            unhealthy_threshold: 1,
        }
    }
}

/// One port of an L4 balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoadBalancer {
    pub name: String,
    pub accounting_type: u32,
    pub policy_type: String,
    pub balancing_type: u32,
    pub network_volume: u32,
    pub load_balancer_port: u16,
    pub instance_port: u16,
    pub health_check: HealthCheck,
    pub instances: Vec<Instance>,
    /// Source CIDRs admitted by the port filter.
    pub filters: Vec<String>,
    /// Assigned by the remote API; empty on desired values.
    pub vip: String,
}

/// One port of an elastic balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ElasticLoadBalancer {
    pub name: String,
    pub accounting_type: u32,
    pub policy_type: String,
    pub balancing_type: u32,
    pub network_volume: u32,
    pub protocol: String,
    pub load_balancer_port: u16,
    pub instance_port: u16,
    pub health_check: HealthCheck,
    pub instances: Vec<Instance>,
    pub filters: Vec<String>,
    pub availability_zone: String,
    pub vip: String,
    pub network_interfaces: Vec<NetworkInterface>,
}

/// One network attachment of an elastic balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkInterface {
    pub network_id: String,
    pub ip_address: Option<String>,
    /// Secondary addresses used as health check sources on private networks.
    pub system_ip_addresses: Vec<String>,
    pub is_vip_network: bool,
}

impl NetworkInterface {
    /// Whether this attaches to one of the provider-managed shared networks.
    pub fn is_shared(&self) -> bool {
        self.network_id == NETWORK_COMMON_GLOBAL || self.network_id == NETWORK_COMMON_PRIVATE
    }
}

/// One ingress rule protecting balancer backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityGroupRule {
    pub protocol: String,
    pub from_port: Option<u16>,
    pub to_port: Option<u16>,
    pub in_out: String,
    pub ip_ranges: Vec<String>,
}

impl SecurityGroupRule {
    /// An inbound rule for `protocol` on `port` admitting `source`.
    pub fn inbound(protocol: &str, port: Option<u16>, source: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            from_port: port,
            to_port: port,
            in_out: RULE_DIRECTION_IN.to_string(),
            ip_ranges: vec![source.to_string()],
        }
    }
}

impl fmt::Display for SecurityGroupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.from_port {
            Some(port) => write!(f, "{} {}:{}", self.in_out, self.protocol, port)?,
            None => write!(f, "{} {}", self.in_out, self.protocol)?,
        }
        write!(f, " from {}", self.ip_ranges.join(","))
    }
}

/// Externally visible state of a balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStatus {
    pub vip: String,
}

/// Accessors shared by both balancer variants.
///
/// Two ports are the same entity when name and port pair match, regardless
/// of any other field.
pub trait BalancerPort: Clone + Send + Sync {
    fn name(&self) -> &str;
    fn port_pair(&self) -> PortPair;
    fn health_check(&self) -> &HealthCheck;
    fn instances(&self) -> &[Instance];
    fn filters(&self) -> &[String];
    fn vip(&self) -> &str;

    fn health_check_mut(&mut self) -> &mut HealthCheck;
    fn instances_mut(&mut self) -> &mut Vec<Instance>;
    fn filters_mut(&mut self) -> &mut Vec<String>;
    fn set_vip(&mut self, vip: String);

    fn same_port(&self, other: &Self) -> bool {
        self.name() == other.name() && self.port_pair() == other.port_pair()
    }
}

macro_rules! impl_balancer_port {
    ($ty:ty) => {
        impl BalancerPort for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn port_pair(&self) -> PortPair {
                PortPair::new(self.load_balancer_port, self.instance_port)
            }

            fn health_check(&self) -> &HealthCheck {
                &self.health_check
            }

            fn instances(&self) -> &[Instance] {
                &self.instances
            }

            fn filters(&self) -> &[String] {
                &self.filters
            }

            fn vip(&self) -> &str {
                &self.vip
            }

            fn health_check_mut(&mut self) -> &mut HealthCheck {
                &mut self.health_check
            }

            fn instances_mut(&mut self) -> &mut Vec<Instance> {
                &mut self.instances
            }

            fn filters_mut(&mut self) -> &mut Vec<String> {
                &mut self.filters
            }

            fn set_vip(&mut self, vip: String) {
                self.vip = vip;
            }
        }
    };
}

impl_balancer_port!(LoadBalancer);
impl_balancer_port!(ElasticLoadBalancer);

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, unique_id: &str) -> Instance {
        Instance {
            instance_id: id.to_string(),
            instance_unique_id: unique_id.to_string(),
            ..Default::default()
        }
    }

    fn port(name: &str, lb_port: u16, instance_port: u16) -> LoadBalancer {
        LoadBalancer {
            name: name.to_string(),
            load_balancer_port: lb_port,
            instance_port,
            ..Default::default()
        }
    }

    #[test]
    fn test_instance_prefers_unique_id() {
        let a = instance("worker1", "i-abc");
        let b = instance("worker1-renamed", "i-abc");
        assert!(a.same_backend(&b));

        let c = instance("worker1", "i-def");
        assert!(!a.same_backend(&c));
    }

    #[test]
    fn test_instance_falls_back_to_instance_id() {
        let a = instance("worker1", "");
        let b = instance("worker1", "i-abc");
        assert!(a.same_backend(&b));
        assert!(!a.same_backend(&instance("worker2", "")));
    }

    #[test]
    fn test_same_port_uses_composite_key() {
        let a = port("lb", 80, 30000);
        let mut b = port("lb", 80, 30000);
        b.network_volume = 100;
        b.filters = vec!["192.0.2.1".to_string()];
        b.vip = "203.0.113.1".to_string();
        assert!(a.same_port(&b));

        assert!(!a.same_port(&port("lb", 80, 30001)));
        assert!(!a.same_port(&port("other", 80, 30000)));
    }

    #[test]
    fn test_shared_network_interface() {
        let global = NetworkInterface {
            network_id: NETWORK_COMMON_GLOBAL.to_string(),
            ..Default::default()
        };
        let private = NetworkInterface {
            network_id: "net-private1".to_string(),
            ..Default::default()
        };
        assert!(global.is_shared());
        assert!(!private.is_shared());
    }

    #[test]
    fn test_rule_display() {
        let rule = SecurityGroupRule::inbound(PROTOCOL_TCP, Some(30000), "203.0.113.1");
        assert_eq!(rule.to_string(), "IN TCP:30000 from 203.0.113.1");

        let icmp = SecurityGroupRule::inbound(PROTOCOL_ICMP, None, "203.0.113.1");
        assert_eq!(icmp.to_string(), "IN ICMP from 203.0.113.1");
    }
}
