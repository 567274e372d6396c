//! Service annotation keys and typed lookups.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::desired::BuildError;

const PREFIX: &str = "service.beta.kubernetes.io/lbsync-";

// Balancer selection
pub const LB_TYPE: &str = "service.beta.kubernetes.io/lbsync-load-balancer-type";

// Balancer policy
pub const LB_BALANCING_TYPE: &str = "service.beta.kubernetes.io/lbsync-load-balancer-balancing-type";
pub const LB_ACCOUNTING_TYPE: &str =
    "service.beta.kubernetes.io/lbsync-load-balancer-accounting-type";
pub const LB_NETWORK_VOLUME: &str = "service.beta.kubernetes.io/lbsync-load-balancer-network-volume";
pub const LB_POLICY_TYPE: &str = "service.beta.kubernetes.io/lbsync-load-balancer-policy-type";
pub const LB_SOURCE_RANGES: &str = "service.beta.kubernetes.io/lbsync-load-balancer-source-ranges";

// Health check
pub const LB_HEALTHCHECK_INTERVAL: &str =
    "service.beta.kubernetes.io/lbsync-load-balancer-healthcheck-interval";
pub const LB_HEALTHCHECK_UNHEALTHY_THRESHOLD: &str =
    "service.beta.kubernetes.io/lbsync-load-balancer-healthcheck-unhealthy-threshold";
pub const LB_HEALTHCHECK_PROTOCOL: &str =
    "service.beta.kubernetes.io/lbsync-load-balancer-healthcheck-protocol";

// Elastic balancer
pub const ELB_AVAILABILITY_ZONE: &str = "service.beta.kubernetes.io/lbsync-elb-availability-zone";

pub const DEFAULT_BALANCING_TYPE: u32 = 1;
pub const DEFAULT_ACCOUNTING_TYPE: u32 = 1;
pub const DEFAULT_NETWORK_VOLUME: u32 = 10;
pub const DEFAULT_POLICY_TYPE: &str = "standard";
pub const DEFAULT_HEALTHCHECK_INTERVAL: u32 = 10;
pub const DEFAULT_HEALTHCHECK_UNHEALTHY_THRESHOLD: u32 = 1;

/// Number of network interface annotation groups an elastic balancer reads.
pub const ELB_NETWORK_INTERFACE_SLOTS: usize = 2;

/// Annotation keys of one elastic network interface slot (1-based).
#[derive(Debug, Clone)]
pub struct NetworkInterfaceKeys {
    pub network_id: String,
    pub ip_address: String,
    pub system_ip_addresses: String,
    pub vip_network: String,
}

impl NetworkInterfaceKeys {
    pub fn slot(index: usize) -> Self {
        let base = format!("{}elb-network-interface-{}", PREFIX, index);
        Self {
            ip_address: format!("{}-ip-address", base),
            system_ip_addresses: format!("{}-system-ip-addresses", base),
            vip_network: format!("{}-vip-network", base),
            network_id: base,
        }
    }
}

/// Trimmed annotation value; blank values count as absent.
pub fn get<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}

/// Parse an annotation, falling back to `default` when absent.
pub fn parse_or<T>(
    annotations: &BTreeMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, BuildError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(annotations, key) {
        Some(value) => value.parse().map_err(|e: T::Err| BuildError::InvalidAnnotation {
            key: key.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Comma separated list annotation; empty when absent.
pub fn list(annotations: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    get(annotations, key)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
