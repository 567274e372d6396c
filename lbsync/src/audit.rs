//! Audit logging of remote mutations.
//!
//! Reconcilers receive an `AuditLogger` at construction and report every
//! change they make to the remote API through it. Where the events end up is
//! decided by the `AuditSink` the logger wraps.

use std::sync::Arc;

use tracing::{info, warn};

use crate::model::{PortPair, SecurityGroupRule};

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Audit,
    Warn,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub level: LogLevel,
    pub message: String,
    /// Balancer names, port pairs, instance ids or security groups involved.
    pub object_ids: Vec<String>,
}

/// Destination of audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as `tracing` events under the `lbsync::audit` target.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: AuditEvent) {
        let ids = event.object_ids.join(",");
        match event.level {
            LogLevel::Warn => warn!(target: "lbsync::audit", ids = %ids, "{}", event.message),
            LogLevel::Info | LogLevel::Audit => {
                info!(target: "lbsync::audit", ids = %ids, "{}", event.message)
            }
        }
    }
}

struct NoopSink;

impl AuditSink for NoopSink {
    fn record(&self, _event: AuditEvent) {}
}

/// Load balancer audit logger with domain-specific methods.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Logger writing to `tracing`.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// Create a noop audit logger (for testing)
    pub fn new_noop() -> Self {
        Self::new(Arc::new(NoopSink))
    }

    fn log(&self, level: LogLevel, message: String, object_ids: Vec<String>) {
        self.sink.record(AuditEvent {
            level,
            message,
            object_ids,
        });
    }

    // === Ports ===

    pub fn port_created(&self, name: &str, ports: PortPair, vip: &str) {
        self.log(
            LogLevel::Audit,
            format!("Load balancer '{}' created with port {} (VIP {})", name, ports, vip),
            vec![name.to_string(), ports.to_string()],
        );
    }

    pub fn port_registered(&self, name: &str, ports: PortPair) {
        self.log(
            LogLevel::Audit,
            format!("Port {} registered on load balancer '{}'", ports, name),
            vec![name.to_string(), ports.to_string()],
        );
    }

    pub fn port_deleted(&self, name: &str, ports: PortPair) {
        self.log(
            LogLevel::Audit,
            format!("Port {} deleted from load balancer '{}'", ports, name),
            vec![name.to_string(), ports.to_string()],
        );
    }

    pub fn health_check_configured(&self, name: &str, ports: PortPair, target: &str) {
        self.log(
            LogLevel::Info,
            format!(
                "Health check of load balancer '{}' port {} set to {}",
                name, ports, target
            ),
            vec![name.to_string(), ports.to_string()],
        );
    }

    // === Backends ===

    pub fn instances_registered(&self, name: &str, ports: PortPair, instance_ids: &[String]) {
        let mut ids = vec![name.to_string(), ports.to_string()];
        ids.extend(instance_ids.iter().cloned());
        self.log(
            LogLevel::Audit,
            format!(
                "Registered {} instance(s) with load balancer '{}' port {}",
                instance_ids.len(),
                name,
                ports
            ),
            ids,
        );
    }

    pub fn instances_deregistered(&self, name: &str, ports: PortPair, instance_ids: &[String]) {
        let mut ids = vec![name.to_string(), ports.to_string()];
        ids.extend(instance_ids.iter().cloned());
        self.log(
            LogLevel::Audit,
            format!(
                "Deregistered {} instance(s) from load balancer '{}' port {}",
                instance_ids.len(),
                name,
                ports
            ),
            ids,
        );
    }

    pub fn filters_set(&self, name: &str, ports: PortPair, added: usize, removed: usize) {
        self.log(
            LogLevel::Audit,
            format!(
                "Filter of load balancer '{}' port {} updated (+{} -{})",
                name, ports, added, removed
            ),
            vec![name.to_string(), ports.to_string()],
        );
    }

    // === Security groups ===

    pub fn ingress_authorized(&self, group: &str, rule: &SecurityGroupRule) {
        self.log(
            LogLevel::Audit,
            format!("Security group '{}' now allows {}", group, rule),
            vec![group.to_string()],
        );
    }

    pub fn ingress_revoked(&self, group: &str, rule: &SecurityGroupRule) {
        self.log(
            LogLevel::Audit,
            format!("Security group '{}' no longer allows {}", group, rule),
            vec![group.to_string()],
        );
    }

    pub fn reconcile_failed(&self, name: &str, error: &str) {
        self.log(
            LogLevel::Warn,
            format!("Reconciling load balancer '{}' failed: {}", name, error),
            vec![name.to_string()],
        );
    }
}
