//! Shared test utilities for lbsync integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use lbsync::annotations;
use lbsync::{
    AuditLogger, Call, ElasticReconciler, Instance, L4Reconciler, LoadBalancerProvider,
    MemoryCloud, ReconcilerConfig, ServiceDescriptor, ServicePort,
};

/// Unique id of the test service.
pub const SERVICE_UID: &str = "6f1c2a4e-8b3d-4f5a-9c7e-1d2b3a4c5e6f";

/// Balancer name derived from `SERVICE_UID`.
pub const LB_NAME: &str = "6f1c2a4e8b3d4f5";

/// Test harness: one in-memory cloud and a provider wired to it.
pub struct TestCloud {
    pub cloud: Arc<MemoryCloud>,
    pub provider: LoadBalancerProvider,
}

impl TestCloud {
    pub fn new() -> Self {
        let cloud = Arc::new(MemoryCloud::new());
        let provider = LoadBalancerProvider::with_api(
            cloud.clone(),
            ReconcilerConfig::default(),
            AuditLogger::new_noop(),
        );
        Self { cloud, provider }
    }

    pub fn l4(&self) -> L4Reconciler {
        L4Reconciler::new(
            self.cloud.clone(),
            ReconcilerConfig::default(),
            AuditLogger::new_noop(),
        )
    }

    pub fn elastic(&self) -> ElasticReconciler {
        ElasticReconciler::new(
            self.cloud.clone(),
            ReconcilerConfig::default(),
            AuditLogger::new_noop(),
        )
    }

    /// Calls of operation `op` received since the last `clear_calls`.
    pub async fn calls_of(&self, op: &str) -> Vec<Call> {
        self.cloud
            .calls()
            .await
            .into_iter()
            .filter(|c| c.operation() == op)
            .collect()
    }

    pub async fn count(&self, op: &str) -> usize {
        self.calls_of(op).await.len()
    }

    pub async fn mutating_operations(&self) -> Vec<&'static str> {
        self.cloud
            .mutating_calls()
            .await
            .iter()
            .map(Call::operation)
            .collect()
    }
}

/// Service exposing `(port, node port)` pairs over TCP.
pub fn service(ports: &[(u16, u16)]) -> ServiceDescriptor {
    ServiceDescriptor {
        uid: SERVICE_UID.to_string(),
        namespace: "default".to_string(),
        name: "web".to_string(),
        ports: ports
            .iter()
            .enumerate()
            .map(|(i, (port, node_port))| ServicePort {
                name: format!("port-{}", i),
                protocol: "TCP".to_string(),
                port: *port,
                node_port: Some(*node_port),
            })
            .collect(),
        ..Default::default()
    }
}

/// Same as `service`, selecting the elastic balancer kind.
pub fn elastic_service(ports: &[(u16, u16)]) -> ServiceDescriptor {
    let mut service = service(ports);
    annotate(&mut service, annotations::LB_TYPE, "elastic");
    service
}

pub fn annotate(service: &mut ServiceDescriptor, key: &str, value: &str) {
    service.annotations.insert(key.to_string(), value.to_string());
}

pub fn instance(id: &str) -> Instance {
    Instance {
        instance_id: id.to_string(),
        instance_unique_id: format!("uid-{}", id),
        instance_type: "standard.small".to_string(),
        private_ip: "10.0.0.10".to_string(),
        zone: "zone-a".to_string(),
        state: "running".to_string(),
        ..Default::default()
    }
}
