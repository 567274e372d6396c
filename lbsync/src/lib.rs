//! lbsync: converges cloud load balancers toward the state declared by
//! orchestrator services.
//!
//! Two balancer shapes are supported:
//! - L4: a basic multi-port balancer with source filters
//! - Elastic: a balancer with one or two network interfaces whose backends are
//!   protected by security group rules derived from its topology
//!
//! Every reconciliation re-describes the remote balancer and applies only the
//! difference, so the engine can be re-invoked safely after any failure.

pub mod annotations;
pub mod audit;
pub mod cloud;
pub mod config;
pub mod desired;
pub mod diff;
pub mod error;
pub mod model;
pub mod provider;
pub mod reconciler;
pub mod security_group;

pub use audit::{AuditEvent, AuditLogger, AuditSink, TracingSink};
pub use cloud::memory::{Call, CloudSnapshot, MemoryCloud};
pub use cloud::{ApiError, ElasticApi, ErrorCode, L4Api};
pub use config::ReconcilerConfig;
pub use desired::{BuildError, ServiceDescriptor, ServicePort};
pub use error::{Error, Result, Target};
pub use model::{
    ElasticLoadBalancer, Filter, HealthCheck, Instance, LoadBalancer, LoadBalancerStatus,
    NetworkInterface, PortPair, SecurityGroupRule,
};
pub use provider::{LoadBalancerKind, LoadBalancerProvider};
pub use reconciler::{ElasticReconciler, L4Reconciler, Reconciler};
