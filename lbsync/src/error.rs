//! Reconciliation error types.

use std::fmt;

use thiserror::Error;

use crate::cloud::{ApiError, ErrorCode};
use crate::desired::BuildError;
use crate::model::PortPair;

/// Balancer (and optionally the port) an operation was acting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub ports: Option<PortPair>,
}

impl Target {
    /// The balancer as a whole.
    pub fn balancer(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ports: None,
        }
    }

    /// One port of a balancer.
    pub fn port(name: &str, ports: PortPair) -> Self {
        Self {
            name: name.to_string(),
            ports: Some(ports),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ports {
            Some(ports) => write!(f, "{} ({})", self.name, ports),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Errors returned by reconcilers and the provider.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote API rejected a call.
    #[error("{op} failed for load balancer {target}: {source}")]
    Remote {
        op: &'static str,
        target: Target,
        #[source]
        source: ApiError,
    },

    /// A remote call did not finish within its deadline.
    #[error("{op} timed out for load balancer {target}")]
    Timeout { op: &'static str, target: Target },

    /// A task of the first-creation side-effect group failed.
    #[error("configuring new port of load balancer {target} failed: {source}")]
    SideEffect {
        target: Target,
        #[source]
        source: Box<Error>,
    },

    /// A port present remotely has no desired counterpart after syncing.
    #[error("load balancer {0} has a port that is not in the desired state")]
    DesiredPortMissing(Target),

    /// Elastic balancers carry one or two network interfaces.
    #[error("elastic load balancer {name} has {count} network interfaces, expected 1 or 2")]
    NetworkInterfaceCount { name: String, count: usize },

    #[error("invalid health check target: {0}")]
    InvalidHealthCheckTarget(String),

    /// The balancer disappeared between a mutation and the following describe.
    #[error("load balancer {0} vanished after being modified")]
    Vanished(String),

    #[error("load balancer {0} has no ports to reconcile")]
    NoPorts(String),

    #[error("invalid service: {0}")]
    Build(#[from] BuildError),
}

impl Error {
    /// The machine-readable remote error code, if this is a remote failure.
    pub fn api_code(&self) -> Option<&ErrorCode> {
        match self {
            Error::Remote { source, .. } => Some(&source.code),
            Error::SideEffect { source, .. } => source.api_code(),
            _ => None,
        }
    }

    /// Whether the remote API answered with `code`.
    pub fn is_api(&self, code: &ErrorCode) -> bool {
        self.api_code() == Some(code)
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, Error>;
