//! Reconciler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deadlines applied to remote calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcilerConfig {
    /// Upper bound for a single remote API call, in seconds.
    pub api_timeout_secs: u64,
    /// Upper bound for waiting until a security group applied its rule changes.
    pub security_group_apply_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            api_timeout_secs: 60,
            security_group_apply_timeout_secs: 600,
        }
    }
}

impl ReconcilerConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn security_group_apply_timeout(&self) -> Duration {
        Duration::from_secs(self.security_group_apply_timeout_secs)
    }
}
