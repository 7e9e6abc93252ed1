//! Resource pool configuration.

use serde::{Deserialize, Serialize};

/// Bounds and timeouts for a resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Minimum number of resources kept alive by housekeeping.
    #[serde(default)]
    pub min: usize,
    /// Maximum number of resources (idle + busy).
    #[serde(default = "default_max")]
    pub max: usize,
    /// Maximum number of callers allowed to wait for a resource.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
    /// How long a waiting caller waits before failing, in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
    /// Idle age after which a resource may be evicted, in milliseconds.
    #[serde(default = "default_idle")]
    pub idle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: default_max(),
            max_queue: default_max_queue(),
            timeout_ms: default_timeout(),
            idle_ms: default_idle(),
        }
    }
}

fn default_max() -> usize {
    10
}

fn default_max_queue() -> usize {
    100
}

fn default_timeout() -> u64 {
    5_000
}

fn default_idle() -> u64 {
    300_000
}
