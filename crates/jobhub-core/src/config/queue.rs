//! Queue client configuration.

use serde::{Deserialize, Serialize};

/// A single named queue client.
///
/// The URL scheme selects the driver (`redis`, `rediss`, `memory`, `sqs`,
/// `https` for full SQS queue URLs, `nats`) and query parameters carry the
/// driver options, e.g. `redis://localhost:6379?visibilityTimeout=30000&count=4`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Connection URL including driver options.
    pub url: String,
    /// Whether this client is created at startup.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl QueueConfig {
    /// Create an enabled queue config for the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            enabled: true,
        }
    }
}

fn default_true() -> bool {
    true
}
