//! Application configuration schemas.
//!
//! All configuration structs are deserialized from TOML files via the
//! `config` crate. Each sub-module represents a logical configuration
//! section.

pub mod logging;
pub mod pool;
pub mod queue;
pub mod worker;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use self::logging::LoggingConfig;
pub use self::pool::PoolConfig;
pub use self::queue::QueueConfig;
pub use self::worker::{ProcessRole, WorkerConfig};

use crate::error::AppError;

/// Name of the queue client that must always be present.
pub const DEFAULT_QUEUE: &str = "default";

/// Root application configuration.
///
/// This struct is the top-level deserialization target for the merged
/// TOML configuration files (default.toml + environment overlay).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Queue clients by logical name.
    #[serde(default)]
    pub queues: BTreeMap<String, QueueConfig>,
    /// Resource pool settings shared by pooled transports.
    #[serde(default)]
    pub pool: PoolConfig,
    /// Worker process settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges the default configuration with an environment-specific overlay
    /// and environment variables prefixed with `JOBHUB_`.
    pub fn load(env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("JOBHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        let mut app: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))?;
        app.ensure_default_queue();
        Ok(app)
    }

    /// Insert an in-process `default` queue when none is configured.
    pub fn ensure_default_queue(&mut self) {
        self.queues
            .entry(DEFAULT_QUEUE.to_string())
            .or_insert_with(|| QueueConfig::new("memory://default"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_queue_is_inserted() {
        let mut config = AppConfig::default();
        config.ensure_default_queue();
        assert_eq!(config.queues[DEFAULT_QUEUE].url, "memory://default");
    }

    #[test]
    fn test_configured_default_queue_is_kept() {
        let mut config = AppConfig::default();
        config.queues.insert(
            DEFAULT_QUEUE.to_string(),
            QueueConfig::new("redis://localhost:6379?visibilityTimeout=30000"),
        );
        config.ensure_default_queue();
        assert!(config.queues[DEFAULT_QUEUE].url.starts_with("redis://"));
    }

    #[test]
    fn test_deserialize_sections_with_defaults() {
        let raw = r#"{
            "queues": { "jobs": { "url": "sqs://jobs?region=eu-west-1" } },
            "worker": { "concurrency": 8 }
        }"#;
        let config: AppConfig = serde_json::from_str(raw).expect("parse");
        assert!(config.queues["jobs"].enabled);
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert_eq!(config.pool.max, 10);
        assert_eq!(config.logging.level, "info");
    }
}
