//! Background worker configuration.

use serde::{Deserialize, Serialize};

/// Role of the current process.
///
/// Only workers listen on job queues; a master only schedules cron entries
/// and submits jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Consumes queues and runs jobs.
    #[default]
    Worker,
    /// Submits cron-triggered jobs but never runs them.
    Master,
}

/// Background job worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Role of this process.
    #[serde(default)]
    pub role: ProcessRole,
    /// Number of jobs one queue listener may run concurrently.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue client names to listen on.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// A single job running longer than this stops the worker (0 disables).
    #[serde(default)]
    pub max_runtime_seconds: u64,
    /// An idle worker older than this stops itself (0 disables).
    #[serde(default)]
    pub max_lifetime_seconds: u64,
    /// Interval between liveness self-checks.
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_seconds: u64,
    /// Per-task timeout (0 disables).
    #[serde(default)]
    pub task_timeout_seconds: u64,
    /// Directory containing `crontab` and `crontab.local`.
    #[serde(default = "default_crontab_dir")]
    pub crontab_dir: String,
    /// Interval between crontab change checks.
    #[serde(default = "default_crontab_watch")]
    pub crontab_watch_seconds: u64,
    /// How long shutdown waits for in-flight jobs.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            role: ProcessRole::default(),
            concurrency: default_concurrency(),
            queues: default_queues(),
            max_runtime_seconds: 0,
            max_lifetime_seconds: 0,
            liveness_interval_seconds: default_liveness_interval(),
            task_timeout_seconds: 0,
            crontab_dir: default_crontab_dir(),
            crontab_watch_seconds: default_crontab_watch(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_liveness_interval() -> u64 {
    30
}

fn default_crontab_dir() -> String {
    "config".to_string()
}

fn default_crontab_watch() -> u64 {
    5
}

fn default_shutdown_timeout() -> u64 {
    30
}
