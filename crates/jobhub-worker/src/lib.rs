//! Job execution and scheduling for JobHub.
//!
//! This crate provides:
//! - A task registry mapping `"module.method"` names to handlers
//! - A job runner with per-task fault isolation
//! - A cron scheduler with per-tag table replacement, fed by crontab files
//! - A liveness self-check that stops stuck or expired workers
//! - The [`Scheduler`] tying these to the queue clients

pub mod cron;
pub mod crontab;
pub mod liveness;
pub mod registry;
pub mod runner;
pub mod scheduler;

pub use cron::CronScheduler;
pub use crontab::CrontabWatcher;
pub use liveness::{LivenessMonitor, LivenessVerdict};
pub use registry::{TaskError, TaskHandler, TaskRegistry, TaskResult};
pub use runner::{JobReport, JobRunner, is_valid};
pub use scheduler::Scheduler;
