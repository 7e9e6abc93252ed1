//! Job specification model: the unit submitted to queues and cron tables.

pub mod cron;
pub mod spec;

pub use cron::CronEntry;
pub use spec::{JobBody, JobSpec, TaskMap, is_valid_task_name};
