//! Job runner: sequential steps, concurrent tasks, fault isolation.
//!
//! Each task runs in its own Tokio task. A panic surfaces as a
//! [`TaskError::Fault`] on that task's result instead of unwinding through
//! the worker, and an optional time budget turns a hang into
//! [`TaskError::Timeout`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use jobhub_core::job::JobSpec;
use jobhub_core::result::AppResult;
use jobhub_queue::{Delivery, DeliveryError};

use crate::registry::{TaskError, TaskRegistry, TaskResult};

/// Validate and normalize a job spec in any accepted shape.
pub fn is_valid(job: &Value) -> AppResult<JobSpec> {
    JobSpec::parse(job)
}

/// Outcome of one task.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Task name.
    pub name: String,
    /// Handler result; an unresolved name counts as `Ok(None)`.
    pub result: TaskResult,
    /// Wall time spent.
    pub elapsed: Duration,
}

/// Outcome of a whole job.
#[derive(Debug, Clone)]
pub struct JobReport {
    /// Outcomes of the tasks that ran, in step order.
    pub outcomes: Vec<TaskOutcome>,
    /// Tasks of steps that never started because an earlier step failed.
    pub skipped: Vec<String>,
    /// Wall time of the whole job.
    pub elapsed: Duration,
}

impl JobReport {
    /// Whether every task that ran succeeded and nothing was skipped.
    pub fn is_success(&self) -> bool {
        self.skipped.is_empty() && self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// The first failure, in step order.
    pub fn first_error(&self) -> Option<(&str, &TaskError)> {
        self.outcomes
            .iter()
            .find_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }

    /// Map the outcome onto the queue acknowledgment contract.
    pub fn status(&self) -> Delivery {
        match self.first_error() {
            None => Ok(()),
            Some((name, err)) => {
                let message = format!("{name}: {err}");
                Err(match err {
                    TaskError::Retry(_) => DeliveryError::transient(message),
                    TaskError::Keep(_) => DeliveryError::keep(message),
                    _ => DeliveryError::permanent(message),
                })
            }
        }
    }
}

/// Snapshot of a task in flight.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    /// Task name.
    pub name: String,
    /// How long it has been running.
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[derive(Debug, Default)]
struct Activity {
    running: HashMap<u64, (String, Instant)>,
    last_finished: Option<Instant>,
}

/// Runs jobs against a [`TaskRegistry`].
#[derive(Debug)]
pub struct JobRunner {
    registry: Arc<TaskRegistry>,
    task_timeout: Option<Duration>,
    activity: Arc<Mutex<Activity>>,
    next_id: AtomicU64,
    started: Instant,
}

struct Tracked {
    id: u64,
    activity: Arc<Mutex<Activity>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Ok(mut activity) = self.activity.lock() {
            activity.running.remove(&self.id);
            activity.last_finished = Some(Instant::now());
        }
    }
}

impl JobRunner {
    /// Create a runner; `task_timeout` bounds every task when set.
    pub fn new(registry: Arc<TaskRegistry>, task_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            task_timeout,
            activity: Arc::new(Mutex::new(Activity::default())),
            next_id: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// The task registry.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Tasks currently running, longest first.
    pub fn running_tasks(&self) -> Vec<RunningTask> {
        let now = Instant::now();
        let mut tasks: Vec<RunningTask> = self
            .activity
            .lock()
            .map(|a| {
                a.running
                    .values()
                    .map(|(name, since)| RunningTask {
                        name: name.clone(),
                        elapsed: now.saturating_duration_since(*since),
                    })
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by(|a, b| b.elapsed.cmp(&a.elapsed));
        tasks
    }

    /// Time since the last task finished, or since the runner was created
    /// when none has; `None` while something is running.
    pub fn idle_for(&self) -> Option<Duration> {
        let activity = self.activity.lock().ok()?;
        if !activity.running.is_empty() {
            return None;
        }
        Some(activity.last_finished.unwrap_or(self.started).elapsed())
    }

    /// Time since the runner was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    fn track(&self, name: &str) -> Tracked {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut activity) = self.activity.lock() {
            activity.running.insert(id, (name.to_string(), Instant::now()));
        }
        Tracked {
            id,
            activity: Arc::clone(&self.activity),
        }
    }

    /// Run one task inside the isolation boundary.
    ///
    /// An unregistered name is logged and treated as a successful no-op.
    pub async fn run_task(&self, name: &str, args: Value) -> TaskOutcome {
        let started = Instant::now();
        let Some(handler) = self.registry.resolve(name) else {
            warn!(task = %name, "No handler registered, skipping task");
            return TaskOutcome {
                name: name.to_string(),
                result: Ok(None),
                elapsed: started.elapsed(),
            };
        };

        let _tracked = self.track(name);
        debug!(task = %name, "Running task");
        let mut handle = tokio::spawn(async move { handler.run(args).await });

        let joined = match self.task_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return self.finish(name, Err(TaskError::Timeout(limit)), started);
                }
            },
            None => handle.await,
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(TaskError::Fault(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::Fault(e.to_string())),
        };
        self.finish(name, result, started)
    }

    fn finish(&self, name: &str, result: TaskResult, started: Instant) -> TaskOutcome {
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => debug!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "Task completed"),
            Err(TaskError::Keep(reason)) => warn!(task = %name, "Task deferred: {}", reason),
            Err(e) => error!(task = %name, elapsed_ms = elapsed.as_millis() as u64, "Task failed: {}", e),
        }
        TaskOutcome {
            name: name.to_string(),
            result,
            elapsed,
        }
    }

    /// Run a job: steps in order, the tasks of one step concurrently.
    /// The first failing step stops the job.
    pub async fn run_job(&self, job: &JobSpec) -> JobReport {
        let started = Instant::now();
        let steps = job.steps();
        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            let results = join_all(
                step.iter()
                    .map(|(name, args)| self.run_task(name, args.clone())),
            )
            .await;
            let failed = results.iter().any(|o| o.result.is_err());
            outcomes.extend(results);

            if failed {
                skipped = steps[index + 1..]
                    .iter()
                    .flat_map(|s| s.keys().cloned())
                    .collect();
                break;
            }
        }

        let report = JobReport {
            outcomes,
            skipped,
            elapsed: started.elapsed(),
        };
        if report.is_success() {
            info!(tasks = report.outcomes.len(), elapsed_ms = report.elapsed.as_millis() as u64, "Job completed");
        } else {
            warn!(
                tasks = report.outcomes.len(),
                skipped = report.skipped.len(),
                "Job failed"
            );
        }
        report
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn registry(log: Arc<Mutex<Vec<String>>>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        for name in ["steps.first", "steps.second", "steps.third"] {
            let log = Arc::clone(&log);
            let label = name.to_string();
            registry
                .register_fn(name, move |_| {
                    let log = Arc::clone(&log);
                    let label = label.clone();
                    async move {
                        log.lock().unwrap().push(label);
                        Ok(None)
                    }
                })
                .unwrap();
        }
        registry
            .register_fn("steps.boom", |args: Value| async move {
                if args.is_null() {
                    panic!("exploded");
                }
                Ok(None)
            })
            .unwrap();
        registry
            .register_fn("steps.busy", |_| async { Err(TaskError::Retry("busy".into())) })
            .unwrap();
        registry
            .register_fn("steps.hang", |_| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(None)
            })
            .unwrap();
        registry
    }

    fn runner(log: &Arc<Mutex<Vec<String>>>, timeout: Option<Duration>) -> JobRunner {
        JobRunner::new(Arc::new(registry(Arc::clone(log))), timeout)
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, None);
        let job = is_valid(&json!({ "job": ["steps.first", "steps.second", { "steps.third": null }] })).unwrap();

        let report = runner.run_job(&job).await;
        assert!(report.is_success());
        assert!(report.status().is_ok());
        assert_eq!(*log.lock().unwrap(), vec!["steps.first", "steps.second", "steps.third"]);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_and_skips_later_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, None);
        let job = is_valid(&json!({ "job": ["steps.first", "steps.boom", "steps.third"] })).unwrap();

        let report = runner.run_job(&job).await;
        assert!(!report.is_success());
        let (name, err) = report.first_error().unwrap();
        assert_eq!(name, "steps.boom");
        assert!(matches!(err, TaskError::Fault(msg) if msg.contains("exploded")));
        assert_eq!(report.skipped, vec!["steps.third"]);
        assert_eq!(report.status().unwrap_err().status, 400);
        assert_eq!(*log.lock().unwrap(), vec!["steps.first"]);
        assert!(runner.running_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_tasks_of_one_step_run_concurrently() {
        let mut registry = TaskRegistry::new();
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        for name in ["par.a", "par.b", "par.c"] {
            let (peak, current) = (Arc::clone(&peak), Arc::clone(&current));
            registry
                .register_fn(name, move |_| {
                    let (peak, current) = (Arc::clone(&peak), Arc::clone(&current));
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(None)
                    }
                })
                .unwrap();
        }
        let runner = JobRunner::new(Arc::new(registry), None);
        let job = is_valid(&json!({ "par.a": 1, "par.b": 2, "par.c": 3 })).unwrap();

        assert!(runner.run_job(&job).await.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_task_is_a_successful_no_op() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, None);
        let job = is_valid(&json!(["optional.missing", "steps.first"])).unwrap();

        let report = runner.run_job(&job).await;
        assert!(report.is_success());
        assert_eq!(report.outcomes[0].result.as_ref().unwrap(), &None);
        assert_eq!(*log.lock().unwrap(), vec!["steps.first"]);
    }

    #[tokio::test]
    async fn test_retry_and_keep_map_to_delivery_statuses() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, None);
        let job = is_valid(&json!("steps.busy")).unwrap();
        assert_eq!(runner.run_job(&job).await.status().unwrap_err().status, 500);

        let report = JobReport {
            outcomes: vec![TaskOutcome {
                name: "steps.wait".into(),
                result: Err(TaskError::Keep("later".into())),
                elapsed: Duration::ZERO,
            }],
            skipped: Vec::new(),
            elapsed: Duration::ZERO,
        };
        assert_eq!(report.status().unwrap_err().status, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_task_times_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let runner = runner(&log, Some(Duration::from_secs(5)));
        let outcome = runner.run_task("steps.hang", Value::Null).await;
        assert!(matches!(outcome.result, Err(TaskError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(runner.running_tasks().is_empty());
        assert!(runner.idle_for().is_some());
    }
}
