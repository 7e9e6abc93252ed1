//! Worker liveness self-check.
//!
//! A worker stuck on one task, or one that has sat idle past its lifetime,
//! asks to be stopped so a supervisor can start a fresh process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use jobhub_core::config::WorkerConfig;

use crate::runner::JobRunner;

/// Result of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// Keep running.
    Healthy,
    /// A task has been running longer than the runtime ceiling.
    Overrun { task: String, elapsed: Duration },
    /// The worker is idle and older than its lifetime ceiling.
    Expired { uptime: Duration },
}

impl LivenessVerdict {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Periodic self-check over a [`JobRunner`].
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    runner: Arc<JobRunner>,
    max_runtime: Option<Duration>,
    max_lifetime: Option<Duration>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(
        runner: Arc<JobRunner>,
        max_runtime: Option<Duration>,
        max_lifetime: Option<Duration>,
        interval: Duration,
    ) -> Self {
        Self {
            runner,
            max_runtime,
            max_lifetime,
            interval,
        }
    }

    /// Build from worker settings; zero ceilings are disabled.
    pub fn from_config(runner: Arc<JobRunner>, config: &WorkerConfig) -> Self {
        let ceiling = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        Self::new(
            runner,
            ceiling(config.max_runtime_seconds),
            ceiling(config.max_lifetime_seconds),
            Duration::from_secs(config.liveness_interval_seconds.max(1)),
        )
    }

    /// Whether any ceiling is configured.
    pub fn is_enabled(&self) -> bool {
        self.max_runtime.is_some() || self.max_lifetime.is_some()
    }

    pub fn check(&self) -> LivenessVerdict {
        if let Some(limit) = self.max_runtime {
            // running_tasks() is sorted longest first
            if let Some(task) = self.runner.running_tasks().into_iter().next() {
                if task.elapsed > limit {
                    return LivenessVerdict::Overrun {
                        task: task.name,
                        elapsed: task.elapsed,
                    };
                }
            }
        }
        if let Some(limit) = self.max_lifetime {
            let uptime = self.runner.uptime();
            if uptime > limit && self.runner.idle_for().is_some() {
                return LivenessVerdict::Expired { uptime };
            }
        }
        LivenessVerdict::Healthy
    }

    /// Check every `interval`; on the first unhealthy verdict, send it on
    /// `verdict` and stop.
    pub fn spawn(self, verdict: watch::Sender<Option<LivenessVerdict>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = verdict.closed() => break,
                }
                match self.check() {
                    LivenessVerdict::Healthy => debug!("Liveness check passed"),
                    found => {
                        match &found {
                            LivenessVerdict::Overrun { task, elapsed } => error!(
                                task = %task,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "Task exceeded max runtime, stopping worker"
                            ),
                            LivenessVerdict::Expired { uptime } => warn!(
                                uptime_secs = uptime.as_secs(),
                                "Idle worker exceeded max lifetime, stopping worker"
                            ),
                            LivenessVerdict::Healthy => {}
                        }
                        let _ = verdict.send(Some(found));
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::registry::TaskRegistry;

    fn runner() -> Arc<JobRunner> {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("slow.sleep", |_args: Value| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(None)
            })
            .unwrap();
        Arc::new(JobRunner::new(Arc::new(registry), None))
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_task_is_reported() {
        let runner = runner();
        let monitor = LivenessMonitor::new(
            Arc::clone(&runner),
            Some(Duration::from_secs(10)),
            None,
            Duration::from_secs(1),
        );
        let job = Arc::clone(&runner);
        let handle = tokio::spawn(async move { job.run_task("slow.sleep", json!(null)).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(monitor.check(), LivenessVerdict::Healthy);

        tokio::time::sleep(Duration::from_secs(6)).await;
        match monitor.check() {
            LivenessVerdict::Overrun { task, .. } => assert_eq!(task, "slow.sleep"),
            other => panic!("unexpected verdict {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_expires_but_busy_one_does_not() {
        let runner = runner();
        let monitor = LivenessMonitor::new(
            Arc::clone(&runner),
            None,
            Some(Duration::from_secs(30)),
            Duration::from_secs(1),
        );
        assert!(monitor.check().is_healthy());

        let job = Arc::clone(&runner);
        let handle = tokio::spawn(async move { job.run_task("slow.sleep", json!(null)).await });
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(monitor.check().is_healthy());

        handle.await.unwrap();
        assert!(matches!(monitor.check(), LivenessVerdict::Expired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_reports_verdict() {
        let runner = runner();
        let monitor = LivenessMonitor::new(runner, None, Some(Duration::from_secs(3)), Duration::from_secs(1));
        let (tx, mut rx) = watch::channel(None);
        let handle = monitor.spawn(tx);

        rx.changed().await.unwrap();
        assert!(matches!(*rx.borrow(), Some(LivenessVerdict::Expired { .. })));
        handle.await.unwrap();
    }
}
