//! The job scheduler: validation, submission, cron and queue consumption
//! in one place.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use jobhub_core::job::{CronEntry, JobSpec};
use jobhub_core::result::AppResult;
use jobhub_queue::{DeliveryError, QueueOptions, QueueRegistry, SubmitReceipt, handler_fn};

use crate::cron::{CronScheduler, CronTrigger};
use crate::runner::{JobReport, JobRunner, is_valid};

/// Owns the queue clients, the job runner and the cron table.
#[derive(Debug)]
pub struct Scheduler {
    queues: Arc<QueueRegistry>,
    runner: Arc<JobRunner>,
    cron: Arc<CronScheduler>,
    listening: Mutex<Vec<(String, QueueOptions)>>,
}

impl Scheduler {
    /// Create a scheduler whose cron ticks submit to the entry's queues.
    pub async fn new(queues: Arc<QueueRegistry>, runner: Arc<JobRunner>) -> AppResult<Self> {
        let target = Arc::clone(&queues);
        let trigger: CronTrigger = Arc::new(move |entry: CronEntry| {
            let queues = Arc::clone(&target);
            Box::pin(async move {
                match submit(&queues, &entry.job, &entry.queue, &QueueOptions::default()).await {
                    Ok(receipt) => debug!(cron = %entry.label(), queue = %receipt.queue, id = %receipt.id, "Cron job submitted"),
                    Err(e) => error!(cron = %entry.label(), error = %e, "Cron job submission failed"),
                }
            })
        });
        let cron = Arc::new(CronScheduler::new(trigger).await?);

        Ok(Self {
            queues,
            runner,
            cron,
            listening: Mutex::new(Vec::new()),
        })
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    /// Validate and run a job in this process.
    pub async fn run_job(&self, job: &Value) -> AppResult<JobReport> {
        let spec = is_valid(job)?;
        Ok(self.runner.run_job(&spec).await)
    }

    /// Validate a job and submit it to the next of `queues` in round-robin
    /// order (the default client when empty). Nothing is sent for an
    /// invalid spec.
    pub async fn submit_job(&self, job: &Value, queues: &[String], options: &QueueOptions) -> AppResult<SubmitReceipt> {
        let spec = is_valid(job)?;
        submit(&self.queues, &spec, queues, options).await
    }

    pub async fn schedule_cronjob(&self, entry: CronEntry) -> AppResult<()> {
        self.cron.schedule_cronjob(entry).await
    }

    /// Replace every cron entry tagged `tag`.
    pub async fn schedule_cronjobs(&self, tag: &str, entries: Vec<CronEntry>) -> AppResult<usize> {
        self.cron.schedule_cronjobs(tag, entries).await
    }

    /// Consume the work queues of `names`, running each message as a job.
    ///
    /// A payload that is not a valid job spec is rejected permanently.
    pub async fn listen(&self, names: &[String], options: &QueueOptions) -> AppResult<()> {
        for name in names {
            let client = self.queues.get(name)?;
            let runner = Arc::clone(&self.runner);
            let handler = handler_fn(move |message| {
                let runner = Arc::clone(&runner);
                async move {
                    let spec = JobSpec::parse(message.payload()).map_err(|e| {
                        warn!(queue = %message.queue, message_id = %message.id(), error = %e, "Rejecting invalid job");
                        DeliveryError::permanent(e.to_string())
                    })?;
                    debug!(queue = %message.queue, message_id = %message.id(), attempt = message.attempt, "Running job");
                    runner.run_job(&spec).await.status()
                }
            });
            client.listen(options, handler).await?;
            if let Ok(mut listening) = self.listening.lock() {
                listening.push((client.name().to_string(), options.clone()));
            }
        }
        Ok(())
    }

    /// Stop cron, stop consuming, wait up to `timeout` for running tasks,
    /// then close every queue client.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Err(e) = self.cron.shutdown().await {
            warn!(error = %e, "Cron shutdown failed");
        }

        let listening = self.listening.lock().map(|mut l| std::mem::take(&mut *l)).unwrap_or_default();
        for (name, options) in listening {
            if let Ok(client) = self.queues.get(&name) {
                if let Err(e) = client.unlisten(&options).await {
                    warn!(queue = %name, error = %e, "Unlisten failed");
                }
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while self.runner.idle_for().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let running = self.runner.running_tasks();
        if !running.is_empty() {
            warn!(tasks = running.len(), "Shutting down with tasks still running");
        }

        self.queues.shutdown_all().await;
        info!("Scheduler shut down");
    }
}

async fn submit(
    queues: &QueueRegistry,
    job: &JobSpec,
    names: &[String],
    options: &QueueOptions,
) -> AppResult<SubmitReceipt> {
    let client = queues.pick(names)?;
    let receipt = client.submit(&job.to_value(), options).await?;
    debug!(queue = %receipt.queue, channel = %receipt.channel, id = %receipt.id, "Job submitted");
    Ok(receipt)
}
