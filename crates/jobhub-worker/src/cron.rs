//! Cron scheduler with tag-scoped, atomic table replacement.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use uuid::Uuid;

use jobhub_core::error::AppError;
use jobhub_core::job::CronEntry;

/// Called on every tick of an installed entry.
pub type CronTrigger = Arc<dyn Fn(CronEntry) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug)]
struct Installed {
    entry: CronEntry,
    job_id: Option<Uuid>,
}

/// Cron-based scheduler for recurring jobs
pub struct CronScheduler {
    /// The underlying job scheduler
    scheduler: JobScheduler,
    /// Installed entries in installation order
    table: Mutex<Vec<Installed>>,
    /// What a tick does
    trigger: CronTrigger,
}

impl std::fmt::Debug for CronScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronScheduler").finish()
    }
}

impl CronScheduler {
    /// Create a new cron scheduler
    pub async fn new(trigger: CronTrigger) -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {}", e)))?;

        Ok(Self {
            scheduler,
            table: Mutex::new(Vec::new()),
            trigger,
        })
    }

    /// Start the scheduler
    pub async fn start(&self) -> Result<(), AppError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {}", e)))?;

        tracing::info!("Cron scheduler started");
        Ok(())
    }

    /// Shutdown the scheduler and forget every entry
    pub async fn shutdown(&self) -> Result<(), AppError> {
        self.table.lock().await.clear();
        let mut scheduler = self.scheduler.clone();
        scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {}", e)))?;

        tracing::info!("Cron scheduler shut down");
        Ok(())
    }

    /// Build the scheduler job for an entry; `None` for disabled entries.
    fn build(&self, entry: &CronEntry) -> Result<Option<CronJob>, AppError> {
        if entry.disabled {
            return Ok(None);
        }
        let trigger = Arc::clone(&self.trigger);
        let fired = entry.clone();
        let job = CronJob::new_async(entry.cron.as_str(), move |_uuid, _lock| {
            let trigger = Arc::clone(&trigger);
            let entry = fired.clone();
            Box::pin(async move {
                tracing::debug!("Cron tick: '{}'", entry.label());
                trigger(entry).await;
            })
        })
        .map_err(|e| {
            AppError::validation(format!(
                "Invalid cron expression '{}' for '{}': {}",
                entry.cron,
                entry.label(),
                e
            ))
        })?;
        Ok(Some(job))
    }

    async fn add(&self, job: Option<CronJob>, entry: &CronEntry) -> Result<Option<Uuid>, AppError> {
        let Some(job) = job else {
            return Ok(None);
        };
        let id = self.scheduler.add(job).await.map_err(|e| {
            AppError::internal(format!("Failed to add schedule '{}': {}", entry.label(), e))
        })?;
        Ok(Some(id))
    }

    /// Install one entry next to the existing ones
    pub async fn schedule_cronjob(&self, entry: CronEntry) -> Result<(), AppError> {
        let job = self.build(&entry)?;
        let mut table = self.table.lock().await;
        let job_id = self.add(job, &entry).await?;
        tracing::info!("Registered: {} ({}){}", entry.label(), entry.cron, disabled_note(&entry));
        table.push(Installed { entry, job_id });
        Ok(())
    }

    /// Replace every entry tagged `tag` with `entries`.
    ///
    /// All expressions are checked before anything is removed, so an
    /// invalid list leaves the previous table in place. Entries with other
    /// tags are untouched.
    pub async fn schedule_cronjobs(&self, tag: &str, entries: Vec<CronEntry>) -> Result<usize, AppError> {
        let entries: Vec<CronEntry> = entries.into_iter().map(|e| e.with_tag(tag)).collect();
        let jobs = entries
            .iter()
            .map(|entry| self.build(entry))
            .collect::<Result<Vec<_>, _>>()?;

        let mut table = self.table.lock().await;
        let (replaced, kept): (Vec<Installed>, Vec<Installed>) =
            std::mem::take(&mut *table).into_iter().partition(|i| i.entry.tag == tag);
        *table = kept;
        for old in &replaced {
            if let Some(id) = old.job_id {
                if let Err(e) = self.scheduler.remove(&id).await {
                    tracing::warn!("Failed to remove schedule '{}': {}", old.entry.label(), e);
                }
            }
        }

        let count = entries.len();
        for (entry, job) in entries.into_iter().zip(jobs) {
            let job_id = self.add(job, &entry).await?;
            table.push(Installed { entry, job_id });
        }

        tracing::info!(
            "Cron table '{}' replaced: {} removed, {} installed",
            tag,
            replaced.len(),
            count
        );
        Ok(count)
    }

    /// Installed entries, in installation order
    pub async fn entries(&self) -> Vec<CronEntry> {
        self.table.lock().await.iter().map(|i| i.entry.clone()).collect()
    }

    /// Installed entries with the given tag
    pub async fn entries_tagged(&self, tag: &str) -> Vec<CronEntry> {
        self.table
            .lock()
            .await
            .iter()
            .filter(|i| i.entry.tag == tag)
            .map(|i| i.entry.clone())
            .collect()
    }
}

fn disabled_note(entry: &CronEntry) -> &'static str {
    if entry.disabled { " [disabled]" } else { "" }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use jobhub_core::job::JobSpec;
    use serde_json::json;

    use super::*;

    fn entry(cron: &str, task: &str) -> CronEntry {
        CronEntry::new(cron, JobSpec::parse(&json!(task)).unwrap())
    }

    fn noop() -> CronTrigger {
        Arc::new(|_| Box::pin(async {}))
    }

    fn labels(entries: &[CronEntry]) -> Vec<String> {
        entries.iter().map(CronEntry::label).collect()
    }

    #[tokio::test]
    async fn test_second_list_replaces_first_for_same_tag() {
        let cron = CronScheduler::new(noop()).await.unwrap();
        cron.schedule_cronjobs("other", vec![entry("0 0 * * * *", "keep.me")])
            .await
            .unwrap();

        cron.schedule_cronjobs(
            "alerts",
            vec![entry("0 */5 * * * *", "alerts.a"), entry("0 */5 * * * *", "alerts.b")],
        )
        .await
        .unwrap();
        cron.schedule_cronjobs("alerts", vec![entry("0 0 3 * * *", "alerts.c")])
            .await
            .unwrap();

        assert_eq!(labels(&cron.entries_tagged("alerts").await), vec!["alerts.c"]);
        assert_eq!(labels(&cron.entries().await), vec!["keep.me", "alerts.c"]);
    }

    #[tokio::test]
    async fn test_invalid_expression_keeps_previous_table() {
        let cron = CronScheduler::new(noop()).await.unwrap();
        cron.schedule_cronjobs("alerts", vec![entry("0 */5 * * * *", "alerts.a")])
            .await
            .unwrap();

        let bad = vec![entry("0 0 3 * * *", "alerts.b"), entry("not a cron", "alerts.c")];
        assert!(cron.schedule_cronjobs("alerts", bad).await.is_err());
        assert_eq!(labels(&cron.entries_tagged("alerts").await), vec!["alerts.a"]);
    }

    #[tokio::test]
    async fn test_disabled_entries_are_listed_but_not_installed() {
        let cron = CronScheduler::new(noop()).await.unwrap();
        let mut off = entry("0 0 * * * *", "reports.weekly");
        off.disabled = true;
        cron.schedule_cronjob(off).await.unwrap();

        let table = cron.table.lock().await;
        assert_eq!(table.len(), 1);
        assert!(table[0].job_id.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_installed_entry_fires() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let trigger: CronTrigger = Arc::new(move |_| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        let cron = CronScheduler::new(trigger).await.unwrap();
        cron.schedule_cronjob(entry("* * * * * *", "clock.tick")).await.unwrap();
        cron.start().await.unwrap();

        for _ in 0..50 {
            if ticks.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(ticks.load(Ordering::SeqCst) > 0);
        cron.shutdown().await.unwrap();
    }
}
