//! Crontab file watcher.
//!
//! Two files are read from one directory: `crontab` and `crontab.local`.
//! Each is installed under its own tag, so a reload of one never disturbs
//! the other. Reloads are skipped while the combined content hash is
//! unchanged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobhub_core::error::{AppError, ErrorKind};
use jobhub_core::job::CronEntry;
use jobhub_core::result::AppResult;

use crate::cron::CronScheduler;

/// Files watched, in load order; each name doubles as the install tag.
pub const CRONTAB_FILES: [&str; 2] = ["crontab", "crontab.local"];

/// Polls a crontab directory and reinstalls changed tables.
#[derive(Debug)]
pub struct CrontabWatcher {
    dir: PathBuf,
    interval: Duration,
    last_hash: Mutex<Option<String>>,
}

impl CrontabWatcher {
    /// Watch `dir`, checking every `interval`.
    pub fn new(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
            last_hash: Mutex::new(None),
        }
    }

    /// Parse one crontab file; a missing file is an empty table.
    pub async fn load_file(path: &Path) -> AppResult<Vec<CronEntry>> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|e| {
            AppError::with_source(ErrorKind::Validation, format!("Malformed crontab '{}'", path.display()), e)
        })
    }

    async fn content_hash(&self) -> AppResult<String> {
        let mut hasher = Sha256::new();
        for name in CRONTAB_FILES {
            match tokio::fs::read(self.dir.join(name)).await {
                Ok(raw) => hasher.update(&raw),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            hasher.update([0u8]);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Reinstall both tables when their content changed.
    ///
    /// Returns whether a reload was attempted. A malformed file is logged
    /// and its previous table stays installed.
    pub async fn reload(&self, cron: &CronScheduler) -> AppResult<bool> {
        let hash = self.content_hash().await?;
        let mut last = self.last_hash.lock().await;
        if last.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        for name in CRONTAB_FILES {
            let path = self.dir.join(name);
            let entries = match Self::load_file(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Crontab not reloaded");
                    continue;
                }
            };
            if let Err(e) = cron.schedule_cronjobs(name, entries).await {
                warn!(file = %path.display(), error = %e, "Crontab not installed");
            }
        }

        info!(dir = %self.dir.display(), "Crontab reloaded");
        *last = Some(hash);
        Ok(true)
    }

    /// Poll until `stop` flips to true.
    pub fn spawn(self: Arc<Self>, cron: Arc<CronScheduler>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reload(&cron).await {
                            Ok(true) => {}
                            Ok(false) => debug!("Crontab unchanged"),
                            Err(e) => warn!(error = %e, "Crontab check failed"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Crontab watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::CronTrigger;

    fn noop() -> CronTrigger {
        Arc::new(|_| Box::pin(async {}))
    }

    fn labels(entries: &[CronEntry]) -> Vec<String> {
        entries.iter().map(CronEntry::label).collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let entries = CrontabWatcher::load_file(&dir.path().join("crontab")).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_reload_installs_each_file_under_its_tag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("crontab"),
            r#"[{ "cron": "0 0 * * * *", "job": "reports.hourly" }]"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("crontab.local"),
            r#"[{ "cron": "0 0 3 * * *", "job": { "cleanup.tmp": { "days": 7 } }, "disabled": true }]"#,
        )
        .unwrap();

        let cron = CronScheduler::new(noop()).await.unwrap();
        let watcher = CrontabWatcher::new(dir.path(), Duration::from_secs(5));
        assert!(watcher.reload(&cron).await.unwrap());

        assert_eq!(labels(&cron.entries_tagged("crontab").await), vec!["reports.hourly"]);
        let local = cron.entries_tagged("crontab.local").await;
        assert_eq!(labels(&local), vec!["cleanup.tmp"]);
        assert!(local[0].disabled);

        // Unchanged content is not reparsed.
        assert!(!watcher.reload(&cron).await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_file_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crontab");
        std::fs::write(&path, r#"[{ "cron": "0 0 * * * *", "job": "reports.hourly" }]"#).unwrap();

        let cron = CronScheduler::new(noop()).await.unwrap();
        let watcher = CrontabWatcher::new(dir.path(), Duration::from_secs(5));
        watcher.reload(&cron).await.unwrap();

        std::fs::write(&path, r#"[{ "cron": "0 0 * * * *", "job": { "Bad-Key": {} } }]"#).unwrap();
        assert!(watcher.reload(&cron).await.unwrap());
        assert_eq!(labels(&cron.entries_tagged("crontab").await), vec!["reports.hourly"]);

        std::fs::write(&path, "[]").unwrap();
        assert!(watcher.reload(&cron).await.unwrap());
        assert!(cron.entries_tagged("crontab").await.is_empty());
    }
}
