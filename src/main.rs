//! JobHub worker process
//!
//! Loads configuration, connects the queue clients and runs either as a
//! worker (consumes queues) or as the master (drives the crontab).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use jobhub_core::config::{AppConfig, ProcessRole};
use jobhub_core::error::AppError;
use jobhub_queue::{QueueOptions, QueueRegistry};
use jobhub_worker::{
    CrontabWatcher, JobRunner, LivenessMonitor, LivenessVerdict, Scheduler, TaskRegistry,
};

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    match run(config).await {
        Ok(None) => {}
        Ok(Some(verdict)) => {
            tracing::warn!("Worker stopped by liveness check: {:?}", verdict);
            std::process::exit(2);
        }
        Err(e) => {
            tracing::error!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Load `config/default.toml`, the `JOBHUB_ENV` overlay and `JOBHUB__*` variables
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("JOBHUB_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Built-in tasks available to every deployment
fn builtin_tasks() -> Result<TaskRegistry, AppError> {
    let mut tasks = TaskRegistry::new();
    tasks.register_fn("system.noop", |_| async { Ok(None) })?;
    tasks.register_fn("system.log", |args: Value| async move {
        tracing::info!(args = %args, "system.log");
        Ok(Some(json!({ "logged": true })))
    })?;
    tasks.register_fn("system.sleep", |args: Value| async move {
        let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(None)
    })?;
    Ok(tasks)
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Main worker run function; returns the liveness verdict that stopped it, if any
async fn run(config: AppConfig) -> Result<Option<LivenessVerdict>, AppError> {
    tracing::info!(
        "Starting JobHub v{} (role: {:?})",
        env!("CARGO_PKG_VERSION"),
        config.worker.role
    );

    // ── Step 1: Queue clients ────────────────────────────────────
    let queues = Arc::new(QueueRegistry::from_config(&config).await?);
    tracing::info!("Queue clients ready: {:?}", queues.names());

    // ── Step 2: Tasks + runner + scheduler ───────────────────────
    let tasks = builtin_tasks()?;
    tracing::info!("Registered tasks: {:?}", tasks.task_names());
    let runner = Arc::new(JobRunner::new(
        Arc::new(tasks),
        seconds(config.worker.task_timeout_seconds),
    ));
    let scheduler = Scheduler::new(Arc::clone(&queues), Arc::clone(&runner)).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (verdict_tx, mut verdict_rx) = watch::channel(None);

    // ── Step 3: Role-specific work ───────────────────────────────
    let mut background = Vec::new();
    match config.worker.role {
        ProcessRole::Worker => {
            let options = QueueOptions::default().with_count(config.worker.concurrency.max(1));
            scheduler.listen(&config.worker.queues, &options).await?;
            tracing::info!(
                "Listening on {:?} with concurrency {}",
                config.worker.queues,
                config.worker.concurrency
            );
        }
        ProcessRole::Master => {
            let watcher = Arc::new(CrontabWatcher::new(
                &config.worker.crontab_dir,
                Duration::from_secs(config.worker.crontab_watch_seconds.max(1)),
            ));
            watcher.reload(scheduler.cron()).await?;
            scheduler.cron().start().await?;
            background.push(watcher.spawn(Arc::clone(scheduler.cron()), shutdown_rx.clone()));
            tracing::info!("Crontab watcher started on '{}'", config.worker.crontab_dir);
        }
    }

    // ── Step 4: Liveness ─────────────────────────────────────────
    let liveness = LivenessMonitor::from_config(Arc::clone(&runner), &config.worker);
    let _idle_verdict = if liveness.is_enabled() {
        background.push(liveness.spawn(verdict_tx));
        None
    } else {
        Some(verdict_tx)
    };

    // ── Step 5: Wait for a stop reason ───────────────────────────
    let verdict = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
            None
        }
        _ = verdict_rx.changed() => verdict_rx.borrow().clone(),
    };

    let _ = shutdown_tx.send(true);
    scheduler
        .shutdown(Duration::from_secs(config.worker.shutdown_timeout_seconds))
        .await;
    for handle in background {
        handle.abort();
    }

    tracing::info!("JobHub worker stopped");
    Ok(verdict)
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
