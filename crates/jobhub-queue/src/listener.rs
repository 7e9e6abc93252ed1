//! Listener bookkeeping and poll scheduling shared by every driver.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use jobhub_core::result::AppResult;

use crate::channel::ChannelName;
use crate::message::Handler;
use crate::options::ClientOptions;

/// One active `listen` registration.
pub struct Listener {
    /// Client name, for logs.
    pub queue: String,
    /// Channel being consumed.
    pub channel: ChannelName,
    /// Options resolved for this listener.
    pub options: ClientOptions,
    /// Work-queue handler.
    pub handler: Handler,
    running: AtomicUsize,
    cancel: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("queue", &self.queue)
            .field("channel", &self.channel)
            .field("running", &self.running())
            .finish()
    }
}

impl Listener {
    /// Create a listener that is not polling yet.
    pub fn new(
        queue: impl Into<String>,
        channel: ChannelName,
        options: ClientOptions,
        handler: Handler,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        Arc::new(Self {
            queue: queue.into(),
            channel,
            options,
            handler,
            running: AtomicUsize::new(0),
            cancel,
            task: Mutex::new(None),
        })
    }

    /// Messages currently being handled.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Free execution slots: `count - running`.
    pub fn free_slots(&self) -> usize {
        self.options.count.saturating_sub(self.running())
    }

    /// Mark one message as running until the guard drops.
    pub fn track(self: &Arc<Self>) -> RunningGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunningGuard {
            listener: Arc::clone(self),
        }
    }

    /// Whether `stop` was called.
    pub fn is_stopped(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Stop polling after the current round. Messages already dispatched
    /// run to completion.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    /// Wait until no message is running or `max_wait` elapses.
    pub async fn drain(&self, max_wait: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + max_wait;
        while self.running() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Spawn the poll loop. `poll` runs one round and returns how many
    /// messages it dispatched.
    pub fn start<F, Fut>(self: &Arc<Self>, poll: F)
    where
        F: Fn(Arc<Listener>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<usize>> + Send + 'static,
    {
        let listener = Arc::clone(self);
        let mut cancel = self.cancel.subscribe();
        let handle = tokio::spawn(async move {
            debug!(queue = %listener.queue, channel = %listener.channel, "Poll loop started");
            loop {
                if *cancel.borrow() {
                    break;
                }
                let result = if listener.free_slots() == 0 {
                    trace!(queue = %listener.queue, "All listener slots busy");
                    Ok(0)
                } else {
                    poll(Arc::clone(&listener)).await
                };
                if let Err(e) = &result {
                    warn!(queue = %listener.queue, channel = %listener.channel, error = %e, "Poll failed");
                }
                let delay = next_delay(&result, &listener.options);
                tokio::select! {
                    _ = cancel.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            debug!(queue = %listener.queue, channel = %listener.channel, "Poll loop stopped");
        });

        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
    }
}

/// Decrements the running count on drop.
pub struct RunningGuard {
    listener: Arc<Listener>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.listener.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pause before the next poll: `interval` after a poll that dispatched
/// something, `retry_interval` after an empty or failed one.
pub fn next_delay(result: &AppResult<usize>, options: &ClientOptions) -> Duration {
    match result {
        Ok(n) if *n > 0 => options.interval,
        _ => options.retry_interval,
    }
}

/// How often a message in flight is kept alive: 80% of the shortest
/// deadline the backend may be holding it under.
pub fn keep_alive_period(deadline: Duration) -> Duration {
    deadline.mul_f64(0.8)
}

/// Periodic keep-alive for a message in flight. Stops when dropped.
pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    /// Run `tick` every `period`, starting one period from now.
    pub fn spawn<F, Fut>(period: Duration, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                tick().await;
            }
        });
        Self { handle }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
