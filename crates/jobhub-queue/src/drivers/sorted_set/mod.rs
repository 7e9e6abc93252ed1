//! Sorted-set broker driver.
//!
//! `poll` atomically pops due members from the ready set. With a visibility
//! timeout they are shadowed in the processing set scored at
//! `now + visibilityTimeout`; a keep-alive refreshes that score every
//! `0.8 × visibilityTimeout` while the handler runs, and a monitor moves
//! expired shadows back to the ready set. An immediate retry goes back to
//! the ready set scored `retryInterval` ahead.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use self::memory::MemorySortedSetStore;
use self::store::{QueueDepth, SortedSetStore, decode_member, encode_member};
use crate::channel::ChannelName;
use crate::client::{QueueClient, SubmitReceipt};
use crate::envelope::{QueueEnvelope, Window, now_ms};
use crate::fanout::Subscriptions;
use crate::listener::{KeepAlive, Listener, keep_alive_period};
use crate::message::{Disposition, Handler, QueueMessage, RetryAt, log_outcome};
use crate::metrics::{QueueMetrics, QueueStats};
use crate::options::{ClientOptions, QueueOptions, millis};

/// Queue client over a [`SortedSetStore`].
#[derive(Debug, Clone)]
pub struct SortedSetClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    store: Arc<dyn SortedSetStore>,
    options: ClientOptions,
    listeners: Mutex<HashMap<String, Arc<Listener>>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
    subscriptions: Subscriptions,
    metrics: QueueMetrics,
}

impl SortedSetClient {
    /// Client over an existing store.
    pub fn new(name: impl Into<String>, store: Arc<dyn SortedSetStore>, options: ClientOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                store,
                options,
                listeners: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                subscriptions: Subscriptions::default(),
                metrics: QueueMetrics::new(),
            }),
        }
    }

    /// Client over a fresh in-process store.
    pub fn memory(name: impl Into<String>, options: ClientOptions) -> Self {
        Self::new(name, Arc::new(MemorySortedSetStore::new()), options)
    }

    /// Client over Redis. The server is reached in the background; only a
    /// malformed URL fails here.
    #[cfg(feature = "redis-backend")]
    pub fn redis(
        name: &str,
        url: &url::Url,
        options: ClientOptions,
        pool: &jobhub_core::config::PoolConfig,
    ) -> AppResult<Self> {
        let client = self::redis::RedisClient::connect(name, url, &options, pool)?;
        let store = self::redis::RedisSortedSetStore::new(client);
        Ok(Self::new(name, Arc::new(store), options))
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn SortedSetStore> {
        &self.inner.store
    }

    /// Sizes of the ready and processing sets of a channel.
    pub async fn depth(&self, channel: Option<&str>) -> AppResult<QueueDepth> {
        let channel = ChannelName::resolve(channel, &self.inner.name)?;
        self.inner.store.depth(&channel.key()).await
    }

    /// Run one recovery sweep now; returns how many members moved back.
    pub async fn recover(&self, channel: Option<&str>) -> AppResult<usize> {
        let channel = ChannelName::resolve(channel, &self.inner.name)?;
        self.inner.recover(&channel.key()).await
    }
}

impl Inner {
    fn channel(&self, options: &QueueOptions) -> AppResult<ChannelName> {
        ChannelName::resolve(options.channel.as_deref(), &self.name)
    }

    fn listener(&self, key: &str) -> Option<Arc<Listener>> {
        self.listeners.lock().ok().and_then(|l| l.get(key).cloned())
    }

    async fn recover(&self, key: &str) -> AppResult<usize> {
        let moved = self.store.recover(key, now_ms()).await?;
        if moved > 0 {
            info!(queue = %self.name, channel = %key, moved, "Recovered expired messages");
            QueueMetrics::add(&self.metrics.recovered, moved as u64);
        }
        Ok(moved)
    }

    async fn poll_listener(self: Arc<Self>, listener: Arc<Listener>) -> AppResult<usize> {
        let free = listener.free_slots();
        if free == 0 {
            return Ok(0);
        }
        let key = listener.channel.key();
        let now = now_ms();
        let invisible_until = listener.options.visibility_timeout.map(|v| now + millis(v));
        let members = self.store.pop_due(&key, now, free, invisible_until).await?;
        let fetched = members.len();
        QueueMetrics::add(&self.metrics.received, fetched as u64);
        for member in members {
            self.dispatch(&listener, member, now).await;
        }
        Ok(fetched)
    }

    async fn dispatch(self: &Arc<Self>, listener: &Arc<Listener>, member: String, now: i64) {
        let key = listener.channel.key();
        let shadowed = listener.options.visibility_timeout.is_some();

        let envelope = match decode_member(&member) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.name, channel = %key, error = %e, "Dropping malformed message");
                if let Err(e) = self.store.remove(&key, &member).await {
                    error!(queue = %self.name, error = %e, "Failed to drop malformed message");
                }
                QueueMetrics::incr(&self.metrics.dropped);
                return;
            }
        };

        match envelope.window(now) {
            Window::Expired => {
                warn!(queue = %self.name, message_id = %envelope.id, "Message expired before it could run");
                if let Err(e) = self.store.remove(&key, &member).await {
                    error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to discard expired message");
                }
                QueueMetrics::incr(&self.metrics.expired);
                return;
            }
            Window::Deferred(wait) => {
                debug!(queue = %self.name, message_id = %envelope.id, wait_ms = wait.as_millis() as u64, "Message not due yet");
                if let Err(e) = self.store.requeue(&key, &member, envelope.ready_score()).await {
                    error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to defer message");
                }
                QueueMetrics::incr(&self.metrics.deferred);
                return;
            }
            Window::Due => {}
        }

        // A message-level visibility timeout replaces the listener's one.
        let visibility = match (shadowed, envelope.visibility()) {
            (true, Some(own)) => match self.store.touch(&key, &member, now + millis(own)).await {
                Ok(_) => Some(own),
                Err(e) => {
                    warn!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to apply message visibility");
                    listener.options.visibility_timeout.map(|v| v.min(own))
                }
            },
            (true, None) => listener.options.visibility_timeout,
            (false, _) => None,
        };

        let guard = listener.track();
        let inner = Arc::clone(self);
        let listener = Arc::clone(listener);
        tokio::spawn(async move {
            let _guard = guard;
            inner.run(listener, envelope, member, visibility).await;
        });
    }

    async fn run(
        self: Arc<Self>,
        listener: Arc<Listener>,
        envelope: QueueEnvelope,
        member: String,
        visibility: Option<Duration>,
    ) {
        let key = listener.channel.key();
        let shadowed = visibility.is_some();
        let message = QueueMessage {
            envelope: envelope.clone(),
            queue: self.name.clone(),
            receipt: Some(member.clone()),
            attempt: 1,
        };

        let keep_alive = visibility.map(|v| {
            let store = Arc::clone(&self.store);
            let key = key.clone();
            let member = member.clone();
            let queue = self.name.clone();
            KeepAlive::spawn(keep_alive_period(v), move || {
                let store = Arc::clone(&store);
                let key = key.clone();
                let member = member.clone();
                let queue = queue.clone();
                async move {
                    if let Err(e) = store.touch(&key, &member, now_ms() + millis(v)).await {
                        warn!(queue = %queue, channel = %key, error = %e, "Keep-alive failed");
                    }
                }
            })
        });

        if envelope.no_wait && shadowed {
            let inner = Arc::clone(&self);
            let (key, member) = (key.clone(), member.clone());
            let delay = envelope.no_wait_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = inner.store.complete(&key, &member).await {
                    QueueMetrics::incr(&inner.metrics.ack_failures);
                    warn!(queue = %inner.name, channel = %key, error = %e, "Early acknowledgment failed");
                }
            });
        }

        let started = Instant::now();
        let delivery = (listener.handler)(message.clone()).await;
        drop(keep_alive);

        let disposition = if envelope.no_wait {
            Disposition::Complete
        } else {
            Disposition::of(&delivery, &envelope, &listener.options)
        };
        log_outcome(&self.name, &message, &delivery, &disposition);
        self.metrics.record_run(started.elapsed(), &disposition);

        if envelope.no_wait {
            return;
        }
        let retry_floor = listener.options.retry_interval;
        if let Err(e) = self.settle(&key, &member, disposition, shadowed, retry_floor).await {
            error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to settle message");
        }
    }

    async fn settle(
        &self,
        key: &str,
        member: &str,
        disposition: Disposition,
        shadowed: bool,
        retry_floor: Duration,
    ) -> AppResult<()> {
        let now = now_ms();
        match disposition {
            Disposition::Complete | Disposition::Discard { .. } => {
                if shadowed {
                    self.store.complete(key, member).await?;
                }
            }
            Disposition::Retry { at: RetryAt::Now, .. } => {
                self.store.requeue(key, member, now + millis(retry_floor)).await?;
            }
            Disposition::Retry { at: RetryAt::After(delay), .. } => {
                let at = now + millis(delay);
                if !shadowed || !self.store.touch(key, member, at).await? {
                    self.store.requeue(key, member, at).await?;
                }
            }
            Disposition::Retry { at: RetryAt::Unchanged, .. } => {
                if !shadowed {
                    self.store.requeue(key, member, now + millis(retry_floor)).await?;
                }
            }
        }
        Ok(())
    }

    fn start_monitor(self: &Arc<Self>, key: String, options: &ClientOptions) {
        let Ok(mut monitors) = self.monitors.lock() else {
            return;
        };
        if monitors.contains_key(&key) {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let period = options.monitor_interval;
        let threshold = options.threshold;
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut above = false;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = inner.recover(&task_key).await {
                    warn!(queue = %inner.name, channel = %task_key, error = %e, "Recovery sweep failed");
                }
                if threshold > 0 {
                    match inner.store.depth(&task_key).await {
                        Ok(depth) if depth.ready >= threshold => {
                            if !above {
                                warn!(queue = %inner.name, channel = %task_key, ready = depth.ready, threshold, "Queue depth crossed threshold");
                                QueueMetrics::incr(&inner.metrics.threshold_warnings);
                            }
                            above = true;
                        }
                        Ok(_) => above = false,
                        Err(e) => warn!(queue = %inner.name, channel = %task_key, error = %e, "Depth check failed"),
                    }
                }
            }
        });
        debug!(queue = %self.name, channel = %key, "Monitor started");
        monitors.insert(key, handle);
    }
}

#[async_trait]
impl QueueClient for SortedSetClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn driver(&self) -> &'static str {
        self.inner.store.driver()
    }

    async fn subscribe(&self, channel: &str, _options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let stream = self.inner.store.subscribe(channel).await?;
        self.inner.subscriptions.spawn(&self.inner.name, channel, stream, handler);
        info!(queue = %self.inner.name, channel = %channel, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> AppResult<()> {
        let stopped = self.inner.subscriptions.cancel(channel);
        debug!(queue = %self.inner.name, channel = %channel, stopped, "Unsubscribed");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value, options: &QueueOptions) -> AppResult<()> {
        let envelope = QueueEnvelope::new(channel, message.clone(), options);
        self.inner.store.publish(channel, envelope.encode()?).await?;
        QueueMetrics::incr(&self.inner.metrics.published);
        Ok(())
    }

    async fn listen(&self, options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let channel = self.inner.channel(options)?;
        let key = channel.key();
        let resolved = self.inner.options.resolve(options);
        let listener = Listener::new(self.inner.name.clone(), channel, resolved.clone(), handler);
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .map_err(|_| AppError::internal("listener table poisoned"))?;
            if listeners.contains_key(&key) {
                return Err(AppError::validation(format!(
                    "Queue '{}' is already listening on '{key}'",
                    self.inner.name
                )));
            }
            listeners.insert(key.clone(), Arc::clone(&listener));
        }

        let inner = Arc::clone(&self.inner);
        listener.start(move |l| Arc::clone(&inner).poll_listener(l));
        if resolved.visibility_timeout.is_some() {
            self.inner.start_monitor(key.clone(), &resolved);
        }
        info!(
            queue = %self.inner.name,
            channel = %key,
            count = resolved.count,
            visibility_ms = resolved.visibility_timeout.map(|v| v.as_millis() as u64),
            "Listening"
        );
        Ok(())
    }

    async fn unlisten(&self, options: &QueueOptions) -> AppResult<()> {
        let key = self.inner.channel(options)?.key();
        let removed = self.inner.listeners.lock().ok().and_then(|mut l| l.remove(&key));
        if let Some(listener) = removed {
            listener.stop();
            info!(queue = %self.inner.name, channel = %key, "Stopped listening");
        }
        Ok(())
    }

    async fn submit(&self, job: &Value, options: &QueueOptions) -> AppResult<SubmitReceipt> {
        let key = self.inner.channel(options)?.key();
        let envelope = QueueEnvelope::new(key.clone(), job.clone(), options);
        let member = encode_member(&envelope)?;
        self.inner.store.push(&key, envelope.ready_score(), &member).await?;
        QueueMetrics::incr(&self.inner.metrics.submitted);
        debug!(queue = %self.inner.name, channel = %key, message_id = %envelope.id, "Submitted");
        Ok(SubmitReceipt {
            id: envelope.id,
            queue: self.inner.name.clone(),
            channel: key,
            backend_id: None,
            start_time: envelope.start_time,
        })
    }

    async fn drop_message(&self, message: &QueueMessage, _options: &QueueOptions) -> AppResult<()> {
        let member = message
            .receipt
            .as_deref()
            .ok_or_else(|| AppError::validation("Message has no receipt to drop"))?;
        self.inner.store.remove(&message.envelope.channel, member).await?;
        QueueMetrics::incr(&self.inner.metrics.dropped);
        debug!(queue = %self.inner.name, message_id = %message.id(), "Dropped");
        Ok(())
    }

    async fn poll(&self, options: &QueueOptions) -> AppResult<usize> {
        let key = self.inner.channel(options)?.key();
        let listener = self
            .inner
            .listener(&key)
            .ok_or_else(|| AppError::not_found(format!("No listener on '{key}'")))?;
        Arc::clone(&self.inner).poll_listener(listener).await
    }

    async fn monitor(&self, options: &QueueOptions) -> AppResult<()> {
        let key = self.inner.channel(options)?.key();
        let resolved = self.inner.options.resolve(options);
        self.inner.start_monitor(key, &resolved);
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        self.inner.metrics.snapshot(&self.inner.name, self.inner.store.driver())
    }

    async fn shutdown(&self) -> AppResult<()> {
        let listeners: Vec<Arc<Listener>> = self
            .inner
            .listeners
            .lock()
            .map(|mut l| l.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for listener in &listeners {
            listener.stop();
        }
        let monitors: Vec<JoinHandle<()>> = self
            .inner
            .monitors
            .lock()
            .map(|mut m| m.drain().map(|(_, v)| v).collect())
            .unwrap_or_default();
        for monitor in monitors {
            monitor.abort();
        }
        self.inner.subscriptions.cancel_all();
        self.inner.store.close().await?;
        info!(queue = %self.inner.name, "Queue client shut down");
        Ok(())
    }
}
