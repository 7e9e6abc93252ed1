//! Fan-out plumbing: an in-process bus and subscription task bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::envelope::QueueEnvelope;
use crate::message::{Handler, QueueMessage};

/// Raw encoded envelopes received on one channel.
pub type EventStream = BoxStream<'static, String>;

/// Capacity of the in-process bus; slow subscribers skip lagged events.
const BUS_CAPACITY: usize = 1024;

/// In-process publish/subscribe bus.
#[derive(Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<(String, String)>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Send to every current subscriber of `channel`; returns the number of
    /// bus receivers.
    pub fn publish(&self, channel: &str, raw: String) -> usize {
        self.tx.send((channel.to_string(), raw)).unwrap_or(0)
    }

    /// Events published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> EventStream {
        let rx = self.tx.subscribe();
        let channel = channel.to_string();
        futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok((ch, raw)) if ch == channel => return Some((raw, (rx, channel))),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "Subscriber lagged behind the bus");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// Subscription tasks by channel.
#[derive(Debug, Default)]
pub struct Subscriptions {
    tasks: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
}

impl Subscriptions {
    /// Feed `stream` into `handler` until cancelled.
    pub fn spawn(&self, queue: &str, channel: &str, mut stream: EventStream, handler: Handler) {
        let queue = queue.to_string();
        let label = channel.to_string();
        let handle = tokio::spawn(async move {
            while let Some(raw) = stream.next().await {
                let envelope = match QueueEnvelope::decode(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(queue = %queue, channel = %label, error = %e, "Dropping malformed event");
                        continue;
                    }
                };
                let message = QueueMessage {
                    envelope,
                    queue: queue.clone(),
                    receipt: None,
                    attempt: 1,
                };
                if let Err(e) = handler(message).await {
                    debug!(queue = %queue, channel = %label, status = e.status, "Subscriber handler failed: {}", e.message);
                }
            }
            debug!(queue = %queue, channel = %label, "Subscription stream ended");
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.entry(channel.to_string()).or_default().push(handle);
        }
    }

    /// Abort every subscription on `channel`; returns how many were stopped.
    pub fn cancel(&self, channel: &str) -> usize {
        let handles = self
            .tasks
            .lock()
            .ok()
            .and_then(|mut tasks| tasks.remove(channel))
            .unwrap_or_default();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }

    /// Abort every subscription.
    pub fn cancel_all(&self) {
        let all: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut tasks| tasks.drain().flat_map(|(_, v)| v).collect())
            .unwrap_or_default();
        for handle in all {
            handle.abort();
        }
    }
}
