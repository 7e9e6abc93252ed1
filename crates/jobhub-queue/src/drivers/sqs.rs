//! Amazon SQS driver.
//!
//! One client maps to one SQS queue. Deferral and retry delays are
//! expressed through the message visibility timeout, so a message never
//! leaves the queue until it completes, fails permanently or expires.
//!
//! A queue given by name has its URL resolved in the background, retried
//! with the client's reconnect backoff; operations wait for it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::channel::ChannelName;
use crate::client::{QueueClient, SubmitReceipt};
use crate::envelope::{QueueEnvelope, Window, now_ms};
use crate::fanout::{LocalBus, Subscriptions};
use crate::listener::{KeepAlive, Listener, keep_alive_period};
use crate::message::{Disposition, Handler, QueueMessage, log_outcome};
use crate::metrics::{QueueMetrics, QueueStats};
use crate::options::{ClientOptions, QueueOptions};
use crate::reconnect::{Backoff, Connection};

/// Longest visibility timeout SQS accepts.
pub const MAX_VISIBILITY: Duration = Duration::from_secs(12 * 60 * 60);
/// Longest per-message delay SQS accepts.
pub const MAX_DELAY_SECONDS: i32 = 900;
/// Longest long-poll wait SQS accepts.
pub const MAX_WAIT_SECONDS: u64 = 20;
/// Most messages one receive call returns.
pub const MAX_BATCH: usize = 10;
/// Visibility timeout of a queue created with default attributes.
pub const DEFAULT_QUEUE_VISIBILITY: Duration = Duration::from_secs(30);

/// Queue client over one SQS queue.
#[derive(Debug, Clone)]
pub struct SqsClient {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    sqs: Client,
    queue_url: Arc<Connection<String>>,
    fifo: bool,
    options: ClientOptions,
    listener: Mutex<Option<Arc<Listener>>>,
    bus: LocalBus,
    subscriptions: Subscriptions,
    metrics: QueueMetrics,
}

impl SqsClient {
    /// Client for `sqs://<queue-name>` or a full `https://` queue URL.
    ///
    /// Only a URL without a queue name fails here; resolving the queue URL
    /// is retried in the background until AWS answers.
    pub async fn connect(name: &str, url: &Url, options: ClientOptions) -> AppResult<Self> {
        let region = options.region.clone().or_else(|| region_from_host(url));
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &options.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;
        let sqs = Client::new(&sdk_config);

        let backoff = Backoff::from_options(&options);
        let (queue_url, fifo) = match url.scheme() {
            "https" | "http" => {
                let mut address = url.clone();
                address.set_query(None);
                let resolved = address.to_string();
                let fifo = resolved.ends_with(".fifo");
                (Connection::spawn(name, backoff, move || futures::future::ready(Ok(resolved.clone()))), fifo)
            }
            _ => {
                let queue_name = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .ok_or_else(|| AppError::configuration(format!("SQS URL for '{name}' has no queue name")))?;
                let fifo = queue_name.ends_with(".fifo");
                let client = sqs.clone();
                let resolve = move || resolve_queue_url(client.clone(), queue_name.clone());
                (Connection::spawn(name, backoff, resolve), fifo)
            }
        };
        info!(queue = %name, fifo, region = ?region, "SQS client created");

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                sqs,
                queue_url,
                fifo,
                options,
                listener: Mutex::new(None),
                bus: LocalBus::new(),
                subscriptions: Subscriptions::default(),
                metrics: QueueMetrics::new(),
            }),
        })
    }

    /// The queue URL, waiting for it to be resolved.
    pub async fn queue_url(&self) -> AppResult<String> {
        self.inner.queue_url.get().await
    }
}

async fn resolve_queue_url(sqs: Client, queue_name: String) -> AppResult<String> {
    let output = sqs
        .get_queue_url()
        .queue_name(&queue_name)
        .send()
        .await
        .map_err(|e| sqs_error("GetQueueUrl", e))?;
    let url = output
        .queue_url()
        .map(str::to_string)
        .ok_or_else(|| AppError::queue(format!("SQS queue '{queue_name}' has no URL")))?;
    info!(queue = %queue_name, url = %url, "Resolved SQS queue URL");
    Ok(url)
}

impl Inner {
    fn active_listener(&self) -> Option<Arc<Listener>> {
        self.listener.lock().ok().and_then(|l| l.clone())
    }

    async fn delete(&self, receipt: &str) -> AppResult<()> {
        let queue_url = self.queue_url.get().await?;
        self.sqs
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| sqs_error("DeleteMessage", e))?;
        Ok(())
    }

    async fn set_visibility(&self, receipt: &str, visibility: Duration) -> AppResult<()> {
        let queue_url = self.queue_url.get().await?;
        self.sqs
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(visibility_seconds(visibility))
            .send()
            .await
            .map_err(|e| sqs_error("ChangeMessageVisibility", e))?;
        Ok(())
    }

    async fn poll_listener(self: Arc<Self>, listener: Arc<Listener>) -> AppResult<usize> {
        let free = listener.free_slots();
        if free == 0 {
            return Ok(0);
        }
        let wait = listener.options.wait_timeout.as_secs().min(MAX_WAIT_SECONDS);
        let queue_url = self.queue_url.get().await?;
        let mut request = self
            .sqs
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(free.min(MAX_BATCH) as i32)
            .wait_time_seconds(wait as i32)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount);
        if let Some(visibility) = listener.options.visibility_timeout {
            request = request.visibility_timeout(visibility_seconds(visibility));
        }
        let output = request.send().await.map_err(|e| sqs_error("ReceiveMessage", e))?;

        let messages = output.messages();
        QueueMetrics::add(&self.metrics.received, messages.len() as u64);
        for message in messages {
            self.dispatch(&listener, message).await;
        }
        Ok(messages.len())
    }

    async fn dispatch(self: &Arc<Self>, listener: &Arc<Listener>, message: &Message) {
        let Some(receipt) = message.receipt_handle().map(str::to_string) else {
            warn!(queue = %self.name, "Received message without receipt handle");
            return;
        };

        let envelope = match QueueEnvelope::decode(message.body().unwrap_or_default()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.name, sqs_id = ?message.message_id(), error = %e, "Dropping malformed message");
                if let Err(e) = self.delete(&receipt).await {
                    error!(queue = %self.name, error = %e, "Failed to drop malformed message");
                }
                QueueMetrics::incr(&self.metrics.dropped);
                return;
            }
        };

        match envelope.window(now_ms()) {
            Window::Expired => {
                warn!(queue = %self.name, message_id = %envelope.id, "Message expired before it could run");
                if let Err(e) = self.delete(&receipt).await {
                    error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to delete expired message");
                }
                QueueMetrics::incr(&self.metrics.expired);
                return;
            }
            Window::Deferred(wait) => {
                let hidden = deferral_visibility(wait, listener.options.visibility_timeout);
                debug!(queue = %self.name, message_id = %envelope.id, hidden_secs = hidden.as_secs(), "Message not due yet");
                if let Err(e) = self.set_visibility(&receipt, hidden).await {
                    error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to defer message");
                }
                QueueMetrics::incr(&self.metrics.deferred);
                return;
            }
            Window::Due => {}
        }

        let attempt = message
            .attributes()
            .and_then(|a| a.get(&MessageSystemAttributeName::ApproximateReceiveCount))
            .and_then(|n| n.parse().ok())
            .unwrap_or(1);
        let message = QueueMessage {
            envelope,
            queue: self.name.clone(),
            receipt: Some(receipt),
            attempt,
        };

        let guard = listener.track();
        let inner = Arc::clone(self);
        let listener = Arc::clone(listener);
        tokio::spawn(async move {
            let _guard = guard;
            inner.run(listener, message).await;
        });
    }

    async fn run(self: Arc<Self>, listener: Arc<Listener>, message: QueueMessage) {
        let Some(receipt) = message.receipt.clone() else {
            return;
        };
        let envelope = message.envelope.clone();
        let received_with = listener.options.visibility_timeout;

        // The receive call hid the message for the listener's visibility;
        // a message-level one replaces it right away.
        let applied = match envelope.visibility() {
            Some(own) if Some(own) != received_with => match self.set_visibility(&receipt, own).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to apply message visibility");
                    false
                }
            },
            _ => true,
        };
        let visibility = envelope.visibility().or(received_with);
        let deadline = keep_alive_deadline(received_with, envelope.visibility(), applied);

        let keep_alive = visibility.zip(deadline).map(|(v, deadline)| {
            let extend = v.mul_f64(1.1).min(listener.options.max_timeout).min(MAX_VISIBILITY);
            let inner = Arc::clone(&self);
            let receipt = receipt.clone();
            KeepAlive::spawn(keep_alive_period(deadline), move || {
                let inner = Arc::clone(&inner);
                let receipt = receipt.clone();
                async move {
                    if let Err(e) = inner.set_visibility(&receipt, extend).await {
                        warn!(queue = %inner.name, error = %e, "Keep-alive failed");
                    }
                }
            })
        });

        if envelope.no_wait {
            let inner = Arc::clone(&self);
            let receipt = receipt.clone();
            let delay = envelope.no_wait_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = inner.delete(&receipt).await {
                    QueueMetrics::incr(&inner.metrics.ack_failures);
                    warn!(queue = %inner.name, error = %e, "Early acknowledgment failed");
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

        let settled = match disposition {
            Disposition::Complete | Disposition::Discard { .. } => self.delete(&receipt).await,
            Disposition::Retry { at, .. } => match at.delay(listener.options.retry_interval) {
                Some(delay) => self.set_visibility(&receipt, delay.min(MAX_VISIBILITY)).await,
                None => Ok(()),
            },
        };
        if let Err(e) = settled {
            error!(queue = %self.name, message_id = %envelope.id, error = %e, "Failed to settle message");
        }
    }
}

#[async_trait]
impl QueueClient for SqsClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn driver(&self) -> &'static str {
        "sqs"
    }

    async fn subscribe(&self, channel: &str, _options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let stream = self.inner.bus.subscribe(channel);
        self.inner.subscriptions.spawn(&self.inner.name, channel, stream, handler);
        debug!(queue = %self.inner.name, channel = %channel, "Subscribed (process-local)");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> AppResult<()> {
        self.inner.subscriptions.cancel(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value, options: &QueueOptions) -> AppResult<()> {
        let envelope = QueueEnvelope::new(channel, message.clone(), options);
        self.inner.bus.publish(channel, envelope.encode()?);
        QueueMetrics::incr(&self.inner.metrics.published);
        Ok(())
    }

    async fn listen(&self, options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let channel = ChannelName::resolve(options.channel.as_deref(), &self.inner.name)?;
        let resolved = self.inner.options.resolve(options);
        let listener = Listener::new(self.inner.name.clone(), channel, resolved, handler);
        {
            let mut slot = self
                .inner
                .listener
                .lock()
                .map_err(|_| AppError::internal("listener slot poisoned"))?;
            if slot.is_some() {
                return Err(AppError::validation(format!(
                    "Queue '{}' is already listening",
                    self.inner.name
                )));
            }
            *slot = Some(Arc::clone(&listener));
        }
        let inner = Arc::clone(&self.inner);
        listener.start(move |l| Arc::clone(&inner).poll_listener(l));
        info!(queue = %self.inner.name, count = listener.options.count, "Listening");
        Ok(())
    }

    async fn unlisten(&self, _options: &QueueOptions) -> AppResult<()> {
        let removed = self.inner.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = removed {
            listener.stop();
            info!(queue = %self.inner.name, "Stopped listening");
        }
        Ok(())
    }

    async fn submit(&self, job: &Value, options: &QueueOptions) -> AppResult<SubmitReceipt> {
        let key = ChannelName::resolve(options.channel.as_deref(), &self.inner.name)?.key();
        let envelope = QueueEnvelope::new(key.clone(), job.clone(), options);
        let queue_url = self.inner.queue_url.get().await?;
        let mut request = self
            .inner
            .sqs
            .send_message()
            .queue_url(queue_url)
            .message_body(envelope.encode()?);

        if self.inner.fifo {
            let group = envelope
                .group
                .clone()
                .or_else(|| self.inner.options.group.clone())
                .unwrap_or_else(|| "default".to_string());
            request = request
                .message_group_id(group)
                .message_deduplication_id(dedup_id(&envelope)?);
        } else if let Some(delay) = delay_seconds(envelope.start_time, now_ms()) {
            request = request.delay_seconds(delay);
        }

        let output = request.send().await.map_err(|e| sqs_error("SendMessage", e))?;
        QueueMetrics::incr(&self.inner.metrics.submitted);
        debug!(queue = %self.inner.name, message_id = %envelope.id, sqs_id = ?output.message_id(), "Submitted");
        Ok(SubmitReceipt {
            id: envelope.id,
            queue: self.inner.name.clone(),
            channel: key,
            backend_id: output.message_id().map(str::to_string),
            start_time: envelope.start_time,
        })
    }

    async fn drop_message(&self, message: &QueueMessage, _options: &QueueOptions) -> AppResult<()> {
        let receipt = message
            .receipt
            .as_deref()
            .ok_or_else(|| AppError::validation("Message has no receipt to drop"))?;
        self.inner.delete(receipt).await?;
        QueueMetrics::incr(&self.inner.metrics.dropped);
        Ok(())
    }

    async fn poll(&self, _options: &QueueOptions) -> AppResult<usize> {
        let listener = self
            .inner
            .active_listener()
            .ok_or_else(|| AppError::not_found(format!("Queue '{}' is not listening", self.inner.name)))?;
        Arc::clone(&self.inner).poll_listener(listener).await
    }

    async fn monitor(&self, _options: &QueueOptions) -> AppResult<()> {
        // SQS restores visibility on its own.
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        self.inner.metrics.snapshot(&self.inner.name, "sqs")
    }

    async fn shutdown(&self) -> AppResult<()> {
        if let Some(listener) = self.inner.listener.lock().ok().and_then(|mut l| l.take()) {
            listener.stop();
        }
        self.inner.subscriptions.cancel_all();
        self.inner.queue_url.close();
        info!(queue = %self.inner.name, "Queue client shut down");
        Ok(())
    }
}

fn sqs_error(op: &str, err: impl std::error::Error) -> AppError {
    AppError::queue(format!("SQS {op} failed: {}", DisplayErrorContext(err)))
}

/// Region embedded in `https://sqs.<region>.amazonaws.com/...`.
fn region_from_host(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let rest = host.strip_prefix("sqs.")?;
    let (region, _) = rest.split_once('.')?;
    Some(region.to_string())
}

/// Visibility timeout in whole seconds, rounded up and clamped to the
/// transport range.
pub fn visibility_seconds(visibility: Duration) -> i32 {
    let secs = visibility.as_millis().div_ceil(1000);
    secs.min(MAX_VISIBILITY.as_secs() as u128) as i32
}

/// `DelaySeconds` for a start time, when it lies in the future.
pub fn delay_seconds(start_time: Option<i64>, now: i64) -> Option<i32> {
    let remaining = start_time? - now;
    if remaining <= 0 {
        return None;
    }
    let secs = (remaining as u64).div_ceil(1000);
    Some(secs.min(MAX_DELAY_SECONDS as u64) as i32)
}

/// Deadline the keep-alive has to beat. When the message's own visibility
/// could not be applied on receipt, the receive-time deadline still holds
/// and the shorter of the two wins.
pub fn keep_alive_deadline(
    received_with: Option<Duration>,
    own: Option<Duration>,
    applied: bool,
) -> Option<Duration> {
    match (received_with, own) {
        (_, Some(own)) if applied => Some(own),
        (server, Some(own)) => Some(own.min(server.unwrap_or(DEFAULT_QUEUE_VISIBILITY))),
        (server, None) => server,
    }
}

/// How long a deferred message stays hidden: the time until it is due,
/// never less than the listener's visibility timeout.
pub fn deferral_visibility(wait: Duration, visibility: Option<Duration>) -> Duration {
    wait.max(visibility.unwrap_or_default()).min(MAX_VISIBILITY)
}

/// FIFO deduplication id: the caller's unique key, else a content hash.
pub fn dedup_id(envelope: &QueueEnvelope) -> AppResult<String> {
    if let Some(key) = &envelope.unique_key {
        return Ok(key.clone());
    }
    let body = serde_json::to_string(&envelope.payload)?;
    Ok(hex::encode(Sha256::digest(body.as_bytes())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_visibility_seconds_rounds_up_and_caps() {
        assert_eq!(visibility_seconds(Duration::from_millis(1)), 1);
        assert_eq!(visibility_seconds(Duration::from_millis(30_000)), 30);
        assert_eq!(visibility_seconds(Duration::ZERO), 0);
        assert_eq!(visibility_seconds(Duration::from_secs(100_000)), 43_200);
    }

    #[test]
    fn test_delay_seconds_only_for_future_start() {
        assert_eq!(delay_seconds(None, 1_000), None);
        assert_eq!(delay_seconds(Some(500), 1_000), None);
        assert_eq!(delay_seconds(Some(6_000), 1_000), Some(5));
        assert_eq!(delay_seconds(Some(3_600_000), 0), Some(900));
    }

    #[test]
    fn test_deferral_never_shortens_visibility() {
        let vis = Some(Duration::from_secs(30));
        assert_eq!(deferral_visibility(Duration::from_secs(5), vis), Duration::from_secs(30));
        assert_eq!(deferral_visibility(Duration::from_secs(90), vis), Duration::from_secs(90));
        assert_eq!(deferral_visibility(Duration::from_secs(90_000), None), MAX_VISIBILITY);
    }

    #[test]
    fn test_keep_alive_deadline_never_outlives_server_deadline() {
        let listener = Some(Duration::from_secs(30));
        let long = Some(Duration::from_secs(120));

        assert_eq!(keep_alive_deadline(listener, None, true), listener);
        assert_eq!(keep_alive_deadline(None, None, true), None);
        assert_eq!(keep_alive_deadline(listener, long, true), long);
        assert_eq!(keep_alive_deadline(listener, long, false), listener);
        assert_eq!(keep_alive_deadline(None, long, false), Some(DEFAULT_QUEUE_VISIBILITY));
        assert_eq!(
            keep_alive_deadline(listener, Some(Duration::from_secs(5)), false),
            Some(Duration::from_secs(5))
        );

        let period = keep_alive_period(keep_alive_deadline(listener, long, false).unwrap());
        assert!(period < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_named_queue_resolves_in_background() {
        let url = Url::parse("sqs://jobs.fifo?region=us-east-1&endpoint=http://127.0.0.1:1").unwrap();
        let options = ClientOptions {
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            ..ClientOptions::from_url(&url).unwrap()
        };
        let client = SqsClient::connect("jobs", &url, options).await.unwrap();
        assert!(client.inner.fifo);

        let pending = tokio::time::timeout(Duration::from_millis(100), client.queue_url()).await;
        assert!(pending.is_err(), "queue URL resolved without a reachable endpoint");
        client.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_url_is_ready_at_once() {
        let url = Url::parse("https://sqs.eu-west-1.amazonaws.com/123/jobs?count=2").unwrap();
        let client = SqsClient::connect("jobs", &url, ClientOptions::from_url(&url).unwrap()).await.unwrap();
        assert_eq!(client.queue_url().await.unwrap(), "https://sqs.eu-west-1.amazonaws.com/123/jobs");
        assert!(!client.inner.fifo);
    }

    #[test]
    fn test_dedup_id_prefers_unique_key() {
        let mut envelope = QueueEnvelope::new("jobs", json!({ "a.b": 1 }), &QueueOptions::default());
        let hashed = dedup_id(&envelope).unwrap();
        assert_eq!(hashed.len(), 64);

        let twin = QueueEnvelope::new("jobs", json!({ "a.b": 1 }), &QueueOptions::default());
        assert_eq!(dedup_id(&twin).unwrap(), hashed);

        envelope.unique_key = Some("order-42".into());
        assert_eq!(dedup_id(&envelope).unwrap(), "order-42");
    }

    #[test]
    fn test_region_from_queue_host() {
        let url = Url::parse("https://sqs.eu-west-1.amazonaws.com/123/jobs").unwrap();
        assert_eq!(region_from_host(&url).as_deref(), Some("eu-west-1"));
        let url = Url::parse("sqs://jobs").unwrap();
        assert_eq!(region_from_host(&url), None);
    }
}
