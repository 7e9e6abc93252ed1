//! NATS JetStream driver.
//!
//! Jobs live in a work stream named after the client; each channel is
//! consumed through a durable pull consumer shared by its group, so
//! competing workers split the backlog. Deferral and retry delays become
//! delayed NAKs.
//!
//! The NATS client connects and reconnects in the background with the
//! client's backoff, buffering publishes meanwhile; the work stream is
//! created once the server answers.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_nats::jetstream::consumer::{AckPolicy, PullConsumer, pull};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::channel::{ChannelName, sanitize};
use crate::client::{QueueClient, SubmitReceipt};
use crate::envelope::{QueueEnvelope, Window, now_ms};
use crate::fanout::Subscriptions;
use crate::listener::{KeepAlive, Listener, keep_alive_period};
use crate::message::{Disposition, Handler, QueueMessage, log_outcome};
use crate::metrics::{QueueMetrics, QueueStats};
use crate::options::{ClientOptions, QueueOptions};
use crate::reconnect::{Backoff, Connection};

/// Ack deadline used when no visibility timeout is configured.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Queue client over a JetStream work stream.
#[derive(Debug, Clone)]
pub struct JetStreamClient {
    inner: Arc<Inner>,
}

/// A channel's consumer slot. `Starting` holds the key while the durable
/// consumer is being created.
#[derive(Debug, Clone)]
enum ListenerSlot {
    Starting,
    Active(Arc<Listener>, PullConsumer),
}

#[derive(Debug)]
struct Inner {
    name: String,
    stream: String,
    nats: async_nats::Client,
    js: jetstream::Context,
    ready: Arc<Connection<()>>,
    options: ClientOptions,
    listeners: Mutex<HashMap<String, ListenerSlot>>,
    subscriptions: Subscriptions,
    metrics: QueueMetrics,
}

impl JetStreamClient {
    /// Client for a `nats://` URL.
    ///
    /// Only a malformed address fails here. The connection and the work
    /// stream are established in the background; jobs submitted before
    /// then wait for them.
    pub async fn connect(name: &str, url: &Url, options: ClientOptions) -> AppResult<Self> {
        let mut address = url.clone();
        address.set_query(None);
        let backoff = Backoff::from_options(&options);
        let nats = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .reconnect_delay_callback(move |attempts| backoff.delay(attempts as u32))
            .connect(address.as_str())
            .await
            .map_err(|e| AppError::configuration(format!("Invalid NATS address for '{name}': {e}")))?;
        let js = jetstream::new(nats.clone());

        let stream = sanitize(name);
        let ready = {
            let (js, stream) = (js.clone(), stream.clone());
            Connection::spawn(name, backoff, move || ensure_stream(js.clone(), stream.clone()))
        };
        info!(queue = %name, stream = %stream, "NATS JetStream client created");

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                stream,
                nats,
                js,
                ready,
                options,
                listeners: Mutex::new(HashMap::new()),
                subscriptions: Subscriptions::default(),
                metrics: QueueMetrics::new(),
            }),
        })
    }
}

async fn ensure_stream(js: jetstream::Context, stream: String) -> AppResult<()> {
    js.get_or_create_stream(jetstream::stream::Config {
        name: stream.clone(),
        subjects: vec![format!("{stream}.jobs.>")],
        ..Default::default()
    })
    .await
    .map_err(|e| AppError::queue(format!("Failed to create stream '{stream}': {e}")))?;
    info!(stream = %stream, "JetStream work stream ready");
    Ok(())
}

impl Inner {
    fn channel(&self, options: &QueueOptions) -> AppResult<ChannelName> {
        ChannelName::resolve(options.channel.as_deref(), &self.name)
    }

    /// Durable pull consumer for a channel, created on first use.
    async fn consumer(&self, channel: &ChannelName, options: &ClientOptions) -> AppResult<(PullConsumer, String)> {
        self.ready.get().await?;
        let durable = durable_name(channel, options.group.as_deref());
        let stream = self
            .js
            .get_stream(&self.stream)
            .await
            .map_err(|e| AppError::queue(format!("JetStream stream lookup failed: {e}")))?;
        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                &durable,
                pull::Config {
                    durable_name: Some(durable.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: consumer_ack_wait(options),
                    filter_subject: jobs_subject(&self.stream, channel),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AppError::queue(format!("JetStream consumer '{durable}' failed: {e}")))?;
        Ok((consumer, durable))
    }

    fn release_slot(&self, key: &str) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if matches!(listeners.get(key), Some(ListenerSlot::Starting)) {
                listeners.remove(key);
            }
        }
    }

    /// Send a raw acknowledgment token to a message's reply subject.
    async fn signal(&self, reply: &str, token: &'static [u8]) -> AppResult<()> {
        self.nats
            .publish(reply.to_string(), Bytes::from_static(token))
            .await
            .map_err(|e| AppError::queue(format!("NATS acknowledgment failed: {e}")))
    }

    async fn poll_listener(self: Arc<Self>, listener: Arc<Listener>, consumer: PullConsumer) -> AppResult<usize> {
        let free = listener.free_slots();
        if free == 0 {
            return Ok(0);
        }
        let mut batch = consumer
            .fetch()
            .max_messages(free)
            .messages()
            .await
            .map_err(|e| AppError::queue(format!("JetStream fetch failed: {e}")))?;

        let mut fetched = 0;
        while let Some(item) = batch.next().await {
            match item {
                Ok(message) => {
                    fetched += 1;
                    QueueMetrics::incr(&self.metrics.received);
                    self.dispatch(&listener, message).await;
                }
                Err(e) => warn!(queue = %self.name, error = %e, "JetStream batch error"),
            }
        }
        Ok(fetched)
    }

    async fn dispatch(self: &Arc<Self>, listener: &Arc<Listener>, message: jetstream::Message) {
        let envelope = match std::str::from_utf8(&message.payload)
            .map_err(|e| AppError::validation(format!("Message is not UTF-8: {e}")))
            .and_then(QueueEnvelope::decode)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.name, error = %e, "Dropping malformed message");
                self.settle(&message, AckKind::Term, "term").await;
                QueueMetrics::incr(&self.metrics.dropped);
                return;
            }
        };

        match envelope.window(now_ms()) {
            Window::Expired => {
                warn!(queue = %self.name, message_id = %envelope.id, "Message expired before it could run");
                self.settle(&message, AckKind::Term, "term").await;
                QueueMetrics::incr(&self.metrics.expired);
                return;
            }
            Window::Deferred(wait) => {
                debug!(queue = %self.name, message_id = %envelope.id, wait_ms = wait.as_millis() as u64, "Message not due yet");
                self.settle(&message, AckKind::Nak(Some(wait)), "nak").await;
                QueueMetrics::incr(&self.metrics.deferred);
                return;
            }
            Window::Due => {}
        }

        let guard = listener.track();
        let inner = Arc::clone(self);
        let listener = Arc::clone(listener);
        tokio::spawn(async move {
            let _guard = guard;
            inner.run(listener, envelope, message).await;
        });
    }

    async fn run(self: Arc<Self>, listener: Arc<Listener>, envelope: QueueEnvelope, raw: jetstream::Message) {
        let reply = raw.reply.as_ref().map(|s| s.to_string());
        let attempt = raw.info().map(|i| i.delivered.max(1) as u32).unwrap_or(1);
        let message = QueueMessage {
            envelope: envelope.clone(),
            queue: self.name.clone(),
            receipt: reply.clone(),
            attempt,
        };

        let deadline = keep_alive_deadline(&listener.options, &envelope);
        let keep_alive = reply.clone().map(|reply| {
            let inner = Arc::clone(&self);
            KeepAlive::spawn(keep_alive_period(deadline), move || {
                let inner = Arc::clone(&inner);
                let reply = reply.clone();
                async move {
                    if let Err(e) = inner.signal(&reply, b"+WPI").await {
                        warn!(queue = %inner.name, error = %e, "Keep-alive failed");
                    }
                }
            })
        });

        if envelope.no_wait {
            if let Some(reply) = reply.clone() {
                let inner = Arc::clone(&self);
                let delay = envelope.no_wait_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = inner.signal(&reply, b"+ACK").await {
                        QueueMetrics::incr(&inner.metrics.ack_failures);
                        warn!(queue = %inner.name, error = %e, "Early acknowledgment failed");
                    }
                });
            }
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

        match ack_kind(&disposition, listener.options.retry_interval) {
            Some(kind) => self.settle(&raw, kind, "settle").await,
            None => debug!(queue = %self.name, message_id = %envelope.id, "Leaving message to its ack deadline"),
        }
    }

    async fn settle(&self, message: &jetstream::Message, kind: AckKind, op: &str) {
        if let Err(e) = message.ack_with(kind).await {
            error!(queue = %self.name, op, error = %e, "JetStream acknowledgment failed");
        }
    }
}

/// Acknowledgment for a disposition; `None` leaves the message to
/// redeliver after its ack deadline. An immediate retry is delayed by
/// `retry_floor`.
pub fn ack_kind(disposition: &Disposition, retry_floor: Duration) -> Option<AckKind> {
    match disposition {
        Disposition::Complete => Some(AckKind::Ack),
        Disposition::Discard { .. } => Some(AckKind::Term),
        Disposition::Retry { at, .. } => at.delay(retry_floor).map(|d| AckKind::Nak(Some(d))),
    }
}

/// Ack deadline the durable consumer is created with: the listener's
/// visibility timeout, else 30 seconds.
pub fn consumer_ack_wait(options: &ClientOptions) -> Duration {
    options.visibility_timeout.unwrap_or(DEFAULT_ACK_WAIT)
}

/// Ack deadline: the message's own visibility timeout, else the
/// listener's, else 30 seconds.
pub fn ack_wait(options: &ClientOptions, envelope: &QueueEnvelope) -> Duration {
    envelope.visibility().unwrap_or_else(|| consumer_ack_wait(options))
}

/// Deadline the keep-alive has to beat. Progress signals restart the
/// consumer's ack timer, so a longer message visibility cannot stretch it.
pub fn keep_alive_deadline(options: &ClientOptions, envelope: &QueueEnvelope) -> Duration {
    ack_wait(options, envelope).min(consumer_ack_wait(options))
}

/// Subject a channel's jobs are published on.
pub fn jobs_subject(stream: &str, channel: &ChannelName) -> String {
    format!("{stream}.jobs.{}", sanitize(&channel.key()))
}

/// Subject a fan-out channel is published on.
pub fn events_subject(stream: &str, channel: &str) -> String {
    format!("{stream}.events.{}", sanitize(channel))
}

/// Durable consumer name: the group, suffixed by the sub-channel when
/// there is one so that each channel keeps its own cursor.
pub fn durable_name(channel: &ChannelName, fallback_group: Option<&str>) -> String {
    let group = sanitize(&channel.group_or(fallback_group));
    match &channel.channel {
        Some(sub) => format!("{group}-{}", sanitize(sub)),
        None => group,
    }
}

#[async_trait]
impl QueueClient for JetStreamClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn driver(&self) -> &'static str {
        "nats"
    }

    async fn subscribe(&self, channel: &str, _options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let subject = events_subject(&self.inner.stream, channel);
        let subscriber = self
            .inner
            .nats
            .subscribe(subject.clone())
            .await
            .map_err(|e| AppError::queue(format!("NATS subscribe to '{subject}' failed: {e}")))?;
        let stream = subscriber
            .filter_map(|m| futures::future::ready(String::from_utf8(m.payload.to_vec()).ok()))
            .boxed();
        self.inner.subscriptions.spawn(&self.inner.name, channel, stream, handler);
        info!(queue = %self.inner.name, subject = %subject, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> AppResult<()> {
        self.inner.subscriptions.cancel(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &Value, options: &QueueOptions) -> AppResult<()> {
        let envelope = QueueEnvelope::new(channel, message.clone(), options);
        let subject = events_subject(&self.inner.stream, channel);
        self.inner
            .nats
            .publish(subject, Bytes::from(envelope.encode()?))
            .await
            .map_err(|e| AppError::queue(format!("NATS publish failed: {e}")))?;
        QueueMetrics::incr(&self.inner.metrics.published);
        Ok(())
    }

    async fn listen(&self, options: &QueueOptions, handler: Handler) -> AppResult<()> {
        let channel = self.inner.channel(options)?;
        let key = channel.key();
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .map_err(|_| AppError::internal("listener table poisoned"))?;
            match listeners.entry(key.clone()) {
                Entry::Occupied(_) => {
                    return Err(AppError::validation(format!(
                        "Queue '{}' is already listening on '{key}'",
                        self.inner.name
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(ListenerSlot::Starting);
                }
            }
        }

        let resolved = self.inner.options.resolve(options);
        let (consumer, durable) = match self.inner.consumer(&channel, &resolved).await {
            Ok(created) => created,
            Err(e) => {
                self.inner.release_slot(&key);
                return Err(e);
            }
        };

        let listener = Listener::new(self.inner.name.clone(), channel, resolved, handler);
        {
            let mut listeners = self
                .inner
                .listeners
                .lock()
                .map_err(|_| AppError::internal("listener table poisoned"))?;
            match listeners.get_mut(&key) {
                Some(slot @ ListenerSlot::Starting) => {
                    *slot = ListenerSlot::Active(Arc::clone(&listener), consumer.clone());
                }
                _ => {
                    debug!(queue = %self.inner.name, channel = %key, "Listen cancelled while starting");
                    return Ok(());
                }
            }
        }
        let inner = Arc::clone(&self.inner);
        listener.start(move |l| Arc::clone(&inner).poll_listener(l, consumer.clone()));
        info!(queue = %self.inner.name, channel = %key, durable = %durable, "Listening");
        Ok(())
    }

    async fn unlisten(&self, options: &QueueOptions) -> AppResult<()> {
        let key = self.inner.channel(options)?.key();
        let removed = self.inner.listeners.lock().ok().and_then(|mut l| l.remove(&key));
        if let Some(ListenerSlot::Active(listener, _)) = removed {
            listener.stop();
            info!(queue = %self.inner.name, channel = %key, "Stopped listening");
        }
        Ok(())
    }

    async fn submit(&self, job: &Value, options: &QueueOptions) -> AppResult<SubmitReceipt> {
        let channel = self.inner.channel(options)?;
        let key = channel.key();
        let envelope = QueueEnvelope::new(key.clone(), job.clone(), options);
        let subject = jobs_subject(&self.inner.stream, &channel);
        self.inner.ready.get().await?;
        let payload = Bytes::from(envelope.encode()?);

        let pending = match &envelope.unique_key {
            Some(unique) => {
                let mut headers = async_nats::HeaderMap::new();
                headers.insert("Nats-Msg-Id", unique.as_str());
                self.inner.js.publish_with_headers(subject, headers, payload).await
            }
            None => self.inner.js.publish(subject, payload).await,
        }
        .map_err(|e| AppError::queue(format!("JetStream publish failed: {e}")))?;
        let ack = pending
            .await
            .map_err(|e| AppError::queue(format!("JetStream publish was not acknowledged: {e}")))?;

        QueueMetrics::incr(&self.inner.metrics.submitted);
        debug!(queue = %self.inner.name, message_id = %envelope.id, sequence = ack.sequence, "Submitted");
        Ok(SubmitReceipt {
            id: envelope.id,
            queue: self.inner.name.clone(),
            channel: key,
            backend_id: Some(ack.sequence.to_string()),
            start_time: envelope.start_time,
        })
    }

    async fn drop_message(&self, message: &QueueMessage, _options: &QueueOptions) -> AppResult<()> {
        let reply = message
            .receipt
            .as_deref()
            .ok_or_else(|| AppError::validation("Message has no receipt to drop"))?;
        self.inner.signal(reply, b"+TERM").await?;
        QueueMetrics::incr(&self.inner.metrics.dropped);
        Ok(())
    }

    async fn poll(&self, options: &QueueOptions) -> AppResult<usize> {
        let key = self.inner.channel(options)?.key();
        let active = self.inner.listeners.lock().ok().and_then(|l| l.get(&key).cloned());
        let Some(ListenerSlot::Active(listener, consumer)) = active else {
            return Err(AppError::not_found(format!("No listener on '{key}'")));
        };
        Arc::clone(&self.inner).poll_listener(listener, consumer).await
    }

    async fn monitor(&self, _options: &QueueOptions) -> AppResult<()> {
        // Ack deadlines are tracked by the server.
        Ok(())
    }

    fn stats(&self) -> QueueStats {
        self.inner.metrics.snapshot(&self.inner.name, "nats")
    }

    async fn shutdown(&self) -> AppResult<()> {
        let listeners: Vec<Arc<Listener>> = self
            .inner
            .listeners
            .lock()
            .map(|mut l| {
                l.drain()
                    .filter_map(|(_, slot)| match slot {
                        ListenerSlot::Active(listener, _) => Some(listener),
                        ListenerSlot::Starting => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for listener in listeners {
            listener.stop();
        }
        self.inner.subscriptions.cancel_all();
        self.inner.ready.close();
        if self.inner.nats.connection_state() == async_nats::connection::State::Connected {
            if let Err(e) = self.inner.nats.flush().await {
                warn!(queue = %self.inner.name, error = %e, "NATS flush on shutdown failed");
            }
        }
        info!(queue = %self.inner.name, "Queue client shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::RetryAt;

    #[test]
    fn test_subjects_and_durable_names() {
        let plain = ChannelName::parse("jobs").unwrap();
        assert_eq!(jobs_subject("jobs", &plain), "jobs.jobs.jobs");
        assert_eq!(durable_name(&plain, None), "workers");

        let grouped = ChannelName::parse("jobs#urgent.v2@billing").unwrap();
        assert_eq!(jobs_subject("jobs", &grouped), "jobs.jobs.jobs_urgent_v2");
        assert_eq!(durable_name(&grouped, Some("ignored")), "billing-urgent_v2");

        assert_eq!(events_subject("jobs", "alerts.high"), "jobs.events.alerts_high");
    }

    #[test]
    fn test_ack_kind_follows_disposition() {
        let floor = Duration::from_millis(500);
        assert!(matches!(ack_kind(&Disposition::Complete, floor), Some(AckKind::Ack)));
        assert!(matches!(ack_kind(&Disposition::Discard { status: 400 }, floor), Some(AckKind::Term)));
        assert!(matches!(
            ack_kind(&Disposition::Retry { status: 500, at: RetryAt::Now }, floor),
            Some(AckKind::Nak(Some(d))) if d == floor
        ));
        assert!(matches!(
            ack_kind(&Disposition::Retry { status: 500, at: RetryAt::After(Duration::from_secs(2)) }, floor),
            Some(AckKind::Nak(Some(d))) if d == Duration::from_secs(2)
        ));
        assert!(ack_kind(&Disposition::Retry { status: 600, at: RetryAt::Unchanged }, floor).is_none());
    }

    #[test]
    fn test_keep_alive_beats_consumer_ack_wait() {
        let options = ClientOptions {
            visibility_timeout: Some(Duration::from_secs(10)),
            ..ClientOptions::default()
        };
        let mut envelope = QueueEnvelope::new("jobs", json!("a.b"), &QueueOptions::default());
        assert_eq!(keep_alive_deadline(&options, &envelope), Duration::from_secs(10));

        envelope.visibility_timeout = Some(120_000);
        assert_eq!(ack_wait(&options, &envelope), Duration::from_secs(120));
        assert_eq!(keep_alive_deadline(&options, &envelope), Duration::from_secs(10));
        assert_eq!(keep_alive_period(keep_alive_deadline(&options, &envelope)), Duration::from_secs(8));

        envelope.visibility_timeout = Some(2_000);
        assert_eq!(keep_alive_deadline(&options, &envelope), Duration::from_secs(2));
        assert_eq!(keep_alive_deadline(&ClientOptions::default(), &envelope), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_unreachable_server_does_not_fail_connect() {
        let url = Url::parse("nats://127.0.0.1:1?reconnectDelay=10&maxReconnectDelay=50").unwrap();
        let client = JetStreamClient::connect("jobs", &url, ClientOptions::from_url(&url).unwrap())
            .await
            .unwrap();

        let payload = json!("jobs.run");
        let opts = QueueOptions::default();
        let submit = client.submit(&payload, &opts);
        assert!(tokio::time::timeout(Duration::from_millis(200), submit).await.is_err());
        assert!(client.poll(&QueueOptions::default()).await.unwrap_err().is(jobhub_core::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_second_listen_on_a_starting_channel_is_rejected() {
        let url = Url::parse("nats://127.0.0.1:1?reconnectDelay=10&maxReconnectDelay=50").unwrap();
        let client = JetStreamClient::connect("jobs", &url, ClientOptions::from_url(&url).unwrap())
            .await
            .unwrap();
        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .listen(&QueueOptions::default(), crate::message::handler_fn(|_| async { Ok(()) }))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client
            .listen(&QueueOptions::default(), crate::message::handler_fn(|_| async { Ok(()) }))
            .await
            .unwrap_err();
        assert!(err.is(jobhub_core::ErrorKind::Validation));

        client.shutdown().await.ok();
        assert!(first.await.unwrap().is_err());
    }

    #[test]
    fn test_ack_wait_precedence() {
        let options = ClientOptions {
            visibility_timeout: Some(Duration::from_secs(10)),
            ..ClientOptions::default()
        };
        let mut envelope = QueueEnvelope::new("jobs", json!("a.b"), &QueueOptions::default());
        assert_eq!(ack_wait(&options, &envelope), Duration::from_secs(10));
        assert_eq!(ack_wait(&ClientOptions::default(), &envelope), DEFAULT_ACK_WAIT);
        envelope.visibility_timeout = Some(2_000);
        assert_eq!(ack_wait(&options, &envelope), Duration::from_secs(2));
    }
}
