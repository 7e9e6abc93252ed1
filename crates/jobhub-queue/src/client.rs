//! The transport-agnostic queue client contract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobhub_core::result::AppResult;

use crate::message::{Handler, QueueMessage};
use crate::metrics::QueueStats;
use crate::options::QueueOptions;

/// Result of a successful `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    /// Envelope id.
    pub id: String,
    /// Client that accepted the job.
    pub queue: String,
    /// Canonical channel key.
    pub channel: String,
    /// Backend message id, when the backend assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    /// Earliest run time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
}

/// A queue client bound to one backend.
///
/// Work-queue delivery (`listen`/`submit`) is at-least-once with
/// visibility-timeout redelivery. Fan-out (`subscribe`/`publish`) is
/// best-effort with no persistence or acknowledgment.
#[async_trait]
pub trait QueueClient: Send + Sync + fmt::Debug {
    /// Logical client name.
    fn name(&self) -> &str;

    /// Driver name (`memory`, `redis`, `sqs`, `nats`).
    fn driver(&self) -> &'static str;

    /// Receive every message published on `channel`.
    async fn subscribe(&self, channel: &str, options: &QueueOptions, handler: Handler) -> AppResult<()>;

    /// Stop every subscription on `channel`.
    async fn unsubscribe(&self, channel: &str) -> AppResult<()>;

    /// Best-effort fan-out send. Never waits for subscribers.
    async fn publish(&self, channel: &str, message: &Value, options: &QueueOptions) -> AppResult<()>;

    /// Consume the work queue selected by `options.channel`.
    async fn listen(&self, options: &QueueOptions, handler: Handler) -> AppResult<()>;

    /// Stop consuming the work queue selected by `options.channel`.
    async fn unlisten(&self, options: &QueueOptions) -> AppResult<()>;

    /// Enqueue a job for work-queue delivery.
    async fn submit(&self, job: &Value, options: &QueueOptions) -> AppResult<SubmitReceipt>;

    /// Delete a received message explicitly.
    async fn drop_message(&self, message: &QueueMessage, options: &QueueOptions) -> AppResult<()>;

    /// Run one poll round for an active listener; returns the number of
    /// messages dispatched.
    async fn poll(&self, options: &QueueOptions) -> AppResult<usize>;

    /// Start background maintenance for the selected queue.
    async fn monitor(&self, options: &QueueOptions) -> AppResult<()>;

    /// Metrics snapshot.
    fn stats(&self) -> QueueStats;

    /// Stop every listener, subscription and timer owned by the client.
    async fn shutdown(&self) -> AppResult<()>;
}
