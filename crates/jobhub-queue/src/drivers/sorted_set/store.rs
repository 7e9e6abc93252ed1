//! Storage primitives of the two-set broker.
//!
//! Each queue key owns a *ready* set scored by the time a member becomes
//! runnable and a *processing* set scored by the time its visibility
//! timeout expires. Every operation that moves a member between sets is
//! atomic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::envelope::QueueEnvelope;
use crate::fanout::EventStream;

/// Sizes of both sets of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Members waiting to run (including deferred ones).
    pub ready: usize,
    /// Members received and not yet settled.
    pub processing: usize,
}

/// Backend of [`SortedSetClient`](super::SortedSetClient).
#[async_trait]
pub trait SortedSetStore: Send + Sync + fmt::Debug + 'static {
    /// Driver name.
    fn driver(&self) -> &'static str;

    /// Add `member` to the ready set.
    async fn push(&self, queue: &str, score: i64, member: &str) -> AppResult<()>;

    /// Atomically remove up to `count` ready members scored at or before
    /// `now`, lowest first. With `invisible_until` they move to the
    /// processing set under that score.
    async fn pop_due(
        &self,
        queue: &str,
        now: i64,
        count: usize,
        invisible_until: Option<i64>,
    ) -> AppResult<Vec<String>>;

    /// Re-score a processing member; false when it is no longer there.
    async fn touch(&self, queue: &str, member: &str, score: i64) -> AppResult<bool>;

    /// Remove a processing member.
    async fn complete(&self, queue: &str, member: &str) -> AppResult<bool>;

    /// Move a member back to the ready set under `score`.
    async fn requeue(&self, queue: &str, member: &str, score: i64) -> AppResult<()>;

    /// Move processing members whose score is at or before `now` back to
    /// the ready set, keeping their score. Returns how many moved.
    async fn recover(&self, queue: &str, now: i64) -> AppResult<usize>;

    /// Remove a member from both sets.
    async fn remove(&self, queue: &str, member: &str) -> AppResult<bool>;

    /// Sizes of both sets.
    async fn depth(&self, queue: &str) -> AppResult<QueueDepth>;

    /// Fan-out send.
    async fn publish(&self, channel: &str, raw: String) -> AppResult<()>;

    /// Fan-out receive.
    async fn subscribe(&self, channel: &str) -> AppResult<EventStream>;

    /// Release connections.
    async fn close(&self) -> AppResult<()> {
        Ok(())
    }
}

static MEMBER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Encode an envelope as a set member.
///
/// The member starts with a fixed-width creation time and sequence so that
/// members with equal scores sort in insertion order.
pub fn encode_member(envelope: &QueueEnvelope) -> AppResult<String> {
    let seq = MEMBER_SEQ.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    Ok(format!(
        "{:013}{seq:06}|{}",
        envelope.created_at.max(0),
        envelope.encode()?
    ))
}

/// Decode a set member back into its envelope.
pub fn decode_member(member: &str) -> AppResult<QueueEnvelope> {
    let (_, raw) = member
        .split_once('|')
        .ok_or_else(|| AppError::validation("Queue member has no envelope"))?;
    QueueEnvelope::decode(raw)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::options::QueueOptions;

    #[test]
    fn test_member_round_trip_and_order() {
        let env = QueueEnvelope::new("jobs", json!({ "job": "a.b" }), &QueueOptions::default());
        let first = encode_member(&env).unwrap();
        let second = encode_member(&env).unwrap();
        assert!(first < second);
        assert_eq!(decode_member(&first).unwrap(), env);
    }

    #[test]
    fn test_member_without_separator_is_rejected() {
        assert!(decode_member("garbage").is_err());
    }
}
