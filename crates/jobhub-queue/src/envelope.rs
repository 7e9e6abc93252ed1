//! The wire record stored by every backend.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::options::{QueueOptions, millis};

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Delay before a transiently failed message is visible again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RetryDelay {
    /// The same delay for every status, in milliseconds.
    Fixed(u64),
    /// Delay per handler status code, in milliseconds.
    ByStatus(BTreeMap<u16, u64>),
}

impl RetryDelay {
    /// Delay for a handler status, if one applies.
    pub fn for_status(&self, status: u16) -> Option<Duration> {
        match self {
            Self::Fixed(ms) => Some(Duration::from_millis(*ms)),
            Self::ByStatus(map) => map.get(&status).map(|ms| Duration::from_millis(*ms)),
        }
    }
}

/// Where a message stands relative to its run window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Runnable now.
    Due,
    /// Not runnable for this long.
    Deferred(Duration),
    /// `endTime` has passed; never run.
    Expired,
}

/// A queued message with its scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEnvelope {
    /// Unique message id (UUID v7).
    pub id: String,
    /// Canonical channel key (`name` or `name#channel`).
    pub channel: String,
    /// The job or event body.
    pub payload: Value,
    /// Submission time, epoch milliseconds.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_wait: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_wait_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_visibility_timeout: Option<RetryDelay>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub no_visibility: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl QueueEnvelope {
    /// Wrap a payload for `channel` with the scheduling fields of `options`.
    pub fn new(channel: impl Into<String>, payload: Value, options: &QueueOptions) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            channel: channel.into(),
            payload,
            created_at: now_ms(),
            start_time: options.start_time,
            end_time: options.end_time,
            no_wait: options.no_wait,
            no_wait_timeout: options.no_wait_timeout.map(|d| d.as_millis() as u64),
            visibility_timeout: options.visibility_timeout.map(|d| d.as_millis() as u64),
            retry_visibility_timeout: options.retry_visibility_timeout.clone(),
            no_visibility: options.no_visibility,
            group: options.group.clone(),
            unique_key: options.unique_key.clone(),
        }
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse the wire form.
    pub fn decode(raw: &str) -> AppResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AppError::validation(format!("Malformed queue envelope: {e}")))
    }

    /// Position of `now` relative to the run window. Expiry wins over
    /// deferral.
    pub fn window(&self, now: i64) -> Window {
        if self.end_time.is_some_and(|end| now >= end) {
            return Window::Expired;
        }
        match self.start_time {
            Some(start) if start > now => {
                Window::Deferred(Duration::from_millis((start - now) as u64))
            }
            _ => Window::Due,
        }
    }

    /// Score of this message in a time-ordered ready set.
    pub fn ready_score(&self) -> i64 {
        self.start_time.unwrap_or(self.created_at)
    }

    /// Message-level visibility timeout.
    pub fn visibility(&self) -> Option<Duration> {
        self.visibility_timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Message-level delay before a `no_wait` acknowledgment.
    pub fn no_wait_delay(&self) -> Duration {
        Duration::from_millis(self.no_wait_timeout.unwrap_or(0))
    }

    /// Shift the start time so the message becomes due after `delay`.
    pub fn defer_by(&mut self, delay: Duration, now: i64) {
        self.start_time = Some(now + millis(delay));
    }
}
