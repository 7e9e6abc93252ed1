//! Client options parsed from the queue URL, and per-call overrides.
//!
//! Precedence is per-call [`QueueOptions`] over URL query parameters over
//! the defaults below. Durations in the URL are milliseconds.

use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::envelope::{RetryDelay, now_ms};

/// Default number of messages a listener runs concurrently.
pub const DEFAULT_COUNT: usize = 1;
/// Default pause after a poll that dispatched messages.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);
/// Default pause after an empty or failed poll.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);
/// Default period of the recovery monitor.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_millis(5000);
/// Default long-poll wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Default upper bound for keep-alive visibility extensions.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(12 * 3600);
/// Default key prefix for stores that share a keyspace.
pub const DEFAULT_PREFIX: &str = "jobhub:";
/// Default connection pool size for pooled transports.
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Default first delay between connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(100);
/// Default cap for the delay between connection attempts.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Options of one queue client, parsed from its URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Maximum messages a listener runs at once.
    pub count: usize,
    /// Pause after a poll that dispatched at least one message.
    pub interval: Duration,
    /// Pause after an empty poll or a poll error.
    pub retry_interval: Duration,
    /// How long a received message stays invisible to other consumers.
    pub visibility_timeout: Option<Duration>,
    /// Delay before a transiently failed message becomes visible again.
    pub retry_visibility_timeout: Option<RetryDelay>,
    /// Ready-set depth that triggers a warning (0 disables).
    pub threshold: usize,
    /// Cap for keep-alive visibility extensions.
    pub max_timeout: Duration,
    /// Period of the recovery monitor.
    pub monitor_interval: Duration,
    /// Long-poll wait per receive call.
    pub wait_timeout: Duration,
    /// Consumer group / message group.
    pub group: Option<String>,
    /// Key prefix.
    pub prefix: String,
    /// Cloud region.
    pub region: Option<String>,
    /// Endpoint override.
    pub endpoint: Option<String>,
    /// Connection pool size.
    pub pool_size: usize,
    /// First delay between connection attempts; doubles on every failure.
    pub reconnect_delay: Duration,
    /// Cap for the delay between connection attempts.
    pub max_reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            count: DEFAULT_COUNT,
            interval: DEFAULT_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            visibility_timeout: None,
            retry_visibility_timeout: None,
            threshold: 0,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            group: None,
            prefix: DEFAULT_PREFIX.to_string(),
            region: None,
            endpoint: None,
            pool_size: DEFAULT_POOL_SIZE,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

impl ClientOptions {
    /// Parse the recognized query parameters of a queue URL.
    ///
    /// Unknown parameters are ignored; malformed values of known ones are a
    /// configuration error.
    pub fn from_url(url: &Url) -> AppResult<Self> {
        let mut options = Self::default();
        for (key, value) in url.query_pairs() {
            let value = value.as_ref();
            match key.as_ref() {
                "count" => options.count = parse_number(&key, value)?.max(1),
                "interval" => options.interval = parse_millis(&key, value)?,
                "retryInterval" => options.retry_interval = parse_millis(&key, value)?,
                "visibilityTimeout" => {
                    options.visibility_timeout = non_zero(parse_millis(&key, value)?)
                }
                "retryVisibilityTimeout" => {
                    options.retry_visibility_timeout = Some(parse_retry_delay(value)?)
                }
                "threshold" => options.threshold = parse_number(&key, value)?,
                "maxTimeout" => options.max_timeout = parse_millis(&key, value)?,
                "monitorInterval" => options.monitor_interval = parse_millis(&key, value)?,
                "waitTimeout" => options.wait_timeout = parse_millis(&key, value)?,
                "group" => options.group = non_empty(value),
                "prefix" => options.prefix = value.to_string(),
                "region" => options.region = non_empty(value),
                "endpoint" => options.endpoint = non_empty(value),
                "poolSize" => options.pool_size = parse_number(&key, value)?.max(1),
                "reconnectDelay" => options.reconnect_delay = parse_millis(&key, value)?,
                "maxReconnectDelay" => options.max_reconnect_delay = parse_millis(&key, value)?,
                _ => {}
            }
        }
        Ok(options)
    }

    /// Apply per-call overrides on top of these options.
    pub fn resolve(&self, call: &QueueOptions) -> Self {
        let mut resolved = self.clone();
        if let Some(count) = call.count {
            resolved.count = count.max(1);
        }
        if let Some(interval) = call.interval {
            resolved.interval = interval;
        }
        if let Some(retry_interval) = call.retry_interval {
            resolved.retry_interval = retry_interval;
        }
        if let Some(visibility) = call.visibility_timeout {
            resolved.visibility_timeout = non_zero(visibility);
        }
        if let Some(retry) = &call.retry_visibility_timeout {
            resolved.retry_visibility_timeout = Some(retry.clone());
        }
        if let Some(group) = &call.group {
            resolved.group = Some(group.clone());
        }
        resolved
    }
}

/// Per-call options for submit, listen, poll and publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueOptions {
    /// Target channel, `name#channel@group`; the client name when unset.
    pub channel: Option<String>,
    /// Listener concurrency.
    pub count: Option<usize>,
    /// Poll interval after success.
    pub interval: Option<Duration>,
    /// Poll interval after an empty or failed poll.
    pub retry_interval: Option<Duration>,
    /// Visibility timeout for this message or listener.
    pub visibility_timeout: Option<Duration>,
    /// Retry delay for this message or listener.
    pub retry_visibility_timeout: Option<RetryDelay>,
    /// Leave visibility alone on transient failure.
    pub no_visibility: bool,
    /// Earliest run time, epoch milliseconds.
    pub start_time: Option<i64>,
    /// Expiry, epoch milliseconds.
    pub end_time: Option<i64>,
    /// Acknowledge on receipt instead of on completion.
    pub no_wait: bool,
    /// Delay before a `no_wait` acknowledgment.
    pub no_wait_timeout: Option<Duration>,
    /// Consumer or message group.
    pub group: Option<String>,
    /// Deduplication key.
    pub unique_key: Option<String>,
}

impl QueueOptions {
    /// Options targeting a channel.
    pub fn channel(channel: impl Into<String>) -> Self {
        Self {
            channel: Some(channel.into()),
            ..Self::default()
        }
    }

    /// Delay the message by `delay` from now.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.start_time = Some(now_ms() + millis(delay));
        self
    }

    /// Expire the message `ttl` from now.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.end_time = Some(now_ms() + millis(ttl));
        self
    }

    /// Set the visibility timeout.
    pub fn with_visibility(mut self, visibility: Duration) -> Self {
        self.visibility_timeout = Some(visibility);
        self
    }

    /// Set the listener concurrency.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// Duration as signed epoch-millisecond offset.
pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_number(key: &str, value: &str) -> AppResult<usize> {
    value.trim().parse::<usize>().map_err(|e| {
        AppError::configuration(format!("Invalid value '{value}' for queue option '{key}': {e}"))
    })
}

fn parse_millis(key: &str, value: &str) -> AppResult<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| {
            AppError::configuration(format!(
                "Invalid milliseconds '{value}' for queue option '{key}': {e}"
            ))
        })
}

/// `1000` for a single delay, or `500:1000,503:5000` for per-status delays.
fn parse_retry_delay(value: &str) -> AppResult<RetryDelay> {
    if !value.contains(':') {
        return parse_millis("retryVisibilityTimeout", value)
            .map(|d| RetryDelay::Fixed(d.as_millis() as u64));
    }
    let mut by_status = BTreeMap::new();
    for pair in value.split(',').filter(|p| !p.trim().is_empty()) {
        let (status, delay) = pair.split_once(':').ok_or_else(|| {
            AppError::configuration(format!("Invalid retryVisibilityTimeout entry '{pair}'"))
        })?;
        let status = status.trim().parse::<u16>().map_err(|e| {
            AppError::configuration(format!("Invalid status '{status}' in retryVisibilityTimeout: {e}"))
        })?;
        let delay = parse_millis("retryVisibilityTimeout", delay)?;
        by_status.insert(status, delay.as_millis() as u64);
    }
    Ok(RetryDelay::ByStatus(by_status))
}
