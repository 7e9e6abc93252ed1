//! Queue channel naming: `name[#channel][@group]`.

use std::fmt;

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

/// Consumer group used when a name carries no `@group` suffix.
pub const DEFAULT_GROUP: &str = "workers";

/// A parsed queue channel name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    /// Logical queue name.
    pub queue: String,
    /// Sub-channel within the queue.
    pub channel: Option<String>,
    /// Consumer group.
    pub group: Option<String>,
}

impl ChannelName {
    /// Parse `name`, `name#channel`, `name@group` or `name#channel@group`.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let raw = raw.trim();
        let (rest, group) = match raw.rsplit_once('@') {
            Some((rest, group)) => (rest, non_empty(group)),
            None => (raw, None),
        };
        let (queue, channel) = match rest.split_once('#') {
            Some((queue, channel)) => (queue, non_empty(channel)),
            None => (rest, None),
        };
        if queue.is_empty() {
            return Err(AppError::validation(format!(
                "Queue channel '{raw}' has an empty queue name"
            )));
        }
        Ok(Self {
            queue: queue.to_string(),
            channel,
            group,
        })
    }

    /// Parse `raw` when given, else use `fallback` as the queue name.
    pub fn resolve(raw: Option<&str>, fallback: &str) -> AppResult<Self> {
        Self::parse(raw.unwrap_or(fallback))
    }

    /// Canonical key shared by producers and consumers: the group never
    /// takes part in it.
    pub fn key(&self) -> String {
        match &self.channel {
            Some(channel) => format!("{}#{channel}", self.queue),
            None => self.queue.clone(),
        }
    }

    /// Dot-separated subject for subject-based brokers.
    pub fn subject(&self) -> String {
        format!(
            "{}.{}",
            sanitize(&self.queue),
            sanitize(self.channel.as_deref().unwrap_or("default"))
        )
    }

    /// Consumer group, falling back to `fallback` then [`DEFAULT_GROUP`].
    pub fn group_or(&self, fallback: Option<&str>) -> String {
        self.group
            .as_deref()
            .or(fallback)
            .unwrap_or(DEFAULT_GROUP)
            .to_string()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())?;
        if let Some(group) = &self.group {
            write!(f, "@{group}")?;
        }
        Ok(())
    }
}

/// Replace everything outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
