//! Cron table entries.

use serde::{Deserialize, Deserializer, Serialize};

use super::spec::JobSpec;

/// One recurring job in a cron table.
///
/// `tag` (serialized as `type`) groups entries that are replaced together:
/// installing a new list under a tag discards every entry previously
/// installed under the same tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntry {
    /// Six-field cron expression, seconds first.
    pub cron: String,
    /// The job to run on every tick.
    pub job: JobSpec,
    /// Disabled entries stay in the table but are never triggered.
    #[serde(default)]
    pub disabled: bool,
    /// Replacement group.
    #[serde(default, rename = "type")]
    pub tag: String,
    /// Queue clients the job is submitted to, one per tick in round-robin
    /// order. Accepts a single name or a list; empty uses the default client.
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub queue: Vec<String>,
    /// Optional label used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl CronEntry {
    /// Create an enabled entry.
    pub fn new(cron: impl Into<String>, job: JobSpec) -> Self {
        Self {
            cron: cron.into(),
            job,
            disabled: false,
            tag: String::new(),
            queue: Vec::new(),
            id: None,
        }
    }

    /// Set the replacement tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Add a target queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue.push(queue.into());
        self
    }

    /// Label used in logs: the explicit id, else the first task name.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => self
                .job
                .task_names()
                .into_iter()
                .next()
                .unwrap_or_default(),
        }
    }
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<Names>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Names::One(name)) => vec![name],
        Some(Names::Many(names)) => names,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_file_entry() {
        let raw = r#"{ "cron": "0 */5 * * * *", "job": "reports.weekly", "disabled": true }"#;
        let entry: CronEntry = serde_json::from_str(raw).expect("parse");
        assert!(entry.disabled);
        assert_eq!(entry.tag, "");
        assert_eq!(entry.label(), "reports.weekly");
        assert!(entry.queue.is_empty());
    }

    #[test]
    fn test_queue_accepts_name_or_list() {
        let one: CronEntry =
            serde_json::from_str(r#"{ "cron": "0 * * * * *", "job": "a.b", "queue": "fast" }"#).unwrap();
        assert_eq!(one.queue, vec!["fast".to_string()]);

        let many: CronEntry =
            serde_json::from_str(r#"{ "cron": "0 * * * * *", "job": "a.b", "queue": ["fast", "slow"] }"#).unwrap();
        assert_eq!(many.queue, vec!["fast".to_string(), "slow".to_string()]);
        assert_eq!(serde_json::to_value(&many).unwrap()["queue"], serde_json::json!(["fast", "slow"]));

        let null: CronEntry =
            serde_json::from_str(r#"{ "cron": "0 * * * * *", "job": "a.b", "queue": null }"#).unwrap();
        assert!(null.queue.is_empty());
    }

    #[test]
    fn test_invalid_job_rejects_entry() {
        let raw = r#"{ "cron": "0 * * * * *", "job": { "Bad-Name": {} } }"#;
        assert!(serde_json::from_str::<CronEntry>(raw).is_err());
    }
}
