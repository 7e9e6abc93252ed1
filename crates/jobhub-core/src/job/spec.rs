//! Job specification parsing and normalization.
//!
//! A job may be written in four equivalent shapes:
//!
//! - `"module.method"`
//! - `{ "module.method": { ...args } }`
//! - `{ "job": <either of the above> }`
//! - `{ "job": [ <either>, ... ] }` (a bare top-level array is accepted too)
//!
//! All of them normalize to [`JobSpec`], where the body is either one task
//! map or a sequence of task maps. Keys of every task map must match
//! `^[a-z0-9_]+\.[a-z0-9_]+$`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::AppError;
use crate::result::AppResult;

/// Ordered mapping from `"module.method"` to the task arguments.
pub type TaskMap = Map<String, Value>;

static TASK_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("task name pattern is a valid regex")
});

/// Check a `"module.method"` task name against the allowed pattern.
pub fn is_valid_task_name(name: &str) -> bool {
    TASK_NAME.is_match(name)
}

/// Normalized job body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobBody {
    /// All tasks of the map run concurrently.
    Single(TaskMap),
    /// Steps run one after another; each step's tasks run concurrently.
    Sequence(Vec<TaskMap>),
}

/// A validated, normalized job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    /// The job body.
    pub job: JobBody,
}

impl JobSpec {
    /// Validate any of the accepted shapes and normalize it.
    ///
    /// The input is never modified; on success a new normalized value is
    /// returned. A single invalid key rejects the whole spec.
    pub fn parse(value: &Value) -> AppResult<Self> {
        let body = match value {
            Value::Object(obj) => match obj.get("job") {
                Some(inner) => parse_body(inner)?,
                None => JobBody::Single(parse_task_map(obj)?),
            },
            other => parse_body(other)?,
        };
        Ok(Self { job: body })
    }

    /// Build a single-task job.
    pub fn task(name: &str, args: Value) -> AppResult<Self> {
        let mut map = TaskMap::new();
        map.insert(name.to_string(), args);
        Ok(Self {
            job: JobBody::Single(parse_task_map(&map)?),
        })
    }

    /// The sequential steps of this job.
    pub fn steps(&self) -> Vec<&TaskMap> {
        match &self.job {
            JobBody::Single(map) => vec![map],
            JobBody::Sequence(list) => list.iter().collect(),
        }
    }

    /// All task names in execution order.
    pub fn task_names(&self) -> Vec<String> {
        self.steps()
            .into_iter()
            .flat_map(|map| map.keys().cloned())
            .collect()
    }

    /// Serialize back into the `{ "job": ... }` wire shape.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl TryFrom<Value> for JobSpec {
    type Error = AppError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl<'de> Deserialize<'de> for JobSpec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Self::parse(&value).map_err(|e| serde::de::Error::custom(e.message))
    }
}

fn parse_body(value: &Value) -> AppResult<JobBody> {
    match value {
        Value::String(name) => Ok(JobBody::Single(single(name)?)),
        Value::Object(obj) => Ok(JobBody::Single(parse_task_map(obj)?)),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(AppError::validation("job list is empty"));
            }
            let steps = items
                .iter()
                .map(|item| match item {
                    Value::String(name) => single(name),
                    Value::Object(obj) => parse_task_map(obj),
                    other => Err(AppError::validation(format!(
                        "job list item must be a task name or task map, got {other}"
                    ))),
                })
                .collect::<AppResult<Vec<_>>>()?;
            Ok(JobBody::Sequence(steps))
        }
        other => Err(AppError::validation(format!(
            "job must be a task name, task map or list, got {other}"
        ))),
    }
}

fn single(name: &str) -> AppResult<TaskMap> {
    check_name(name)?;
    let mut map = TaskMap::new();
    map.insert(name.to_string(), Value::Null);
    Ok(map)
}

fn parse_task_map(obj: &TaskMap) -> AppResult<TaskMap> {
    if obj.is_empty() {
        return Err(AppError::validation("task map is empty"));
    }
    for name in obj.keys() {
        check_name(name)?;
    }
    Ok(obj.clone())
}

fn check_name(name: &str) -> AppResult<()> {
    if is_valid_task_name(name) {
        Ok(())
    } else {
        Err(AppError::validation(format!(
            "invalid task name '{name}', expected 'module.method'"
        )))
    }
}
