//! Task registry: dotted `"module.method"` names resolved to handlers.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use jobhub_core::error::AppError;
use jobhub_core::job::is_valid_task_name;
use jobhub_core::result::AppResult;

/// Result of one task run.
pub type TaskResult = Result<Option<Value>, TaskError>;

/// Trait for task implementations
#[async_trait]
pub trait TaskHandler: Send + Sync + fmt::Debug {
    /// Run the task with its arguments (`null` when none were given)
    async fn run(&self, args: Value) -> TaskResult;
}

/// Error from a task run
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Permanent failure; the job is dropped
    #[error("Permanent task failure: {0}")]
    Permanent(String),

    /// Transient failure; the job is redelivered
    #[error("Transient task failure: {0}")]
    Retry(String),

    /// Not ready; the job stays queued with a warning
    #[error("Task deferred: {0}")]
    Keep(String),

    /// The task panicked or was aborted
    #[error("Task fault: {0}")]
    Fault(String),

    /// The task exceeded its time budget
    #[error("Task timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] AppError),
}

type TaskFn = dyn Fn(Value) -> BoxFuture<'static, TaskResult> + Send + Sync;

/// A closure registered through [`TaskRegistry::register_fn`].
struct FnTask {
    name: String,
    f: Box<TaskFn>,
}

impl fmt::Debug for FnTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTask").field("name", &self.name).finish()
    }
}

#[async_trait]
impl TaskHandler for FnTask {
    async fn run(&self, args: Value) -> TaskResult {
        (self.f)(args).await
    }
}

/// Maps task names to their handlers
#[derive(Debug, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`
    pub fn register(&mut self, name: &str, handler: Arc<dyn TaskHandler>) -> AppResult<()> {
        if !is_valid_task_name(name) {
            return Err(AppError::validation(format!(
                "Invalid task name '{name}': expected 'module.method'"
            )));
        }
        tracing::info!("Registered task handler '{}'", name);
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    /// Register an async closure under `name`
    pub fn register_fn<F, Fut>(&mut self, name: &str, f: F) -> AppResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let task = FnTask {
            name: name.to_string(),
            f: Box::new(move |args| Box::pin(f(args))),
        };
        self.register(name, Arc::new(task))
    }

    /// Look up a handler
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Check if a handler is registered
    pub fn has_task(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_register_and_resolve_closure() {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("math.double", |args: Value| async move {
                let n = args.get("n").and_then(Value::as_i64).unwrap_or(0);
                Ok(Some(json!(n * 2)))
            })
            .unwrap();

        assert!(registry.has_task("math.double"));
        let handler = registry.resolve("math.double").unwrap();
        assert_eq!(handler.run(json!({ "n": 21 })).await.unwrap(), Some(json!(42)));
        assert!(registry.resolve("math.triple").is_none());
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let mut registry = TaskRegistry::new();
        for name in ["Math.double", "math", "math.double.extra", "math-x.y"] {
            assert!(registry.register_fn(name, |_| async { Ok(None) }).is_err(), "{name}");
        }
        assert!(registry.task_names().is_empty());
    }
}
