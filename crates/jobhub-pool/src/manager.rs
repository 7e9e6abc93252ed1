//! Lifecycle hooks for pooled resources.

use async_trait::async_trait;

use jobhub_core::result::AppResult;

/// Creates, checks and tears down the resources held by a pool.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    /// The pooled resource type.
    type Resource: Send + 'static;

    /// Create a new resource. Failures are reported to the acquiring caller.
    async fn create(&self) -> AppResult<Self::Resource>;

    /// Tear down a resource that leaves the pool.
    async fn destroy(&self, resource: Self::Resource) {
        drop(resource);
    }

    /// Whether a released resource may go back to the idle list.
    fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Reset a resource before it becomes idle again.
    fn reset(&self, _resource: &mut Self::Resource) {}
}
