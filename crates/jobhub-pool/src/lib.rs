//! # jobhub-pool
//!
//! A bounded pool of expensive resources (connections, handles) with
//! creation/destruction hooks, idle eviction and a bounded wait queue.
//!
//! Callers [`ResourcePool::acquire`] a [`Pooled`] guard; dropping the guard
//! (or passing it to [`ResourcePool::release`]) returns the resource. When
//! callers are waiting, a released resource is handed straight to the
//! oldest waiter.

pub mod manager;
pub mod metrics;
pub mod pool;

pub use manager::ResourceManager;
pub use metrics::{PoolMetrics, PoolStats};
pub use pool::{PoolOptions, Pooled, ResourcePool};
