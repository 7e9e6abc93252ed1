//! The bounded resource pool.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jobhub_core::config::PoolConfig;
use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::manager::ResourceManager;
use crate::metrics::{PoolMetrics, PoolStats};

/// Poll period while shutdown waits for busy resources.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Lower bound for the housekeeping period.
const MIN_HOUSEKEEPING: Duration = Duration::from_secs(30);

/// Pool bounds and timeouts.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Pool name used in logs and errors.
    pub name: String,
    /// Resources kept alive by housekeeping.
    pub min: usize,
    /// Upper bound on idle + busy resources.
    pub max: usize,
    /// Upper bound on waiting callers.
    pub max_queue: usize,
    /// How long a caller waits for a released resource.
    pub timeout: Duration,
    /// Idle age after which a resource may be evicted.
    pub idle: Duration,
}

impl PoolOptions {
    /// Options with the configuration defaults.
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_config(name, &PoolConfig::default())
    }

    /// Options from a configuration section.
    pub fn from_config(name: impl Into<String>, config: &PoolConfig) -> Self {
        Self {
            name: name.into(),
            min: config.min.min(config.max),
            max: config.max,
            max_queue: config.max_queue,
            timeout: Duration::from_millis(config.timeout_ms),
            idle: Duration::from_millis(config.idle_ms),
        }
    }

    /// Set the minimum number of live resources.
    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min.min(self.max);
        self
    }

    /// Set the maximum number of resources.
    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self.min = self.min.min(max);
        self
    }

    /// Set the maximum number of waiting callers.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Set the wait timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the idle eviction age.
    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Housekeeping period: a third of the idle age, at least 30 seconds.
    pub fn housekeeping_interval(&self) -> Duration {
        (self.idle / 3).max(MIN_HOUSEKEEPING)
    }
}

struct IdleResource<R> {
    id: u64,
    resource: R,
    since: Instant,
}

struct Waiter<M: ResourceManager> {
    id: u64,
    tx: oneshot::Sender<Pooled<M>>,
}

/// Every tracked id lives in exactly one of `available`, `busy` or
/// `pending_destroy`.
struct PoolState<M: ResourceManager> {
    available: VecDeque<IdleResource<M::Resource>>,
    busy: HashSet<u64>,
    pending_destroy: HashSet<u64>,
    waiters: VecDeque<Waiter<M>>,
    closed: bool,
}

impl<M: ResourceManager> PoolState<M> {
    fn total(&self) -> usize {
        self.available.len() + self.busy.len() + self.pending_destroy.len()
    }
}

struct PoolInner<M: ResourceManager> {
    options: PoolOptions,
    manager: M,
    state: Mutex<PoolState<M>>,
    metrics: PoolMetrics,
    next_id: AtomicU64,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

enum Slot<M: ResourceManager> {
    Ready(Pooled<M>),
    Create(u64),
    Wait(u64, oneshot::Receiver<Pooled<M>>),
}

impl<M: ResourceManager> PoolInner<M> {
    fn state(&self) -> MutexGuard<'_, PoolState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn closed_error(&self) -> AppError {
        AppError::service_unavailable(format!("pool '{}' is closed", self.options.name))
    }

    /// Drop an id from the bookkeeping without touching the resource.
    fn forget(&self, id: u64) {
        let mut state = self.state();
        state.busy.remove(&id);
        state.pending_destroy.remove(&id);
    }

    fn spawn_destroy(self: &Arc<Self>, resource: M::Resource) {
        PoolMetrics::incr(&self.metrics.destroyed);
        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.manager.destroy(resource).await;
                });
            }
            Err(_) => drop(resource),
        }
    }

    /// Return a resource: hand it to the oldest live waiter, else park it
    /// in the idle list, else destroy it.
    fn release(self: &Arc<Self>, id: u64, resource: M::Resource) {
        if !self.manager.validate(&resource) {
            debug!(pool = %self.options.name, id, "Released resource failed validation");
            self.forget(id);
            self.spawn_destroy(resource);
            self.refill_for_waiters();
            return;
        }

        let mut resource = resource;
        loop {
            let waiter = {
                let mut guard = self.state();
                let state = &mut *guard;
                if state.pending_destroy.remove(&id) {
                    drop(guard);
                    self.spawn_destroy(resource);
                    self.refill_for_waiters();
                    return;
                }
                if !state.busy.contains(&id) {
                    drop(guard);
                    debug!(pool = %self.options.name, id, "Released resource is not tracked");
                    self.spawn_destroy(resource);
                    return;
                }
                if state.closed {
                    state.busy.remove(&id);
                    drop(guard);
                    self.spawn_destroy(resource);
                    return;
                }
                match state.waiters.pop_front() {
                    Some(waiter) => waiter,
                    None => {
                        state.busy.remove(&id);
                        if state.available.len() < self.options.max {
                            self.manager.reset(&mut resource);
                            state.available.push_back(IdleResource {
                                id,
                                resource,
                                since: Instant::now(),
                            });
                            return;
                        }
                        drop(guard);
                        self.spawn_destroy(resource);
                        return;
                    }
                }
            };

            match waiter.tx.send(Pooled::new(Arc::clone(self), id, resource)) {
                Ok(()) => {
                    PoolMetrics::incr(&self.metrics.handoffs);
                    return;
                }
                Err(mut returned) => match returned.resource.take() {
                    Some(r) => resource = r,
                    None => return,
                },
            }
        }
    }

    /// Create a resource for the oldest waiter when a slot was freed
    /// without a resource coming back.
    fn refill_for_waiters(self: &Arc<Self>) {
        let id = {
            let mut state = self.state();
            state.waiters.retain(|w| !w.tx.is_closed());
            if state.closed || state.waiters.is_empty() || state.total() >= self.options.max {
                return;
            }
            let id = self.next_id();
            state.busy.insert(id);
            id
        };

        let Ok(handle) = Handle::try_current() else {
            self.forget(id);
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            match inner.manager.create().await {
                Ok(resource) => {
                    PoolMetrics::incr(&inner.metrics.created);
                    inner.release(id, resource);
                }
                Err(e) => {
                    inner.forget(id);
                    PoolMetrics::incr(&inner.metrics.create_failures);
                    warn!(pool = %inner.options.name, error = %e, "Failed to create resource for waiter");
                }
            }
        });
    }
}

/// Releases a reserved slot unless creation completed.
struct Reservation<'a, M: ResourceManager> {
    inner: &'a PoolInner<M>,
    id: u64,
    armed: bool,
}

impl<M: ResourceManager> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.forget(self.id);
        }
    }
}

/// A bounded pool of resources created by a [`ResourceManager`].
pub struct ResourcePool<M: ResourceManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ResourceManager> fmt::Debug for ResourcePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.options.name)
            .field("max", &self.inner.options.max)
            .finish()
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    /// Create an empty pool. Call [`start_housekeeping`](Self::start_housekeeping)
    /// to enable idle eviction and `min` top-up.
    pub fn new(options: PoolOptions, manager: M) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                options,
                manager,
                state: Mutex::new(PoolState {
                    available: VecDeque::new(),
                    busy: HashSet::new(),
                    pending_destroy: HashSet::new(),
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                metrics: PoolMetrics::default(),
                next_id: AtomicU64::new(0),
                housekeeper: Mutex::new(None),
            }),
        }
    }

    /// Pool options.
    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// The resource manager.
    pub fn manager(&self) -> &M {
        &self.inner.manager
    }

    /// Acquire a resource.
    ///
    /// Reuses an idle resource, else creates one while below `max`, else
    /// waits in a queue bounded by `max_queue` for up to `timeout`.
    pub async fn acquire(&self) -> AppResult<Pooled<M>> {
        let inner = &self.inner;
        let slot = {
            let mut guard = inner.state();
            let state = &mut *guard;
            if state.closed {
                return Err(inner.closed_error());
            }
            if let Some(idle) = state.available.pop_back() {
                state.busy.insert(idle.id);
                Slot::Ready(Pooled::new(Arc::clone(inner), idle.id, idle.resource))
            } else if state.total() < inner.options.max {
                let id = inner.next_id();
                state.busy.insert(id);
                Slot::Create(id)
            } else {
                state.waiters.retain(|w| !w.tx.is_closed());
                if state.waiters.len() >= inner.options.max_queue {
                    PoolMetrics::incr(&inner.metrics.exhausted);
                    return Err(AppError::resource_exhausted(format!(
                        "pool '{}' is at max {} with {} callers waiting",
                        inner.options.name,
                        inner.options.max,
                        state.waiters.len()
                    )));
                }
                let (tx, rx) = oneshot::channel();
                let id = inner.next_id();
                state.waiters.push_back(Waiter { id, tx });
                Slot::Wait(id, rx)
            }
        };

        match slot {
            Slot::Ready(pooled) => {
                PoolMetrics::incr(&inner.metrics.acquired);
                Ok(pooled)
            }
            Slot::Create(id) => self.create_reserved(id).await,
            Slot::Wait(waiter_id, rx) => self.wait_for_release(waiter_id, rx).await,
        }
    }

    async fn create_reserved(&self, id: u64) -> AppResult<Pooled<M>> {
        let inner = &self.inner;
        let mut reservation = Reservation {
            inner,
            id,
            armed: true,
        };
        match inner.manager.create().await {
            Ok(resource) => {
                reservation.armed = false;
                PoolMetrics::incr(&inner.metrics.created);
                PoolMetrics::incr(&inner.metrics.acquired);
                debug!(pool = %inner.options.name, id, "Created pooled resource");
                Ok(Pooled::new(Arc::clone(inner), id, resource))
            }
            Err(e) => {
                drop(reservation);
                PoolMetrics::incr(&inner.metrics.create_failures);
                warn!(pool = %inner.options.name, error = %e, "Failed to create pooled resource");
                inner.refill_for_waiters();
                Err(e)
            }
        }
    }

    async fn wait_for_release(
        &self,
        waiter_id: u64,
        mut rx: oneshot::Receiver<Pooled<M>>,
    ) -> AppResult<Pooled<M>> {
        let inner = &self.inner;
        match tokio::time::timeout(inner.options.timeout, &mut rx).await {
            Ok(Ok(pooled)) => {
                PoolMetrics::incr(&inner.metrics.acquired);
                Ok(pooled)
            }
            Ok(Err(_)) => Err(inner.closed_error()),
            Err(_) => {
                let still_queued = {
                    let mut state = inner.state();
                    let before = state.waiters.len();
                    state.waiters.retain(|w| w.id != waiter_id);
                    state.waiters.len() != before
                };
                if still_queued {
                    PoolMetrics::incr(&inner.metrics.timeouts);
                    return Err(AppError::timeout(format!(
                        "timed out after {:?} waiting for a resource from pool '{}'",
                        inner.options.timeout, inner.options.name
                    )));
                }
                // A release already picked this waiter; the hand-off is in flight.
                match rx.await {
                    Ok(pooled) => {
                        PoolMetrics::incr(&inner.metrics.acquired);
                        Ok(pooled)
                    }
                    Err(_) => Err(inner.closed_error()),
                }
            }
        }
    }

    /// Return a resource to the pool. Equivalent to dropping the guard.
    pub fn release(&self, pooled: Pooled<M>) {
        drop(pooled);
    }

    /// Remove a resource from the pool and destroy it.
    pub async fn destroy(&self, mut pooled: Pooled<M>) {
        let Some(resource) = pooled.resource.take() else {
            return;
        };
        let owner = Arc::clone(&pooled.pool);
        owner.forget(pooled.id);
        PoolMetrics::incr(&owner.metrics.destroyed);
        owner.manager.destroy(resource).await;
        owner.refill_for_waiters();
    }

    /// Destroy every idle resource and mark busy ones for destruction on
    /// release.
    pub async fn destroy_all(&self) {
        let idle: Vec<M::Resource> = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let busy: Vec<u64> = state.busy.drain().collect();
            state.pending_destroy.extend(busy);
            state.available.drain(..).map(|e| e.resource).collect()
        };
        for resource in idle {
            PoolMetrics::incr(&self.inner.metrics.destroyed);
            self.inner.manager.destroy(resource).await;
        }
    }

    /// One housekeeping pass: evict resources idle longer than `idle`
    /// while keeping `min` alive, then create resources up to `min`.
    pub async fn run_housekeeping(&self) {
        let inner = &self.inner;
        let now = Instant::now();
        let (evicted, missing) = {
            let mut guard = inner.state();
            let state = &mut *guard;
            if state.closed {
                return;
            }
            let mut evicted = Vec::new();
            while state.total() > inner.options.min {
                let expired = state
                    .available
                    .front()
                    .is_some_and(|front| now.duration_since(front.since) >= inner.options.idle);
                if !expired {
                    break;
                }
                if let Some(entry) = state.available.pop_front() {
                    evicted.push(entry.resource);
                }
            }
            let missing: Vec<u64> = (0..inner.options.min.saturating_sub(state.total()))
                .map(|_| {
                    let id = inner.next_id();
                    state.busy.insert(id);
                    id
                })
                .collect();
            (evicted, missing)
        };

        if !evicted.is_empty() {
            debug!(pool = %inner.options.name, count = evicted.len(), "Evicting idle resources");
        }
        for resource in evicted {
            PoolMetrics::incr(&inner.metrics.destroyed);
            inner.manager.destroy(resource).await;
        }

        for id in missing {
            match inner.manager.create().await {
                Ok(resource) => {
                    PoolMetrics::incr(&inner.metrics.created);
                    inner.release(id, resource);
                }
                Err(e) => {
                    inner.forget(id);
                    PoolMetrics::incr(&inner.metrics.create_failures);
                    warn!(pool = %inner.options.name, error = %e, "Failed to top up pool to min");
                }
            }
        }
    }

    /// Spawn the periodic housekeeping task.
    pub fn start_housekeeping(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.options.housekeeping_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ResourcePool { inner }.run_housekeeping().await;
            }
        });

        let mut slot = self
            .inner
            .housekeeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Close the pool: refuse new acquisitions, fail waiting callers,
    /// destroy idle resources and wait up to `max_wait` for busy ones.
    pub async fn shutdown(&self, max_wait: Duration) -> AppResult<()> {
        let inner = &self.inner;
        let idle: Vec<M::Resource> = {
            let mut guard = inner.state();
            let state = &mut *guard;
            state.closed = true;
            state.waiters.clear();
            state.available.drain(..).map(|e| e.resource).collect()
        };
        if let Some(handle) = inner
            .housekeeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }

        info!(pool = %inner.options.name, idle = idle.len(), "Shutting down resource pool");
        for resource in idle {
            PoolMetrics::incr(&inner.metrics.destroyed);
            inner.manager.destroy(resource).await;
        }

        let deadline = Instant::now() + max_wait;
        loop {
            let outstanding = {
                let state = inner.state();
                state.busy.len() + state.pending_destroy.len()
            };
            if outstanding == 0 {
                info!(pool = %inner.options.name, "Resource pool shut down");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(pool = %inner.options.name, outstanding, "Pool shutdown timed out");
                return Err(AppError::timeout(format!(
                    "pool '{}' still has {outstanding} busy resources after {max_wait:?}",
                    inner.options.name
                )));
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            name: self.inner.options.name.clone(),
            idle: state.available.len(),
            busy: state.busy.len(),
            pending_destroy: state.pending_destroy.len(),
            waiting: state.waiters.len(),
            closed: state.closed,
            created: 0,
            destroyed: 0,
            acquired: 0,
            handoffs: 0,
            timeouts: 0,
            exhausted: 0,
            create_failures: 0,
        }
        .counters(&self.inner.metrics)
    }
}

/// A resource checked out of a [`ResourcePool`].
///
/// Dropping the guard releases the resource back to its pool.
pub struct Pooled<M: ResourceManager> {
    pool: Arc<PoolInner<M>>,
    id: u64,
    resource: Option<M::Resource>,
}

impl<M: ResourceManager> Pooled<M> {
    fn new(pool: Arc<PoolInner<M>>, id: u64, resource: M::Resource) -> Self {
        Self {
            pool,
            id,
            resource: Some(resource),
        }
    }

    /// Pool-local identifier of this resource.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<M: ResourceManager> Deref for Pooled<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: ResourceManager> DerefMut for Pooled<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<M: ResourceManager> Drop for Pooled<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(self.id, resource);
        }
    }
}

impl<M: ResourceManager> fmt::Debug for Pooled<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.options.name)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use async_trait::async_trait;
    use jobhub_core::error::ErrorKind;

    use super::*;

    #[derive(Debug, Default)]
    struct TestManager {
        serial: AtomicUsize,
        failures_left: AtomicUsize,
        reject_release: AtomicBool,
    }

    #[async_trait]
    impl ResourceManager for TestManager {
        type Resource = usize;

        async fn create(&self) -> AppResult<usize> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::queue("connection refused"));
            }
            Ok(self.serial.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn validate(&self, _resource: &usize) -> bool {
            !self.reject_release.load(Ordering::SeqCst)
        }
    }

    fn options() -> PoolOptions {
        PoolOptions::new("test")
            .with_max(2)
            .with_timeout(Duration::from_millis(200))
    }

    fn make_pool(options: PoolOptions) -> ResourcePool<TestManager> {
        ResourcePool::new(options, TestManager::default())
    }

    #[tokio::test]
    async fn test_idle_resource_is_reused() {
        let pool = make_pool(options());
        let first = pool.acquire().await.unwrap();
        let value = *first;
        pool.release(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(*second, value);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn test_max_one_blocks_until_release() {
        let pool = make_pool(options().with_max(1).with_timeout(Duration::from_secs(5)));
        let held = pool.acquire().await.unwrap();
        let value = *held;

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|r| *r) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.stats().waiting, 1);

        pool.release(held);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, value);

        let stats = pool.stats();
        assert_eq!(stats.handoffs, 1);
        assert_eq!(stats.created, 1);
    }

    #[tokio::test]
    async fn test_zero_queue_fails_immediately() {
        let pool = make_pool(options().with_max(1).with_max_queue(0));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        assert_eq!(pool.stats().exhausted, 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let pool = make_pool(
            options()
                .with_max(1)
                .with_timeout(Duration::from_millis(50)),
        );
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        let stats = pool.stats();
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_keeps_min() {
        let pool = make_pool(
            options()
                .with_min(1)
                .with_idle(Duration::from_millis(100)),
        );
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().idle, 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        pool.run_housekeeping().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.destroyed, 1);

        pool.run_housekeeping().await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_housekeeping_tops_up_to_min() {
        let pool = make_pool(options().with_max(4).with_min(2));
        pool.run_housekeeping().await;

        let stats = pool.stats();
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.created, 2);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_trace() {
        let pool = make_pool(options());
        pool.manager().failures_left.store(1, Ordering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Queue);
        let stats = pool.stats();
        assert_eq!((stats.idle, stats.busy), (0, 0));
        assert_eq!(stats.create_failures, 1);

        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_resource_is_destroyed_on_release() {
        let pool = make_pool(options());
        let held = pool.acquire().await.unwrap();
        pool.manager().reject_release.store(true, Ordering::SeqCst);
        pool.release(held);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.destroyed, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let pool = make_pool(options().with_max(1).with_timeout(Duration::from_secs(5)));
        let held = pool.acquire().await.unwrap();

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|r| *r) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let patient = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|r| *r) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.release(held);
        assert!(patient.await.unwrap().is_ok());
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_destroy_all_marks_busy_for_destruction() {
        let pool = make_pool(options());
        let kept = pool.acquire().await.unwrap();
        let returned = pool.acquire().await.unwrap();
        pool.release(returned);

        pool.destroy_all().await;
        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.pending_destroy, 1);
        assert_eq!(stats.destroyed, 1);

        drop(kept);
        let stats = pool.stats();
        assert_eq!(stats.pending_destroy, 0);
        assert_eq!(stats.destroyed, 2);
    }

    #[tokio::test]
    async fn test_explicit_destroy_frees_slot() {
        let pool = make_pool(options().with_max(1));
        let held = pool.acquire().await.unwrap();
        pool.destroy(held).await;

        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.destroyed, 1);
        let again = pool.acquire().await.unwrap();
        assert_eq!(*again, 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_busy_resources() {
        let pool = make_pool(options());
        let held = pool.acquire().await.unwrap();
        let idle = pool.acquire().await.unwrap();
        pool.release(idle);

        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);

        drop(held);
        assert!(closing.await.unwrap().is_ok());
        let stats = pool.stats();
        assert!(stats.closed);
        assert_eq!(stats.destroyed, 2);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_with_busy_resource() {
        let pool = make_pool(options());
        let _held = pool.acquire().await.unwrap();

        let err = pool.shutdown(Duration::from_millis(60)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_housekeeping_interval_floor() {
        let short = PoolOptions::new("a").with_idle(Duration::from_millis(100));
        assert_eq!(short.housekeeping_interval(), Duration::from_secs(30));
        let long = PoolOptions::new("b").with_idle(Duration::from_secs(300));
        assert_eq!(long.housekeeping_interval(), Duration::from_secs(100));
    }
}
