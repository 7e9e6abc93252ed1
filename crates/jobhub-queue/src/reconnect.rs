//! Background connection with capped exponential backoff.
//!
//! A [`Connection`] starts down and connects in the background, so building
//! a client never fails because its backend is unreachable. Callers of
//! [`Connection::get`] wait until the link is up; drivers call
//! [`Connection::lost`] when an operation finds it broken, which starts a
//! new round of attempts.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::options::ClientOptions;

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failed attempt.
    pub initial: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
        }
    }

    /// Backoff configured by a client's `reconnectDelay` and
    /// `maxReconnectDelay`.
    pub fn from_options(options: &ClientOptions) -> Self {
        Self::new(options.reconnect_delay, options.max_reconnect_delay)
    }

    /// Delay after `failures` consecutive failures (1-based): doubles from
    /// `initial` up to `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.initial.saturating_mul(1u32 << exponent).min(self.max)
    }
}

type ConnectFn<T> = Arc<dyn Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync>;

enum State<T> {
    Down,
    Up(T),
    Closed,
}

/// A link to a backend, re-established in the background whenever it is lost.
pub struct Connection<T> {
    name: String,
    backoff: Backoff,
    connect: ConnectFn<T>,
    state: watch::Sender<State<T>>,
    connecting: Mutex<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Connection<T> {
    /// Start connecting in the background with `connect`.
    pub fn spawn<F, Fut>(name: impl Into<String>, backoff: Backoff, connect: F) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (state, _) = watch::channel(State::Down);
        let connection = Arc::new(Self {
            name: name.into(),
            backoff,
            connect: Arc::new(move || connect().boxed()),
            state,
            connecting: Mutex::new(true),
            task: Mutex::new(None),
        });
        connection.start_attempts();
        connection
    }

    fn connecting(&self) -> MutexGuard<'_, bool> {
        self.connecting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), State::Up(_))
    }

    /// The link, waiting for it to come up.
    pub async fn get(&self) -> AppResult<T> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, State::Down))
            .await
            .map_err(|_| self.closed_error())?;
        match &*state {
            State::Up(value) => Ok(value.clone()),
            _ => Err(self.closed_error()),
        }
    }

    /// Mark the link broken and reconnect in the background. Callers of
    /// [`get`](Self::get) wait until the new link is up.
    pub fn lost(self: &Arc<Self>) {
        {
            let mut connecting = self.connecting();
            if *connecting || matches!(*self.state.borrow(), State::Closed) {
                return;
            }
            self.state.send_replace(State::Down);
            *connecting = true;
        }
        warn!(queue = %self.name, "Connection lost, reconnecting");
        self.start_attempts();
    }

    /// Stop reconnecting and fail every waiting caller.
    pub fn close(&self) {
        {
            let mut connecting = self.connecting();
            self.state.send_replace(State::Closed);
            *connecting = false;
        }
        if let Some(handle) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    fn closed_error(&self) -> AppError {
        AppError::service_unavailable(format!("connection '{}' is closed", self.name))
    }

    fn start_attempts(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let connect = Arc::clone(&self.connect);
        let backoff = self.backoff;
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                let result = connect().await;
                let Some(connection) = weak.upgrade() else {
                    break;
                };
                match result {
                    Ok(value) => {
                        let mut connecting = connection.connecting();
                        if !matches!(*connection.state.borrow(), State::Closed) {
                            connection.state.send_replace(State::Up(value));
                        }
                        *connecting = false;
                        drop(connecting);
                        if failures > 0 {
                            info!(queue = %name, attempts = failures + 1, "Connection established after retries");
                        } else {
                            debug!(queue = %name, "Connection established");
                        }
                        break;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = backoff.delay(failures);
                        warn!(
                            queue = %name,
                            attempt = failures,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "Connection attempt failed"
                        );
                        drop(connection);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });

        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }
}

impl<T> Drop for Connection<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use jobhub_core::error::ErrorKind;

    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(10), Duration::from_millis(80))
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let b = backoff();
        let delays: Vec<u64> = (1..=6).map(|n| b.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80, 80]);
        assert_eq!(b.delay(u32::MAX), Duration::from_millis(80));

        let floor = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(floor.delay(1), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_wait_until_backend_comes_up() {
        let up = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));
        let (flag, counter) = (Arc::clone(&up), Arc::clone(&attempts));
        let connection = Connection::spawn("jobs", backoff(), move || {
            let (flag, counter) = (Arc::clone(&flag), Arc::clone(&counter));
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if flag.load(Ordering::SeqCst) {
                    Ok("link")
                } else {
                    Err(AppError::queue("connection refused"))
                }
            }
        });

        let pending = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.get().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!pending.is_finished());
        assert!(!connection.is_connected());
        // Attempts at 0, 10, 30, 70, 150, 230, 310, 390 and 470 ms.
        assert_eq!(attempts.load(Ordering::SeqCst), 9);

        up.store(true, Ordering::SeqCst);
        assert_eq!(pending.await.unwrap().unwrap(), "link");
        assert!(connection.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_is_replaced() {
        let serial = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&serial);
        let connection = Connection::spawn("jobs", backoff(), move || {
            let counter = Arc::clone(&counter);
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
        });
        assert_eq!(connection.get().await.unwrap(), 1);

        connection.lost();
        connection.lost();
        assert_eq!(connection.get().await.unwrap(), 2);
        assert_eq!(serial.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiting_callers() {
        let connection: Arc<Connection<()>> = Connection::spawn("jobs", backoff(), || async {
            Err(AppError::queue("connection refused"))
        });
        let pending = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        connection.close();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is(ErrorKind::ServiceUnavailable));
        connection.lost();
        assert!(connection.get().await.is_err());
    }

    #[tokio::test]
    async fn test_server_appearing_later_is_picked_up() {
        let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let connection = Connection::spawn("jobs", backoff(), move || async move {
            tokio::net::TcpStream::connect(addr)
                .await
                .map(|_| ())
                .map_err(|e| AppError::with_source(ErrorKind::Queue, "connect failed", e))
        });
        let early = tokio::time::timeout(Duration::from_millis(100), connection.get()).await;
        assert!(early.is_err(), "connected before the server existed");

        let _server = tokio::net::TcpListener::bind(addr).await.unwrap();
        let late = tokio::time::timeout(Duration::from_secs(2), connection.get()).await;
        assert!(late.unwrap().is_ok());
    }
}
