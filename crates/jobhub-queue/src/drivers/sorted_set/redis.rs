//! Redis sorted-set store.
//!
//! Set moves run as Lua scripts so that a pop and its shadow insert, or a
//! recovery sweep, are atomic on the server. Connections come from a
//! [`ResourcePool`] of multiplexed connections, gated by a background
//! [`Connection`] that holds operations while the server is unreachable.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, RedisResult, Script};
use tracing::{info, warn};
use url::Url;

use jobhub_core::config::PoolConfig;
use jobhub_core::error::{AppError, ErrorKind};
use jobhub_core::result::AppResult;
use jobhub_pool::{PoolOptions, Pooled, ResourceManager, ResourcePool};

use super::store::{QueueDepth, SortedSetStore};
use crate::fanout::EventStream;
use crate::options::ClientOptions;
use crate::reconnect::{Backoff, Connection};

static POP_DUE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(items) do
  redis.call('ZREM', KEYS[1], member)
  if ARGV[3] ~= '' then
    redis.call('ZADD', KEYS[2], ARGV[3], member)
  end
end
return items
",
    )
});

static RECOVER: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local items = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'WITHSCORES')
for i = 1, #items, 2 do
  redis.call('ZREM', KEYS[2], items[i])
  redis.call('ZADD', KEYS[1], items[i + 1], items[i])
end
return #items / 2
",
    )
});

static TOUCH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('ZSCORE', KEYS[1], ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
  return 1
end
return 0
",
    )
});

/// Creates multiplexed connections for the pool.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: Client,
}

#[async_trait]
impl ResourceManager for RedisConnector {
    type Resource = MultiplexedConnection;

    async fn create(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Queue, "Failed to connect to Redis", e))
    }
}

/// Answers once the server replies to `PING`.
async fn ping(client: Client) -> AppResult<()> {
    let mut conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Queue, "Failed to connect to Redis", e))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| AppError::with_source(ErrorKind::Queue, "Redis PING failed", e))?;
    Ok(())
}

/// Redis client wrapper with a connection pool and key prefix.
#[derive(Debug, Clone)]
pub struct RedisClient {
    client: Client,
    pool: ResourcePool<RedisConnector>,
    link: Arc<Connection<()>>,
    key_prefix: String,
}

impl RedisClient {
    /// Create a client for a queue URL; its query string is stripped.
    ///
    /// Only a malformed URL fails here. The server is reached in the
    /// background with the client's reconnect backoff, and operations wait
    /// until it answers.
    pub fn connect(name: &str, url: &Url, options: &ClientOptions, pool: &PoolConfig) -> AppResult<Self> {
        let mut address = url.clone();
        address.set_query(None);
        info!(queue = %name, url = %mask_redis_url(&address), "Connecting to Redis");

        let client = Client::open(address.as_str()).map_err(|e| {
            AppError::with_source(ErrorKind::Configuration, "Failed to create Redis client", e)
        })?;

        let pool_options = PoolOptions::from_config(format!("redis:{name}"), pool).with_max(options.pool_size);
        let pool = ResourcePool::new(pool_options, RedisConnector { client: client.clone() });
        pool.start_housekeeping();

        let target = client.clone();
        let link = Connection::spawn(name, Backoff::from_options(options), move || ping(target.clone()));

        Ok(Self {
            client,
            pool,
            link,
            key_prefix: options.prefix.clone(),
        })
    }

    /// Build a full key with the configured prefix.
    pub fn prefixed_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    /// The connection pool.
    pub fn pool(&self) -> &ResourcePool<RedisConnector> {
        &self.pool
    }

    /// Whether the server answered the last connection check.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// A pooled connection, once the server is reachable.
    async fn conn(&self) -> AppResult<Pooled<RedisConnector>> {
        self.link.get().await?;
        self.pool.acquire().await.inspect_err(|e| {
            if e.is(ErrorKind::Queue) {
                self.link.lost();
            }
        })
    }

    /// Release the connection, or destroy it when the error says it is
    /// broken, and map the result.
    fn settle<T>(&self, conn: Pooled<RedisConnector>, result: RedisResult<T>, op: &str) -> AppResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                if is_broken(&e) {
                    warn!(error = %e, "Discarding broken Redis connection");
                    self.link.lost();
                    let pool = self.pool.clone();
                    tokio::spawn(async move { pool.destroy(conn).await });
                }
                Err(AppError::with_source(ErrorKind::Queue, format!("Redis {op} failed: {e}"), e))
            }
        }
    }
}

fn is_broken(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

/// Mask password in Redis URL for safe logging.
pub fn mask_redis_url(url: &Url) -> String {
    let mut masked = url.clone();
    if masked.password().is_some() && masked.set_password(Some("****")).is_err() {
        return format!("{}://<redacted>", url.scheme());
    }
    masked.to_string()
}

/// Sorted sets in Redis.
#[derive(Debug, Clone)]
pub struct RedisSortedSetStore {
    client: RedisClient,
}

impl RedisSortedSetStore {
    /// Wrap a connected client.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    fn ready_key(&self, queue: &str) -> String {
        self.client.prefixed_key(&format!("ready:{queue}"))
    }

    fn processing_key(&self, queue: &str) -> String {
        self.client.prefixed_key(&format!("processing:{queue}"))
    }

    fn events_key(&self, channel: &str) -> String {
        self.client.prefixed_key(&format!("events:{channel}"))
    }
}

#[async_trait]
impl SortedSetStore for RedisSortedSetStore {
    fn driver(&self) -> &'static str {
        "redis"
    }

    async fn push(&self, queue: &str, score: i64, member: &str) -> AppResult<()> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<i64> = redis::cmd("ZADD")
            .arg(self.ready_key(queue))
            .arg(score)
            .arg(member)
            .query_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "ZADD").map(|_| ())
    }

    async fn pop_due(
        &self,
        queue: &str,
        now: i64,
        count: usize,
        invisible_until: Option<i64>,
    ) -> AppResult<Vec<String>> {
        let mut conn = self.client.conn().await?;
        let until = invisible_until.map(|u| u.to_string()).unwrap_or_default();
        let result: RedisResult<Vec<String>> = POP_DUE
            .key(self.ready_key(queue))
            .key(self.processing_key(queue))
            .arg(now)
            .arg(count)
            .arg(until)
            .invoke_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "pop")
    }

    async fn touch(&self, queue: &str, member: &str, score: i64) -> AppResult<bool> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<i64> = TOUCH
            .key(self.processing_key(queue))
            .arg(score)
            .arg(member)
            .invoke_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "touch").map(|n| n > 0)
    }

    async fn complete(&self, queue: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<i64> = redis::cmd("ZREM")
            .arg(self.processing_key(queue))
            .arg(member)
            .query_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "ZREM").map(|n| n > 0)
    }

    async fn requeue(&self, queue: &str, member: &str, score: i64) -> AppResult<()> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<()> = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.processing_key(queue))
            .arg(member)
            .ignore()
            .cmd("ZADD")
            .arg(self.ready_key(queue))
            .arg(score)
            .arg(member)
            .ignore()
            .query_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "requeue")
    }

    async fn recover(&self, queue: &str, now: i64) -> AppResult<usize> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<usize> = RECOVER
            .key(self.ready_key(queue))
            .key(self.processing_key(queue))
            .arg(now)
            .invoke_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "recover")
    }

    async fn remove(&self, queue: &str, member: &str) -> AppResult<bool> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<(i64, i64)> = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.ready_key(queue))
            .arg(member)
            .cmd("ZREM")
            .arg(self.processing_key(queue))
            .arg(member)
            .query_async(&mut *conn)
            .await;
        self.client
            .settle(conn, result, "ZREM")
            .map(|(ready, processing)| ready + processing > 0)
    }

    async fn depth(&self, queue: &str) -> AppResult<QueueDepth> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<(usize, usize)> = redis::pipe()
            .cmd("ZCARD")
            .arg(self.ready_key(queue))
            .cmd("ZCARD")
            .arg(self.processing_key(queue))
            .query_async(&mut *conn)
            .await;
        self.client
            .settle(conn, result, "ZCARD")
            .map(|(ready, processing)| QueueDepth { ready, processing })
    }

    async fn publish(&self, channel: &str, raw: String) -> AppResult<()> {
        let mut conn = self.client.conn().await?;
        let result: RedisResult<i64> = redis::cmd("PUBLISH")
            .arg(self.events_key(channel))
            .arg(raw)
            .query_async(&mut *conn)
            .await;
        self.client.settle(conn, result, "PUBLISH").map(|_| ())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<EventStream> {
        self.client.link.get().await?;
        let mut pubsub = self
            .client
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Queue, "Failed to open Redis pub/sub", e))?;
        pubsub
            .subscribe(self.events_key(channel))
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Queue, "Redis SUBSCRIBE failed", e))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| futures::future::ready(msg.get_payload::<String>().ok()));
        Ok(stream.boxed())
    }

    async fn close(&self) -> AppResult<()> {
        self.client.link.close();
        self.client.pool.shutdown(Duration::from_secs(5)).await
    }
}
