//! Named queue clients.
//!
//! Every queue operation resolves its client here by name, or round-robin
//! over a list of names. The registry always holds a `default` client.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{info, warn};
use url::Url;

use jobhub_core::config::{AppConfig, DEFAULT_QUEUE, PoolConfig};
use jobhub_core::error::AppError;
use jobhub_core::result::AppResult;

use crate::client::QueueClient;
use crate::drivers::SortedSetClient;
use crate::options::ClientOptions;

/// Mapping from logical queue name to client.
#[derive(Debug)]
pub struct QueueRegistry {
    clients: RwLock<BTreeMap<String, Arc<dyn QueueClient>>>,
    next: AtomicUsize,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueRegistry {
    /// Registry with only an in-process `default` client.
    pub fn new() -> Self {
        let mut clients: BTreeMap<String, Arc<dyn QueueClient>> = BTreeMap::new();
        clients.insert(
            DEFAULT_QUEUE.to_string(),
            Arc::new(SortedSetClient::memory(DEFAULT_QUEUE, ClientOptions::default())),
        );
        Self {
            clients: RwLock::new(clients),
            next: AtomicUsize::new(0),
        }
    }

    /// Connect every enabled queue in the configuration.
    pub async fn from_config(config: &AppConfig) -> AppResult<Self> {
        let registry = Self::new();
        for (name, queue) in &config.queues {
            if !queue.enabled {
                info!(queue = %name, "Queue disabled, skipping");
                continue;
            }
            let client = connect(name, &queue.url, &config.pool).await?;
            registry.insert(client);
        }
        Ok(registry)
    }

    /// Add or replace a client under its own name.
    pub fn insert(&self, client: Arc<dyn QueueClient>) {
        if let Ok(mut clients) = self.clients.write() {
            info!(queue = %client.name(), driver = client.driver(), "Queue client registered");
            clients.insert(client.name().to_string(), client);
        }
    }

    /// Client by name; an empty name means `default`.
    pub fn get(&self, name: &str) -> AppResult<Arc<dyn QueueClient>> {
        let name = if name.is_empty() { DEFAULT_QUEUE } else { name };
        self.clients
            .read()
            .map_err(|_| AppError::internal("queue registry poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("Queue client '{name}' is not configured")))
    }

    /// Next client of `names` in round-robin order; `default` when the
    /// list is empty.
    pub fn pick(&self, names: &[String]) -> AppResult<Arc<dyn QueueClient>> {
        if names.is_empty() {
            return self.get(DEFAULT_QUEUE);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % names.len();
        self.get(&names[index])
    }

    /// Registered client names.
    pub fn names(&self) -> Vec<String> {
        self.clients
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Shut down every client, logging failures.
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<dyn QueueClient>> = self
            .clients
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        for client in clients {
            if let Err(e) = client.shutdown().await {
                warn!(queue = %client.name(), error = %e, "Queue client shutdown failed");
            }
        }
    }
}

/// Create a client for `url`; the scheme selects the driver.
#[cfg_attr(not(feature = "redis-backend"), allow(unused_variables))]
pub async fn connect(name: &str, url: &str, pool: &PoolConfig) -> AppResult<Arc<dyn QueueClient>> {
    let parsed = Url::parse(url)?;
    let options = ClientOptions::from_url(&parsed)?;
    let client: Arc<dyn QueueClient> = match parsed.scheme() {
        "memory" => Arc::new(SortedSetClient::memory(name, options)),
        #[cfg(feature = "redis-backend")]
        "redis" | "rediss" => Arc::new(SortedSetClient::redis(name, &parsed, options, pool)?),
        #[cfg(feature = "sqs-backend")]
        "sqs" | "https" => Arc::new(crate::drivers::SqsClient::connect(name, &parsed, options).await?),
        #[cfg(feature = "nats-backend")]
        "nats" => Arc::new(crate::drivers::JetStreamClient::connect(name, &parsed, options).await?),
        other => {
            return Err(AppError::configuration(format!(
                "Unsupported queue scheme '{other}' for '{name}'. Supported: memory, redis, rediss, sqs, https, nats"
            )));
        }
    };
    Ok(client)
}
