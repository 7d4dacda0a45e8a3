//! Broker transport for the RPC layer.
//!
//! This module contains:
//! - `Broker` trait: keyed mailboxes, FIFO queues, pattern pub/sub, named locks
//! - `Subscription`: nonblocking view over a pattern subscription
//! - Broker configuration types and the `init_broker` factory
//! - Implementations: in-memory (standalone), Redis (shared)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

// Implementation modules
#[cfg(feature = "memory")]
pub mod memory;
mod pattern;
#[cfg(feature = "redis")]
pub mod redis;

// Re-exports
#[cfg(feature = "memory")]
pub use memory::MemoryBroker;
pub use pattern::pattern_matches;
#[cfg(feature = "redis")]
pub use self::redis::RedisBroker;

// ============================================================================
// Traits
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Lock '{name}' failed: {message}")]
    Lock { name: String, message: String },

    #[error("Subscription '{0}' closed")]
    SubscriptionClosed(String),
}

/// Proof of holding a named lock. Handed back to `Broker::release_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    name: String,
    token: String,
}

impl LockToken {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Messages published on topics matching a pattern, buffered in arrival order.
///
/// Only messages published after the subscription was established are seen.
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    pattern: String,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(pattern: impl Into<String>, receiver: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            pattern: pattern.into(),
            receiver,
            forwarder: None,
        }
    }

    /// Attach the task pumping broker messages into this subscription.
    #[cfg(feature = "redis")]
    pub(crate) fn with_forwarder(mut self, forwarder: JoinHandle<()>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Take the next pending message without waiting.
    ///
    /// `Ok(None)` means nothing is pending right now.
    pub fn try_next(&mut self) -> Result<Option<Vec<u8>>> {
        match self.receiver.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BrokerError::SubscriptionClosed(self.pattern.clone()))
            }
        }
    }

    /// Wait for the next message. `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Narrow contract the RPC layer needs from the shared broker.
///
/// Implementations:
/// - `MemoryBroker`: in-process, for standalone mode and tests
/// - `RedisBroker`: Redis, shared between processes
#[async_trait]
pub trait Broker: Send + Sync {
    /// Write a single-slot mailbox. `ttl` bounds how long an unread value lives.
    async fn write_keyed(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Read a mailbox and clear it atomically.
    ///
    /// Reading an empty or already-cleared slot returns `None`.
    async fn read_and_clear_keyed(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Drop a mailbox without reading it. Missing slots are not an error.
    async fn delete_keyed(&self, key: &str) -> Result<()>;

    /// Append to the tail of a competing-consumer queue.
    async fn push(&self, queue: &str, bytes: Vec<u8>) -> Result<()>;

    /// Pop from the head of a queue without waiting.
    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>>;

    /// Publish to a topic. Returns how many subscriptions received it.
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<usize>;

    /// Subscribe to every topic matching a glob pattern (`*`, `?`).
    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription>;

    /// Acquire a named lock, waiting as long as it takes.
    async fn acquire_lock(&self, name: &str) -> Result<LockToken>;

    /// Release a lock previously acquired with `acquire_lock`.
    async fn release_lock(&self, token: LockToken) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Broker type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// In-process broker (no external server).
    #[default]
    Memory,
    /// Redis shared between processes.
    Redis,
}

/// Broker configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker type discriminator.
    #[serde(rename = "type")]
    pub broker_type: BrokerType,
    /// Redis-specific configuration.
    pub redis: RedisConfig,
    /// Named lock configuration.
    pub lock: LockConfig,
}

/// Redis-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Named lock configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease after which a lock held by a dead process expires.
    /// `None` keeps the lock until released.
    ///
    /// The lease also bounds live holders. A critical section that outlives
    /// it loses the lock mid-run: another holder may enter, and the late
    /// release fails even though the section's work was already applied.
    /// Size it above the slowest critical section.
    pub lease_ms: Option<u64>,
    /// Interval between acquisition attempts while the lock is held elsewhere.
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: Some(60_000),
            retry_interval_ms: 50,
        }
    }
}

impl LockConfig {
    pub fn lease(&self) -> Option<Duration> {
        self.lease_ms.map(Duration::from_millis)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Memory: `--features memory` (included in default)
/// - Redis: `--features redis`
pub async fn init_broker(
    config: &BrokerConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.broker_type {
        BrokerType::Memory => {
            #[cfg(feature = "memory")]
            {
                info!(broker_type = "memory", "Broker initialized");
                Ok(Arc::new(MemoryBroker::new()))
            }

            #[cfg(not(feature = "memory"))]
            {
                Err("Memory broker requires the 'memory' feature. Rebuild with --features memory".into())
            }
        }
        BrokerType::Redis => {
            #[cfg(feature = "redis")]
            {
                let broker = RedisBroker::connect(&config.redis.url, config.lock.clone()).await?;
                info!(broker_type = "redis", "Broker initialized");
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err("Redis support requires the 'redis' feature. Rebuild with --features redis".into())
            }
        }
    }
}
