//! In-memory broker for standalone mode.
//!
//! All state lives behind one `Arc`, so clones share mailboxes, queues,
//! subscriptions and locks. Ideal for local development and testing without
//! external dependencies.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{pattern_matches, Broker, BrokerError, LockToken, Result, Subscription};

struct Slot {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    subscribers: Vec<Subscriber>,
    locks: HashMap<String, String>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    lock_released: Notify,
}

/// In-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        info!("Memory broker initialized");
        Self::default()
    }

    /// Number of items waiting in a queue.
    pub async fn queue_len(&self, queue: &str) -> usize {
        let state = self.inner.state.lock().await;
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Number of live (unexpired) mailbox slots.
    pub async fn slot_count(&self) -> usize {
        let now = Instant::now();
        let state = self.inner.state.lock().await;
        state.slots.values().filter(|s| !s.is_expired(now)).count()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn write_keyed(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;

        // Orphaned replies are collected lazily on each write
        state.slots.retain(|_, slot| !slot.is_expired(now));
        state.slots.insert(
            key.to_string(),
            Slot {
                bytes,
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );

        debug!(key = %key, "Wrote keyed slot");
        Ok(())
    }

    async fn read_and_clear_keyed(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;

        Ok(state
            .slots
            .remove(key)
            .filter(|slot| !slot.is_expired(now))
            .map(|slot| slot.bytes))
    }

    async fn delete_keyed(&self, key: &str) -> Result<()> {
        self.inner.state.lock().await.slots.remove(key);
        Ok(())
    }

    async fn push(&self, queue: &str, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(bytes);
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut state = self.inner.state.lock().await;
        Ok(state.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<usize> {
        let mut state = self.inner.state.lock().await;

        // Dropped subscriptions are pruned as they are discovered
        state.subscribers.retain(|s| !s.sender.is_closed());

        let mut receivers = 0;
        for subscriber in &state.subscribers {
            if pattern_matches(&subscriber.pattern, topic)
                && subscriber.sender.send(bytes.clone()).is_ok()
            {
                receivers += 1;
            }
        }

        debug!(topic = %topic, receivers = receivers, "Published message");
        Ok(receivers)
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.state.lock().await.subscribers.push(Subscriber {
            pattern: pattern.to_string(),
            sender,
        });

        info!(pattern = %pattern, "Subscribed to pattern");
        Ok(Subscription::new(pattern, receiver))
    }

    async fn acquire_lock(&self, name: &str) -> Result<LockToken> {
        loop {
            // Register interest before checking so a release in between is not missed
            let released = self.inner.lock_released.notified();
            {
                let mut state = self.inner.state.lock().await;
                if !state.locks.contains_key(name) {
                    let token = LockToken::new(name);
                    state
                        .locks
                        .insert(name.to_string(), token.token().to_string());
                    debug!(lock = %name, "Lock acquired");
                    return Ok(token);
                }
            }
            released.await;
        }
    }

    async fn release_lock(&self, token: LockToken) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match state.locks.get(token.name()) {
            Some(holder) if holder == token.token() => {
                state.locks.remove(token.name());
                drop(state);
                self.inner.lock_released.notify_waiters();
                debug!(lock = %token.name(), "Lock released");
                Ok(())
            }
            _ => Err(BrokerError::Lock {
                name: token.name().to_string(),
                message: "lock not held by this token".to_string(),
            }),
        }
    }
}
