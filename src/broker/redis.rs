//! Redis broker implementation.
//!
//! Maps the broker contract onto plain Redis commands:
//! - mailboxes: `PSETEX`/`SET` + `GETDEL` + `DEL`
//! - queues: `RPUSH` + `LPOP`
//! - pub/sub: `PUBLISH` + `PSUBSCRIBE` on a dedicated connection
//! - locks: `SET NX PX` with a random token, released by compare-and-delete

use std::time::Duration;

use ::redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Broker, BrokerError, LockConfig, LockToken, Result, Subscription};

/// Deletes the lock key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed broker shared between dispatcher and worker processes.
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    lock: LockConfig,
}

impl RedisBroker {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `lock` - Lease and retry settings for named locks
    pub async fn connect(url: &str, lock: LockConfig) -> Result<Self> {
        let unreachable = |e: ::redis::RedisError| BrokerError::Connection(format!("{}: {}", url, e));
        let client = Client::open(url).map_err(unreachable)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(unreachable)?;

        info!(url = %url, "Connected to Redis broker");

        Ok(Self { client, conn, lock })
    }

    async fn try_acquire(&self, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(token.name()).arg(token.token()).arg("NX");
        if let Some(lease) = self.lock.lease() {
            cmd.arg("PX").arg(lease.as_millis() as u64);
        }

        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn write_keyed(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();

        match ttl {
            Some(ttl) => {
                let millis = (ttl.as_millis() as u64).max(1);
                let _: () = conn.pset_ex(key, bytes, millis).await?;
            }
            None => {
                let _: () = conn.set(key, bytes).await?;
            }
        }

        debug!(key = %key, "Wrote keyed slot to Redis");
        Ok(())
    }

    async fn read_and_clear_keyed(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = ::redis::cmd("GETDEL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(bytes)
    }

    async fn delete_keyed(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn push(&self, queue: &str, bytes: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(queue, bytes).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let bytes: Option<Vec<u8>> = conn.lpop(queue, None).await?;
        Ok(bytes)
    }

    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = conn.publish(topic, bytes).await?;
        debug!(topic = %topic, receivers = receivers, "Published message to Redis");
        Ok(receivers)
    }

    async fn subscribe_pattern(&self, pattern: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        // Subscription is live once PSUBSCRIBE is acknowledged
        pubsub.psubscribe(pattern).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let owned_pattern = pattern.to_string();
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                if sender.send(msg.get_payload_bytes().to_vec()).is_err() {
                    break;
                }
            }
            warn!(pattern = %owned_pattern, "Redis subscription stream ended");
        });

        info!(pattern = %pattern, "Subscribed to Redis pattern");
        Ok(Subscription::new(pattern, receiver).with_forwarder(forwarder))
    }

    async fn acquire_lock(&self, name: &str) -> Result<LockToken> {
        let token = LockToken::new(name);
        let retry_interval = self.lock.retry_interval();

        while !self.try_acquire(&token).await? {
            tokio::time::sleep(retry_interval).await;
        }

        debug!(lock = %name, "Acquired Redis lock");
        Ok(token)
    }

    async fn release_lock(&self, token: LockToken) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(token.name())
            .arg(token.token())
            .invoke_async(&mut conn)
            .await?;

        if deleted == 0 {
            return Err(BrokerError::Lock {
                name: token.name().to_string(),
                message: "lease expired before release".to_string(),
            });
        }

        debug!(lock = %token.name(), "Released Redis lock");
        Ok(())
    }
}
