//! Server side of the RPC layer.
//!
//! A worker drains two inputs in one sequential loop: the broadcast
//! subscription (checked first, so deploys are not starved behind a backlog
//! of predictions) and the unicast queue it shares with competing workers.
//! Exactly one envelope executes at a time.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Subscription};
use crate::envelope::{CodecError, Envelope, RemoteError, Reply};
use crate::service::{Handler, Request, RequestError};
use crate::utils::retry::{idle_backoff, RetryPolicy};

/// Result type for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors raised while consuming envelopes.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Unknown method '{0}'")]
    UnknownMethod(String),

    #[error("Invalid arguments for '{method}': {message}")]
    InvalidArguments { method: String, message: String },

    #[error("Broker unavailable: {0}")]
    Transport(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl WorkerError {
    /// Fatal errors stop the loop; the rest drop the offending envelope.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WorkerError::Transport(_))
    }
}

impl From<RequestError> for WorkerError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::UnknownMethod(name) => WorkerError::UnknownMethod(name),
            RequestError::InvalidArguments { method, message } => WorkerError::InvalidArguments {
                method: method.to_string(),
                message,
            },
        }
    }
}

/// Worker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Backoff while both inputs are empty. Restarts after every message.
    pub idle_backoff: RetryPolicy,
    /// How long an unread reply survives before the broker expires it.
    pub reply_ttl_secs: Option<u64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_backoff: idle_backoff(),
            reply_ttl_secs: Some(300),
        }
    }
}

impl WorkerConfig {
    pub fn reply_ttl(&self) -> Option<Duration> {
        self.reply_ttl_secs.map(Duration::from_secs)
    }
}

/// Where an envelope was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Broadcast,
    Queue,
}

/// What happened to one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Executed and a reply was written.
    Replied,
    /// Executed; nobody was waiting for a reply.
    Executed,
    /// Handler failed on a broadcast; only logged.
    Failed,
}

/// Stops a running worker after its current envelope.
#[derive(Clone)]
pub struct WorkerHandle {
    stop: Arc<watch::Sender<bool>>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

/// Consume-execute-reply loop for one service.
pub struct Worker<H> {
    broker: Arc<dyn Broker>,
    service: String,
    handler: H,
    subscription: Subscription,
    config: WorkerConfig,
    stop: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<bool>,
}

impl<H: Handler> Worker<H> {
    /// Subscribe to the service's broadcast topic and take ownership of `handler`.
    ///
    /// Broadcasts published before this returns are not delivered.
    ///
    /// The subscription is the prefix pattern `"{service}*"`, so it also
    /// receives broadcasts for any service whose name starts with `service`.
    /// A service name must not be a prefix of another service's name on the
    /// same broker (`model` next to `model-b` executes `model-b` broadcasts).
    pub async fn new(broker: Arc<dyn Broker>, service: impl Into<String>, handler: H) -> Result<Self> {
        let service = service.into();
        let subscription = broker.subscribe_pattern(&format!("{}*", service)).await?;
        let (stop, stopped) = watch::channel(false);

        Ok(Self {
            broker,
            service,
            handler,
            subscription,
            config: WorkerConfig::default(),
            stop: Arc::new(stop),
            stopped,
        })
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    fn is_stopping(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Take one pending message, broadcast first. Never waits.
    pub async fn next_message(&mut self) -> Result<Option<(Source, Vec<u8>)>> {
        if let Some(bytes) = self.subscription.try_next()? {
            return Ok(Some((Source::Broadcast, bytes)));
        }
        Ok(self
            .broker
            .pop(&self.service)
            .await?
            .map(|bytes| (Source::Queue, bytes)))
    }

    /// Decode, execute and (for keyed requests) reply to one message.
    pub async fn process(&mut self, source: Source, bytes: &[u8]) -> Result<Outcome> {
        let mut envelope = Envelope::decode(bytes)?;

        if source == Source::Broadcast && envelope.key.is_some() {
            warn!(method = %envelope.method, "Ignoring correlation key on broadcast");
            envelope.key = None;
        }

        let request = Request::parse(&envelope.method, envelope.payload)?;
        let method = request.method();
        debug!(method = %method, source = ?source, "Executing request");

        let result = self.handler.handle(request).await;

        let Some(key) = envelope.key else {
            return Ok(match result {
                Ok(_) => Outcome::Executed,
                Err(e) => {
                    error!(method = %method, error = %e, "Broadcast request failed");
                    Outcome::Failed
                }
            });
        };

        let reply = match result {
            Ok(value) => Reply::Ok(value),
            Err(e) => {
                warn!(method = %method, error = %e, "Request failed, replying with error");
                Reply::Error(RemoteError {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                })
            }
        };

        self.broker
            .write_keyed(key.as_str(), reply.encode()?, self.config.reply_ttl())
            .await?;
        debug!(method = %method, key = %key, "Reply written");
        Ok(Outcome::Replied)
    }

    /// Run until stopped or until the broker fails.
    ///
    /// Bad envelopes (unknown method, invalid arguments, undecodable bytes)
    /// are logged and dropped, never retried.
    pub async fn serve_forever(mut self) -> Result<()> {
        info!(service = %self.service, "Worker serving");

        let policy = self.config.idle_backoff.clone();
        let mut idle = policy.builder().build();

        while !self.is_stopping() {
            let Some((source, bytes)) = self.next_message().await? else {
                let delay = idle.next().unwrap_or_else(|| policy.max_delay());
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stopped.changed() => {}
                }
                continue;
            };

            idle = policy.builder().build();
            match self.process(source, &bytes).await {
                Ok(outcome) => debug!(outcome = ?outcome, "Envelope processed"),
                Err(e) if e.is_fatal() => {
                    error!(service = %self.service, error = %e, "Worker stopping on broker failure");
                    return Err(e);
                }
                Err(e) => error!(service = %self.service, error = %e, "Dropping envelope"),
            }
        }

        info!(service = %self.service, "Worker stopped");
        Ok(())
    }
}
