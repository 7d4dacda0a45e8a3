//! Caller side of the RPC layer.
//!
//! `dispatch` pushes a keyed request onto the service queue and polls the
//! reply slot with bounded exponential backoff. `broadcast` publishes a
//! keyless request to every subscribed worker and returns immediately.

use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::envelope::{CodecError, CorrelationKey, Envelope, Reply};
use crate::service::{Method, Request, VersionDescriptor};
use crate::utils::retry::RetryPolicy;

/// Result type for dispatcher operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced to callers of the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Service timeout for {0}")]
    ServiceTimeout(String),

    #[error("Broker unavailable: {0}")]
    Transport(#[from] BrokerError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("'{method}' failed on the worker ({kind}): {message}")]
    Remote {
        method: String,
        kind: String,
        message: String,
    },

    #[error("Argument name '{0}' is reserved by the envelope")]
    ReservedArgument(&'static str),

    #[error("Unexpected reply shape for {method}: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DispatchError {
    /// Whether the caller may reasonably try the same call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::ServiceTimeout(_) | DispatchError::Transport(_))
    }
}

/// Outcome of one poll of the reply slot.
enum Poll {
    Empty,
    Failed(BrokerError),
}

/// Issues calls against one logical service.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    service: String,
    reply_backoff: RetryPolicy,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, service: impl Into<String>) -> Self {
        Self {
            broker,
            service: service.into(),
            reply_backoff: RetryPolicy::default(),
        }
    }

    pub fn with_reply_backoff(mut self, policy: RetryPolicy) -> Self {
        self.reply_backoff = policy;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Call `method` on one worker and wait for its reply.
    ///
    /// Fails with `ServiceTimeout` once the reply budget is spent. The request
    /// may still be served later; its reply then expires unread.
    #[tracing::instrument(name = "dispatch", skip_all, fields(service = %self.service, method = %method))]
    pub async fn dispatch(&self, method: &str, args: Map<String, Value>) -> Result<Value> {
        if let Some(name) = Envelope::reserved_argument(&args) {
            return Err(DispatchError::ReservedArgument(name));
        }

        let key = CorrelationKey::generate();
        let bytes = Envelope::call(method, key.clone(), args).encode()?;
        self.broker.push(&self.service, bytes).await?;
        debug!(key = %key, "Request queued");

        let outcome = self.await_reply(&key).await;

        // The slot is single-use whatever happened while polling
        if let Err(e) = self.broker.delete_keyed(key.as_str()).await {
            warn!(key = %key, error = %e, "Failed to clear reply slot");
        }

        let bytes = match outcome {
            Ok(bytes) => bytes,
            Err(Poll::Empty) => {
                warn!(
                    key = %key,
                    budget = ?self.reply_backoff.total_delay(),
                    "No reply within budget"
                );
                return Err(DispatchError::ServiceTimeout(method.to_string()));
            }
            Err(Poll::Failed(e)) => return Err(e.into()),
        };

        match Reply::decode(&bytes)? {
            Reply::Ok(value) => Ok(value),
            Reply::Error(e) => Err(DispatchError::Remote {
                method: method.to_string(),
                kind: e.kind,
                message: e.message,
            }),
        }
    }

    async fn await_reply(&self, key: &CorrelationKey) -> std::result::Result<Vec<u8>, Poll> {
        let broker = &self.broker;
        let slot = key.as_str();
        (move || async move {
            match broker.read_and_clear_keyed(slot).await {
                Ok(Some(bytes)) => Ok(bytes),
                Ok(None) => Err(Poll::Empty),
                Err(e) => Err(Poll::Failed(e)),
            }
        })
        .retry(self.reply_backoff.builder())
        .when(|poll| matches!(poll, Poll::Empty))
        .notify(|_, delay: Duration| {
            debug!(key = %key, delay = ?delay, "Reply not ready");
        })
        .await
    }

    /// Publish `method` to every worker currently subscribed. No reply.
    #[tracing::instrument(name = "broadcast", skip_all, fields(service = %self.service, method = %method))]
    pub async fn broadcast(&self, method: &str, args: Map<String, Value>) -> Result<usize> {
        if let Some(name) = Envelope::reserved_argument(&args) {
            return Err(DispatchError::ReservedArgument(name));
        }

        let bytes = Envelope::broadcast(method, args).encode()?;
        let receivers = self.broker.publish(&self.service, bytes).await?;
        info!(receivers = receivers, "Broadcast published");
        Ok(receivers)
    }

    /// Dispatch a typed request.
    pub async fn call(&self, request: &Request) -> Result<Value> {
        self.dispatch(request.method().as_str(), request.args()).await
    }

    /// Broadcast a typed request.
    pub async fn notify(&self, request: &Request) -> Result<usize> {
        self.broadcast(request.method().as_str(), request.args()).await
    }

    async fn call_as<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let method = request.method();
        let value = self.call(&request).await?;
        serde_json::from_value(value).map_err(|source| DispatchError::Decode {
            method: method.to_string(),
            source,
        })
    }

    pub async fn predict(&self, input: Value) -> Result<Value> {
        self.call(&Request::Predict { input }).await
    }

    pub async fn train(&self, items: Vec<Value>) -> Result<VersionDescriptor> {
        self.call_as(Request::Train { input: items }).await
    }

    /// Deploy on one worker and wait for the enabled descriptor.
    pub async fn deploy(&self, version: impl Into<String>) -> Result<VersionDescriptor> {
        self.call_as(Request::Deploy {
            version: version.into(),
        })
        .await
    }

    /// Deploy on every subscribed worker without waiting.
    pub async fn deploy_everywhere(&self, version: impl Into<String>) -> Result<usize> {
        self.notify(&Request::Deploy {
            version: version.into(),
        })
        .await
    }

    pub async fn enabled_version(&self) -> Result<VersionDescriptor> {
        self.call_as(Request::EnabledVersion).await
    }

    pub async fn available_versions(&self) -> Result<Vec<VersionDescriptor>> {
        self.call_as(Request::AvailableVersions).await
    }

    /// Method names the dispatcher knows how to type.
    pub fn methods() -> impl Iterator<Item = &'static str> {
        Method::ALL.into_iter().map(|m| m.as_str())
    }
}
